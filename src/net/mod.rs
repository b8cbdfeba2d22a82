//! Network access for intercepted requests.

mod client;
mod types;

pub use client::{HttpNetwork, Network};
pub use types::{resolve_url, Request, Response};
