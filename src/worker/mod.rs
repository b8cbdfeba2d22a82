//! Offline cache manager: the install / activate / fetch lifecycle.

mod manager;
mod strategy;

pub use manager::{OfflineCacheManager, WorkerState};
pub use strategy::{FetchOutcome, Strategy};
