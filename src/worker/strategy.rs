use serde::Deserialize;

use crate::cache::CacheResult;
use crate::net::Response;

/// How intercepted GET requests are answered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Strategy {
  /// Serve from cache when present, otherwise go to the network without storing
  CacheFirst,
  /// Go to the network and refresh the cache, fall back to the cache when offline
  #[default]
  NetworkFirst,
}

impl std::fmt::Display for Strategy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Strategy::CacheFirst => write!(f, "cache-first"),
      Strategy::NetworkFirst => write!(f, "network-first"),
    }
  }
}

/// What the fetch handler did with a request.
#[derive(Debug)]
pub enum FetchOutcome {
  /// Not intercepted; the caller should perform default network handling
  Passthrough,
  /// Answered, from the network or the cache
  Responded(CacheResult<Response>),
  /// Neither the network nor the cache produced a response
  Unresolved { reason: String },
}

impl FetchOutcome {
  pub fn response(&self) -> Option<&Response> {
    match self {
      FetchOutcome::Responded(result) => Some(&result.data),
      _ => None,
    }
  }

  pub fn is_passthrough(&self) -> bool {
    matches!(self, FetchOutcome::Passthrough)
  }

  pub fn is_unresolved(&self) -> bool {
    matches!(self, FetchOutcome::Unresolved { .. })
  }
}
