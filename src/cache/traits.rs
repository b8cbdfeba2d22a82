//! Core types for the caching system.

use chrono::{DateTime, Utc};

use crate::net::Response;

/// A response as stored in a cache generation.
#[derive(Debug, Clone)]
pub struct CachedEntry {
  pub response: Response,
  /// When the entry was written
  pub cached_at: DateTime<Utc>,
  /// Hex SHA-256 of the body, recorded at write time
  pub digest: String,
}

/// Summary of one stored generation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationInfo {
  pub name: String,
  pub entries: usize,
  pub created_at: DateTime<Utc>,
}

/// Result from a cache operation, including data and metadata about the source.
#[derive(Debug, Clone)]
pub struct CacheResult<T> {
  /// The actual data
  pub data: T,
  /// Where the data came from
  pub source: CacheSource,
  /// When the data was cached (if from cache)
  pub cached_at: Option<DateTime<Utc>>,
}

impl<T> CacheResult<T> {
  /// Create a new cache result from fresh network data.
  pub fn from_network(data: T) -> Self {
    Self {
      data,
      source: CacheSource::Network,
      cached_at: None,
    }
  }

  /// Create a new cache result from a cache hit that skipped the network.
  pub fn from_cache(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Cache,
      cached_at: Some(cached_at),
    }
  }

  /// Create a new cache result for offline mode.
  pub fn offline(data: T, cached_at: DateTime<Utc>) -> Self {
    Self {
      data,
      source: CacheSource::Offline,
      cached_at: Some(cached_at),
    }
  }
}

/// Indicates where a response came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheSource {
  /// Fresh data from network
  Network,
  /// Served from cache without consulting the network
  Cache,
  /// Network unavailable, serving cached data
  Offline,
}

impl std::fmt::Display for CacheSource {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      CacheSource::Network => write!(f, "network"),
      CacheSource::Cache => write!(f, "cache"),
      CacheSource::Offline => write!(f, "offline"),
    }
  }
}
