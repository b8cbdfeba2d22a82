//! Versioned response cache for offline support.
//!
//! This module provides persistent storage for cached responses that:
//! - Groups entries into named generations (one per cache version)
//! - Keys entries by request identity (GET + absolute URL)
//! - Supports whole-generation deletion for version rotation

mod storage;
mod traits;

pub use storage::{CacheStorage, SqliteStorage};
pub use traits::{CacheResult, CacheSource, CachedEntry, GenerationInfo};
