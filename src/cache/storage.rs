//! Cache storage trait and SQLite implementation.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use super::traits::{CachedEntry, GenerationInfo};
use crate::net::{Request, Response};

/// Trait for cache storage backends.
///
/// A backend holds any number of named generations, each mapping request
/// identity to a stored response. Only GET requests are ever stored or matched.
pub trait CacheStorage: Send + Sync {
  /// Create the named generation if it does not exist yet.
  fn open(&self, name: &str) -> Result<()>;

  /// Names of all generations, oldest first.
  fn keys(&self) -> Result<Vec<String>>;

  /// Delete a generation and everything in it. Returns false if it did not exist.
  fn delete(&self, name: &str) -> Result<bool>;

  /// Look a request up in one generation.
  fn match_request(&self, name: &str, request: &Request) -> Result<Option<CachedEntry>>;

  /// Look a request up across all generations, oldest first.
  fn match_any(&self, request: &Request) -> Result<Option<CachedEntry>>;

  /// Store one response, replacing any previous entry for the same request.
  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()>;

  /// Store a batch of responses. Either every entry is written or none is.
  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()>;

  /// Request keys stored in a generation, in key order.
  fn entries(&self, name: &str) -> Result<Vec<String>>;

  /// Every generation with its entry count.
  fn generations(&self) -> Result<Vec<GenerationInfo>>;
}

/// SQLite-based cache storage implementation.
pub struct SqliteStorage {
  conn: Mutex<Connection>,
}

impl SqliteStorage {
  /// Open (or create) the cache database at `path`.
  pub fn open_at(path: &Path) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      if !parent.as_os_str().is_empty() {
        std::fs::create_dir_all(parent)
          .map_err(|e| eyre!("Failed to create cache directory: {}", e))?;
      }
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open cache database at {}: {}", path.display(), e))?;

    Self::with_connection(conn)
  }

  /// Open a private database that lives only as long as this value.
  pub fn open_in_memory() -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory cache database: {}", e))?;
    Self::with_connection(conn)
  }

  fn with_connection(conn: Connection) -> Result<Self> {
    let storage = Self {
      conn: Mutex::new(conn),
    };
    storage.run_migrations()?;
    Ok(storage)
  }

  /// Get the default database path.
  pub fn default_path() -> Result<PathBuf> {
    let data_dir = dirs::data_dir()
      .or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))
      .ok_or_else(|| eyre!("Could not determine data directory"))?;

    Ok(data_dir.join("shellcache").join("cache.db"))
  }

  fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
    self.conn.lock().map_err(|e| eyre!("Lock poisoned: {}", e))
  }

  /// Run database migrations for cache tables.
  fn run_migrations(&self) -> Result<()> {
    self
      .conn()?
      .execute_batch(CACHE_SCHEMA)
      .map_err(|e| eyre!("Failed to run cache migrations: {}", e))?;

    Ok(())
  }
}

/// Schema for cache tables.
const CACHE_SCHEMA: &str = r#"
-- One row per generation; id gives creation order
CREATE TABLE IF NOT EXISTS generations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL UNIQUE,
    created_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Stored responses, keyed by generation + request identity
CREATE TABLE IF NOT EXISTS entries (
    generation TEXT NOT NULL,
    request_key TEXT NOT NULL,
    url TEXT NOT NULL,
    status INTEGER NOT NULL,
    headers TEXT NOT NULL,
    body BLOB NOT NULL,
    digest TEXT NOT NULL,
    cached_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (generation, request_key)
);
"#;

const ENTRY_COLUMNS: &str = "e.url, e.status, e.headers, e.body, e.digest, e.cached_at";

fn ensure_generation(conn: &Connection, name: &str) -> Result<()> {
  conn
    .execute(
      "INSERT OR IGNORE INTO generations (name) VALUES (?)",
      params![name],
    )
    .map_err(|e| eyre!("Failed to open cache '{}': {}", name, e))?;
  Ok(())
}

fn insert_entry(conn: &Connection, name: &str, request: &Request, response: &Response) -> Result<()> {
  if !request.is_get() {
    return Err(eyre!(
      "Refusing to cache {} {}: only GET requests can be stored",
      request.method,
      request.url
    ));
  }

  let headers = serde_json::to_string(&response.headers)
    .map_err(|e| eyre!("Failed to serialize headers: {}", e))?;

  conn
    .execute(
      "INSERT OR REPLACE INTO entries (generation, request_key, url, status, headers, body, digest, cached_at)
       VALUES (?, ?, ?, ?, ?, ?, ?, datetime('now'))",
      params![
        name,
        request.cache_key(),
        response.url,
        response.status,
        headers,
        &response.body[..],
        response.digest(),
      ],
    )
    .map_err(|e| eyre!("Failed to store {}: {}", request.url, e))?;

  Ok(())
}

type EntryRow = (String, u16, String, Vec<u8>, String, String);

fn read_entry(row: &rusqlite::Row<'_>) -> rusqlite::Result<EntryRow> {
  Ok((
    row.get(0)?,
    row.get(1)?,
    row.get(2)?,
    row.get(3)?,
    row.get(4)?,
    row.get(5)?,
  ))
}

fn into_entry((url, status, headers, body, digest, cached_at): EntryRow) -> Result<CachedEntry> {
  let headers: Vec<(String, String)> = serde_json::from_str(&headers)
    .map_err(|e| eyre!("Failed to deserialize headers for {}: {}", url, e))?;

  Ok(CachedEntry {
    response: Response {
      url,
      status,
      headers,
      body: Bytes::from(body),
    },
    cached_at: parse_datetime(&cached_at)?,
    digest,
  })
}

impl CacheStorage for SqliteStorage {
  fn open(&self, name: &str) -> Result<()> {
    let conn = self.conn()?;
    ensure_generation(&conn, name)
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT name FROM generations ORDER BY id")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let names = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read cache name: {}", e))?;

    Ok(names)
  }

  fn delete(&self, name: &str) -> Result<bool> {
    let conn = self.conn()?;
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    tx.execute("DELETE FROM entries WHERE generation = ?", params![name])
      .map_err(|e| eyre!("Failed to delete entries of '{}': {}", name, e))?;
    let removed = tx
      .execute("DELETE FROM generations WHERE name = ?", params![name])
      .map_err(|e| eyre!("Failed to delete cache '{}': {}", name, e))?;

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(removed > 0)
  }

  fn match_request(&self, name: &str, request: &Request) -> Result<Option<CachedEntry>> {
    if !request.is_get() {
      return Ok(None);
    }

    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM entries e WHERE e.generation = ? AND e.request_key = ?",
      ENTRY_COLUMNS
    );
    let row = conn
      .query_row(&sql, params![name, request.cache_key()], read_entry)
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", request.url, e))?;

    row.map(into_entry).transpose()
  }

  fn match_any(&self, request: &Request) -> Result<Option<CachedEntry>> {
    if !request.is_get() {
      return Ok(None);
    }

    let conn = self.conn()?;
    let sql = format!(
      "SELECT {} FROM entries e
       INNER JOIN generations g ON g.name = e.generation
       WHERE e.request_key = ?
       ORDER BY g.id
       LIMIT 1",
      ENTRY_COLUMNS
    );
    let row = conn
      .query_row(&sql, params![request.cache_key()], read_entry)
      .optional()
      .map_err(|e| eyre!("Failed to look up {}: {}", request.url, e))?;

    row.map(into_entry).transpose()
  }

  fn put(&self, name: &str, request: &Request, response: &Response) -> Result<()> {
    let conn = self.conn()?;
    ensure_generation(&conn, name)?;
    insert_entry(&conn, name, request, response)
  }

  fn put_all(&self, name: &str, entries: &[(Request, Response)]) -> Result<()> {
    let conn = self.conn()?;
    // Rolled back on drop if any insert fails
    let tx = conn
      .unchecked_transaction()
      .map_err(|e| eyre!("Failed to begin transaction: {}", e))?;

    ensure_generation(&tx, name)?;
    for (request, response) in entries {
      insert_entry(&tx, name, request, response)?;
    }

    tx.commit()
      .map_err(|e| eyre!("Failed to commit transaction: {}", e))?;

    Ok(())
  }

  fn entries(&self, name: &str) -> Result<Vec<String>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare("SELECT request_key FROM entries WHERE generation = ? ORDER BY request_key")
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let keys = stmt
      .query_map(params![name], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list entries of '{}': {}", name, e))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(|e| eyre!("Failed to read entry key: {}", e))?;

    Ok(keys)
  }

  fn generations(&self) -> Result<Vec<GenerationInfo>> {
    let conn = self.conn()?;
    let mut stmt = conn
      .prepare(
        "SELECT g.name, g.created_at, COUNT(e.request_key) FROM generations g
         LEFT JOIN entries e ON e.generation = g.name
         GROUP BY g.id
         ORDER BY g.id",
      )
      .map_err(|e| eyre!("Failed to prepare query: {}", e))?;

    let rows = stmt
      .query_map([], |row| {
        Ok((
          row.get::<_, String>(0)?,
          row.get::<_, String>(1)?,
          row.get::<_, i64>(2)?,
        ))
      })
      .map_err(|e| eyre!("Failed to list caches: {}", e))?
      .collect::<rusqlite::Result<Vec<_>>>()
      .map_err(|e| eyre!("Failed to read cache row: {}", e))?;

    rows
      .into_iter()
      .map(|(name, created_at, entries)| {
        Ok(GenerationInfo {
          name,
          entries: entries as usize,
          created_at: parse_datetime(&created_at)?,
        })
      })
      .collect()
  }
}

/// Parse a datetime string from SQLite format.
fn parse_datetime(s: &str) -> Result<DateTime<Utc>> {
  // SQLite stores as "YYYY-MM-DD HH:MM:SS"
  chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
    .map(|dt| dt.and_utc())
    .map_err(|e| eyre!("Failed to parse datetime '{}': {}", s, e))
}
