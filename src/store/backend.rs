//! Key-value storage backends and the SQLite implementation.

use color_eyre::{eyre::eyre, Result};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;

/// Storage consumption as reported by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageEstimate {
  /// Bytes currently used
  pub used: u64,
  /// Bytes available in total, if the backend enforces a limit
  pub quota: Option<u64>,
}

impl StorageEstimate {
  /// Fraction of the quota in use, if there is one.
  pub fn usage_ratio(&self) -> Option<f64> {
    match self.quota {
      Some(quota) if quota > 0 => Some(self.used as f64 / quota as f64),
      _ => None,
    }
  }
}

/// Trait for persistent string key-value backends.
///
/// Backends report failures; the `DurableStore` adapter is what turns them into
/// best-effort no-ops.
pub trait KeyValueBackend: Send + Sync {
  fn get(&self, key: &str) -> Result<Option<String>>;

  fn set(&self, key: &str, value: &str) -> Result<()>;

  fn remove(&self, key: &str) -> Result<()>;

  /// All keys currently stored.
  fn keys(&self) -> Result<Vec<String>>;

  /// Storage estimate, or None when the backend can't measure itself.
  fn estimate(&self) -> Option<StorageEstimate> {
    None
  }
}

/// Backend that stores nothing.
/// Used when persistent storage can't be opened - every read misses.
pub struct NoopBackend;

impl KeyValueBackend for NoopBackend {
  fn get(&self, _key: &str) -> Result<Option<String>> {
    Ok(None) // Always miss
  }

  fn set(&self, _key: &str, _value: &str) -> Result<()> {
    Err(eyre!("Persistent storage is unavailable"))
  }

  fn remove(&self, _key: &str) -> Result<()> {
    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    Ok(Vec::new())
  }
}

/// SQLite-based key-value backend.
pub struct SqliteBackend {
  conn: Mutex<Connection>,
  quota_bytes: Option<u64>,
}

impl SqliteBackend {
  /// Open (or create) the store at `path`.
  pub fn open(path: &Path, quota_bytes: Option<u64>) -> Result<Self> {
    // Ensure parent directory exists
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent)
        .map_err(|e| eyre!("Failed to create storage directory: {}", e))?;
    }

    let conn = Connection::open(path)
      .map_err(|e| eyre!("Failed to open store at {}: {}", path.display(), e))?;

    Self::with_connection(conn, quota_bytes)
  }

  #[cfg(test)]
  pub fn open_in_memory(quota_bytes: Option<u64>) -> Result<Self> {
    let conn = Connection::open_in_memory()
      .map_err(|e| eyre!("Failed to open in-memory store: {}", e))?;
    Self::with_connection(conn, quota_bytes)
  }

  fn with_connection(conn: Connection, quota_bytes: Option<u64>) -> Result<Self> {
    let backend = Self {
      conn: Mutex::new(conn),
      quota_bytes,
    };
    backend.run_migrations()?;
    Ok(backend)
  }

  fn run_migrations(&self) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute_batch(STORE_SCHEMA)
      .map_err(|e| eyre!("Failed to run store migrations: {}", e))?;

    Ok(())
  }

  fn used_bytes(conn: &Connection, excluding: Option<&str>) -> Result<u64> {
    let used: i64 = conn
      .query_row(
        "SELECT COALESCE(SUM(length(CAST(key AS BLOB)) + length(CAST(value AS BLOB))), 0)
         FROM kv_store WHERE key != ?",
        params![excluding.unwrap_or("")],
        |row| row.get(0),
      )
      .map_err(|e| eyre!("Failed to measure store: {}", e))?;
    Ok(used.max(0) as u64)
  }
}

const STORE_SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL DEFAULT (datetime('now'))
);
"#;

impl KeyValueBackend for SqliteBackend {
  fn get(&self, key: &str) -> Result<Option<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .query_row(
        "SELECT value FROM kv_store WHERE key = ?",
        params![key],
        |row| row.get(0),
      )
      .optional()
      .map_err(|e| eyre!("Failed to read {}: {}", key, e))
  }

  fn set(&self, key: &str, value: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    if let Some(quota) = self.quota_bytes {
      let used = Self::used_bytes(&conn, Some(key))?;
      let needed = (key.len() + value.len()) as u64;
      if used + needed > quota {
        return Err(eyre!(
          "Storage quota exceeded writing {} ({} + {} > {} bytes)",
          key,
          used,
          needed,
          quota
        ));
      }
    }

    conn
      .execute(
        "INSERT OR REPLACE INTO kv_store (key, value, updated_at)
         VALUES (?, ?, datetime('now'))",
        params![key, value],
      )
      .map_err(|e| eyre!("Failed to write {}: {}", key, e))?;

    Ok(())
  }

  fn remove(&self, key: &str) -> Result<()> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    conn
      .execute("DELETE FROM kv_store WHERE key = ?", params![key])
      .map_err(|e| eyre!("Failed to remove {}: {}", key, e))?;

    Ok(())
  }

  fn keys(&self) -> Result<Vec<String>> {
    let conn = self
      .conn
      .lock()
      .map_err(|e| eyre!("Lock poisoned: {}", e))?;

    let mut stmt = conn
      .prepare("SELECT key FROM kv_store")
      .map_err(|e| eyre!("Failed to prepare key listing: {}", e))?;

    let keys = stmt
      .query_map([], |row| row.get(0))
      .map_err(|e| eyre!("Failed to list keys: {}", e))?
      .filter_map(|r| r.ok())
      .collect();

    Ok(keys)
  }

  fn estimate(&self) -> Option<StorageEstimate> {
    let conn = self.conn.lock().ok()?;
    let used = Self::used_bytes(&conn, None).ok()?;
    Some(StorageEstimate {
      used,
      quota: self.quota_bytes,
    })
  }
}
