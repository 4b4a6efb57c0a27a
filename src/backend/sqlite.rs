//! SQLite-backed local backend.
//!
//! Rows are stored as JSON documents per collection; objects as blobs with a
//! SHA-256 digest that is verified on read.

use chrono::Utc;
use futures::future::{self, BoxFuture, FutureExt};
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use super::{row_id, Backend, Collection, Identity, ObjectStore, Row, RowQuery, UserId};
use crate::cache::{CacheError, Result};

/// Schema for the local backend.
const BACKEND_SCHEMA: &str = r#"
-- Records of every collection, stored as JSON objects
CREATE TABLE IF NOT EXISTS records (
    collection TEXT NOT NULL,
    id TEXT NOT NULL,
    data TEXT NOT NULL,
    PRIMARY KEY (collection, id)
);

-- Binary objects per bucket
CREATE TABLE IF NOT EXISTS objects (
    bucket TEXT NOT NULL,
    path TEXT NOT NULL,
    data BLOB NOT NULL,
    sha256 TEXT NOT NULL,
    stored_at TEXT NOT NULL DEFAULT (datetime('now')),
    PRIMARY KEY (bucket, path)
);

CREATE TABLE IF NOT EXISTS id_sequence (
    id INTEGER PRIMARY KEY AUTOINCREMENT
);
"#;

fn transport(context: &str) -> impl FnOnce(rusqlite::Error) -> CacheError + '_ {
  move |e| CacheError::Transport(format!("{}: {}", context, e))
}

/// Backend persisted in a single SQLite database.
#[derive(Clone)]
pub struct SqliteBackend {
  conn: Arc<Mutex<Connection>>,
  user: Option<UserId>,
}

impl SqliteBackend {
  /// Open (or create) the database at `path`, acting as `user`.
  pub fn open(path: &Path, user: Option<UserId>) -> Result<Self> {
    if let Some(parent) = path.parent() {
      std::fs::create_dir_all(parent).map_err(|e| {
        CacheError::Transport(format!("Failed to create backend directory: {}", e))
      })?;
    }

    let conn = Connection::open(path).map_err(|e| {
      CacheError::Transport(format!(
        "Failed to open backend database at {}: {}",
        path.display(),
        e
      ))
    })?;
    Self::from_connection(conn, user)
  }

  /// Database that lives only as long as this value.
  pub fn open_in_memory(user: Option<UserId>) -> Result<Self> {
    let conn = Connection::open_in_memory().map_err(transport("Failed to open database"))?;
    Self::from_connection(conn, user)
  }

  fn from_connection(conn: Connection, user: Option<UserId>) -> Result<Self> {
    conn
      .execute_batch(BACKEND_SCHEMA)
      .map_err(transport("Failed to run backend migrations"))?;
    Ok(Self {
      conn: Arc::new(Mutex::new(conn)),
      user,
    })
  }

  /// Default database location under the user's data directory.
  pub fn default_path() -> Option<PathBuf> {
    let data_dir = dirs::data_dir().or_else(|| dirs::home_dir().map(|p| p.join(".local/share")))?;
    Some(data_dir.join("issuedeck").join("backend.db"))
  }

  fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
    self
      .conn
      .lock()
      .map_err(|e| CacheError::Transport(format!("Lock poisoned: {}", e)))
  }

  /// Replace the rows of `collection`, e.g. from a seed file.
  pub fn seed(&self, collection: &str, rows: &[Row]) -> Result<()> {
    let mut conn = self.lock()?;
    let tx = conn
      .transaction()
      .map_err(transport("Failed to begin transaction"))?;
    tx.execute("DELETE FROM records WHERE collection = ?", params![collection])
      .map_err(transport("Failed to clear collection"))?;
    for row in rows {
      let id = row_id(row)
        .ok_or_else(|| CacheError::Decode(format!("seed row in {} has no id", collection)))?;
      let data = serde_json::to_string(row).map_err(|e| CacheError::Decode(e.to_string()))?;
      tx.execute(
        "INSERT INTO records (collection, id, data) VALUES (?, ?, ?)",
        params![collection, id, data],
      )
      .map_err(transport("Failed to store record"))?;
    }
    tx.commit().map_err(transport("Failed to commit transaction"))
  }
}

fn parse_row(data: &str) -> Result<Row> {
  serde_json::from_str(data).map_err(|e| CacheError::Decode(format!("corrupt record: {}", e)))
}

impl Backend for SqliteBackend {
  fn identity(&self) -> Arc<dyn Identity> {
    Arc::new(self.clone())
  }

  fn collection(&self, name: &str) -> Arc<dyn Collection> {
    Arc::new(SqliteCollection {
      backend: self.clone(),
      name: name.to_string(),
    })
  }

  fn bucket(&self, name: &str) -> Arc<dyn ObjectStore> {
    Arc::new(SqliteBucket {
      backend: self.clone(),
      name: name.to_string(),
    })
  }
}

impl Identity for SqliteBackend {
  fn current_user(&self) -> BoxFuture<'_, Result<Option<UserId>>> {
    future::ready(Ok(self.user.clone())).boxed()
  }
}

struct SqliteCollection {
  backend: SqliteBackend,
  name: String,
}

impl SqliteCollection {
  fn fetch(&self, conn: &Connection, id: &str) -> Result<Option<Row>> {
    let data: Option<String> = conn
      .query_row(
        "SELECT data FROM records WHERE collection = ? AND id = ?",
        params![self.name, id],
        |row| row.get(0),
      )
      .optional()
      .map_err(transport("Failed to query record"))?;
    data.as_deref().map(parse_row).transpose()
  }

  fn store(&self, conn: &Connection, id: &str, row: &Row) -> Result<()> {
    let data = serde_json::to_string(row).map_err(|e| CacheError::Decode(e.to_string()))?;
    conn
      .execute(
        "INSERT OR REPLACE INTO records (collection, id, data) VALUES (?, ?, ?)",
        params![self.name, id, data],
      )
      .map_err(transport("Failed to store record"))?;
    Ok(())
  }

  fn read_now(&self, query: &RowQuery) -> Result<Vec<Row>> {
    let conn = self.backend.lock()?;
    let mut stmt = conn
      .prepare("SELECT data FROM records WHERE collection = ?")
      .map_err(transport("Failed to prepare query"))?;
    let rows = stmt
      .query_map(params![self.name], |row| row.get::<_, String>(0))
      .map_err(transport("Failed to query records"))?
      .collect::<rusqlite::Result<Vec<String>>>()
      .map_err(transport("Failed to read records"))?;

    let rows = rows
      .iter()
      .map(|data| parse_row(data))
      .collect::<Result<Vec<Row>>>()?;
    Ok(query.apply(rows))
  }

  /// Next id from the shared sequence that is free in this collection.
  fn allocate_id(&self, conn: &Connection) -> Result<String> {
    loop {
      conn
        .execute("INSERT INTO id_sequence DEFAULT VALUES", [])
        .map_err(transport("Failed to allocate id"))?;
      let id = conn.last_insert_rowid().to_string();
      if self.fetch(conn, &id)?.is_none() {
        return Ok(id);
      }
    }
  }

  fn insert_now(&self, mut row: Row) -> Result<Row> {
    let conn = self.backend.lock()?;
    let id = match row_id(&row) {
      Some(id) => id,
      None => self.allocate_id(&conn)?,
    };
    if self.fetch(&conn, &id)?.is_some() {
      return Err(CacheError::Conflict(format!(
        "{} already has a row with id {}",
        self.name, id
      )));
    }

    let now = Value::String(Utc::now().to_rfc3339());
    row.insert("id".into(), Value::String(id.clone()));
    row.entry("created_at").or_insert_with(|| now.clone());
    row.entry("updated_at").or_insert(now);
    self.store(&conn, &id, &row)?;
    Ok(row)
  }

  fn update_now(&self, id: &str, patch: Row) -> Result<Row> {
    let conn = self.backend.lock()?;
    let mut row = self
      .fetch(&conn, id)?
      .ok_or_else(|| CacheError::NotFound(format!("{} {}", self.name, id)))?;
    for (column, value) in patch {
      if column != "id" {
        row.insert(column, value);
      }
    }
    row.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
    self.store(&conn, id, &row)?;
    Ok(row)
  }

  fn remove_now(&self, id: &str) -> Result<()> {
    let conn = self.backend.lock()?;
    conn
      .execute(
        "DELETE FROM records WHERE collection = ? AND id = ?",
        params![self.name, id],
      )
      .map_err(transport("Failed to delete record"))?;
    Ok(())
  }
}

impl Collection for SqliteCollection {
  fn read<'a>(&'a self, query: &'a RowQuery) -> BoxFuture<'a, Result<Vec<Row>>> {
    future::ready(self.read_now(query)).boxed()
  }

  fn insert(&self, row: Row) -> BoxFuture<'_, Result<Row>> {
    future::ready(self.insert_now(row)).boxed()
  }

  fn update<'a>(&'a self, id: &'a str, patch: Row) -> BoxFuture<'a, Result<Row>> {
    future::ready(self.update_now(id, patch)).boxed()
  }

  fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>> {
    future::ready(self.remove_now(id)).boxed()
  }
}

struct SqliteBucket {
  backend: SqliteBackend,
  name: String,
}

fn digest(bytes: &[u8]) -> String {
  let mut hasher = Sha256::new();
  hasher.update(bytes);
  hex::encode(hasher.finalize())
}

impl SqliteBucket {
  fn put_now(&self, path: &str, bytes: &[u8]) -> Result<()> {
    let conn = self.backend.lock()?;
    conn
      .execute(
        "INSERT OR REPLACE INTO objects (bucket, path, data, sha256, stored_at)
         VALUES (?, ?, ?, ?, datetime('now'))",
        params![self.name, path, bytes, digest(bytes)],
      )
      .map_err(transport("Failed to store object"))?;
    Ok(())
  }

  fn get_now(&self, path: &str) -> Result<Vec<u8>> {
    let conn = self.backend.lock()?;
    let (data, expected): (Vec<u8>, String) = conn
      .query_row(
        "SELECT data, sha256 FROM objects WHERE bucket = ? AND path = ?",
        params![self.name, path],
        |row| Ok((row.get(0)?, row.get(1)?)),
      )
      .optional()
      .map_err(transport("Failed to query object"))?
      .ok_or_else(|| CacheError::NotFound(format!("{}/{}", self.name, path)))?;

    if digest(&data) != expected {
      return Err(CacheError::Transport(format!(
        "object {}/{} failed its integrity check",
        self.name, path
      )));
    }
    Ok(data)
  }

  fn remove_now(&self, path: &str) -> Result<()> {
    let conn = self.backend.lock()?;
    conn
      .execute(
        "DELETE FROM objects WHERE bucket = ? AND path = ?",
        params![self.name, path],
      )
      .map_err(transport("Failed to delete object"))?;
    Ok(())
  }
}

impl ObjectStore for SqliteBucket {
  fn put<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<()>> {
    future::ready(self.put_now(path, &bytes)).boxed()
  }

  fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
    future::ready(self.get_now(path)).boxed()
  }

  fn remove<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
    future::ready(self.remove_now(path)).boxed()
  }
}
