//! In-memory backend with fault injection, used by tests and demos.

use chrono::Utc;
use futures::future::{self, BoxFuture, FutureExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::{row_id, Backend, Collection, Identity, ObjectStore, Row, RowQuery, UserId};
use crate::cache::{CacheError, Result};

#[derive(Default)]
struct Faults {
  failing_reads: usize,
  failing_writes: usize,
  write_error: Option<CacheError>,
}

#[derive(Default)]
struct MemoryState {
  user: Option<UserId>,
  collections: HashMap<String, Vec<Row>>,
  buckets: HashMap<String, HashMap<String, Vec<u8>>>,
  faults: HashMap<String, Faults>,
  reads: HashMap<String, usize>,
  writes: HashMap<String, usize>,
  next_id: u64,
}

impl MemoryState {
  fn check_read(&mut self, name: &str) -> Result<()> {
    *self.reads.entry(name.to_string()).or_default() += 1;
    if let Some(faults) = self.faults.get_mut(name) {
      if faults.failing_reads > 0 {
        faults.failing_reads -= 1;
        return Err(CacheError::Transport(format!("read of {} failed", name)));
      }
    }
    Ok(())
  }

  fn check_write(&mut self, name: &str) -> Result<()> {
    *self.writes.entry(name.to_string()).or_default() += 1;
    if let Some(faults) = self.faults.get_mut(name) {
      if faults.failing_writes > 0 {
        faults.failing_writes -= 1;
        return Err(
          faults
            .write_error
            .clone()
            .unwrap_or_else(|| CacheError::Transport(format!("write to {} failed", name))),
        );
      }
    }
    Ok(())
  }

  /// Next numeric id not already used in `collection`.
  fn allocate_id(&mut self, collection: &str) -> String {
    loop {
      self.next_id += 1;
      let id = self.next_id.to_string();
      let taken = self
        .collections
        .get(collection)
        .is_some_and(|rows| rows.iter().any(|r| row_id(r).as_deref() == Some(id.as_str())));
      if !taken {
        return id;
      }
    }
  }
}

/// Backend that keeps every collection and bucket in memory.
///
/// Collections and buckets are addressed by name; faults are injected per
/// name (a collection name or a bucket name).
#[derive(Clone, Default)]
pub struct MemoryBackend {
  state: Arc<Mutex<MemoryState>>,
}

impl MemoryBackend {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, MemoryState> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn with_user(self, user: impl Into<UserId>) -> Self {
    self.sign_in(user);
    self
  }

  pub fn sign_in(&self, user: impl Into<UserId>) {
    self.lock().user = Some(user.into());
  }

  pub fn sign_out(&self) {
    self.lock().user = None;
  }

  /// Replace the rows of `collection`.
  pub fn seed(&self, collection: &str, rows: Vec<Row>) {
    self.lock().collections.insert(collection.to_string(), rows);
  }

  pub fn rows(&self, collection: &str) -> Vec<Row> {
    self
      .lock()
      .collections
      .get(collection)
      .cloned()
      .unwrap_or_default()
  }

  pub fn object(&self, bucket: &str, path: &str) -> Option<Vec<u8>> {
    self.lock().buckets.get(bucket)?.get(path).cloned()
  }

  /// Make the next `count` writes to `name` fail with `error`.
  pub fn fail_next_writes(&self, name: &str, count: usize, error: CacheError) {
    let mut state = self.lock();
    let faults = state.faults.entry(name.to_string()).or_default();
    faults.failing_writes = count;
    faults.write_error = Some(error);
  }

  /// Make the next `count` reads of `name` fail with a transport error.
  pub fn fail_next_reads(&self, name: &str, count: usize) {
    self
      .lock()
      .faults
      .entry(name.to_string())
      .or_default()
      .failing_reads = count;
  }

  pub fn read_count(&self, name: &str) -> usize {
    self.lock().reads.get(name).copied().unwrap_or_default()
  }

  pub fn write_count(&self, name: &str) -> usize {
    self.lock().writes.get(name).copied().unwrap_or_default()
  }
}

impl Backend for MemoryBackend {
  fn identity(&self) -> Arc<dyn Identity> {
    Arc::new(self.clone())
  }

  fn collection(&self, name: &str) -> Arc<dyn Collection> {
    Arc::new(MemoryCollection {
      backend: self.clone(),
      name: name.to_string(),
    })
  }

  fn bucket(&self, name: &str) -> Arc<dyn ObjectStore> {
    Arc::new(MemoryBucket {
      backend: self.clone(),
      name: name.to_string(),
    })
  }
}

impl Identity for MemoryBackend {
  fn current_user(&self) -> BoxFuture<'_, Result<Option<UserId>>> {
    future::ready(Ok(self.lock().user.clone())).boxed()
  }
}

struct MemoryCollection {
  backend: MemoryBackend,
  name: String,
}

impl MemoryCollection {
  fn read_now(&self, query: &RowQuery) -> Result<Vec<Row>> {
    let mut state = self.backend.lock();
    state.check_read(&self.name)?;
    let rows = state.collections.get(&self.name).cloned().unwrap_or_default();
    Ok(query.apply(rows))
  }

  fn insert_now(&self, mut row: Row) -> Result<Row> {
    let mut state = self.backend.lock();
    state.check_write(&self.name)?;

    let id = match row_id(&row) {
      Some(id) => id,
      None => state.allocate_id(&self.name),
    };
    let rows = state.collections.entry(self.name.clone()).or_default();
    if rows.iter().any(|r| row_id(r).as_deref() == Some(id.as_str())) {
      return Err(CacheError::Conflict(format!(
        "{} already has a row with id {}",
        self.name, id
      )));
    }

    let now = Value::String(Utc::now().to_rfc3339());
    row.insert("id".into(), Value::String(id));
    row.entry("created_at").or_insert_with(|| now.clone());
    row.entry("updated_at").or_insert(now);
    rows.push(row.clone());
    Ok(row)
  }

  fn update_now(&self, id: &str, patch: Row) -> Result<Row> {
    let mut state = self.backend.lock();
    state.check_write(&self.name)?;

    let row = state
      .collections
      .get_mut(&self.name)
      .and_then(|rows| rows.iter_mut().find(|r| row_id(r).as_deref() == Some(id)))
      .ok_or_else(|| CacheError::NotFound(format!("{} {}", self.name, id)))?;

    for (column, value) in patch {
      if column != "id" {
        row.insert(column, value);
      }
    }
    row.insert("updated_at".into(), Value::String(Utc::now().to_rfc3339()));
    Ok(row.clone())
  }

  fn remove_now(&self, id: &str) -> Result<()> {
    let mut state = self.backend.lock();
    state.check_write(&self.name)?;
    if let Some(rows) = state.collections.get_mut(&self.name) {
      rows.retain(|r| row_id(r).as_deref() != Some(id));
    }
    Ok(())
  }
}

impl Collection for MemoryCollection {
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

struct MemoryBucket {
  backend: MemoryBackend,
  name: String,
}

impl ObjectStore for MemoryBucket {
  fn put<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<()>> {
    let result = {
      let mut state = self.backend.lock();
      state.check_write(&self.name).map(|()| {
        state
          .buckets
          .entry(self.name.clone())
          .or_default()
          .insert(path.to_string(), bytes);
      })
    };
    future::ready(result).boxed()
  }

  fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>> {
    let result = {
      let mut state = self.backend.lock();
      state.check_read(&self.name).and_then(|()| {
        state
          .buckets
          .get(&self.name)
          .and_then(|bucket| bucket.get(path))
          .cloned()
          .ok_or_else(|| CacheError::NotFound(format!("{}/{}", self.name, path)))
      })
    };
    future::ready(result).boxed()
  }

  fn remove<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>> {
    let result = {
      let mut state = self.backend.lock();
      state.check_write(&self.name).map(|()| {
        if let Some(bucket) = state.buckets.get_mut(&self.name) {
          bucket.remove(path);
        }
      })
    };
    future::ready(result).boxed()
  }
}
