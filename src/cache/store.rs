//! Query store: the single owner of cached entries.

use chrono::{DateTime, Utc};
use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::error::CacheError;
use super::key::QueryKey;
use super::notify::{Listener, NotificationBus, Scope, Subscription};

/// Type-erased cached value. Entries are replaced by swapping the `Arc`,
/// never mutated in place.
pub type CacheData = Arc<dyn Any + Send + Sync>;

/// Freshness of a cache entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum QueryStatus {
  Fresh,
  #[default]
  Stale,
  Fetching,
  Error,
}

/// One cached result set.
#[derive(Clone, Default)]
pub struct CacheEntry {
  pub data: Option<CacheData>,
  pub status: QueryStatus,
  /// Last loader failure. Kept alongside (not instead of) `data`.
  pub error: Option<CacheError>,
  pub last_updated: Option<DateTime<Utc>>,
  /// Token of the latest fetch started for this entry.
  pub inflight_token: u64,
}

impl CacheEntry {
  /// Downcast the cached value to `T`.
  pub fn data_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
    self.data.clone()?.downcast::<T>().ok()
  }

  pub fn has_data(&self) -> bool {
    self.data.is_some()
  }

  /// True if both entries hold the same value (by reference) and metadata.
  pub fn same_state(&self, other: &CacheEntry) -> bool {
    let same_data = match (&self.data, &other.data) {
      (Some(a), Some(b)) => Arc::ptr_eq(a, b),
      (None, None) => true,
      _ => false,
    };
    same_data
      && self.status == other.status
      && self.error == other.error
      && self.last_updated == other.last_updated
  }
}

impl std::fmt::Debug for CacheEntry {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CacheEntry")
      .field("has_data", &self.data.is_some())
      .field("status", &self.status)
      .field("error", &self.error)
      .field("last_updated", &self.last_updated)
      .field("inflight_token", &self.inflight_token)
      .finish()
  }
}

/// Keyed container of cached results.
///
/// Every operation takes the entry lock once, performs its whole
/// read-modify-write and releases the lock before subscribers are notified.
/// That makes each operation atomic with respect to the others; callers that
/// span an `.await` must re-read the entry afterwards.
pub struct QueryStore {
  entries: Mutex<HashMap<QueryKey, CacheEntry>>,
  /// Source of fetch tokens. Shared by all entries so a token is never
  /// reused, even after an entry is evicted and recreated.
  tokens: AtomicU64,
  bus: Arc<NotificationBus>,
}

impl Default for QueryStore {
  fn default() -> Self {
    Self::new()
  }
}

impl QueryStore {
  pub fn new() -> Self {
    Self {
      entries: Mutex::new(HashMap::new()),
      tokens: AtomicU64::new(0),
      bus: Arc::new(NotificationBus::new()),
    }
  }

  fn lock(&self) -> MutexGuard<'_, HashMap<QueryKey, CacheEntry>> {
    self.entries.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn bus(&self) -> &Arc<NotificationBus> {
    &self.bus
  }

  /// Current entry for `key`. Missing keys read as `None`.
  pub fn get(&self, key: &QueryKey) -> Option<CacheEntry> {
    self.lock().get(key).cloned()
  }

  /// Cached value for `key`, if present and of type `T`.
  pub fn data<T: Any + Send + Sync>(&self, key: &QueryKey) -> Option<Arc<T>> {
    self.get(key)?.data_as::<T>()
  }

  /// Replace the data and status of `key` in one step.
  ///
  /// The error is cleared and `last_updated` stamped. The fetch token is
  /// left alone. Subscribers are notified after the write.
  pub fn set(&self, key: &QueryKey, data: Option<CacheData>, status: QueryStatus) {
    let entry = {
      let mut entries = self.lock();
      let entry = entries.entry(key.clone()).or_default();
      entry.data = data;
      entry.status = status;
      entry.error = None;
      entry.last_updated = Some(Utc::now());
      entry.clone()
    };
    self.bus.emit(key, &entry);
  }

  /// Typed convenience over [`QueryStore::set`].
  pub fn set_value<T: Any + Send + Sync>(&self, key: &QueryKey, value: T, status: QueryStatus) {
    self.set(key, Some(Arc::new(value)), status);
  }

  /// Subscribe to changes of exactly `key`.
  pub fn subscribe(&self, key: QueryKey, listener: Listener) -> Subscription {
    self.bus.subscribe(key, Scope::Exact, listener)
  }

  /// Subscribe to changes of `prefix` and every key under it.
  pub fn subscribe_prefix(&self, prefix: QueryKey, listener: Listener) -> Subscription {
    self.bus.subscribe(prefix, Scope::Prefix, listener)
  }

  /// Keys currently present under `prefix` (including `prefix` itself).
  pub fn keys_with_prefix(&self, prefix: &QueryKey) -> Vec<QueryKey> {
    let mut keys: Vec<QueryKey> = self
      .lock()
      .keys()
      .filter(|k| k.starts_with(prefix))
      .cloned()
      .collect();
    keys.sort();
    keys
  }

  /// Mark `prefix` and every key under it stale without touching data.
  /// Returns the affected keys. Does not start any fetch.
  pub fn mark_stale(&self, prefix: &QueryKey) -> Vec<QueryKey> {
    let changed: Vec<(QueryKey, CacheEntry)> = {
      let mut entries = self.lock();
      let mut changed: Vec<(QueryKey, CacheEntry)> = entries
        .iter_mut()
        .filter(|(k, _)| k.starts_with(prefix))
        .map(|(k, entry)| {
          entry.status = QueryStatus::Stale;
          (k.clone(), entry.clone())
        })
        .collect();
      changed.sort_by(|a, b| a.0.cmp(&b.0));
      changed
    };

    for (key, entry) in &changed {
      self.bus.emit(key, entry);
    }
    changed.into_iter().map(|(k, _)| k).collect()
  }

  /// Evict every entry, e.g. on sign-out. Subscriptions survive.
  pub fn clear(&self) {
    let evicted: Vec<QueryKey> = self.lock().drain().map(|(k, _)| k).collect();
    let empty = CacheEntry::default();
    for key in &evicted {
      self.bus.emit(key, &empty);
    }
  }

  pub fn len(&self) -> usize {
    self.lock().len()
  }

  pub fn is_empty(&self) -> bool {
    self.lock().is_empty()
  }

  /// Start a fetch: allocate a new token and mark the entry Fetching.
  pub(crate) fn begin_fetch(&self, key: &QueryKey) -> u64 {
    let token = self.tokens.fetch_add(1, Ordering::SeqCst) + 1;
    let entry = {
      let mut entries = self.lock();
      let entry = entries.entry(key.clone()).or_default();
      entry.inflight_token = token;
      entry.status = QueryStatus::Fetching;
      entry.clone()
    };
    self.bus.emit(key, &entry);
    token
  }

  /// Invalidate the token of any in-flight fetch for `key` so its result is
  /// discarded on arrival. A Fetching entry becomes Stale. Returns whether
  /// there was a fetch to supersede.
  pub(crate) fn supersede(&self, key: &QueryKey) -> bool {
    let token = self.tokens.fetch_add(1, Ordering::SeqCst) + 1;
    let entry = {
      let mut entries = self.lock();
      match entries.get_mut(key) {
        Some(entry) if entry.status == QueryStatus::Fetching => {
          entry.inflight_token = token;
          entry.status = QueryStatus::Stale;
          entry.clone()
        }
        Some(entry) => {
          entry.inflight_token = token;
          return false;
        }
        None => return false,
      }
    };
    self.bus.emit(key, &entry);
    true
  }

  /// Commit the outcome of the fetch holding `token`. Returns false (and
  /// changes nothing) if a newer fetch or write has superseded it.
  pub(crate) fn resolve_fetch(
    &self,
    key: &QueryKey,
    token: u64,
    outcome: &Result<CacheData, CacheError>,
  ) -> bool {
    let entry = {
      let mut entries = self.lock();
      let entry = match entries.get_mut(key) {
        Some(entry) if entry.inflight_token == token => entry,
        _ => return false,
      };
      match outcome {
        Ok(data) => {
          entry.data = Some(Arc::clone(data));
          entry.status = QueryStatus::Fresh;
          entry.error = None;
          entry.last_updated = Some(Utc::now());
        }
        Err(err) => {
          // Keep whatever data we had; only the status changes.
          entry.status = QueryStatus::Error;
          entry.error = Some(err.clone());
        }
      }
      entry.clone()
    };
    self.bus.emit(key, &entry);
    true
  }

  /// Put back an entry captured earlier. `None` means the key did not exist
  /// and is evicted again. A captured Fetching status comes back as Stale,
  /// since the fetch it referred to has been superseded.
  pub(crate) fn restore(&self, key: &QueryKey, captured: Option<&CacheEntry>) {
    let entry = {
      let mut entries = self.lock();
      match captured {
        Some(captured) => {
          let entry = entries.entry(key.clone()).or_default();
          entry.data = captured.data.clone();
          entry.status = match captured.status {
            QueryStatus::Fetching => QueryStatus::Stale,
            status => status,
          };
          entry.error = captured.error.clone();
          entry.last_updated = captured.last_updated;
          entry.clone()
        }
        None => {
          entries.remove(key);
          CacheEntry::default()
        }
      }
    };
    self.bus.emit(key, &entry);
  }
}
