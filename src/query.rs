//! Observer binding a view to one cache key.
//!
//! A `QueryObserver<T>` subscribes to a key in a [`QueryClient`] and turns
//! cache notifications into a [`QueryState`] the caller reads between
//! ticks. Because it holds a subscription, the key counts as observed and is
//! refreshed in the background whenever it is invalidated.
//!
//! # Example
//!
//! ```ignore
//! let mut issues = QueryObserver::<Vec<Issue>>::new(
//!   tracker.cache().clone(),
//!   TrackerQueryKey::Issues.query_key(),
//!   tracker.loader_for(&TrackerQueryKey::Issues),
//! );
//!
//! // Start fetching
//! issues.fetch();
//!
//! // In event loop tick
//! if issues.poll() {
//!   // State changed, trigger re-render
//! }
//!
//! match issues.state() {
//!   QueryState::Loading => render_spinner(),
//!   QueryState::Success(data) => render_issues(data),
//!   QueryState::Error(e) => render_error(e),
//!   QueryState::Idle => {}
//! }
//! ```

use chrono::{DateTime, Utc};
use std::any::Any;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use crate::cache::{CacheEntry, Loader, QueryClient, QueryKey, QueryStatus, Subscription};

/// The state of a query
#[derive(Debug, Clone)]
pub enum QueryState<T> {
  /// Nothing cached and no fetch started
  Idle,
  /// First fetch in flight
  Loading,
  /// Data available, possibly stale or being refreshed
  Success(T),
  /// Fetch failed and there is no data to show
  Error(String),
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error(_))
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&str> {
    match self {
      QueryState::Error(e) => Some(e),
      _ => None,
    }
  }
}

/// Live view of one cache key.
pub struct QueryObserver<T> {
  client: QueryClient,
  key: QueryKey,
  loader: Loader,
  state: QueryState<Arc<T>>,
  status: Option<QueryStatus>,
  last_error: Option<String>,
  updated_at: Option<DateTime<Utc>>,
  receiver: mpsc::UnboundedReceiver<CacheEntry>,
  _subscription: Subscription,
}

impl<T: Any + Send + Sync> QueryObserver<T> {
  /// Observe `key`, loading it with `loader` on [`QueryObserver::fetch`].
  ///
  /// The initial state reflects whatever is already cached.
  pub fn new(client: QueryClient, key: QueryKey, loader: Loader) -> Self {
    let (tx, receiver) = mpsc::unbounded_channel();
    let subscription = client.store().subscribe(
      key.clone(),
      Arc::new(move |_, entry: &CacheEntry| {
        // Ignore send errors - the observer may have been dropped
        let _ = tx.send(entry.clone());
      }),
    );

    let mut observer = Self {
      client,
      key,
      loader,
      state: QueryState::Idle,
      status: None,
      last_error: None,
      updated_at: None,
      receiver,
      _subscription: subscription,
    };
    if let Some(entry) = observer.client.store().get(&observer.key) {
      observer.apply(&entry);
    }
    observer
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  pub fn state(&self) -> &QueryState<Arc<T>> {
    &self.state
  }

  pub fn data(&self) -> Option<&Arc<T>> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&str> {
    self.state.error()
  }

  /// Cache status of the key, `None` if it has no entry.
  pub fn status(&self) -> Option<QueryStatus> {
    self.status
  }

  /// Shown data is older than the backend (invalidated or a refresh failed).
  pub fn is_stale(&self) -> bool {
    self.data().is_some() && matches!(self.status, Some(QueryStatus::Stale | QueryStatus::Error))
  }

  /// Error of the latest failed fetch, even when older data is still shown.
  pub fn last_error(&self) -> Option<&str> {
    self.last_error.as_deref()
  }

  pub fn updated_at(&self) -> Option<DateTime<Utc>> {
    self.updated_at
  }

  /// Load the key unless it is fresh or already loading.
  pub fn fetch(&mut self) {
    if let Some(entry) = self.client.store().get(&self.key) {
      if entry.status == QueryStatus::Fresh && entry.has_data() {
        self.apply(&entry);
        return;
      }
    }
    if self.state.is_loading() {
      return;
    }
    if self.data().is_none() {
      self.state = QueryState::Loading;
    }

    let fetcher = Arc::clone(self.client.fetcher());
    let key = self.key.clone();
    let loader = Arc::clone(&self.loader);
    tokio::spawn(async move {
      // Failures are recorded on the entry and arrive as a notification
      let _ = fetcher.ensure_fresh(&key, loader).await;
    });
  }

  /// Force a new fetch, superseding any in flight.
  pub fn refetch(&mut self) {
    if self.data().is_none() {
      self.state = QueryState::Loading;
    }
    debug!(key = %self.key, "refetch");

    let fetcher = Arc::clone(self.client.fetcher());
    let key = self.key.clone();
    let loader = Arc::clone(&self.loader);
    tokio::spawn(async move {
      let _ = fetcher.refetch_with(&key, loader).await;
    });
  }

  /// Apply pending cache notifications.
  ///
  /// Returns `true` if anything arrived. Call this in your event loop tick
  /// handler.
  pub fn poll(&mut self) -> bool {
    let mut latest = None;
    while let Ok(entry) = self.receiver.try_recv() {
      latest = Some(entry);
    }
    match latest {
      Some(entry) => {
        self.apply(&entry);
        true
      }
      None => false,
    }
  }

  fn apply(&mut self, entry: &CacheEntry) {
    self.updated_at = entry.last_updated;
    self.last_error = entry.error.as_ref().map(ToString::to_string);
    self.status = (entry.has_data() || entry.status != QueryStatus::Stale || entry.error.is_some())
      .then_some(entry.status);

    self.state = match (&entry.data, entry.status) {
      (Some(_), _) => match entry.data_as::<T>() {
        Some(data) => QueryState::Success(data),
        None => QueryState::Error(format!(
          "cached value for {} is not a {}",
          self.key,
          std::any::type_name::<T>()
        )),
      },
      (None, QueryStatus::Fetching) => QueryState::Loading,
      (None, QueryStatus::Error) => {
        QueryState::Error(self.last_error.clone().unwrap_or_else(|| "fetch failed".to_string()))
      }
      (None, _) => QueryState::Idle,
    };
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for QueryObserver<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("QueryObserver")
      .field("key", &self.key)
      .field("state", &self.state)
      .field("status", &self.status)
      .finish_non_exhaustive()
  }
}
