//! Fetch coordinator: deduplicated, supersedable reads.

use futures::future::{join_all, BoxFuture, FutureExt, Shared};
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, warn};

use super::error::{CacheError, Result};
use super::key::QueryKey;
use super::store::{CacheData, CacheEntry, QueryStatus, QueryStore};

type FetchOutcome = Result<CacheData>;
type SharedFetch = Shared<BoxFuture<'static, FetchOutcome>>;

/// A factory for futures that load one key from the backend.
///
/// The coordinator may call it again later (on invalidation or refetch), so
/// it must be `Fn`, not `FnOnce`.
pub type Loader = Arc<dyn Fn() -> BoxFuture<'static, FetchOutcome> + Send + Sync>;

/// Wrap a typed async closure as a [`Loader`].
///
/// ```ignore
/// let issues = loader(move || {
///   let backend = backend.clone();
///   async move { fetch_issues(&*backend).await }
/// });
/// ```
pub fn loader<T, F, Fut>(fetcher: F) -> Loader
where
  T: Any + Send + Sync,
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T>> + Send + 'static,
{
  Arc::new(move || {
    let fut = fetcher();
    async move { fut.await.map(|value| Arc::new(value) as CacheData) }.boxed()
  })
}

/// Downcast a loaded value, reporting the key on mismatch.
pub(crate) fn downcast<T: Any + Send + Sync>(key: &QueryKey, data: CacheData) -> Result<Arc<T>> {
  data.downcast::<T>().map_err(|_| {
    CacheError::Decode(format!(
      "cached value for {} is not a {}",
      key,
      std::any::type_name::<T>()
    ))
  })
}

struct InFlight {
  token: u64,
  future: SharedFetch,
}

/// Coordinates reads against the [`QueryStore`].
///
/// Concurrent `ensure_fresh` calls for one key share a single loader call.
/// Every fetch carries a token allocated by the store; a result is committed
/// only if its token is still the latest for the key, so a slow, older
/// fetch can never overwrite a newer fetch or an optimistic write.
pub struct FetchCoordinator {
  store: Arc<QueryStore>,
  inflight: Arc<Mutex<HashMap<QueryKey, InFlight>>>,
  loaders: Mutex<HashMap<QueryKey, Loader>>,
}

impl FetchCoordinator {
  pub fn new(store: Arc<QueryStore>) -> Self {
    Self {
      store,
      inflight: Arc::new(Mutex::new(HashMap::new())),
      loaders: Mutex::new(HashMap::new()),
    }
  }

  pub fn store(&self) -> &Arc<QueryStore> {
    &self.store
  }

  fn inflight(&self) -> MutexGuard<'_, HashMap<QueryKey, InFlight>> {
    self.inflight.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn loaders(&self) -> MutexGuard<'_, HashMap<QueryKey, Loader>> {
    self.loaders.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// The loader most recently used for `key`, if any.
  pub fn loader_for(&self, key: &QueryKey) -> Option<Loader> {
    self.loaders().get(key).cloned()
  }

  /// Make sure `key` holds fresh data, loading it if needed.
  ///
  /// - Fresh: returns the cached value without calling the loader.
  /// - Fetching: joins the fetch already in flight.
  /// - Stale, Error or missing: starts a new fetch.
  ///
  /// Loader failures are recorded on the entry (status Error, data kept)
  /// and also returned.
  pub async fn ensure_fresh(&self, key: &QueryKey, loader: Loader) -> Result<CacheData> {
    self.loaders().insert(key.clone(), Arc::clone(&loader));

    let fetch = match self.store.get(key) {
      Some(CacheEntry {
        status: QueryStatus::Fresh,
        data: Some(data),
        ..
      }) => return Ok(data),
      Some(entry) if entry.status == QueryStatus::Fetching => {
        match self.join(key, entry.inflight_token) {
          Some(fetch) => fetch,
          None => self.start(key, loader),
        }
      }
      _ => self.start(key, loader),
    };

    fetch.await
  }

  /// Typed convenience over [`FetchCoordinator::ensure_fresh`].
  pub async fn ensure_fresh_as<T: Any + Send + Sync>(
    &self,
    key: &QueryKey,
    loader: Loader,
  ) -> Result<Arc<T>> {
    let data = self.ensure_fresh(key, loader).await?;
    downcast(key, data)
  }

  /// Force a new fetch of `key` with its remembered loader, superseding
  /// any fetch in flight.
  pub async fn refetch(&self, key: &QueryKey) -> Result<CacheData> {
    let loader = self
      .loader_for(key)
      .ok_or_else(|| CacheError::NotFound(format!("no loader registered for {}", key)))?;
    self.refetch_with(key, loader).await
  }

  /// Like [`FetchCoordinator::refetch`], registering `loader` for the key.
  pub async fn refetch_with(&self, key: &QueryKey, loader: Loader) -> Result<CacheData> {
    self.loaders().insert(key.clone(), Arc::clone(&loader));
    self.supersede(key);
    self.start(key, loader).await
  }

  /// Soft-cancel any fetch in flight for `key`: its result will be dropped
  /// on arrival.
  pub fn supersede(&self, key: &QueryKey) {
    if self.store.supersede(key) {
      debug!(%key, "superseded in-flight fetch");
    }
    self.inflight().remove(key);
  }

  /// Mark `prefix` stale and refresh the observed keys under it.
  ///
  /// Keys with no subscriber are only marked stale and will be loaded on
  /// their next read. Refresh failures are logged, never returned: the
  /// previous data stays visible with status Error.
  pub async fn invalidate(&self, prefix: &QueryKey) {
    for key in self.store.keys_with_prefix(prefix) {
      self.supersede(&key);
    }
    let stale = self.store.mark_stale(prefix);

    let bus = self.store.bus();
    let refreshes: Vec<_> = stale
      .into_iter()
      .filter(|key| bus.is_observed(key))
      .filter_map(|key| self.loader_for(&key).map(|loader| (key, loader)))
      .map(|(key, loader)| async move {
        if let Err(e) = self.ensure_fresh(&key, loader).await {
          warn!(%key, error = %e, "background refresh failed");
        }
      })
      .collect();

    debug!(%prefix, refreshes = refreshes.len(), "invalidated");
    join_all(refreshes).await;
  }

  fn join(&self, key: &QueryKey, token: u64) -> Option<SharedFetch> {
    self
      .inflight()
      .get(key)
      .filter(|f| f.token == token)
      .map(|f| f.future.clone())
  }

  fn start(&self, key: &QueryKey, loader: Loader) -> SharedFetch {
    let token = self.store.begin_fetch(key);
    debug!(%key, token, "fetch started");

    let store = Arc::clone(&self.store);
    let inflight = Arc::clone(&self.inflight);
    let owned_key = key.clone();
    let load = loader();

    let fetch = async move {
      let outcome = load.await;
      if !store.resolve_fetch(&owned_key, token, &outcome) {
        debug!(key = %owned_key, token, "discarded superseded fetch result");
      }
      let mut inflight = inflight.lock().unwrap_or_else(PoisonError::into_inner);
      if inflight.get(&owned_key).is_some_and(|f| f.token == token) {
        inflight.remove(&owned_key);
      }
      outcome
    }
    .boxed()
    .shared();

    self.inflight().insert(
      key.clone(),
      InFlight {
        token,
        future: fetch.clone(),
      },
    );
    fetch
  }
}
