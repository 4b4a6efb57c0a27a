//! `QueryClient`: one store with its coordinator and executor.

use std::any::Any;
use std::sync::Arc;

use super::error::Result;
use super::fetch::{FetchCoordinator, Loader};
use super::key::QueryKey;
use super::mutation::{MutationDescriptor, MutationExecutor, PendingMutation};
use super::store::QueryStore;

/// Handle to an independent cache instance.
///
/// Cloning is cheap and every clone shares the same store. Create separate
/// instances with [`QueryClient::new`] (e.g. one per test).
#[derive(Clone)]
pub struct QueryClient {
  store: Arc<QueryStore>,
  fetcher: Arc<FetchCoordinator>,
  executor: MutationExecutor,
}

impl Default for QueryClient {
  fn default() -> Self {
    Self::new()
  }
}

impl QueryClient {
  pub fn new() -> Self {
    let store = Arc::new(QueryStore::new());
    let fetcher = Arc::new(FetchCoordinator::new(Arc::clone(&store)));
    let executor = MutationExecutor::new(Arc::clone(&fetcher));
    Self {
      store,
      fetcher,
      executor,
    }
  }

  pub fn store(&self) -> &Arc<QueryStore> {
    &self.store
  }

  pub fn fetcher(&self) -> &Arc<FetchCoordinator> {
    &self.fetcher
  }

  pub fn executor(&self) -> &MutationExecutor {
    &self.executor
  }

  /// Read `key` through the cache, loading it if it is not fresh.
  pub async fn query<T: Any + Send + Sync>(&self, key: &QueryKey, loader: Loader) -> Result<Arc<T>> {
    self.fetcher.ensure_fresh_as::<T>(key, loader).await
  }

  /// Cached value for `key` without loading.
  pub fn cached<T: Any + Send + Sync>(&self, key: &QueryKey) -> Option<Arc<T>> {
    self.store.data::<T>(key)
  }

  pub async fn invalidate(&self, prefix: &QueryKey) {
    self.fetcher.invalidate(prefix).await;
  }

  pub fn begin<R: Send + 'static>(
    &self,
    descriptor: MutationDescriptor<R>,
  ) -> Result<PendingMutation<R>> {
    self.executor.begin(descriptor)
  }

  pub async fn execute<R: Send + 'static>(&self, descriptor: MutationDescriptor<R>) -> Result<R> {
    self.executor.execute(descriptor).await
  }

  /// Drop every cached entry (sign-out).
  pub fn clear(&self) {
    self.store.clear();
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::{loader, CacheError, OptimisticTarget, QueryStatus};
  use crate::query_key;

  #[tokio::test]
  async fn test_instances_are_independent() {
    let a = QueryClient::new();
    let b = QueryClient::new();
    let key = query_key!["issues"];

    a.query::<u32>(&key, loader(|| async { Ok::<_, CacheError>(1u32) }))
      .await
      .unwrap();

    assert_eq!(a.cached::<u32>(&key).as_deref(), Some(&1));
    assert!(b.cached::<u32>(&key).is_none());
  }

  #[tokio::test]
  async fn test_clones_share_state() {
    let client = QueryClient::new();
    let clone = client.clone();
    let key = query_key!["issues"];
    clone.store().set_value(&key, vec![1u32], QueryStatus::Fresh);

    client
      .execute(
        MutationDescriptor::new("append", || async { Ok(()) })
          .target(OptimisticTarget::append_item(key.clone(), 2u32)),
      )
      .await
      .unwrap();

    assert_eq!(*clone.cached::<Vec<u32>>(&key).unwrap(), vec![1, 2]);
    client.clear();
    assert!(clone.cached::<Vec<u32>>(&key).is_none());
  }
}
