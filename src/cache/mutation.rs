//! Mutation executor: optimistic apply, commit, rollback and reconciliation.

use futures::future::{BoxFuture, FutureExt};
use std::any::{type_name, Any};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::error::{CacheError, Result};
use super::fetch::FetchCoordinator;
use super::key::QueryKey;
use super::store::{CacheData, CacheEntry, QueryStatus, QueryStore};

type ApplyFn =
  Box<dyn FnOnce(Option<CacheData>) -> std::result::Result<Option<CacheData>, String> + Send>;
type CommitFn<R> = Box<dyn FnOnce() -> BoxFuture<'static, Result<R>> + Send>;

/// One cache entry a mutation updates optimistically.
///
/// The apply function receives the current value (if any) and returns the
/// replacement. Returning `Ok(None)` leaves the entry untouched, which is
/// what the helpers do when the target has not been loaded yet. Returning
/// `Err` aborts the whole mutation before its commit runs.
pub struct OptimisticTarget {
  key: QueryKey,
  apply: ApplyFn,
}

impl OptimisticTarget {
  pub fn new<T, F>(key: QueryKey, apply: F) -> Self
  where
    T: Any + Send + Sync,
    F: FnOnce(Option<&T>) -> std::result::Result<Option<T>, String> + Send + 'static,
  {
    let apply: ApplyFn = Box::new(move |current| {
      let typed = match current {
        Some(data) => Some(
          data
            .downcast::<T>()
            .map_err(|_| format!("cached value is not a {}", type_name::<T>()))?,
        ),
        None => None,
      };
      Ok(apply(typed.as_deref())?.map(|value| Arc::new(value) as CacheData))
    });
    Self { key, apply }
  }

  /// Patch a copy of a single cached value.
  pub fn patch<T, F>(key: QueryKey, patch: F) -> Self
  where
    T: Clone + Any + Send + Sync,
    F: FnOnce(&mut T) -> std::result::Result<(), String> + Send + 'static,
  {
    Self::new(key, move |current: Option<&T>| match current {
      Some(value) => {
        let mut next = value.clone();
        patch(&mut next)?;
        Ok(Some(next))
      }
      None => Ok(None),
    })
  }

  /// Patch every element of a cached list that matches `predicate`.
  pub fn patch_item<T, P, F>(key: QueryKey, predicate: P, patch: F) -> Self
  where
    T: Clone + Any + Send + Sync,
    P: Fn(&T) -> bool + Send + 'static,
    F: Fn(&mut T) -> std::result::Result<(), String> + Send + 'static,
  {
    Self::new(key, move |current: Option<&Vec<T>>| {
      let Some(list) = current else {
        return Ok(None);
      };
      let mut next = list.clone();
      for item in next.iter_mut() {
        if predicate(&*item) {
          patch(item)?;
        }
      }
      Ok(Some(next))
    })
  }

  /// Remove every element of a cached list that matches `predicate`.
  ///
  /// Rollback restores the captured list as a whole, so removed elements
  /// come back at their original positions.
  pub fn remove_item<T, P>(key: QueryKey, predicate: P) -> Self
  where
    T: Clone + Any + Send + Sync,
    P: Fn(&T) -> bool + Send + 'static,
  {
    Self::new(key, move |current: Option<&Vec<T>>| {
      Ok(current.map(|list| list.iter().filter(|item| !predicate(*item)).cloned().collect()))
    })
  }

  /// Insert `item` at the front of a cached list.
  pub fn prepend_item<T>(key: QueryKey, item: T) -> Self
  where
    T: Clone + Any + Send + Sync,
  {
    Self::new(key, move |current: Option<&Vec<T>>| {
      Ok(current.map(|list| {
        let mut next = Vec::with_capacity(list.len() + 1);
        next.push(item);
        next.extend(list.iter().cloned());
        next
      }))
    })
  }

  /// Add `item` at the end of a cached list.
  pub fn append_item<T>(key: QueryKey, item: T) -> Self
  where
    T: Clone + Any + Send + Sync,
  {
    Self::new(key, move |current: Option<&Vec<T>>| {
      Ok(current.map(|list| {
        let mut next = list.clone();
        next.push(item);
        next
      }))
    })
  }

  pub fn key(&self) -> &QueryKey {
    &self.key
  }
}

/// A write together with the cache entries it affects.
///
/// `targets` must name every entry the optimistic update touches; the
/// executor snapshots exactly those. `invalidate_keys` lists entries that are
/// semantically affected but not patched (refreshed after success).
pub struct MutationDescriptor<R> {
  label: String,
  targets: Vec<OptimisticTarget>,
  commit: CommitFn<R>,
  invalidate_keys: Vec<QueryKey>,
  rollback_on_error: bool,
  invalidate_on_error: bool,
}

impl<R: Send + 'static> MutationDescriptor<R> {
  pub fn new<F, Fut>(label: impl Into<String>, commit: F) -> Self
  where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<R>> + Send + 'static,
  {
    Self {
      label: label.into(),
      targets: Vec::new(),
      commit: Box::new(move || commit().boxed()),
      invalidate_keys: Vec::new(),
      rollback_on_error: true,
      invalidate_on_error: false,
    }
  }

  pub fn target(mut self, target: OptimisticTarget) -> Self {
    self.targets.push(target);
    self
  }

  pub fn invalidates(mut self, key: QueryKey) -> Self {
    self.invalidate_keys.push(key);
    self
  }

  /// Restore the snapshot when the commit fails. On by default.
  pub fn rollback_on_error(mut self, enabled: bool) -> Self {
    self.rollback_on_error = enabled;
    self
  }

  /// Also refresh target keys after a failed commit (once the snapshot has
  /// been restored). Off by default.
  pub fn invalidate_on_error(mut self, enabled: bool) -> Self {
    self.invalidate_on_error = enabled;
    self
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  pub fn target_keys(&self) -> impl Iterator<Item = &QueryKey> {
    self.targets.iter().map(OptimisticTarget::key)
  }
}

/// Pre-mutation copies of the target entries.
///
/// `None` records that the key had no entry.
#[derive(Debug, Default, Clone)]
pub struct Snapshot {
  entries: Vec<(QueryKey, Option<CacheEntry>)>,
}

impl Snapshot {
  /// Record `entry` for `key` unless this snapshot already holds the key.
  fn capture(&mut self, key: &QueryKey, entry: Option<CacheEntry>) {
    if !self.contains(key) {
      self.entries.push((key.clone(), entry));
    }
  }

  pub fn contains(&self, key: &QueryKey) -> bool {
    self.entries.iter().any(|(k, _)| k == key)
  }

  /// The captured entry for `key`, if the key was captured and existed.
  pub fn entry(&self, key: &QueryKey) -> Option<&CacheEntry> {
    self
      .entries
      .iter()
      .find(|(k, _)| k == key)
      .and_then(|(_, entry)| entry.as_ref())
  }

  pub fn keys(&self) -> impl Iterator<Item = &QueryKey> {
    self.entries.iter().map(|(k, _)| k)
  }

  pub fn len(&self) -> usize {
    self.entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Put back the captured entries for `keys`, last applied first.
  fn restore(&self, store: &QueryStore, keys: &[QueryKey]) {
    for key in keys.iter().rev() {
      if let Some((_, captured)) = self.entries.iter().find(|(k, _)| k == key) {
        store.restore(key, captured.as_ref());
      }
    }
  }
}

/// Lifecycle of one mutation.
///
/// `Idle -> Applying -> Committing -> SettledSuccess | SettledError`. A
/// failed optimistic apply goes straight from `Applying` to `SettledError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationPhase {
  Idle,
  Applying,
  Committing,
  SettledSuccess,
  SettledError,
}

impl MutationPhase {
  pub fn is_settled(self) -> bool {
    matches!(self, MutationPhase::SettledSuccess | MutationPhase::SettledError)
  }
}

fn advance(label: &str, phase: &watch::Sender<MutationPhase>, next: MutationPhase) {
  let prev = phase.send_replace(next);
  debug!(%label, from = ?prev, to = ?next, "mutation phase");
}

/// A mutation whose optimistic update is visible and whose commit has not
/// run yet. Obtain one from [`MutationExecutor::begin`] and drive it with
/// [`PendingMutation::settle`].
pub struct PendingMutation<R> {
  label: String,
  phase: watch::Sender<MutationPhase>,
  snapshot: Snapshot,
  applied: Vec<QueryKey>,
  target_keys: Vec<QueryKey>,
  invalidate_keys: Vec<QueryKey>,
  commit: CommitFn<R>,
  rollback_on_error: bool,
  invalidate_on_error: bool,
  store: Arc<QueryStore>,
  fetcher: Arc<FetchCoordinator>,
}

impl<R: Send + 'static> PendingMutation<R> {
  pub fn phase(&self) -> MutationPhase {
    *self.phase.borrow()
  }

  /// Follow the phase past [`PendingMutation::settle`], which consumes the
  /// mutation.
  pub fn watch_phase(&self) -> watch::Receiver<MutationPhase> {
    self.phase.subscribe()
  }

  pub fn snapshot(&self) -> &Snapshot {
    &self.snapshot
  }

  pub fn label(&self) -> &str {
    &self.label
  }

  /// Run the commit and settle the cache.
  ///
  /// On success the optimistic values stay in place and every target and
  /// declared invalidation key is refreshed. On failure the snapshot is
  /// restored for every applied key and the error is returned.
  pub async fn settle(self) -> Result<R> {
    let PendingMutation {
      label,
      phase,
      snapshot,
      applied,
      target_keys,
      invalidate_keys,
      commit,
      rollback_on_error,
      invalidate_on_error,
      store,
      fetcher,
    } = self;

    let result = commit().await;
    match result {
      Ok(value) => {
        advance(&label, &phase, MutationPhase::SettledSuccess);
        info!(%label, "mutation committed");
        let keys: Vec<QueryKey> = target_keys.into_iter().chain(invalidate_keys).collect();
        reconcile(&fetcher, keys).await;
        Ok(value)
      }
      Err(err) => {
        warn!(%label, error = %err, "mutation failed");
        if rollback_on_error {
          snapshot.restore(&store, &applied);
          debug!(%label, keys = applied.len(), "rolled back");
        }
        advance(&label, &phase, MutationPhase::SettledError);
        if invalidate_on_error || !rollback_on_error {
          reconcile(&fetcher, target_keys).await;
        }
        Err(err)
      }
    }
  }
}

async fn reconcile(fetcher: &FetchCoordinator, keys: Vec<QueryKey>) {
  for key in collapse_prefixes(keys) {
    fetcher.invalidate(&key).await;
  }
}

/// Drop duplicates and keys already covered by a shorter key in the list.
fn collapse_prefixes(mut keys: Vec<QueryKey>) -> Vec<QueryKey> {
  keys.sort_by_key(QueryKey::len);
  let mut kept: Vec<QueryKey> = Vec::new();
  for key in keys {
    if !kept.iter().any(|prefix| key.starts_with(prefix)) {
      kept.push(key);
    }
  }
  kept
}

/// Runs mutations against a shared [`QueryStore`].
#[derive(Clone)]
pub struct MutationExecutor {
  store: Arc<QueryStore>,
  fetcher: Arc<FetchCoordinator>,
}

impl MutationExecutor {
  pub fn new(fetcher: Arc<FetchCoordinator>) -> Self {
    Self {
      store: Arc::clone(fetcher.store()),
      fetcher,
    }
  }

  /// Snapshot the targets and apply the optimistic update.
  ///
  /// This step is synchronous. Mutations on the same key serialize here:
  /// a second mutation snapshots the first one's optimistic value. If any
  /// apply fails, the keys already applied are restored and `LocalApply` is
  /// returned; the commit never runs.
  ///
  /// Only keys the apply actually replaces have their in-flight fetch
  /// superseded. A target that is still loading for the first time keeps
  /// its load.
  pub fn begin<R: Send + 'static>(
    &self,
    descriptor: MutationDescriptor<R>,
  ) -> Result<PendingMutation<R>> {
    let MutationDescriptor {
      label,
      targets,
      commit,
      invalidate_keys,
      rollback_on_error,
      invalidate_on_error,
    } = descriptor;

    let (phase, _) = watch::channel(MutationPhase::Idle);
    advance(&label, &phase, MutationPhase::Applying);

    let mut snapshot = Snapshot::default();
    let mut applied: Vec<QueryKey> = Vec::new();
    let mut target_keys: Vec<QueryKey> = Vec::new();

    for OptimisticTarget { key, apply } in targets {
      let current = self.store.get(&key);
      snapshot.capture(&key, current.clone());

      match apply(current.and_then(|entry| entry.data)) {
        Ok(Some(next)) => {
          self.fetcher.supersede(&key);
          self.store.set(&key, Some(next), QueryStatus::Fresh);
          if !applied.contains(&key) {
            applied.push(key.clone());
          }
        }
        Ok(None) => {}
        Err(reason) => {
          snapshot.restore(&self.store, &applied);
          advance(&label, &phase, MutationPhase::SettledError);
          warn!(%label, %key, %reason, "optimistic update failed");
          return Err(CacheError::LocalApply { key, reason });
        }
      }

      if !target_keys.contains(&key) {
        target_keys.push(key);
      }
    }

    debug!(%label, keys = applied.len(), "optimistic update applied");
    advance(&label, &phase, MutationPhase::Committing);
    Ok(PendingMutation {
      label,
      phase,
      snapshot,
      applied,
      target_keys,
      invalidate_keys,
      commit,
      rollback_on_error,
      invalidate_on_error,
      store: Arc::clone(&self.store),
      fetcher: Arc::clone(&self.fetcher),
    })
  }

  /// [`MutationExecutor::begin`] followed by [`PendingMutation::settle`].
  pub async fn execute<R: Send + 'static>(&self, descriptor: MutationDescriptor<R>) -> Result<R> {
    self.begin(descriptor)?.settle().await
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::fetch::loader;
  use crate::query_key;
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::sync::Mutex;
  use tokio::sync::oneshot;

  #[derive(Debug, Clone, PartialEq)]
  struct Item {
    id: String,
    status: String,
  }

  fn item(id: &str, status: &str) -> Item {
    Item {
      id: id.to_string(),
      status: status.to_string(),
    }
  }

  fn setup() -> (Arc<QueryStore>, Arc<FetchCoordinator>, MutationExecutor) {
    let store = Arc::new(QueryStore::new());
    let fetcher = Arc::new(FetchCoordinator::new(Arc::clone(&store)));
    let executor = MutationExecutor::new(Arc::clone(&fetcher));
    (store, fetcher, executor)
  }

  fn list_key() -> QueryKey {
    query_key!["issue-list"]
  }

  fn entity_key(id: &str) -> QueryKey {
    query_key!["issue", id]
  }

  fn close_issue(id: &'static str) -> [OptimisticTarget; 2] {
    [
      OptimisticTarget::patch_item(
        list_key(),
        move |i: &Item| i.id == id,
        |i: &mut Item| {
          i.status = "closed".into();
          Ok(())
        },
      ),
      OptimisticTarget::patch(entity_key(id), |i: &mut Item| {
        i.status = "closed".into();
        Ok(())
      }),
    ]
  }

  #[tokio::test]
  async fn test_failed_commit_restores_every_target() {
    let (store, _, executor) = setup();
    store.set_value(&list_key(), vec![item("1", "open")], QueryStatus::Fresh);
    store.set_value(&entity_key("1"), item("1", "open"), QueryStatus::Fresh);
    let before_list = store.get(&list_key()).unwrap();
    let before_entity = store.get(&entity_key("1")).unwrap();

    let [list_target, entity_target] = close_issue("1");
    let descriptor = MutationDescriptor::new("close", || async {
      Err::<(), _>(CacheError::Transport("connection reset".into()))
    })
    .target(list_target)
    .target(entity_target);

    let pending = executor.begin(descriptor).unwrap();
    let phase = pending.watch_phase();
    assert_eq!(pending.phase(), MutationPhase::Committing);
    assert_eq!(pending.snapshot().len(), 2);
    assert_eq!(
      store.data::<Vec<Item>>(&list_key()).unwrap()[0].status,
      "closed"
    );
    assert_eq!(store.data::<Item>(&entity_key("1")).unwrap().status, "closed");

    let result = pending.settle().await;
    assert_eq!(result, Err(CacheError::Transport("connection reset".into())));
    assert_eq!(*phase.borrow(), MutationPhase::SettledError);

    assert!(store.get(&list_key()).unwrap().same_state(&before_list));
    assert!(store.get(&entity_key("1")).unwrap().same_state(&before_entity));
    assert_eq!(store.data::<Vec<Item>>(&list_key()).unwrap()[0].status, "open");
  }

  #[tokio::test]
  async fn test_local_apply_failure_rolls_back_and_skips_commit() {
    let (store, _, executor) = setup();
    store.set_value(&list_key(), vec![item("1", "open")], QueryStatus::Fresh);
    store.set_value(&entity_key("1"), item("1", "open"), QueryStatus::Fresh);
    let before = store.get(&list_key()).unwrap();

    let commits = Arc::new(AtomicUsize::new(0));
    let commits_clone = Arc::clone(&commits);
    let [list_target, _] = close_issue("1");
    let descriptor = MutationDescriptor::new("bad patch", move || {
      commits_clone.fetch_add(1, Ordering::SeqCst);
      async { Ok(()) }
    })
    .target(list_target)
    .target(OptimisticTarget::patch(entity_key("1"), |_: &mut Item| {
      Err("status must not be empty".to_string())
    }));

    let result = executor.execute(descriptor).await;

    assert!(matches!(
      result,
      Err(CacheError::LocalApply { ref key, .. }) if *key == entity_key("1")
    ));
    assert_eq!(commits.load(Ordering::SeqCst), 0);
    assert!(store.get(&list_key()).unwrap().same_state(&before));
  }

  #[tokio::test]
  async fn test_unloaded_target_keeps_its_first_load() {
    let (store, fetcher, executor) = setup();
    let (gate, wait) = oneshot::channel::<()>();
    let wait = Arc::new(Mutex::new(Some(wait)));
    let list_loader = loader(move || {
      let wait = wait.lock().unwrap().take();
      async move {
        if let Some(wait) = wait {
          let _ = wait.await;
        }
        Ok::<_, CacheError>(vec![item("1", "open"), item("2", "open")])
      }
    });

    let reader = {
      let fetcher = Arc::clone(&fetcher);
      tokio::spawn(async move {
        let key = list_key();
        fetcher.ensure_fresh_as::<Vec<Item>>(&key, list_loader).await
      })
    };
    while store.get(&list_key()).map(|entry| entry.status) != Some(QueryStatus::Fetching) {
      tokio::task::yield_now().await;
    }

    let descriptor = MutationDescriptor::new("create", || async {
      Err::<(), _>(CacheError::Transport("offline".into()))
    })
    .target(OptimisticTarget::prepend_item(list_key(), item("temp-1", "open")));
    let pending = executor.begin(descriptor).unwrap();
    assert_eq!(store.get(&list_key()).unwrap().status, QueryStatus::Fetching);
    assert!(pending.settle().await.is_err());

    gate.send(()).unwrap();
    assert_eq!(reader.await.unwrap().unwrap().len(), 2);
    let entry = store.get(&list_key()).unwrap();
    assert_eq!(entry.status, QueryStatus::Fresh);
    assert_eq!(*entry.data_as::<Vec<Item>>().unwrap(), vec![item("1", "open"), item("2", "open")]);
  }

  #[tokio::test]
  async fn test_wrong_cached_type_is_local_apply_error() {
    let (store, _, executor) = setup();
    store.set_value(&list_key(), "not a list".to_string(), QueryStatus::Fresh);

    let descriptor = MutationDescriptor::new("delete", || async { Ok(()) })
      .target(OptimisticTarget::remove_item(list_key(), |i: &Item| i.id == "1"));

    let result = executor.execute(descriptor).await;
    assert!(matches!(result, Err(CacheError::LocalApply { .. })));
    assert_eq!(*store.data::<String>(&list_key()).unwrap(), "not a list");
  }

  #[tokio::test]
  async fn test_delete_then_reconcile_with_backend() {
    let (store, fetcher, executor) = setup();
    let backend = Arc::new(Mutex::new(vec![
      item("1", "open"),
      item("2", "open"),
      item("3", "open"),
    ]));

    let backend_clone = Arc::clone(&backend);
    let list_loader = loader(move || {
      let rows = backend_clone.lock().unwrap().clone();
      async move { Ok::<_, CacheError>(rows) }
    });
    fetcher.ensure_fresh(&list_key(), list_loader).await.unwrap();
    let _observer = store.subscribe(list_key(), Arc::new(|_, _| {}));

    let backend_clone = Arc::clone(&backend);
    let descriptor = MutationDescriptor::new("delete", move || async move {
      backend_clone.lock().unwrap().retain(|i| i.id != "1");
      Ok(())
    })
    .target(OptimisticTarget::remove_item(list_key(), |i: &Item| i.id == "1"));

    let pending = executor.begin(descriptor).unwrap();
    let phase = pending.watch_phase();
    let optimistic = store.data::<Vec<Item>>(&list_key()).unwrap();
    assert_eq!(optimistic.len(), 2);

    pending.settle().await.unwrap();
    assert_eq!(*phase.borrow(), MutationPhase::SettledSuccess);
    assert!(phase.borrow().is_settled());
    let reconciled = store.data::<Vec<Item>>(&list_key()).unwrap();
    assert_eq!(*reconciled, vec![item("2", "open"), item("3", "open")]);
    assert!(!Arc::ptr_eq(&optimistic, &reconciled));
    assert_eq!(store.get(&list_key()).unwrap().status, QueryStatus::Fresh);
  }

  #[tokio::test]
  async fn test_failed_delete_restores_original_position() {
    let (store, _, executor) = setup();
    let original = vec![item("1", "open"), item("2", "open"), item("3", "open")];
    store.set_value(&list_key(), original.clone(), QueryStatus::Fresh);

    let descriptor = MutationDescriptor::new("delete", || async {
      Err::<(), _>(CacheError::Conflict("row locked".into()))
    })
    .target(OptimisticTarget::remove_item(list_key(), |i: &Item| i.id == "2"));

    assert!(executor.execute(descriptor).await.is_err());
    assert_eq!(*store.data::<Vec<Item>>(&list_key()).unwrap(), original);
  }

  #[tokio::test]
  async fn test_list_and_entity_agree_after_reconciliation() {
    let (store, fetcher, executor) = setup();
    let backend = Arc::new(Mutex::new(vec![item("1", "open")]));

    let rows = Arc::clone(&backend);
    fetcher
      .ensure_fresh(
        &list_key(),
        loader(move || {
          let rows = rows.lock().unwrap().clone();
          async move { Ok::<_, CacheError>(rows) }
        }),
      )
      .await
      .unwrap();
    let rows = Arc::clone(&backend);
    fetcher
      .ensure_fresh(
        &entity_key("1"),
        loader(move || {
          let row = rows.lock().unwrap()[0].clone();
          async move { Ok::<_, CacheError>(row) }
        }),
      )
      .await
      .unwrap();
    let _a = store.subscribe(list_key(), Arc::new(|_, _| {}));
    let _b = store.subscribe(entity_key("1"), Arc::new(|_, _| {}));

    let rows = Arc::clone(&backend);
    let [list_target, entity_target] = close_issue("1");
    let descriptor = MutationDescriptor::new("close", move || async move {
      rows.lock().unwrap()[0].status = "closed".into();
      Ok(())
    })
    .target(list_target)
    .target(entity_target);
    executor.execute(descriptor).await.unwrap();

    let list = store.data::<Vec<Item>>(&list_key()).unwrap();
    let entity = store.data::<Item>(&entity_key("1")).unwrap();
    assert_eq!(list[0].status, "closed");
    assert_eq!(entity.status, list[0].status);
  }

  #[tokio::test]
  async fn test_overlapping_mutations_snapshot_in_order() {
    let (store, _, executor) = setup();
    store.set_value(&entity_key("1"), item("1", "open"), QueryStatus::Fresh);

    let (gate, wait) = oneshot::channel::<()>();
    let first = executor
      .begin(
        MutationDescriptor::new("first", move || async move {
          let _ = wait.await;
          Err::<(), _>(CacheError::Transport("timeout".into()))
        })
        .target(OptimisticTarget::patch(entity_key("1"), |i: &mut Item| {
          i.status = "in_progress".into();
          Ok(())
        })),
      )
      .unwrap();

    let second = executor
      .begin(
        MutationDescriptor::new("second", || async { Ok(()) }).target(OptimisticTarget::patch(
          entity_key("1"),
          |i: &mut Item| {
            i.status = "resolved".into();
            Ok(())
          },
        )),
      )
      .unwrap();

    // The second snapshot sees the first optimistic value.
    let captured = second.snapshot().entry(&entity_key("1")).unwrap();
    assert_eq!(captured.data_as::<Item>().unwrap().status, "in_progress");

    second.settle().await.unwrap();
    assert_eq!(store.data::<Item>(&entity_key("1")).unwrap().status, "resolved");

    // The first one fails afterwards and restores its own snapshot.
    gate.send(()).unwrap();
    assert!(first.settle().await.is_err());
    assert_eq!(store.data::<Item>(&entity_key("1")).unwrap().status, "open");
  }

  #[tokio::test]
  async fn test_optimistic_write_supersedes_inflight_fetch() {
    let (store, fetcher, executor) = setup();
    store.set_value(&entity_key("1"), item("1", "open"), QueryStatus::Stale);

    let (gate, wait) = oneshot::channel::<Item>();
    let wait = Arc::new(Mutex::new(Some(wait)));
    let slow = loader(move || {
      let wait = wait.lock().unwrap().take();
      async move {
        match wait {
          Some(wait) => wait.await.map_err(|_| CacheError::Transport("dropped".into())),
          None => Err(CacheError::Transport("used".into())),
        }
      }
    });

    let key = entity_key("1");
    let fetch = fetcher.ensure_fresh(&key, slow);
    let mutation = async {
      let result = executor
        .execute(
          MutationDescriptor::new("close", || async { Ok(()) })
            .target(OptimisticTarget::patch(entity_key("1"), |i: &mut Item| {
              i.status = "closed".into();
              Ok(())
            })),
        )
        .await;
      gate.send(item("1", "open")).unwrap();
      result
    };

    let (fetched, mutated) = tokio::join!(fetch, mutation);
    assert!(fetched.is_ok());
    assert!(mutated.is_ok());
    assert_eq!(store.data::<Item>(&key).unwrap().status, "closed");
  }

  #[tokio::test]
  async fn test_unloaded_targets_are_left_absent() {
    let (store, _, executor) = setup();
    let descriptor = MutationDescriptor::new("create", || async { Ok(1) })
      .target(OptimisticTarget::prepend_item(list_key(), item("9", "open")));

    let pending = executor.begin(descriptor).unwrap();
    assert!(store.get(&list_key()).is_none());
    assert_eq!(pending.settle().await, Ok(1));
  }

  #[test]
  fn test_collapse_prefixes() {
    let keys = vec![
      query_key!["issues", "1"],
      query_key!["issues"],
      query_key!["comments", "1"],
      query_key!["issues"],
    ];
    assert_eq!(
      collapse_prefixes(keys),
      vec![query_key!["issues"], query_key!["comments", "1"]]
    );
  }
}
