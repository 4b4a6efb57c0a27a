//! Notification bus delivering cache-state changes to subscribers.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::key::QueryKey;
use super::store::CacheEntry;

/// Callback invoked after an entry changes.
pub type Listener = Arc<dyn Fn(&QueryKey, &CacheEntry) + Send + Sync>;

/// How a subscription matches keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope {
  /// Only the subscribed key itself.
  Exact,
  /// The subscribed key and every key it is a prefix of.
  Prefix,
}

struct Registration {
  id: u64,
  key: QueryKey,
  scope: Scope,
  listener: Listener,
}

impl Registration {
  fn matches(&self, key: &QueryKey) -> bool {
    match self.scope {
      Scope::Exact => self.key == *key,
      Scope::Prefix => key.starts_with(&self.key),
    }
  }
}

#[derive(Default)]
struct BusInner {
  next_id: u64,
  registrations: Vec<Registration>,
}

/// Registry of listeners keyed by [`QueryKey`].
///
/// Delivery is synchronous: `emit` calls every matching listener on the
/// caller's stack. The registry lock is released before listeners run, so a
/// listener may subscribe, unsubscribe or read the store.
#[derive(Default)]
pub struct NotificationBus {
  inner: Mutex<BusInner>,
}

impl NotificationBus {
  pub fn new() -> Self {
    Self::default()
  }

  fn lock(&self) -> MutexGuard<'_, BusInner> {
    self.inner.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Register `listener` for `key`. The listener stays registered until the
  /// returned [`Subscription`] is dropped.
  pub fn subscribe(self: &Arc<Self>, key: QueryKey, scope: Scope, listener: Listener) -> Subscription {
    let mut inner = self.lock();
    inner.next_id += 1;
    let id = inner.next_id;
    inner.registrations.push(Registration {
      id,
      key,
      scope,
      listener,
    });

    Subscription {
      bus: Arc::downgrade(self),
      id,
    }
  }

  fn remove(&self, id: u64) {
    self.lock().registrations.retain(|r| r.id != id);
  }

  /// Deliver `entry` to every listener matching `key`.
  pub fn emit(&self, key: &QueryKey, entry: &CacheEntry) {
    let listeners: Vec<Listener> = self
      .lock()
      .registrations
      .iter()
      .filter(|r| r.matches(key))
      .map(|r| Arc::clone(&r.listener))
      .collect();

    for listener in listeners {
      listener(key, entry);
    }
  }

  /// True if some subscription currently covers `key`.
  pub fn is_observed(&self, key: &QueryKey) -> bool {
    self.lock().registrations.iter().any(|r| r.matches(key))
  }

  pub fn subscriber_count(&self) -> usize {
    self.lock().registrations.len()
  }
}

/// Handle for a registered listener. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the listener"]
pub struct Subscription {
  bus: Weak<NotificationBus>,
  id: u64,
}

impl Subscription {
  pub fn unsubscribe(self) {
    drop(self);
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    if let Some(bus) = self.bus.upgrade() {
      bus.remove(self.id);
    }
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription").field("id", &self.id).finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::query_key;
  use std::sync::atomic::{AtomicUsize, Ordering};

  fn counting_listener(counter: &Arc<AtomicUsize>) -> Listener {
    let counter = Arc::clone(counter);
    Arc::new(move |_, _| {
      counter.fetch_add(1, Ordering::SeqCst);
    })
  }

  #[test]
  fn test_exact_and_prefix_matching() {
    let bus = Arc::new(NotificationBus::new());
    let exact = Arc::new(AtomicUsize::new(0));
    let prefix = Arc::new(AtomicUsize::new(0));

    let _a = bus.subscribe(query_key!["issues", "1"], Scope::Exact, counting_listener(&exact));
    let _b = bus.subscribe(query_key!["issues"], Scope::Prefix, counting_listener(&prefix));

    let entry = CacheEntry::default();
    bus.emit(&query_key!["issues", "1"], &entry);
    bus.emit(&query_key!["issues", "2"], &entry);
    bus.emit(&query_key!["comments", "1"], &entry);

    assert_eq!(exact.load(Ordering::SeqCst), 1);
    assert_eq!(prefix.load(Ordering::SeqCst), 2);
  }

  #[test]
  fn test_drop_unsubscribes() {
    let bus = Arc::new(NotificationBus::new());
    let counter = Arc::new(AtomicUsize::new(0));

    let sub = bus.subscribe(query_key!["issues"], Scope::Exact, counting_listener(&counter));
    assert!(bus.is_observed(&query_key!["issues"]));

    sub.unsubscribe();
    assert!(!bus.is_observed(&query_key!["issues"]));
    assert_eq!(bus.subscriber_count(), 0);

    bus.emit(&query_key!["issues"], &CacheEntry::default());
    assert_eq!(counter.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn test_listener_may_subscribe_during_emit() {
    let bus = Arc::new(NotificationBus::new());
    let held: Arc<Mutex<Vec<Subscription>>> = Arc::new(Mutex::new(Vec::new()));

    let bus_clone = Arc::clone(&bus);
    let held_clone = Arc::clone(&held);
    let _sub = bus.subscribe(
      query_key!["issues"],
      Scope::Exact,
      Arc::new(move |_, _| {
        let sub = bus_clone.subscribe(query_key!["other"], Scope::Exact, Arc::new(|_, _| {}));
        held_clone.lock().unwrap().push(sub);
      }),
    );

    bus.emit(&query_key!["issues"], &CacheEntry::default());
    assert!(bus.is_observed(&query_key!["other"]));
  }
}
