//! Client-side query cache with optimistic mutations.
//!
//! The cache is built from four parts:
//! - [`QueryStore`]: keyed entries with status, error and fetch token
//! - [`NotificationBus`]: synchronous delivery of entry changes
//! - [`FetchCoordinator`]: deduplicated reads, superseded by token
//! - [`MutationExecutor`]: snapshot, optimistic apply, commit, rollback
//!
//! [`QueryClient`] bundles one instance of each.

mod client;
mod error;
mod fetch;
mod key;
mod mutation;
mod notify;
mod store;

pub use client::QueryClient;
pub use error::{CacheError, Result};
pub use fetch::{loader, FetchCoordinator, Loader};
pub use key::{KeySegment, QueryKey};
pub use mutation::{
  MutationDescriptor, MutationExecutor, MutationPhase, OptimisticTarget, PendingMutation, Snapshot,
};
pub use notify::{Listener, NotificationBus, Scope, Subscription};
pub use store::{CacheData, CacheEntry, QueryStatus, QueryStore};
