//! Error taxonomy shared by the cache and its backend collaborators.

use super::key::QueryKey;

/// Errors raised by loaders, commits and optimistic updates.
///
/// Errors are `Clone` because one in-flight fetch may be awaited by several
/// readers, and each of them receives the same outcome.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
  /// Network or backend failure during a read or write.
  #[error("transport error: {0}")]
  Transport(String),

  /// The backend rejected a write, e.g. a failed precondition.
  #[error("write conflict: {0}")]
  Conflict(String),

  /// No signed-in user, or the user lacks permission.
  #[error("unauthorized: {0}")]
  Unauthorized(String),

  /// The requested record or object does not exist.
  #[error("not found: {0}")]
  NotFound(String),

  /// An optimistic update could not be computed. Raised before any network call.
  #[error("optimistic update of {key} failed: {reason}")]
  LocalApply { key: QueryKey, reason: String },

  /// A cached or fetched value does not have the expected shape.
  #[error("decode error: {0}")]
  Decode(String),
}

impl CacheError {
  /// True for errors produced by the backend during a write or read.
  pub fn is_remote(&self) -> bool {
    matches!(
      self,
      CacheError::Transport(_)
        | CacheError::Conflict(_)
        | CacheError::Unauthorized(_)
        | CacheError::NotFound(_)
    )
  }
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
