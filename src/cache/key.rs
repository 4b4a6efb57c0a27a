//! Query keys identifying cached result sets.

use std::fmt;

/// One segment of a [`QueryKey`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum KeySegment {
  Str(String),
  Int(i64),
  Bool(bool),
}

impl From<&str> for KeySegment {
  fn from(value: &str) -> Self {
    KeySegment::Str(value.to_string())
  }
}

impl From<String> for KeySegment {
  fn from(value: String) -> Self {
    KeySegment::Str(value)
  }
}

impl From<&String> for KeySegment {
  fn from(value: &String) -> Self {
    KeySegment::Str(value.clone())
  }
}

impl From<i64> for KeySegment {
  fn from(value: i64) -> Self {
    KeySegment::Int(value)
  }
}

impl From<i32> for KeySegment {
  fn from(value: i32) -> Self {
    KeySegment::Int(i64::from(value))
  }
}

impl From<bool> for KeySegment {
  fn from(value: bool) -> Self {
    KeySegment::Bool(value)
  }
}

impl fmt::Display for KeySegment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      KeySegment::Str(s) => write!(f, "{:?}", s),
      KeySegment::Int(i) => write!(f, "{}", i),
      KeySegment::Bool(b) => write!(f, "{}", b),
    }
  }
}

/// Identifier for one cached result set, e.g. `["issues", "42"]`.
///
/// Keys are compared segment by segment. A key also acts as a prefix for
/// bulk operations: `["issues"]` covers `["issues", "42"]`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct QueryKey(Vec<KeySegment>);

impl QueryKey {
  pub fn new(segments: Vec<KeySegment>) -> Self {
    Self(segments)
  }

  /// Append a segment, returning the extended key.
  pub fn with(mut self, segment: impl Into<KeySegment>) -> Self {
    self.0.push(segment.into());
    self
  }

  pub fn segments(&self) -> &[KeySegment] {
    &self.0
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  /// True if `prefix` equals this key or is a leading part of it.
  /// The empty key is a prefix of every key.
  pub fn starts_with(&self, prefix: &QueryKey) -> bool {
    self.0.starts_with(&prefix.0)
  }
}

impl fmt::Display for QueryKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "[")?;
    for (i, segment) in self.0.iter().enumerate() {
      if i > 0 {
        write!(f, ", ")?;
      }
      write!(f, "{}", segment)?;
    }
    write!(f, "]")
  }
}

/// Build a [`QueryKey`] from a list of segments.
///
/// ```ignore
/// let key = query_key!["issues", issue_id];
/// ```
#[macro_export]
macro_rules! query_key {
  ($($segment:expr),* $(,)?) => {
    $crate::cache::QueryKey::new(vec![$($crate::cache::KeySegment::from($segment)),*])
  };
}
