//! Backend collaborator surface: identity, record collections and object
//! storage.
//!
//! The cache never talks to a backend directly. Loaders and commits built by
//! the tracker layer call these traits.

mod memory;
mod sqlite;

pub use memory::MemoryBackend;
pub use sqlite::SqliteBackend;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::sync::Arc;

use crate::cache::Result;

/// A record as stored by the backend: a JSON object with an `id` field.
pub type Row = Map<String, Value>;

/// Identifier of the acting principal.
pub type UserId = String;

/// Ordering applied to a read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
  pub column: String,
  pub ascending: bool,
}

/// Filters, ordering and limit for [`Collection::read`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RowQuery {
  pub filters: Vec<(String, Value)>,
  pub order: Option<Order>,
  pub limit: Option<usize>,
}

impl RowQuery {
  pub fn new() -> Self {
    Self::default()
  }

  /// Keep rows whose `column` equals `value`.
  pub fn eq(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
    self.filters.push((column.into(), value.into()));
    self
  }

  pub fn order_by(mut self, column: impl Into<String>, ascending: bool) -> Self {
    self.order = Some(Order {
      column: column.into(),
      ascending,
    });
    self
  }

  pub fn limit(mut self, limit: usize) -> Self {
    self.limit = Some(limit);
    self
  }

  pub fn matches(&self, row: &Row) -> bool {
    self
      .filters
      .iter()
      .all(|(column, value)| row.get(column) == Some(value))
  }

  /// Filter, sort and truncate `rows` in memory.
  pub fn apply(&self, rows: impl IntoIterator<Item = Row>) -> Vec<Row> {
    let mut rows: Vec<Row> = rows.into_iter().filter(|row| self.matches(row)).collect();
    if let Some(order) = &self.order {
      rows.sort_by(|a, b| {
        let ord = compare_values(a.get(&order.column), b.get(&order.column));
        if order.ascending {
          ord
        } else {
          ord.reverse()
        }
      });
    }
    if let Some(limit) = self.limit {
      rows.truncate(limit);
    }
    rows
  }
}

/// Total order over optional JSON scalars: missing/null first, then booleans,
/// numbers and strings. Timestamps in RFC 3339 sort correctly as strings.
fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
  fn rank(v: Option<&Value>) -> u8 {
    match v {
      None | Some(Value::Null) => 0,
      Some(Value::Bool(_)) => 1,
      Some(Value::Number(_)) => 2,
      Some(Value::String(_)) => 3,
      Some(_) => 4,
    }
  }

  match (a, b) {
    (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
    (Some(Value::Number(x)), Some(Value::Number(y))) => {
      let x = x.as_f64().unwrap_or_default();
      let y = y.as_f64().unwrap_or_default();
      x.partial_cmp(&y).unwrap_or(Ordering::Equal)
    }
    (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
    _ => rank(a).cmp(&rank(b)),
  }
}

/// Row id as a string, whether stored as a string or a number.
pub fn row_id(row: &Row) -> Option<String> {
  match row.get("id")? {
    Value::String(s) => Some(s.clone()),
    Value::Number(n) => Some(n.to_string()),
    _ => None,
  }
}

/// Lookup of the signed-in user.
pub trait Identity: Send + Sync {
  fn current_user(&self) -> BoxFuture<'_, Result<Option<UserId>>>;
}

/// Authenticated CRUD over one named record collection.
pub trait Collection: Send + Sync {
  fn read<'a>(&'a self, query: &'a RowQuery) -> BoxFuture<'a, Result<Vec<Row>>>;
  fn insert(&self, row: Row) -> BoxFuture<'_, Result<Row>>;
  fn update<'a>(&'a self, id: &'a str, patch: Row) -> BoxFuture<'a, Result<Row>>;
  fn remove<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// Binary object storage within one bucket.
pub trait ObjectStore: Send + Sync {
  fn put<'a>(&'a self, path: &'a str, bytes: Vec<u8>) -> BoxFuture<'a, Result<()>>;
  fn get<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<Vec<u8>>>;
  fn remove<'a>(&'a self, path: &'a str) -> BoxFuture<'a, Result<()>>;
}

/// The managed backend as a whole.
pub trait Backend: Send + Sync {
  fn identity(&self) -> Arc<dyn Identity>;
  fn collection(&self, name: &str) -> Arc<dyn Collection>;
  fn bucket(&self, name: &str) -> Arc<dyn ObjectStore>;
}
