//! Conversion between backend rows and domain types.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::backend::Row;
use crate::cache::{CacheError, Result};

/// Decode a row into a domain type.
pub fn from_row<T: DeserializeOwned>(row: Row) -> Result<T> {
  serde_json::from_value(Value::Object(row)).map_err(|e| CacheError::Decode(e.to_string()))
}

pub fn from_rows<T: DeserializeOwned>(rows: Vec<Row>) -> Result<Vec<T>> {
  rows.into_iter().map(from_row).collect()
}

/// Encode a value as a row. Fails unless it serializes to a JSON object.
pub fn to_row<T: Serialize>(value: &T) -> Result<Row> {
  match serde_json::to_value(value) {
    Ok(Value::Object(row)) => Ok(row),
    Ok(other) => Err(CacheError::Decode(format!(
      "expected an object, got {}",
      other
    ))),
    Err(e) => Err(CacheError::Decode(e.to_string())),
  }
}

/// String column of a row, if present.
pub fn str_field<'a>(row: &'a Row, column: &str) -> Option<&'a str> {
  row.get(column).and_then(Value::as_str)
}
