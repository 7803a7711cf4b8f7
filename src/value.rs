//! Typed SQL parameters

use serde::{Deserialize, Serialize};
use sqlx::Sqlite;
use sqlx::query::Query;
use sqlx::sqlite::SqliteArguments;

/// A value bound to a `?` placeholder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "lowercase")]
pub enum SqlValue {
   Null,
   Integer(i64),
   Real(f64),
   Text(String),
   Blob(Vec<u8>),
}

impl SqlValue {
   /// Bind this value to the next placeholder of `query`.
   pub(crate) fn bind_to<'q>(
      self,
      query: Query<'q, Sqlite, SqliteArguments<'q>>,
   ) -> Query<'q, Sqlite, SqliteArguments<'q>> {
      match self {
         SqlValue::Null => query.bind(None::<String>),
         SqlValue::Integer(v) => query.bind(v),
         SqlValue::Real(v) => query.bind(v),
         SqlValue::Text(v) => query.bind(v),
         SqlValue::Blob(v) => query.bind(v),
      }
   }
}

/// Bind every value in order.
pub(crate) fn bind_all<'q>(
   mut query: Query<'q, Sqlite, SqliteArguments<'q>>,
   values: &[SqlValue],
) -> Query<'q, Sqlite, SqliteArguments<'q>> {
   for value in values {
      query = value.clone().bind_to(query);
   }
   query
}

impl From<i64> for SqlValue {
   fn from(v: i64) -> Self {
      SqlValue::Integer(v)
   }
}

impl From<i32> for SqlValue {
   fn from(v: i32) -> Self {
      SqlValue::Integer(v.into())
   }
}

impl From<u32> for SqlValue {
   fn from(v: u32) -> Self {
      SqlValue::Integer(v.into())
   }
}

impl From<bool> for SqlValue {
   fn from(v: bool) -> Self {
      SqlValue::Integer(v as i64)
   }
}

impl From<f64> for SqlValue {
   fn from(v: f64) -> Self {
      SqlValue::Real(v)
   }
}

impl From<String> for SqlValue {
   fn from(v: String) -> Self {
      SqlValue::Text(v)
   }
}

impl From<&str> for SqlValue {
   fn from(v: &str) -> Self {
      SqlValue::Text(v.to_owned())
   }
}

impl From<Vec<u8>> for SqlValue {
   fn from(v: Vec<u8>) -> Self {
      SqlValue::Blob(v)
   }
}

impl From<&[u8]> for SqlValue {
   fn from(v: &[u8]) -> Self {
      SqlValue::Blob(v.to_vec())
   }
}

impl<T: Into<SqlValue>> From<Option<T>> for SqlValue {
   fn from(v: Option<T>) -> Self {
      v.map_or(SqlValue::Null, Into::into)
   }
}

#[cfg(test)]
mod tests {
   use super::*;
   use serde_json::json;

   #[test]
   fn test_conversions() {
      assert_eq!(SqlValue::from(7), SqlValue::Integer(7));
      assert_eq!(SqlValue::from(true), SqlValue::Integer(1));
      assert_eq!(SqlValue::from("tabs"), SqlValue::Text("tabs".into()));
      assert_eq!(SqlValue::from(None::<i64>), SqlValue::Null);
      assert_eq!(SqlValue::from(Some(2.5)), SqlValue::Real(2.5));
      assert_eq!(SqlValue::from(&b"ab"[..]), SqlValue::Blob(vec![97, 98]));
   }

   #[test]
   fn test_tagged_serde_shape() {
      let v = serde_json::to_value(SqlValue::Integer(1234)).unwrap();
      assert_eq!(v, json!({ "type": "integer", "value": 1234 }));

      let v: SqlValue = serde_json::from_value(json!({ "type": "null" })).unwrap();
      assert_eq!(v, SqlValue::Null);

      let v: SqlValue = serde_json::from_value(json!({ "type": "text", "value": "[]" })).unwrap();
      assert_eq!(v, SqlValue::Text("[]".into()));
   }
}
