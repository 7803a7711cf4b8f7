//! Conversion of SQLite rows into ordered JSON maps

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use indexmap::IndexMap;
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row as _, TypeInfo, ValueRef};

use crate::{Error, Result};

/// A decoded result row, keyed by column name in select order.
pub type Row = IndexMap<String, JsonValue>;

pub(crate) fn decode_rows(rows: Vec<SqliteRow>) -> Result<Vec<Row>> {
   rows.iter().map(decode_row).collect()
}

fn decode_row(row: &SqliteRow) -> Result<Row> {
   let mut value = IndexMap::with_capacity(row.columns().len());
   for (i, column) in row.columns().iter().enumerate() {
      value.insert(column.name().to_string(), to_json(row, i)?);
   }
   Ok(value)
}

/// Decode one column using the storage class of the value itself, not the
/// declared column type.
fn to_json(row: &SqliteRow, index: usize) -> Result<JsonValue> {
   let raw = row.try_get_raw(index)?;
   if raw.is_null() {
      return Ok(JsonValue::Null);
   }

   let type_name = raw.type_info().name().to_string();
   let value = match type_name.as_str() {
      "INTEGER" | "BOOLEAN" => JsonValue::from(row.try_get_unchecked::<i64, _>(index)?),
      "REAL" | "NUMERIC" => JsonValue::from(row.try_get_unchecked::<f64, _>(index)?),
      "TEXT" | "DATE" | "TIME" | "DATETIME" => {
         JsonValue::String(row.try_get_unchecked::<String, _>(index)?)
      }
      "BLOB" => {
         let bytes = row.try_get_unchecked::<Vec<u8>, _>(index)?;
         JsonValue::String(STANDARD.encode(bytes))
      }
      _ => return Err(Error::UnsupportedDatatype(type_name)),
   };

   Ok(value)
}
