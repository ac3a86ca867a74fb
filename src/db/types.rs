//! Row to JSON conversion.
//!
//! Column values are decoded by trying a fixed list of Rust types per backend,
//! most specific first, so expression columns without a declared type decode
//! the same way as table columns. NULL is checked before any typed decode.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::{Map, Number, Value};
use sqlx::mysql::MySqlRow;
use sqlx::postgres::PgRow;
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Row, TypeInfo, ValueRef};

/// Trait for converting database rows to JSON objects.
pub trait RowToJson {
    fn to_json_map(&self) -> Map<String, Value>;

    fn to_json(&self) -> Value {
        Value::Object(self.to_json_map())
    }
}

/// Binary column values travel as base64 strings.
pub fn encode_binary(bytes: &[u8]) -> Value {
    Value::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> Value {
    Number::from_f64(v)
        .map(Value::Number)
        .unwrap_or_else(|| Value::String(v.to_string()))
}

/// Text columns declared as JSON are parsed back into structured values.
fn text_value(text: String, type_name: &str) -> Value {
    if type_name.to_lowercase().contains("json") {
        if let Ok(parsed) = serde_json::from_str::<Value>(&text) {
            return parsed;
        }
    }
    Value::String(text)
}

/// Try each `type => conversion` pair in order and keep the first that decodes.
macro_rules! decode_first {
    ($row:expr, $idx:expr, $($ty:ty => $conv:expr),+ $(,)?) => {{
        let mut decoded: Option<Value> = None;
        $(
            if decoded.is_none() {
                if let Ok(v) = $row.try_get::<$ty, _>($idx) {
                    decoded = Some(($conv)(v));
                }
            }
        )+
        decoded
    }};
}

macro_rules! impl_row_to_json {
    ($row:ty, $decode:path) => {
        impl RowToJson for $row {
            fn to_json_map(&self) -> Map<String, Value> {
                self.columns()
                    .iter()
                    .map(|col| {
                        let idx = col.ordinal();
                        let is_null = self.try_get_raw(idx).map(|v| v.is_null()).unwrap_or(true);
                        let value = if is_null {
                            Value::Null
                        } else {
                            $decode(self, idx, col.type_info().name())
                        };
                        (col.name().to_string(), value)
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_json!(MySqlRow, mysql::decode_column);
impl_row_to_json!(PgRow, postgres::decode_column);
impl_row_to_json!(SqliteRow, sqlite::decode_column);

fn undecodable(type_name: &str) -> Value {
    tracing::debug!(type_name, "Column type has no JSON mapping");
    Value::Null
}

mod mysql {
    use super::*;

    pub fn decode_column(row: &MySqlRow, idx: usize, type_name: &str) -> Value {
        decode_first!(row, idx,
            i64 => Value::from,
            u64 => Value::from,
            f64 => float_value,
            f32 => |v: f32| float_value(v as f64),
            Value => |v: Value| v,
            DateTime<Utc> => |v: DateTime<Utc>| Value::String(v.to_rfc3339()),
            NaiveDateTime => |v: NaiveDateTime| Value::String(v.to_string()),
            NaiveDate => |v: NaiveDate| Value::String(v.to_string()),
            String => |v: String| text_value(v, type_name),
            Vec<u8> => |v: Vec<u8>| encode_binary(&v),
        )
        .unwrap_or_else(|| undecodable(type_name))
    }
}

mod postgres {
    use super::*;

    pub fn decode_column(row: &PgRow, idx: usize, type_name: &str) -> Value {
        decode_first!(row, idx,
            i64 => Value::from,
            i32 => Value::from,
            i16 => Value::from,
            f64 => float_value,
            f32 => |v: f32| float_value(v as f64),
            bool => Value::Bool,
            Value => |v: Value| v,
            DateTime<Utc> => |v: DateTime<Utc>| Value::String(v.to_rfc3339()),
            NaiveDateTime => |v: NaiveDateTime| Value::String(v.to_string()),
            NaiveDate => |v: NaiveDate| Value::String(v.to_string()),
            String => |v: String| text_value(v, type_name),
            Vec<u8> => |v: Vec<u8>| encode_binary(&v),
        )
        .unwrap_or_else(|| undecodable(type_name))
    }
}

mod sqlite {
    use super::*;

    pub fn decode_column(row: &SqliteRow, idx: usize, type_name: &str) -> Value {
        let lower = type_name.to_lowercase();
        if lower == "boolean" || lower == "bool" {
            if let Ok(v) = row.try_get::<bool, _>(idx) {
                return Value::Bool(v);
            }
        }
        decode_first!(row, idx,
            i64 => Value::from,
            f64 => float_value,
            String => |v: String| text_value(v, type_name),
            Vec<u8> => |v: Vec<u8>| encode_binary(&v),
        )
        .unwrap_or_else(|| undecodable(type_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_binary() {
        assert_eq!(
            encode_binary(b"hello world"),
            Value::String("aGVsbG8gd29ybGQ=".to_string())
        );
        assert_eq!(encode_binary(&[]), Value::String(String::new()));
    }

    #[test]
    fn test_text_value_parses_json_columns() {
        assert_eq!(
            text_value(r#"{"a":1}"#.to_string(), "JSON"),
            serde_json::json!({"a": 1})
        );
        assert_eq!(
            text_value("not json".to_string(), "JSON"),
            Value::String("not json".to_string())
        );
        assert_eq!(
            text_value(r#"{"a":1}"#.to_string(), "TEXT"),
            Value::String(r#"{"a":1}"#.to_string())
        );
    }

    #[test]
    fn test_float_value_non_finite() {
        assert_eq!(float_value(1.5), serde_json::json!(1.5));
        assert!(float_value(f64::NAN).is_string());
    }
}
