//! Row decoding for the sqlx adapter.
//!
//! Columns are first classified into a [`ColumnKind`] from their declared type
//! name, then decoded by a database-specific decoder into JSON. Binary values
//! are base64 encoded so a row stays plain JSON.

use crate::models::{DatabaseType, Row as JsonRow};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde_json::Value as JsonValue;
use sqlx::mysql::{MySqlRow, MySqlTypeInfo, MySqlValueRef};
use sqlx::postgres::{PgRow, PgTypeInfo, PgValueRef};
use sqlx::sqlite::SqliteRow;
use sqlx::{Column, Decode, Row, Type, TypeInfo};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Integer,
    Float,
    Decimal,
    Boolean,
    Binary,
    Json,
    Text,
}

impl ColumnKind {
    pub fn of(type_name: &str, db: DatabaseType) -> Self {
        let lower = type_name.to_lowercase();

        // Checked first: "numeric" would otherwise fall through to float.
        if lower.contains("decimal") || lower.contains("numeric") {
            if db == DatabaseType::SQLite && lower == "numeric" {
                return Self::Float;
            }
            return Self::Decimal;
        }
        if lower.contains("int") || lower.contains("serial") || lower.contains("tiny") {
            return Self::Integer;
        }
        if lower == "bool" || lower == "boolean" {
            return Self::Boolean;
        }
        if lower.contains("float") || lower.contains("double") || lower == "real" {
            return Self::Float;
        }
        if lower == "json" || lower == "jsonb" {
            return Self::Json;
        }
        if lower.contains("blob") || lower.contains("binary") || lower == "bytea" {
            return Self::Binary;
        }
        Self::Text
    }
}

/// DECIMAL/NUMERIC value kept in its textual database representation.
#[derive(Debug)]
pub struct DecimalText(pub String);

impl Type<sqlx::MySql> for DecimalText {
    fn type_info() -> MySqlTypeInfo {
        <String as Type<sqlx::MySql>>::type_info()
    }

    fn compatible(ty: &MySqlTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("decimal") || name.contains("numeric")
    }
}

impl<'r> Decode<'r, sqlx::MySql> for DecimalText {
    fn decode(value: MySqlValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::MySql>>::decode(value)?;
        Ok(DecimalText(s.to_string()))
    }
}

impl Type<sqlx::Postgres> for DecimalText {
    fn type_info() -> PgTypeInfo {
        <String as Type<sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &PgTypeInfo) -> bool {
        let name = ty.name().to_lowercase();
        name.contains("numeric") || name.contains("decimal")
    }
}

impl<'r> Decode<'r, sqlx::Postgres> for DecimalText {
    fn decode(value: PgValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let s = <&str as Decode<sqlx::Postgres>>::decode(value)?;
        Ok(DecimalText(s.to_string()))
    }
}

pub fn encode_binary(bytes: &[u8]) -> JsonValue {
    JsonValue::String(STANDARD.encode(bytes))
}

fn float_value(v: f64) -> JsonValue {
    serde_json::Number::from_f64(v)
        .map(JsonValue::Number)
        .unwrap_or_else(|| JsonValue::String(v.to_string()))
}

fn json_text(v: String, type_name: &str) -> JsonValue {
    if type_name.to_lowercase().contains("json") {
        if let Ok(json) = serde_json::from_str::<JsonValue>(&v) {
            return json;
        }
    }
    JsonValue::String(v)
}

/// Conversion of a driver row into a JSON row.
pub trait RowToJson {
    fn column_names(&self) -> Vec<String>;
    fn to_json_row(&self) -> JsonRow;
}

macro_rules! impl_row_to_json {
    ($row:ty, $db:expr, $decode:path) => {
        impl RowToJson for $row {
            fn column_names(&self) -> Vec<String> {
                self.columns().iter().map(|c| c.name().to_string()).collect()
            }

            fn to_json_row(&self) -> JsonRow {
                self.columns()
                    .iter()
                    .enumerate()
                    .map(|(idx, col)| {
                        let type_name = col.type_info().name();
                        let kind = ColumnKind::of(type_name, $db);
                        (col.name().to_string(), $decode(self, idx, type_name, kind))
                    })
                    .collect()
            }
        }
    };
}

impl_row_to_json!(MySqlRow, DatabaseType::MySQL, mysql::decode);
impl_row_to_json!(PgRow, DatabaseType::PostgreSQL, postgres::decode);
impl_row_to_json!(SqliteRow, DatabaseType::SQLite, sqlite::decode);

mod mysql {
    use super::*;

    pub fn decode(row: &MySqlRow, idx: usize, type_name: &str, kind: ColumnKind) -> JsonValue {
        match kind {
            ColumnKind::Decimal => match row.try_get::<Option<DecimalText>, _>(idx) {
                Ok(v) => v.map_or(JsonValue::Null, |d| JsonValue::String(d.0)),
                Err(e) => {
                    tracing::error!("Failed to decode DECIMAL: {:?}", e);
                    JsonValue::Null
                }
            },
            ColumnKind::Integer => integer(row, idx),
            ColumnKind::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, JsonValue::Bool),
            ColumnKind::Float => {
                if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
                    return float_value(v);
                }
                if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
                    return float_value(f64::from(v));
                }
                JsonValue::Null
            }
            ColumnKind::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, |v| encode_binary(&v)),
            ColumnKind::Json => row
                .try_get::<Option<JsonValue>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(JsonValue::Null),
            ColumnKind::Text => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, |v| json_text(v, type_name)),
        }
    }

    // MySQL integer columns may be signed or unsigned of any width.
    fn integer(row: &MySqlRow, idx: usize) -> JsonValue {
        if let Ok(None) = row.try_get::<Option<i64>, _>(idx) {
            return JsonValue::Null;
        }
        if let Ok(Some(v)) = row.try_get::<Option<i8>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<u8>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<u16>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<u32>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<u64>, _>(idx) {
            return v.into();
        }
        JsonValue::Null
    }
}

mod postgres {
    use super::*;

    pub fn decode(row: &PgRow, idx: usize, _type_name: &str, kind: ColumnKind) -> JsonValue {
        match kind {
            ColumnKind::Decimal => match row.try_get::<Option<DecimalText>, _>(idx) {
                Ok(v) => v.map_or(JsonValue::Null, |d| JsonValue::String(d.0)),
                Err(e) => {
                    tracing::error!("Failed to decode NUMERIC: {:?}", e);
                    JsonValue::Null
                }
            },
            ColumnKind::Integer => {
                if let Ok(Some(v)) = row.try_get::<Option<i16>, _>(idx) {
                    return v.into();
                }
                if let Ok(Some(v)) = row.try_get::<Option<i32>, _>(idx) {
                    return v.into();
                }
                if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
                    return v.into();
                }
                JsonValue::Null
            }
            ColumnKind::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, JsonValue::Bool),
            ColumnKind::Float => {
                if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
                    return float_value(v);
                }
                if let Ok(Some(v)) = row.try_get::<Option<f32>, _>(idx) {
                    return float_value(f64::from(v));
                }
                JsonValue::Null
            }
            ColumnKind::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, |v| encode_binary(&v)),
            ColumnKind::Json => row
                .try_get::<Option<JsonValue>, _>(idx)
                .ok()
                .flatten()
                .unwrap_or(JsonValue::Null),
            ColumnKind::Text => row
                .try_get::<Option<String>, _>(idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, JsonValue::String),
        }
    }
}

mod sqlite {
    use super::*;

    pub fn decode(row: &SqliteRow, idx: usize, type_name: &str, kind: ColumnKind) -> JsonValue {
        match kind {
            ColumnKind::Integer => row
                .try_get::<Option<i64>, _>(idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, JsonValue::from),
            ColumnKind::Boolean => row
                .try_get::<Option<bool>, _>(idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, JsonValue::Bool),
            ColumnKind::Float | ColumnKind::Decimal => row
                .try_get::<Option<f64>, _>(idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, float_value),
            ColumnKind::Binary => row
                .try_get::<Option<Vec<u8>>, _>(idx)
                .ok()
                .flatten()
                .map_or(JsonValue::Null, |v| encode_binary(&v)),
            ColumnKind::Json | ColumnKind::Text => text_or_dynamic(row, idx, type_name),
        }
    }

    // Expression columns (e.g. `SELECT 1 + 1`) carry SQLite's runtime type
    // name, which is "NULL" for a NULL result.
    fn text_or_dynamic(row: &SqliteRow, idx: usize, type_name: &str) -> JsonValue {
        if let Ok(Some(v)) = row.try_get::<Option<String>, _>(idx) {
            return json_text(v, type_name);
        }
        if let Ok(Some(v)) = row.try_get::<Option<i64>, _>(idx) {
            return v.into();
        }
        if let Ok(Some(v)) = row.try_get::<Option<f64>, _>(idx) {
            return float_value(v);
        }
        if let Ok(Some(v)) = row.try_get::<Option<Vec<u8>>, _>(idx) {
            return encode_binary(&v);
        }
        JsonValue::Null
    }
}
