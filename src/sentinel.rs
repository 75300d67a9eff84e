//! Missing-value convention shared by the parser, the differ and the store.
//!
//! Source spreadsheets mark "no measurement" with a reserved numeric value.
//! In memory such cells become [`Value::Missing`]; on the way to the store
//! they are written either as SQL `NULL` or as the sentinel itself.

use crate::schema::ColumnType;
use crate::table::Value;
use serde::Deserialize;

pub const DEFAULT_SENTINEL: f64 = -999_999.0;

/// How missing numeric cells are written to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MissingStorage {
    #[default]
    Null,
    Sentinel,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SentinelCodec {
    sentinel: f64,
    storage: MissingStorage,
}

impl Default for SentinelCodec {
    fn default() -> Self {
        Self::new(DEFAULT_SENTINEL, MissingStorage::Null)
    }
}

impl SentinelCodec {
    pub fn new(sentinel: f64, storage: MissingStorage) -> Self {
        Self { sentinel, storage }
    }

    pub fn sentinel(&self) -> f64 {
        self.sentinel
    }

    pub fn storage(&self) -> MissingStorage {
        self.storage
    }

    pub fn is_sentinel(&self, value: &Value) -> bool {
        value.as_f64().is_some_and(|v| v == self.sentinel)
    }

    /// True for the native absent marker and for the raw sentinel.
    pub fn is_missing(&self, value: &Value) -> bool {
        value.is_missing() || self.is_sentinel(value)
    }

    /// Sentinel → absent. Everything else passes through.
    pub fn decode(&self, value: Value) -> Value {
        if self.is_sentinel(&value) {
            Value::Missing
        } else {
            value
        }
    }

    /// Absent → the storage representation for a column of type `column_type`.
    pub fn encode(&self, value: &Value, column_type: Option<ColumnType>) -> Value {
        if !self.is_missing(value) {
            return value.clone();
        }
        match (self.storage, column_type) {
            (MissingStorage::Sentinel, Some(ColumnType::Float)) => Value::Float(self.sentinel),
            (MissingStorage::Sentinel, Some(ColumnType::Integer)) => {
                Value::Integer(self.sentinel as i64)
            }
            _ => Value::Missing,
        }
    }

    /// Per-cell equality: two missing cells are equal, exactly one missing
    /// cell is a difference, otherwise the values themselves decide.
    pub fn equal(&self, a: &Value, b: &Value) -> bool {
        match (self.is_missing(a), self.is_missing(b)) {
            (true, true) => true,
            (true, false) | (false, true) => false,
            (false, false) => match (a, b) {
                (Value::Text(x), Value::Text(y)) => x == y,
                (Value::Timestamp(x), Value::Timestamp(y)) => x == y,
                (Value::Integer(x), Value::Integer(y)) => x == y,
                (Value::Float(_), _) | (_, Value::Float(_)) => match (a.as_f64(), b.as_f64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => false,
                },
                _ => false,
            },
        }
    }
}
