//! Engine-neutral values and rows.

use crate::error::EngineError;
use serde_json::{Map, Value as JsonValue};

/// Value type for query parameters and result columns.
#[derive(Debug, Clone, PartialEq)]
pub enum DbValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Blob(Vec<u8>),
    Boolean(bool),
}

impl DbValue {
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// JSON form used by result serialization. Blobs become lowercase hex.
    pub fn to_json(&self) -> JsonValue {
        match self {
            DbValue::Null => JsonValue::Null,
            DbValue::Integer(v) => JsonValue::from(*v),
            DbValue::Real(v) => JsonValue::from(*v),
            DbValue::Text(v) => JsonValue::from(v.clone()),
            DbValue::Blob(v) => JsonValue::from(hex::encode(v)),
            DbValue::Boolean(v) => JsonValue::from(*v),
        }
    }
}

impl From<i32> for DbValue {
    fn from(v: i32) -> Self {
        DbValue::Integer(v as i64)
    }
}

impl From<i64> for DbValue {
    fn from(v: i64) -> Self {
        DbValue::Integer(v)
    }
}

impl From<f64> for DbValue {
    fn from(v: f64) -> Self {
        DbValue::Real(v)
    }
}

impl From<String> for DbValue {
    fn from(v: String) -> Self {
        DbValue::Text(v)
    }
}

impl From<&str> for DbValue {
    fn from(v: &str) -> Self {
        DbValue::Text(v.to_string())
    }
}

impl From<bool> for DbValue {
    fn from(v: bool) -> Self {
        DbValue::Boolean(v)
    }
}

impl From<Vec<u8>> for DbValue {
    fn from(v: Vec<u8>) -> Self {
        DbValue::Blob(v)
    }
}

impl<T: Into<DbValue>> From<Option<T>> for DbValue {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => DbValue::Null,
        }
    }
}

/// Row data from a query result.
#[derive(Debug, Clone, PartialEq)]
pub struct DbRow {
    columns: Vec<String>,
    values: Vec<DbValue>,
}

impl DbRow {
    /// Create a new row with column names and values.
    pub fn new(columns: Vec<String>, values: Vec<DbValue>) -> Self {
        Self { columns, values }
    }

    /// Get a value by column index.
    pub fn get<T: FromDbValue>(&self, index: usize) -> Result<T, EngineError> {
        self.values
            .get(index)
            .ok_or_else(|| EngineError::fatal(format!("Column index {} out of bounds", index)))
            .and_then(|v| T::from_db_value(v))
    }

    /// Get a value by column name. Matching is case-insensitive because DB2
    /// and some MySQL configurations fold identifiers.
    pub fn get_by_name<T: FromDbValue>(&self, name: &str) -> Result<T, EngineError> {
        let index = self
            .columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .ok_or_else(|| EngineError::fatal(format!("Column '{}' not found", name)))?;
        self.get(index)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn column_names(&self) -> &[String] {
        &self.columns
    }

    pub fn get_raw(&self, index: usize) -> Option<&DbValue> {
        self.values.get(index)
    }

    /// Row as a JSON object keyed by column name.
    pub fn to_json(&self) -> JsonValue {
        let mut map = Map::with_capacity(self.columns.len());
        for (column, value) in self.columns.iter().zip(self.values.iter()) {
            map.insert(column.clone(), value.to_json());
        }
        JsonValue::Object(map)
    }
}

/// Trait for converting from DbValue.
pub trait FromDbValue: Sized {
    fn from_db_value(value: &DbValue) -> Result<Self, EngineError>;
}

fn null_error(type_name: &str) -> EngineError {
    EngineError::fatal(format!(
        "{} field is NULL - use Option<{}> for nullable columns",
        type_name, type_name
    ))
}

impl FromDbValue for i64 {
    fn from_db_value(value: &DbValue) -> Result<Self, EngineError> {
        match value {
            DbValue::Integer(v) => Ok(*v),
            DbValue::Boolean(v) => Ok(*v as i64),
            // DB2 over ODBC hands every column back as text.
            DbValue::Text(v) => v
                .trim()
                .parse()
                .map_err(|_| EngineError::fatal(format!("Expected integer, got '{}'", v))),
            DbValue::Null => Err(null_error("i64")),
            _ => Err(EngineError::fatal("Expected integer")),
        }
    }
}

impl FromDbValue for f64 {
    fn from_db_value(value: &DbValue) -> Result<Self, EngineError> {
        match value {
            DbValue::Real(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v as f64),
            DbValue::Text(v) => v
                .trim()
                .parse()
                .map_err(|_| EngineError::fatal(format!("Expected real, got '{}'", v))),
            DbValue::Null => Err(null_error("f64")),
            _ => Err(EngineError::fatal("Expected real")),
        }
    }
}

impl FromDbValue for String {
    fn from_db_value(value: &DbValue) -> Result<Self, EngineError> {
        match value {
            DbValue::Text(v) => Ok(v.clone()),
            DbValue::Integer(v) => Ok(v.to_string()),
            DbValue::Null => Err(null_error("String")),
            _ => Err(EngineError::fatal("Expected text")),
        }
    }
}

impl FromDbValue for bool {
    fn from_db_value(value: &DbValue) -> Result<Self, EngineError> {
        match value {
            DbValue::Boolean(v) => Ok(*v),
            DbValue::Integer(v) => Ok(*v != 0),
            DbValue::Text(v) => match v.trim() {
                "1" | "t" | "true" | "TRUE" => Ok(true),
                "0" | "f" | "false" | "FALSE" => Ok(false),
                other => Err(EngineError::fatal(format!("Expected boolean, got '{}'", other))),
            },
            DbValue::Null => Err(null_error("bool")),
            _ => Err(EngineError::fatal("Expected boolean")),
        }
    }
}

impl FromDbValue for Vec<u8> {
    fn from_db_value(value: &DbValue) -> Result<Self, EngineError> {
        match value {
            DbValue::Blob(v) => Ok(v.clone()),
            DbValue::Null => Err(null_error("Vec<u8>")),
            _ => Err(EngineError::fatal("Expected blob")),
        }
    }
}

impl<T: FromDbValue> FromDbValue for Option<T> {
    fn from_db_value(value: &DbValue) -> Result<Self, EngineError> {
        match value {
            DbValue::Null => Ok(None),
            _ => T::from_db_value(value).map(Some),
        }
    }
}
