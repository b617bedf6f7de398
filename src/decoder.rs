//! Turns Kafka payloads into database rows
pub mod map;
pub mod typed;

use chrono::NaiveDateTime;

/// Single column value as it is handed to a writer
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    Text(String),
    DateTime(NaiveDateTime),
    /// Nested object or array, stored as its JSON text
    Json(serde_json::Value),
}

impl From<serde_json::Value> for Value {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else if let Some(u) = n.as_u64() {
                    Value::UInt(u)
                } else {
                    Value::Float(n.as_f64().unwrap_or_default())
                }
            }
            serde_json::Value::String(s) => Value::Text(s),
            v @ (serde_json::Value::Array(_) | serde_json::Value::Object(_)) => Value::Json(v),
        }
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Text(s.to_owned())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

/// Database row - vector of columns, each column is tuple of its name and value
pub type Row = Vec<(String, Value)>;

/// Decoder converts a message from Kafka into a database row
pub trait Decoder: Send + Sync {
    fn decode(&self, message: &[u8]) -> Result<Row, serde_json::Error>;
}

/// Flattens a JSON object into a row, keeping only the keys accepted by `keep`
pub(crate) fn object_to_row(
    object: serde_json::Map<String, serde_json::Value>,
    keep: impl Fn(&str) -> bool,
) -> Row {
    object
        .into_iter()
        .filter(|(k, _)| keep(k))
        .map(|(k, v)| (k, Value::from(v)))
        .collect()
}
