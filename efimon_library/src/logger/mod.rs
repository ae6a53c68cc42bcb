//! Schema-checked append loggers.

pub mod csv;

pub use csv::CsvLogger;

use crate::status::Status;
use std::collections::HashMap;

/// Type of a schema field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FieldType {
    #[default]
    None,
    Integer64,
    Float,
    String,
}

/// A typed cell value for one row.
#[derive(Debug, Clone, PartialEq)]
pub enum LogValue {
    Int(i64),
    Float(f32),
    Str(String),
}

impl LogValue {
    pub fn field_type(&self) -> FieldType {
        match self {
            LogValue::Int(_) => FieldType::Integer64,
            LogValue::Float(_) => FieldType::Float,
            LogValue::Str(_) => FieldType::String,
        }
    }

    pub fn stringify(&self) -> String {
        match self {
            LogValue::Int(v) => v.to_string(),
            LogValue::Float(v) => v.to_string(),
            LogValue::Str(v) => v.clone(),
        }
    }
}

impl From<i64> for LogValue {
    fn from(v: i64) -> Self {
        LogValue::Int(v)
    }
}

impl From<u64> for LogValue {
    fn from(v: u64) -> Self {
        LogValue::Int(v as i64)
    }
}

impl From<f32> for LogValue {
    fn from(v: f32) -> Self {
        LogValue::Float(v)
    }
}

impl From<&str> for LogValue {
    fn from(v: &str) -> Self {
        LogValue::Str(v.to_string())
    }
}

/// An ordered schema: one (name, type) pair per column.
pub type Schema = Vec<(String, FieldType)>;

/// Append-only row sink.
///
/// `insert_row` reports its outcome as a [Status] value: OK with an empty
/// message on a complete row, OK with a message when schema fields were
/// missing from the row, an error code otherwise.
pub trait Logger {
    fn insert_row(&mut self, values: &HashMap<String, LogValue>) -> Status;
}
