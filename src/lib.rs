pub mod access;
pub mod actors;
pub mod address;
pub mod config;
pub mod expression;
pub mod interval;
pub mod key;
pub mod plugin;
pub mod protocol;
pub mod storage;
pub mod task;
pub mod util;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent version reported to the server
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Message used when the access gate rejects a key
pub const UNSUPPORTED_KEY: &str = "Unsupported item key.";

/// A single measured value, tagged by kind
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Value {
    Text(String),
    Unsigned(u64),
    Float(f64),
    Error(String),
}

impl Value {
    /// Textual form sent over the wire, `None` for errors
    pub fn render(&self) -> Option<String> {
        match self {
            Value::Text(text) => Some(text.clone()),
            Value::Unsigned(number) => Some(number.to_string()),
            Value::Float(number) => Some(format!("{number:.6}")),
            Value::Error(_) => None,
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Value::Error(_))
    }
}

/// Log file position attached to log-style results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogMeta {
    pub lastlogsize: u64,
    pub mtime: i64,
}

/// Outcome of one check execution for one item
///
/// Results are immutable once produced and are owned by the result cache
/// until they have been delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub itemid: u64,
    pub value: Value,
    pub log: Option<LogMeta>,
    pub timestamp: DateTime<Utc>,
}

impl CheckResult {
    pub fn new(itemid: u64, value: Value) -> Self {
        Self {
            itemid,
            value,
            log: None,
            timestamp: Utc::now(),
        }
    }

    pub fn error(itemid: u64, message: impl Into<String>) -> Self {
        Self::new(itemid, Value::Error(message.into()))
    }

    pub fn with_log(mut self, log: Option<LogMeta>) -> Self {
        self.log = log;
        self
    }

    pub fn error_message(&self) -> Option<&str> {
        match &self.value {
            Value::Error(message) => Some(message),
            _ => None,
        }
    }
}
