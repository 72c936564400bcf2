//! Buffered value rows
//!
//! The same row shape is used in memory, on disk and in the delivery
//! envelope, so spilling and reloading never reformats a value.

use serde::{Deserialize, Serialize};

use crate::{CheckResult, Value};

/// `state` marker for values the item could not produce
pub const STATE_NOT_SUPPORTED: i32 = 1;

/// One result ready for delivery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferedValue {
    /// Monotonic per-process value id
    pub id: u64,

    pub itemid: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<i32>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub lastlogsize: Option<u64>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtime: Option<i64>,

    pub clock: i64,

    pub ns: u32,
}

impl BufferedValue {
    /// Errors become a not-supported marker carrying the message as value
    pub fn from_result(id: u64, result: &CheckResult) -> Self {
        let (value, state) = match &result.value {
            Value::Error(message) => (Some(message.clone()), Some(STATE_NOT_SUPPORTED)),
            other => (other.render(), None),
        };

        Self {
            id,
            itemid: result.itemid,
            value,
            state,
            lastlogsize: result.log.map(|log| log.lastlogsize),
            mtime: result.log.map(|log| log.mtime),
            clock: result.timestamp.timestamp(),
            ns: result.timestamp.timestamp_subsec_nanos(),
        }
    }

    pub fn is_not_supported(&self) -> bool {
        self.state == Some(STATE_NOT_SUPPORTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LogMeta;
    use chrono::TimeZone;

    #[test]
    fn test_error_becomes_not_supported() {
        let result = CheckResult::error(42, "Cannot open file.");
        let row = BufferedValue::from_result(7, &result);
        assert!(row.is_not_supported());
        assert_eq!(row.value.as_deref(), Some("Cannot open file."));
        assert_eq!(row.id, 7);
    }

    #[test]
    fn test_value_fields() {
        let mut result = CheckResult::new(3, Value::Unsigned(12)).with_log(Some(LogMeta {
            lastlogsize: 100,
            mtime: 5,
        }));
        result.timestamp = chrono::Utc.timestamp_opt(1_700_000_000, 250).unwrap();

        let row = BufferedValue::from_result(1, &result);
        assert_eq!(row.value.as_deref(), Some("12"));
        assert_eq!(row.state, None);
        assert_eq!(row.lastlogsize, Some(100));
        assert_eq!(row.mtime, Some(5));
        assert_eq!(row.clock, 1_700_000_000);
        assert_eq!(row.ns, 250);

        let json = serde_json::to_value(&row).unwrap();
        assert!(json.get("state").is_none());
    }
}
