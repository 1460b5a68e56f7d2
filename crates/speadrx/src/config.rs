//! Consumer configuration documents
//!
//! Consumers are configured with a free-form JSON object, handed over as a
//! string by whatever front-end drives the library. This module wraps the
//! parsed document and offers typed getters so that each consumer can state
//! which keys it requires and which defaults apply.

use serde_json::Value;

use crate::error::{DaqError, DaqResult};

/// A parsed, string-keyed configuration document
#[derive(Clone, Debug, Default)]
pub struct ConsumerConfig {
    document: serde_json::Map<String, Value>,
}

impl ConsumerConfig {
    /// Parse a JSON object from its string form
    ///
    /// Anything other than a JSON object (including valid JSON of another
    /// kind) is rejected.
    pub fn from_json(text: &str) -> DaqResult<Self> {
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(document)) => Ok(Self { document }),
            Ok(other) => Err(DaqError::Config(format!(
                "expected a JSON object, got {other}"
            ))),
            Err(err) => Err(DaqError::Config(format!("invalid JSON: {err}"))),
        }
    }

    /// True if `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.document.contains_key(key)
    }

    /// Mandatory unsigned integer
    pub fn require_u32(&self, consumer: &str, key: &str) -> DaqResult<u32> {
        self.get_u64(key)
            .map(|v| v as u32)
            .ok_or_else(|| DaqError::missing_key(consumer, key))
    }

    /// Mandatory unsigned integer, narrow form
    pub fn require_u16(&self, consumer: &str, key: &str) -> DaqResult<u16> {
        self.get_u64(key)
            .map(|v| v as u16)
            .ok_or_else(|| DaqError::missing_key(consumer, key))
    }

    /// Optional unsigned integer with default
    pub fn u32_or(&self, key: &str, default: u32) -> u32 {
        self.get_u64(key).map(|v| v as u32).unwrap_or(default)
    }

    /// Optional unsigned integer with default, wide form
    pub fn u64_or(&self, key: &str, default: u64) -> u64 {
        self.get_u64(key).unwrap_or(default)
    }

    /// Optional float with default
    pub fn f64_or(&self, key: &str, default: f64) -> f64 {
        match self.document.get(key) {
            Some(Value::Number(n)) => n.as_f64().unwrap_or(default),
            _ => default,
        }
    }

    /// Optional boolean with default
    pub fn bool_or(&self, key: &str, default: bool) -> bool {
        match self.document.get(key) {
            Some(Value::Bool(b)) => *b,
            _ => default,
        }
    }

    /// Optional string
    pub fn string(&self, key: &str) -> Option<&str> {
        match self.document.get(key) {
            Some(Value::String(s)) => Some(s.as_str()),
            _ => None,
        }
    }

    fn get_u64(&self, key: &str) -> Option<u64> {
        match self.document.get(key) {
            Some(Value::Number(n)) => n.as_u64(),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_object() {
        let cfg = ConsumerConfig::from_json(r#"{"nof_tiles": 2, "start_time": -1}"#).unwrap();
        assert!(cfg.contains("nof_tiles"));
        assert_eq!(cfg.require_u16("test", "nof_tiles").unwrap(), 2);
        assert_eq!(cfg.f64_or("start_time", 0.0), -1.0);
        assert_eq!(cfg.u32_or("absent", 7), 7);
    }

    #[test]
    fn test_reject_non_object() {
        assert!(ConsumerConfig::from_json("[1, 2]").is_err());
        assert!(ConsumerConfig::from_json("not json").is_err());
    }

    #[test]
    fn test_missing_key_names_consumer() {
        let cfg = ConsumerConfig::from_json("{}").unwrap();
        let err = cfg.require_u32("rawdata", "nof_antennas").unwrap_err();
        let text = err.to_string();
        assert!(text.contains("rawdata"));
        assert!(text.contains("nof_antennas"));
    }
}
