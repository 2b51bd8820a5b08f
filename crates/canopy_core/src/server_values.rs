//! Server-resolved placeholder values.
//!
//! A write may contain `{".sv": "timestamp"}` anywhere a scalar is allowed.
//! The local cache resolves it with the client clock (corrected by the
//! server time offset); the server substitutes its own clock.

use crate::error::{CoreError, CoreResult};
use crate::value::Leaf;
use serde_json::{json, Value as Json};
use std::time::{SystemTime, UNIX_EPOCH};

/// Object key marking a server value placeholder.
pub const SERVER_VALUE_KEY: &str = ".sv";

/// Placeholder constructors.
pub struct ServerValue;

impl ServerValue {
    /// Placeholder replaced by the server's current time in milliseconds.
    pub fn timestamp() -> Json {
        json!({ SERVER_VALUE_KEY: "timestamp" })
    }
}

/// The values substituted for placeholders during conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerValues {
    /// Milliseconds since the Unix epoch.
    pub timestamp_millis: i64,
}

impl ServerValues {
    /// Uses the local clock.
    pub fn now() -> Self {
        Self::with_offset(0)
    }

    /// Uses the local clock shifted by `offset_millis`.
    pub fn with_offset(offset_millis: i64) -> Self {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as i64;
        Self {
            timestamp_millis: now + offset_millis,
        }
    }

    /// Uses a fixed timestamp.
    pub fn at(timestamp_millis: i64) -> Self {
        Self { timestamp_millis }
    }

    /// Resolves the payload of a `.sv` placeholder.
    pub(crate) fn resolve(&self, placeholder: &Json) -> CoreResult<Leaf> {
        match placeholder.as_str() {
            Some("timestamp") => Ok(Leaf::Number(self.timestamp_millis as f64)),
            _ => Err(CoreError::invalid_argument(format!(
                "unknown server value {placeholder}"
            ))),
        }
    }
}

impl Default for ServerValues {
    fn default() -> Self {
        Self::now()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_timestamp() {
        let values = ServerValues::at(1_700_000_000_000);
        let leaf = values.resolve(&json!("timestamp")).unwrap();
        assert_eq!(leaf, Leaf::Number(1_700_000_000_000.0));
        assert!(values.resolve(&json!("increment")).is_err());
    }

    #[test]
    fn placeholder_shape() {
        assert_eq!(ServerValue::timestamp(), json!({".sv": "timestamp"}));
    }
}
