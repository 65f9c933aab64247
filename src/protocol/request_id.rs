//! Correlation id type for protocol messages.
//!
//! Ids may arrive as integers or as decimal text on the wire; both are
//! normalized into the signed 64-bit domain. Negative values are treated
//! as unroutable.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Correlation id linking a request to its response.
///
/// Wraps `i64` so ids cannot be confused with sequence counters or
/// payload lengths, and so it can key the pending-call and in-flight maps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(i64);

impl RequestId {
    #[inline]
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    #[inline]
    pub fn as_i64(self) -> i64 {
        self.0
    }

    /// Normalize a wire value into a routable id.
    ///
    /// Accepts integers and decimal strings (surrounding whitespace is
    /// ignored). Returns `None` for anything else, including negative ids.
    pub fn from_value(value: &Value) -> Option<Self> {
        let raw = match value {
            Value::Number(n) => n.as_i64()?,
            Value::String(s) => s.trim().parse::<i64>().ok()?,
            _ => return None,
        };
        (raw >= 0).then_some(Self(raw))
    }

    /// Extract and normalize the id stored under `field` of a message.
    pub fn from_field(message: &Value, field: &str) -> Option<Self> {
        Self::from_value(message.get(field)?)
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<RequestId> for i64 {
    fn from(id: RequestId) -> Self {
        id.0
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;

    #[test]
    fn request_id_round_trips_i64() {
        let id: RequestId = 123.into();
        assert_eq!(id.as_i64(), 123);
        let value: i64 = id.into();
        assert_eq!(value, 123);
    }

    #[rstest]
    #[case(json!(42), Some(42))]
    #[case(json!("42"), Some(42))]
    #[case(json!(" 7 "), Some(7))]
    #[case(json!(0), Some(0))]
    #[case(json!(-1), None)]
    #[case(json!("-3"), None)]
    #[case(json!("abc"), None)]
    #[case(json!(1.5), None)]
    #[case(json!(null), None)]
    #[case(json!({"id": 1}), None)]
    fn from_value_normalizes(#[case] value: Value, #[case] expected: Option<i64>) {
        assert_eq!(RequestId::from_value(&value), expected.map(RequestId::new));
    }

    #[test]
    fn from_field_reads_named_field() {
        let msg = json!({"request_seq": 9, "seq": 3});
        assert_eq!(
            RequestId::from_field(&msg, "request_seq"),
            Some(RequestId::new(9))
        );
        assert_eq!(RequestId::from_field(&msg, "missing"), None);
    }

    #[test]
    fn serializes_as_bare_integer() {
        assert_eq!(serde_json::to_value(RequestId::new(5)).unwrap(), json!(5));
    }
}
