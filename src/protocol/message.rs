//! Typed protocol events (inbound) and outgoing messages.
//!
//! Inbound payloads are classified into [`Renor`] values (request,
//! notification, response, error, invalid). Events are transient: the
//! dispatcher consumes each one immediately.
//!
//! Outgoing messages are rendered into the wire shape by the sink, which
//! owns sequence numbering through a shared [`SequenceCounter`].

use std::sync::Arc;
use std::sync::atomic::{AtomicI64, Ordering};

use serde_json::{Map, Value, json};

use super::RequestId;
use crate::error::ErrorBody;

/// Inbound request expecting a response.
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub id: RequestId,
    pub method: String,
    pub params: Value,
}

/// Inbound notification; no response is expected.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub method: String,
    pub params: Value,
}

/// Classified protocol event.
///
/// Response ids are kept raw: the correlator normalizes them and discards
/// the ones it cannot route.
#[derive(Debug, Clone, PartialEq)]
pub enum Renor {
    Request(Request),
    Notification(Notification),
    ResponseSuccess { id: Value, result: Value },
    ResponseFailure { id: Value, error: ErrorBody },
    /// Classification fault. `id` is set when the fault is addressable.
    Invalid {
        id: Option<RequestId>,
        reason: String,
    },
}

impl Renor {
    pub fn is_response(&self) -> bool {
        matches!(
            self,
            Renor::ResponseSuccess { .. } | Renor::ResponseFailure { .. }
        )
    }

    pub fn invalid(reason: impl Into<String>) -> Self {
        Renor::Invalid {
            id: None,
            reason: reason.into(),
        }
    }
}

/// Message handed to the output sink.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    /// Successful response to an inbound request.
    Response {
        request_seq: RequestId,
        command: String,
        body: Value,
    },
    /// Failed response. `request_seq` is absent when the fault had no id.
    Error {
        request_seq: Option<RequestId>,
        command: Option<String>,
        error: ErrorBody,
    },
    Event { event: String, body: Value },
    /// Outbound call; `seq` doubles as the correlation id.
    Request {
        seq: RequestId,
        command: String,
        arguments: Value,
    },
}

impl Outgoing {
    pub fn is_response(&self) -> bool {
        matches!(self, Outgoing::Response { .. } | Outgoing::Error { .. })
    }

    /// Render the wire representation.
    ///
    /// `next_seq` is only consulted for messages that do not carry their
    /// own sequence number (everything except `Request`).
    pub fn to_wire(&self, next_seq: impl FnOnce() -> i64) -> Value {
        let mut message = Map::new();
        match self {
            Outgoing::Response {
                request_seq,
                command,
                body,
            } => {
                message.insert("seq".into(), json!(next_seq()));
                message.insert("type".into(), json!("response"));
                message.insert("request_seq".into(), json!(request_seq));
                message.insert("command".into(), json!(command));
                message.insert("success".into(), json!(true));
                if !body.is_null() {
                    message.insert("body".into(), body.clone());
                }
            }
            Outgoing::Error {
                request_seq,
                command,
                error,
            } => {
                message.insert("seq".into(), json!(next_seq()));
                message.insert("type".into(), json!("response"));
                if let Some(request_seq) = request_seq {
                    message.insert("request_seq".into(), json!(request_seq));
                }
                message.insert(
                    "command".into(),
                    json!(command.as_deref().unwrap_or_default()),
                );
                message.insert("success".into(), json!(false));
                message.insert("message".into(), json!(error.message));
                message.insert("body".into(), json!(error));
            }
            Outgoing::Event { event, body } => {
                message.insert("seq".into(), json!(next_seq()));
                message.insert("type".into(), json!("event"));
                message.insert("event".into(), json!(event));
                if !body.is_null() {
                    message.insert("body".into(), body.clone());
                }
            }
            Outgoing::Request {
                seq,
                command,
                arguments,
            } => {
                message.insert("seq".into(), json!(seq));
                message.insert("type".into(), json!("request"));
                message.insert("command".into(), json!(command));
                message.insert("arguments".into(), arguments.clone());
            }
        }
        Value::Object(message)
    }
}

/// Shared sequence counter for outgoing messages.
///
/// The sink numbers responses and events from it; outbound calls draw
/// their correlation id from the same counter so the two never collide.
#[derive(Debug, Clone)]
pub struct SequenceCounter(Arc<AtomicI64>);

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self(Arc::new(AtomicI64::new(1)))
    }

    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::SeqCst)
    }

    pub fn next_id(&self) -> RequestId {
        RequestId::new(self.next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_wire_shape() {
        let wire = Outgoing::Response {
            request_seq: RequestId::new(4),
            command: "threads".into(),
            body: json!({"threads": []}),
        }
        .to_wire(|| 10);
        assert_eq!(
            wire,
            json!({
                "seq": 10,
                "type": "response",
                "request_seq": 4,
                "command": "threads",
                "success": true,
                "body": {"threads": []}
            })
        );
    }

    #[test]
    fn null_body_is_omitted() {
        let wire = Outgoing::Event {
            event: "initialized".into(),
            body: Value::Null,
        }
        .to_wire(|| 1);
        assert!(wire.get("body").is_none());
    }

    #[test]
    fn error_wire_shape_carries_error_body() {
        let wire = Outgoing::Error {
            request_seq: Some(RequestId::new(3)),
            command: Some("evaluate".into()),
            error: ErrorBody {
                code: -32601,
                message: "Method not found - evaluate".into(),
                data: None,
            },
        }
        .to_wire(|| 8);
        assert_eq!(wire["success"], false);
        assert_eq!(wire["request_seq"], 3);
        assert_eq!(wire["body"]["code"], -32601);
        assert_eq!(wire["message"], "Method not found - evaluate");
    }

    #[test]
    fn unaddressed_error_has_no_request_seq() {
        let wire = Outgoing::Error {
            request_seq: None,
            command: None,
            error: ErrorBody::unknown(),
        }
        .to_wire(|| 1);
        assert!(wire.get("request_seq").is_none());
        assert_eq!(wire["command"], "");
    }

    #[test]
    fn request_uses_its_own_seq() {
        let wire = Outgoing::Request {
            seq: RequestId::new(77),
            command: "runInTerminal".into(),
            arguments: json!({}),
        }
        .to_wire(|| panic!("requests carry their own seq"));
        assert_eq!(wire["seq"], 77);
        assert_eq!(wire["type"], "request");
    }

    #[test]
    fn sequence_counter_is_shared_between_clones() {
        let counter = SequenceCounter::new();
        let clone = counter.clone();
        assert_eq!(counter.next(), 1);
        assert_eq!(clone.next(), 2);
        assert_eq!(counter.next_id(), RequestId::new(3));
    }
}
