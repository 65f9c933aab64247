//! Classification of decoded payloads into protocol events.
//!
//! The wire vocabulary uses a `type` discriminant (`event`, `request`,
//! `response`) plus a per-message `seq`. One quirk needs special care: the
//! `cancel` request carries `arguments.requestId`, which means both
//! "cancel that other in-flight call" and "acknowledge this cancel
//! request". The classifier splits such a message into a cancellation
//! notification followed by the cancel request itself, so the scheduler
//! and the handler each see only their half.

use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::{Map, Value, json};

use super::message::{Notification, Outgoing, Renor, Request};
use super::RequestId;
use crate::error::{ErrorBody, WireError};

/// Reserved command name of the cancellation request.
pub const CANCEL_COMMAND: &str = "cancel";

/// Internal notification addressed to the in-flight call being cancelled.
pub const CANCEL_NOTIFICATION: &str = "$/cancelRequest";

/// Lifecycle names that may cross the sink before initialization.
pub const INITIALIZE_COMMAND: &str = "initialize";
pub const INITIALIZED_EVENT: &str = "initialized";

/// Turns decoded payloads into typed events and gates early output.
pub trait MessageClassifier: Send + Sync {
    /// Classify one payload.
    ///
    /// # Errors
    /// Returns [`WireError::UnsupportedMessage`] when the payload uses a
    /// message kind this dialect does not know. The caller must treat this
    /// as fatal for the read loop.
    fn classify(&self, payload: &Value) -> Result<Vec<Renor>, WireError>;

    /// Record that the lifecycle-init handshake completed.
    fn mark_initialized(&self);

    /// Whether `message` may be written to the sink right now.
    fn permits_output(&self, message: &Outgoing) -> bool;
}

/// Classifier for the `seq`/`type` message dialect.
#[derive(Debug, Default)]
pub struct DapClassifier {
    initialized: AtomicBool,
}

impl DapClassifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }
}

fn missing(field: &str, id: Option<RequestId>) -> Vec<Renor> {
    vec![Renor::Invalid {
        id,
        reason: format!("No {} given", field),
    }]
}

fn classify_event(message: &Map<String, Value>) -> Vec<Renor> {
    let Some(event) = message.get("event").and_then(Value::as_str) else {
        return missing("event", None);
    };
    vec![Renor::Notification(Notification {
        method: event.to_string(),
        params: message.get("body").cloned().unwrap_or(Value::Null),
    })]
}

fn classify_request(message: &Map<String, Value>, seq: &Value) -> Vec<Renor> {
    let Some(id) = RequestId::from_value(seq) else {
        return vec![Renor::invalid("Invalid seq given")];
    };
    let Some(command) = message.get("command").and_then(Value::as_str) else {
        return missing("command", Some(id));
    };
    let mut arguments = message
        .get("arguments")
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()));

    if command == CANCEL_COMMAND
        && let Some(target) = arguments
            .as_object_mut()
            .and_then(|args| args.remove("requestId"))
    {
        return vec![
            Renor::Notification(Notification {
                method: CANCEL_NOTIFICATION.to_string(),
                params: json!({ "id": target }),
            }),
            Renor::Request(Request {
                id,
                method: CANCEL_COMMAND.to_string(),
                params: arguments,
            }),
        ];
    }

    vec![Renor::Request(Request {
        id,
        method: command.to_string(),
        params: arguments,
    })]
}

fn classify_response(message: &Map<String, Value>) -> Vec<Renor> {
    let Some(request_seq) = message.get("request_seq") else {
        return missing("request_seq", None);
    };
    if !message.contains_key("command") {
        return missing("command", None);
    }
    let Some(success) = message.get("success") else {
        return missing("success", None);
    };
    let Some(success) = success.as_bool() else {
        return vec![Renor::invalid("Invalid success given")];
    };

    let body = message.get("body").cloned().unwrap_or(Value::Null);
    if success {
        return vec![Renor::ResponseSuccess {
            id: request_seq.clone(),
            result: body,
        }];
    }

    let error = if body.is_object() {
        serde_json::from_value::<ErrorBody>(body).unwrap_or_else(|_| ErrorBody::unknown())
    } else {
        ErrorBody::unknown()
    };
    vec![Renor::ResponseFailure {
        id: request_seq.clone(),
        error,
    }]
}

impl MessageClassifier for DapClassifier {
    fn classify(&self, payload: &Value) -> Result<Vec<Renor>, WireError> {
        let Some(message) = payload.as_object() else {
            return Ok(vec![Renor::invalid("Not an object")]);
        };
        let Some(seq) = message.get("seq") else {
            return Ok(missing("seq", None));
        };
        let Some(message_type) = message.get("type") else {
            return Ok(missing("type", None));
        };

        match message_type.as_str() {
            Some("event") => Ok(classify_event(message)),
            Some("request") => Ok(classify_request(message, seq)),
            Some("response") => Ok(classify_response(message)),
            Some(other) => Err(WireError::UnsupportedMessage {
                message_type: other.to_string(),
            }),
            None => Err(WireError::UnsupportedMessage {
                message_type: message_type.to_string(),
            }),
        }
    }

    fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    fn permits_output(&self, message: &Outgoing) -> bool {
        if self.is_initialized() {
            return true;
        }
        match message {
            Outgoing::Response { .. } | Outgoing::Error { .. } => true,
            Outgoing::Event { event, .. } => event == INITIALIZED_EVENT,
            Outgoing::Request { command, .. } => command == INITIALIZE_COMMAND,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn classify(payload: Value) -> Vec<Renor> {
        DapClassifier::new()
            .classify(&payload)
            .expect("payload should be supported")
    }

    #[test]
    fn event_becomes_notification_with_null_body() {
        let events = classify(json!({"seq": 1, "type": "event", "event": "x"}));
        assert_eq!(
            events,
            vec![Renor::Notification(Notification {
                method: "x".into(),
                params: Value::Null,
            })]
        );
    }

    #[test]
    fn event_body_is_forwarded() {
        let events = classify(json!({
            "seq": 1, "type": "event", "event": "output", "body": {"output": "hi"}
        }));
        assert_eq!(
            events,
            vec![Renor::Notification(Notification {
                method: "output".into(),
                params: json!({"output": "hi"}),
            })]
        );
    }

    #[test]
    fn request_defaults_arguments_to_empty_object() {
        let events = classify(json!({"seq": 4, "type": "request", "command": "threads"}));
        assert_eq!(
            events,
            vec![Renor::Request(Request {
                id: RequestId::new(4),
                method: "threads".into(),
                params: json!({}),
            })]
        );
    }

    #[test]
    fn cancel_with_request_id_splits_into_two_events() {
        let events = classify(json!({
            "seq": 9,
            "type": "request",
            "command": "cancel",
            "arguments": {"requestId": 5, "progressId": "p"}
        }));
        assert_eq!(
            events,
            vec![
                Renor::Notification(Notification {
                    method: CANCEL_NOTIFICATION.into(),
                    params: json!({"id": 5}),
                }),
                Renor::Request(Request {
                    id: RequestId::new(9),
                    method: CANCEL_COMMAND.into(),
                    params: json!({"progressId": "p"}),
                }),
            ]
        );
    }

    #[test]
    fn cancel_without_request_id_is_a_single_request() {
        let events = classify(json!({
            "seq": 9, "type": "request", "command": "cancel", "arguments": {"progressId": "p"}
        }));
        assert_eq!(events.len(), 1);
        assert!(matches!(&events[0], Renor::Request(r) if r.method == "cancel"));
    }

    #[test]
    fn successful_response() {
        let events = classify(json!({
            "seq": 2, "type": "response", "request_seq": 7, "command": "c",
            "success": true, "body": {"ok": 1}
        }));
        assert_eq!(
            events,
            vec![Renor::ResponseSuccess {
                id: json!(7),
                result: json!({"ok": 1}),
            }]
        );
    }

    #[test]
    fn failed_response_without_body_uses_unknown_error() {
        let events = classify(json!({
            "seq": 2, "type": "response", "request_seq": 7, "command": "c", "success": false
        }));
        assert_eq!(
            events,
            vec![Renor::ResponseFailure {
                id: json!(7),
                error: ErrorBody {
                    code: -1,
                    message: "Unknown Error".into(),
                    data: None,
                },
            }]
        );
    }

    #[test]
    fn failed_response_decodes_error_body() {
        let events = classify(json!({
            "seq": 2, "type": "response", "request_seq": "7", "command": "c", "success": false,
            "body": {"code": -32800, "message": "cancelled", "data": [1]}
        }));
        assert_eq!(
            events,
            vec![Renor::ResponseFailure {
                id: json!("7"),
                error: ErrorBody {
                    code: -32800,
                    message: "cancelled".into(),
                    data: Some(json!([1])),
                },
            }]
        );
    }

    #[test]
    fn failed_response_with_undecodable_body_uses_unknown_error() {
        let events = classify(json!({
            "seq": 2, "type": "response", "request_seq": 7, "command": "c", "success": false,
            "body": {"code": "not-a-number"}
        }));
        assert!(matches!(
            &events[0],
            Renor::ResponseFailure { error, .. } if *error == ErrorBody::unknown()
        ));
    }

    #[rstest]
    #[case(json!([1, 2]), "Not an object", None)]
    #[case(json!({"type": "event", "event": "x"}), "No seq given", None)]
    #[case(json!({"seq": 1, "event": "x"}), "No type given", None)]
    #[case(json!({"seq": 1, "type": "event"}), "No event given", None)]
    #[case(json!({"seq": 3, "type": "request"}), "No command given", Some(3))]
    #[case(json!({"seq": 1, "type": "response", "command": "c", "success": true}), "No request_seq given", None)]
    #[case(json!({"seq": 1, "type": "response", "request_seq": 1, "success": true}), "No command given", None)]
    #[case(json!({"seq": 1, "type": "response", "request_seq": 1, "command": "c"}), "No success given", None)]
    fn missing_fields_yield_single_invalid_event(
        #[case] payload: Value,
        #[case] reason: &str,
        #[case] id: Option<i64>,
    ) {
        assert_eq!(
            classify(payload),
            vec![Renor::Invalid {
                id: id.map(RequestId::new),
                reason: reason.into(),
            }]
        );
    }

    #[test]
    fn unknown_type_is_unsupported() {
        let result = DapClassifier::new().classify(&json!({"seq": 1, "type": "reverse"}));
        assert!(matches!(
            result,
            Err(WireError::UnsupportedMessage { message_type }) if message_type == "reverse"
        ));
    }

    #[test]
    fn output_is_gated_until_initialized() {
        let classifier = DapClassifier::new();
        let event = Outgoing::Event {
            event: "stopped".into(),
            body: Value::Null,
        };
        let initialized = Outgoing::Event {
            event: INITIALIZED_EVENT.into(),
            body: Value::Null,
        };
        let response = Outgoing::Response {
            request_seq: RequestId::new(1),
            command: "initialize".into(),
            body: Value::Null,
        };

        assert!(!classifier.permits_output(&event));
        assert!(classifier.permits_output(&initialized));
        assert!(classifier.permits_output(&response));

        classifier.mark_initialized();
        assert!(classifier.permits_output(&event));
    }
}
