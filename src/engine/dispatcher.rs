//! Dispatcher: routes classified events to their consumer.
//!
//! | Event | Consumer |
//! |---|---|
//! | response success/failure | correlator |
//! | `$/cancelRequest` notification | scheduler cancel |
//! | request / notification | registry lookup, then scheduler |
//! | invalid with id | immediate `InvalidRequest` error |
//! | invalid without id | log |

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;
use tokio::sync::mpsc;

use crate::correlator::Correlator;
use crate::error::RpcError;
use crate::protocol::classifier::{
    CANCEL_COMMAND, CANCEL_NOTIFICATION, INITIALIZE_COMMAND, INITIALIZED_EVENT,
};
use crate::protocol::{MessageClassifier, Notification, Outgoing, Renor, Request, RequestId};
use crate::registry::{HandlerDescriptor, HandlerFuture, HandlerRegistry};
use crate::scheduler::{Policy, Scheduler, SchedulingUnit, UnitState};
use crate::sink::OutputSink;

pub(super) struct Dispatcher {
    pub(super) scheduler: Scheduler,
    pub(super) correlator: Correlator,
    pub(super) registry: Arc<dyn HandlerRegistry>,
    pub(super) classifier: Arc<dyn MessageClassifier>,
    pub(super) sink: Arc<dyn OutputSink>,
    /// Emit `initialized` after a successful `initialize` response.
    pub(super) announce_initialized: bool,
}

impl Dispatcher {
    /// Consume events until the ingestion side closes the queue.
    pub(super) async fn run(self, mut events: mpsc::Receiver<Renor>) {
        while let Some(event) = events.recv().await {
            self.dispatch(event);
        }
        log::debug!(target: "dapwire::dispatch", "Event queue closed, dispatcher exiting");
    }

    pub(super) fn dispatch(&self, event: Renor) {
        match event {
            Renor::ResponseSuccess { .. } | Renor::ResponseFailure { .. } => {
                if !self.correlator.route(event) {
                    log::debug!(
                        target: "dapwire::dispatch",
                        "Response for unknown request, dropping"
                    );
                }
            }
            Renor::Notification(notification) if notification.method == CANCEL_NOTIFICATION => {
                self.cancel(&notification.params);
            }
            Renor::Notification(notification) => self.notification(notification),
            Renor::Request(request) => self.request(request),
            Renor::Invalid {
                id: Some(id),
                reason,
            } => {
                log::debug!(target: "dapwire::dispatch", "Invalid request {}: {}", id, reason);
                self.sink.send(Outgoing::Error {
                    request_seq: Some(id),
                    command: None,
                    error: RpcError::invalid_request(reason).to_body(),
                });
            }
            Renor::Invalid { id: None, reason } => {
                log::warn!(target: "dapwire::dispatch", "Dropping invalid message: {}", reason);
            }
        }
    }

    fn cancel(&self, params: &Value) {
        let Some(id) = RequestId::from_field(params, "id") else {
            log::debug!(
                target: "dapwire::dispatch",
                "Cancel without a usable request id: {}",
                params
            );
            return;
        };
        if self.scheduler.cancel(id) {
            log::debug!(target: "dapwire::dispatch", "Cancelled request {}", id);
        }
    }

    fn notification(&self, notification: Notification) {
        let Notification { method, params } = notification;
        let Some(descriptor) = self.registry.resolve(&method) else {
            log::debug!(target: "dapwire::dispatch", "No handler for notification {}", method);
            return;
        };
        self.scheduler.accept(SchedulingUnit::notification(
            method,
            descriptor.policy,
            move |token| descriptor.invoke(params, token),
        ));
    }

    fn request(&self, request: Request) {
        let Request { id, method, params } = request;
        let Some(descriptor) = self.registry.resolve(&method) else {
            if method == CANCEL_COMMAND {
                // Cancellation already happened at the notification half;
                // the request itself only needs an acknowledgement.
                self.scheduler.accept(SchedulingUnit::request(
                    id,
                    method,
                    Policy::Parallel,
                    |_| -> HandlerFuture { Box::pin(async { Ok(Value::Null) }) },
                ));
                return;
            }
            log::debug!(target: "dapwire::dispatch", "Method not found: {}", method);
            self.sink.send(Outgoing::Error {
                request_seq: Some(id),
                error: RpcError::method_not_found(&method).to_body(),
                command: Some(method),
            });
            return;
        };

        if self.announce_initialized && method == INITIALIZE_COMMAND {
            self.initialize(id, method, params, descriptor);
            return;
        }

        self.scheduler.accept(SchedulingUnit::request(
            id,
            method,
            descriptor.policy,
            move |token| descriptor.invoke(params, token),
        ));
    }

    /// Run `initialize`, then announce readiness once its response is out.
    fn initialize(
        &self,
        id: RequestId,
        method: String,
        params: Value,
        descriptor: Arc<HandlerDescriptor>,
    ) {
        let succeeded = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&succeeded);
        let handle = self.scheduler.accept(SchedulingUnit::request(
            id,
            method,
            descriptor.policy,
            move |token| -> HandlerFuture {
                let call = descriptor.invoke(params, token);
                Box::pin(async move {
                    let result = call.await;
                    flag.store(result.is_ok(), Ordering::Release);
                    result
                })
            },
        ));

        let sink = Arc::clone(&self.sink);
        let classifier = Arc::clone(&self.classifier);
        // Tracked so shutdown waits for the announcement before the sink stops.
        self.scheduler.spawn_tracked(async move {
            if handle.finished().await == UnitState::Completed
                && succeeded.load(Ordering::Acquire)
            {
                classifier.mark_initialized();
                sink.send(Outgoing::Event {
                    event: INITIALIZED_EVENT.to_string(),
                    body: Value::Null,
                });
                log::info!(target: "dapwire::dispatch", "Initialized");
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCodes;
    use crate::protocol::DapClassifier;
    use crate::registry::HandlerTable;
    use crate::scheduler::SchedulerOptions;
    use crate::sink::ChannelSink;
    use serde_json::json;
    use tokio_util::sync::CancellationToken;

    fn dispatcher(table: HandlerTable) -> (Dispatcher, mpsc::UnboundedReceiver<Outgoing>) {
        let (sink, rx) = ChannelSink::new();
        let sink: Arc<dyn OutputSink> = Arc::new(sink);
        let dispatcher = Dispatcher {
            scheduler: Scheduler::new(Arc::clone(&sink), SchedulerOptions::default()),
            correlator: Correlator::new(),
            registry: Arc::new(table),
            classifier: Arc::new(DapClassifier::new()),
            sink,
            announce_initialized: true,
        };
        (dispatcher, rx)
    }

    fn request(id: i64, method: &str) -> Renor {
        Renor::Request(Request {
            id: RequestId::new(id),
            method: method.into(),
            params: json!({}),
        })
    }

    #[tokio::test]
    async fn unknown_method_yields_method_not_found() {
        let (dispatcher, mut rx) = dispatcher(HandlerTable::new());
        dispatcher.dispatch(request(3, "evaluate"));

        match rx.recv().await.unwrap() {
            Outgoing::Error {
                request_seq,
                command,
                error,
            } => {
                assert_eq!(request_seq, Some(RequestId::new(3)));
                assert_eq!(command.as_deref(), Some("evaluate"));
                assert_eq!(error.code, ErrorCodes::METHOD_NOT_FOUND);
                assert_eq!(error.message, "Method not found - evaluate");
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn invalid_event_with_id_yields_invalid_request() {
        let (dispatcher, mut rx) = dispatcher(HandlerTable::new());
        dispatcher.dispatch(Renor::Invalid {
            id: Some(RequestId::new(4)),
            reason: "No command given".into(),
        });
        dispatcher.dispatch(Renor::invalid("No seq given"));

        match rx.recv().await.unwrap() {
            Outgoing::Error { request_seq, error, .. } => {
                assert_eq!(request_seq, Some(RequestId::new(4)));
                assert_eq!(error.code, ErrorCodes::INVALID_REQUEST);
            }
            other => panic!("expected error, got {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn responses_go_to_the_correlator() {
        let (dispatcher, _rx) = dispatcher(HandlerTable::new());
        let pending = dispatcher
            .correlator
            .register(RequestId::new(12), Some("runInTerminal"))
            .unwrap();

        dispatcher.dispatch(Renor::ResponseSuccess {
            id: json!(12),
            result: json!({"processId": 7}),
        });

        let result = pending.wait(&CancellationToken::new(), None).await;
        assert_eq!(result, Ok(json!({"processId": 7})));
    }

    #[tokio::test]
    async fn cancel_notification_cancels_in_flight_request() {
        let table = HandlerTable::new().with(
            "evaluate",
            Policy::Parallel,
            |_params: Value, _token: CancellationToken| {
                std::future::pending::<Result<Value, RpcError>>()
            },
        );
        let (dispatcher, mut rx) = dispatcher(table);

        dispatcher.dispatch(request(5, "evaluate"));
        tokio::task::yield_now().await;
        dispatcher.dispatch(Renor::Notification(Notification {
            method: CANCEL_NOTIFICATION.into(),
            params: json!({"id": "5"}),
        }));
        dispatcher.dispatch(request(6, CANCEL_COMMAND));

        let mut messages = vec![rx.recv().await.unwrap(), rx.recv().await.unwrap()];
        messages.sort_by_key(|message| match message {
            Outgoing::Response { request_seq, .. } => request_seq.as_i64(),
            Outgoing::Error { request_seq, .. } => request_seq.map(RequestId::as_i64).unwrap_or(0),
            _ => 0,
        });
        assert!(matches!(
            &messages[0],
            Outgoing::Error { error, .. } if error.code == ErrorCodes::REQUEST_CANCELLED
        ));
        assert!(matches!(
            &messages[1],
            Outgoing::Response { command, .. } if command == CANCEL_COMMAND
        ));
    }

    #[tokio::test]
    async fn successful_initialize_is_announced_after_its_response() {
        let table = HandlerTable::new().with(
            INITIALIZE_COMMAND,
            Policy::Exclusive,
            |_params: Value, _token: CancellationToken| async {
                Ok::<_, RpcError>(json!({"supportsConfigurationDoneRequest": true}))
            },
        );
        let (dispatcher, mut rx) = dispatcher(table);
        dispatcher.dispatch(request(1, INITIALIZE_COMMAND));

        assert!(matches!(rx.recv().await.unwrap(), Outgoing::Response { .. }));
        assert!(matches!(
            rx.recv().await.unwrap(),
            Outgoing::Event { event, .. } if event == INITIALIZED_EVENT
        ));
    }

    #[tokio::test]
    async fn failed_initialize_is_not_announced() {
        let table = HandlerTable::new().with(
            INITIALIZE_COMMAND,
            Policy::Exclusive,
            |_params: Value, _token: CancellationToken| async {
                Err::<Value, _>(RpcError::invalid_parameters("adapterID required"))
            },
        );
        let (dispatcher, mut rx) = dispatcher(table);
        dispatcher.dispatch(request(1, INITIALIZE_COMMAND));

        assert!(matches!(rx.recv().await.unwrap(), Outgoing::Error { .. }));
        dispatcher
            .scheduler
            .shutdown(std::time::Duration::from_millis(100))
            .await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn initialize_cancelled_by_shutdown_is_not_announced() {
        let table = HandlerTable::new().with(
            INITIALIZE_COMMAND,
            Policy::Exclusive,
            |_params: Value, _token: CancellationToken| {
                std::future::pending::<Result<Value, RpcError>>()
            },
        );
        let (dispatcher, mut rx) = dispatcher(table);
        dispatcher.dispatch(request(1, INITIALIZE_COMMAND));
        while dispatcher.scheduler.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        dispatcher
            .scheduler
            .shutdown(std::time::Duration::from_millis(100))
            .await;

        // The announcer has been joined by shutdown; only the cancellation remains.
        assert!(matches!(
            rx.try_recv(),
            Ok(Outgoing::Error { error, .. }) if error.code == ErrorCodes::REQUEST_CANCELLED
        ));
        assert!(rx.try_recv().is_err());
    }
}
