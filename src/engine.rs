//! Engine wiring: ingestion, dispatch, scheduling and output.
//!
//! ```text
//! input bytes -> [ingestion task] -> bounded queue -> [dispatcher task]
//!                                                        |        |
//!                                              correlator    scheduler -> sink
//! ```
//!
//! ## Module Structure
//!
//! - `reader` - ingestion loop (framing, decoding, classification)
//! - `dispatcher` - routing of classified events
//!
//! # Shutdown
//!
//! [`EngineHandle::shutdown`] runs the sequence:
//! 1. stop ingestion and wait for the dispatcher to drain the queue
//! 2. cancel every unit and wait up to the grace period, then abort
//! 3. fail pending outbound calls
//! 4. stop the sink (drain and flush)

mod dispatcher;
mod reader;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{EngineSettings, ShutdownGrace};
use crate::correlator::{Correlator, ErrorCustomizer};
use crate::error::{LockResultExt, RpcError, WireError};
use crate::protocol::classifier::INITIALIZED_EVENT;
use crate::protocol::{DapClassifier, MessageClassifier, Outgoing, SequenceCounter};
use crate::registry::HandlerRegistry;
use crate::scheduler::Scheduler;
use crate::sink::{FramedSink, OutputSink};
use dispatcher::Dispatcher;
use reader::Ingestion;

/// Why ingestion ended.
#[derive(Debug, Clone)]
pub enum EngineExit {
    /// The peer closed the input stream.
    InputClosed,
    /// Shutdown was requested.
    Stopped,
    /// Fatal ingestion fault (I/O error, unsupported message kind).
    Fault(Arc<WireError>),
}

impl EngineExit {
    pub fn is_fault(&self) -> bool {
        matches!(self, EngineExit::Fault(_))
    }
}

/// Engine builder.
pub struct Engine {
    settings: EngineSettings,
    registry: Arc<dyn HandlerRegistry>,
    classifier: Arc<dyn MessageClassifier>,
    customizer: Option<ErrorCustomizer>,
    announce_initialized: bool,
}

impl Engine {
    pub fn new(registry: Arc<dyn HandlerRegistry>) -> Self {
        Self {
            settings: EngineSettings::default(),
            registry,
            classifier: Arc::new(DapClassifier::new()),
            customizer: None,
            announce_initialized: false,
        }
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_classifier(mut self, classifier: Arc<dyn MessageClassifier>) -> Self {
        self.classifier = classifier;
        self
    }

    /// Host hook consulted for failure codes the taxonomy does not know.
    pub fn with_error_customizer(mut self, customizer: ErrorCustomizer) -> Self {
        self.customizer = Some(customizer);
        self
    }

    /// Emit the `initialized` event after a successful `initialize` response
    /// and lift output gating.
    pub fn announce_initialized(mut self, announce: bool) -> Self {
        self.announce_initialized = announce;
        self
    }

    /// Start over a byte stream pair, writing through a [`FramedSink`].
    pub fn start<R, W>(self, input: R, output: W) -> EngineHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let sequence = SequenceCounter::new();
        let sink = Arc::new(FramedSink::spawn(
            output,
            Arc::clone(&self.classifier),
            sequence.clone(),
        ));
        self.start_with_sink(input, sink, sequence)
    }

    /// Start with a host-provided sink.
    ///
    /// `sequence` must be the counter the sink numbers messages from, so
    /// outbound call ids never collide with it.
    pub fn start_with_sink<R>(
        self,
        input: R,
        sink: Arc<dyn OutputSink>,
        sequence: SequenceCounter,
    ) -> EngineHandle
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let settings = self.settings;
        let correlator = match self.customizer {
            Some(customizer) => Correlator::with_customizer(customizer),
            None => Correlator::new(),
        };
        let scheduler = Scheduler::new(Arc::clone(&sink), settings.scheduler_options());
        let ingestion_token = CancellationToken::new();
        let (events_tx, events_rx) = mpsc::channel(settings.inbound_queue_capacity.max(1));
        let (exit_tx, exit_rx) = watch::channel(None);

        let ingestion = Ingestion {
            classifier: Arc::clone(&self.classifier),
            sink: Arc::clone(&sink),
            events: events_tx,
            chunk_size: settings.read_chunk_size,
        };
        let reader_correlator = correlator.clone();
        let reader_token = ingestion_token.clone();
        let reader_task = tokio::spawn(async move {
            let exit = ingestion.run(input, reader_token).await;
            match &exit {
                EngineExit::InputClosed => reader_correlator.fail_all("input closed"),
                EngineExit::Fault(e) => {
                    reader_correlator.fail_all(&format!("reader error: {}", e));
                }
                EngineExit::Stopped => {}
            }
            exit_tx.send_replace(Some(exit));
        });

        let dispatcher = Dispatcher {
            scheduler: scheduler.clone(),
            correlator: correlator.clone(),
            registry: self.registry,
            classifier: Arc::clone(&self.classifier),
            sink: Arc::clone(&sink),
            announce_initialized: self.announce_initialized,
        };
        let dispatcher_task = tokio::spawn(dispatcher.run(events_rx));

        log::debug!(target: "dapwire::engine", "Engine started");

        EngineHandle {
            scheduler,
            correlator,
            classifier: self.classifier,
            sink,
            sequence,
            request_timeout: settings.request_timeout(),
            grace: settings.shutdown_grace(),
            ingestion_token,
            exit: exit_rx,
            tasks: Mutex::new(Some(EngineTasks {
                reader: reader_task,
                dispatcher: dispatcher_task,
            })),
        }
    }
}

struct EngineTasks {
    reader: JoinHandle<()>,
    dispatcher: JoinHandle<()>,
}

/// Running engine.
pub struct EngineHandle {
    scheduler: Scheduler,
    correlator: Correlator,
    classifier: Arc<dyn MessageClassifier>,
    sink: Arc<dyn OutputSink>,
    sequence: SequenceCounter,
    request_timeout: Option<Duration>,
    grace: ShutdownGrace,
    ingestion_token: CancellationToken,
    exit: watch::Receiver<Option<EngineExit>>,
    tasks: Mutex<Option<EngineTasks>>,
}

impl EngineHandle {
    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Call the peer and wait for its response.
    ///
    /// Bounded by the configured request timeout; `token` cancels the wait.
    ///
    /// # Errors
    /// Fails with [`ErrorKind::ServerNotInitialized`](crate::error::ErrorKind)
    /// when output gating would hold the request back.
    pub async fn call(
        &self,
        command: &str,
        arguments: Value,
        token: &CancellationToken,
    ) -> Result<Value, RpcError> {
        let id = self.sequence.next_id();
        let request = Outgoing::Request {
            seq: id,
            command: command.to_string(),
            arguments,
        };
        if !self.classifier.permits_output(&request) {
            log::debug!(target: "dapwire::engine", "Refusing {} before initialization", command);
            return Err(RpcError::not_initialized(format!(
                "Cannot send {} before initialization",
                command
            )));
        }
        let pending = self
            .correlator
            .register(id, Some(command))
            .map_err(|e| RpcError::internal(e.to_string()))?;
        self.sink.send(request);
        pending.wait(token, self.request_timeout).await
    }

    /// Send an event to the peer.
    ///
    /// Sending `initialized` also lifts output gating.
    pub fn send_event(&self, event: &str, body: Value) {
        self.sink.send(Outgoing::Event {
            event: event.to_string(),
            body,
        });
        if event == INITIALIZED_EVENT {
            self.classifier.mark_initialized();
        }
    }

    pub fn mark_initialized(&self) {
        self.classifier.mark_initialized();
    }

    /// Wait for ingestion to end and report why.
    pub async fn finished(&self) -> EngineExit {
        let mut exit = self.exit.clone();
        match exit.wait_for(Option::is_some).await {
            Ok(exit) => (*exit).clone().unwrap_or(EngineExit::Stopped),
            Err(_) => EngineExit::Stopped,
        }
    }

    /// Run the shutdown sequence. Idempotent.
    pub async fn shutdown(&self) -> EngineExit {
        let tasks = self
            .tasks
            .lock()
            .recover_poison("EngineHandle::shutdown")
            .take();
        let Some(EngineTasks { reader, dispatcher }) = tasks else {
            return self.finished().await;
        };

        log::info!(target: "dapwire::engine", "Shutting down");
        self.ingestion_token.cancel();
        if let Err(e) = reader.await {
            log::error!(target: "dapwire::engine", "Ingestion task panicked: {}", e);
        }
        if let Err(e) = dispatcher.await {
            log::error!(target: "dapwire::engine", "Dispatcher task panicked: {}", e);
        }

        self.scheduler.shutdown(self.grace.as_duration()).await;
        self.correlator.fail_all("engine shutting down");
        self.sink.stop().await;
        log::debug!(target: "dapwire::engine", "Shutdown complete");

        self.finished().await
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        // Ensure ingestion stops if the handle is dropped without shutdown
        self.ingestion_token.cancel();
    }
}
