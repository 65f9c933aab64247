//! Ingestion task: bytes in, classified events out.
//!
//! The ingestion loop:
//! - Reads chunks from the input stream
//! - Cuts them into frames with a [`FrameReader`] owned by this task
//! - Decodes each body as JSON; undecodable bodies yield a `ParseFault`
//!   error without id
//! - Classifies payloads and pushes events onto the bounded dispatch queue
//! - Stops on EOF, read error, unsupported message kind, or cancellation

use std::sync::Arc;

use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::EngineExit;
use crate::error::{RpcError, WireError};
use crate::protocol::{Frame, FrameReader, MessageClassifier, Outgoing, Renor};
use crate::sink::OutputSink;

pub(super) struct Ingestion {
    pub(super) classifier: Arc<dyn MessageClassifier>,
    pub(super) sink: Arc<dyn OutputSink>,
    pub(super) events: mpsc::Sender<Renor>,
    pub(super) chunk_size: usize,
}

impl Ingestion {
    /// Run until the input ends, a fatal fault occurs, or `cancel` fires.
    pub(super) async fn run<R>(self, mut input: R, cancel: CancellationToken) -> EngineExit
    where
        R: AsyncRead + Unpin,
    {
        let mut frames = FrameReader::with_capacity(self.chunk_size);
        let mut chunk = vec![0u8; self.chunk_size.max(1)];

        loop {
            let read = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    log::debug!(target: "dapwire::reader", "Ingestion cancelled, shutting down");
                    return EngineExit::Stopped;
                }
                read = input.read(&mut chunk) => read,
            };

            let n = match read {
                Ok(0) => {
                    if frames.has_partial_frame() {
                        log::warn!(
                            target: "dapwire::reader",
                            "Input closed with {} byte(s) of an incomplete frame",
                            frames.buffered_len()
                        );
                    } else {
                        log::debug!(target: "dapwire::reader", "Input closed");
                    }
                    return EngineExit::InputClosed;
                }
                Ok(n) => n,
                Err(e) => {
                    log::warn!(target: "dapwire::reader", "Reader error: {}", e);
                    return EngineExit::Fault(Arc::new(WireError::Io(e)));
                }
            };

            for frame in frames.feed(&chunk[..n]) {
                let events = match frame {
                    Frame::Malformed { reason } => {
                        log::debug!(target: "dapwire::reader", "Skipping frame: {}", reason);
                        continue;
                    }
                    Frame::Message { body, .. } => match self.decode(&body) {
                        Some(payload) => match self.classifier.classify(&payload) {
                            Ok(events) => events,
                            Err(e) => {
                                log::error!(target: "dapwire::reader", "Fatal: {}", e);
                                return EngineExit::Fault(Arc::new(e));
                            }
                        },
                        None => continue,
                    },
                };

                for event in events {
                    tokio::select! {
                        biased;
                        _ = cancel.cancelled() => return EngineExit::Stopped,
                        sent = self.events.send(event) => {
                            if sent.is_err() {
                                log::error!(target: "dapwire::reader", "Dispatcher gone, stopping");
                                return EngineExit::Fault(Arc::new(WireError::ChannelClosed(
                                    "event queue",
                                )));
                            }
                        }
                    }
                }
            }
        }
    }

    /// Decode a frame body, answering undecodable ones with a parse fault.
    fn decode(&self, body: &[u8]) -> Option<Value> {
        match serde_json::from_slice(body) {
            Ok(payload) => Some(payload),
            Err(e) => {
                log::warn!(target: "dapwire::reader", "Undecodable payload: {}", e);
                self.sink.send(Outgoing::Error {
                    request_seq: None,
                    command: None,
                    error: RpcError::parse_fault(e.to_string()).to_body(),
                });
                None
            }
        }
    }
}
