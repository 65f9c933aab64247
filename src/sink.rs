//! Output sinks: where scheduler results and engine messages go.
//!
//! [`FramedSink`] is the production sink: a single-writer task that owns
//! the output stream, numbers every message from the shared
//! [`SequenceCounter`] and writes `Content-Length` framed JSON.
//!
//! # Shutdown
//!
//! `stop()` follows a drain-then-return protocol:
//! 1. **Stop Signal**: the caller signals the writer task
//! 2. **Drain**: queued messages are written (best effort) and flushed
//! 3. **Done**: the writer task confirms and exits
//!
//! Messages sent after `stop()` are dropped with a debug log.

use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use crate::error::{LockResultExt, WireResult};
use crate::protocol::{MessageClassifier, Outgoing, SequenceCounter, encode_frame};

/// Destination for outgoing messages.
pub trait OutputSink: Send + Sync {
    /// Queue a message. Never blocks.
    fn send(&self, message: Outgoing);

    /// Flush queued messages and close the sink.
    fn stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;
}

struct StopHandles {
    stop_tx: oneshot::Sender<()>,
    done_rx: oneshot::Receiver<()>,
}

/// Single-writer sink over an async byte stream.
pub struct FramedSink {
    tx: mpsc::UnboundedSender<Outgoing>,
    classifier: Arc<dyn MessageClassifier>,
    stop: Mutex<Option<StopHandles>>,
    /// Held so the writer task stays associated with the sink.
    _join_handle: tokio::task::JoinHandle<()>,
}

impl FramedSink {
    /// Spawn the writer task.
    ///
    /// `classifier` gates output until the lifecycle handshake completes;
    /// `sequence` numbers every message that does not carry its own seq.
    pub fn spawn<W>(
        writer: W,
        classifier: Arc<dyn MessageClassifier>,
        sequence: SequenceCounter,
    ) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (done_tx, done_rx) = oneshot::channel();

        let join_handle = tokio::spawn(writer_loop(writer, rx, sequence, stop_rx, done_tx));

        Self {
            tx,
            classifier,
            stop: Mutex::new(Some(StopHandles { stop_tx, done_rx })),
            _join_handle: join_handle,
        }
    }
}

impl OutputSink for FramedSink {
    fn send(&self, message: Outgoing) {
        if !self.classifier.permits_output(&message) {
            log::debug!(
                target: "dapwire::sink",
                "Holding back {:?} until initialized, dropping",
                message
            );
            return;
        }
        if self.tx.send(message).is_err() {
            log::debug!(target: "dapwire::sink", "Sink already stopped, dropping message");
        }
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async move {
            let handles = self.stop.lock().recover_poison("FramedSink::stop").take();
            let Some(StopHandles { stop_tx, done_rx }) = handles else {
                return;
            };
            // Phase 1: signal
            let _ = stop_tx.send(());
            // Phase 2/3: wait for drain confirmation
            let _ = done_rx.await;
        })
    }
}

async fn writer_loop<W>(
    mut writer: W,
    mut rx: mpsc::UnboundedReceiver<Outgoing>,
    sequence: SequenceCounter,
    mut stop_rx: oneshot::Receiver<()>,
    done_tx: oneshot::Sender<()>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = &mut stop_rx => {
                log::debug!(target: "dapwire::sink", "Writer received stop signal, draining queue");
                rx.close();
                while let Ok(message) = rx.try_recv() {
                    if let Err(e) = write_message(&mut writer, &sequence, &message).await {
                        log::warn!(target: "dapwire::sink", "Write error during drain: {}", e);
                        break;
                    }
                }
                if let Err(e) = writer.shutdown().await {
                    log::debug!(target: "dapwire::sink", "Closing output failed: {}", e);
                }
                let _ = done_tx.send(());
                return;
            }

            message = rx.recv() => {
                let Some(message) = message else {
                    log::debug!(target: "dapwire::sink", "Writer channel closed");
                    let _ = done_tx.send(());
                    return;
                };
                if let Err(e) = write_message(&mut writer, &sequence, &message).await {
                    log::warn!(target: "dapwire::sink", "Write error: {}", e);
                }
            }
        }
    }
}

async fn write_message<W>(
    writer: &mut W,
    sequence: &SequenceCounter,
    message: &Outgoing,
) -> WireResult<()>
where
    W: AsyncWrite + Unpin,
{
    let wire = message.to_wire(|| sequence.next());
    let body = serde_json::to_vec(&wire)?;
    writer.write_all(&encode_frame(&body)).await?;
    writer.flush().await?;
    Ok(())
}

/// In-memory sink forwarding every message to a channel.
///
/// Useful for hosts that do their own writing, and for tests.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl OutputSink for ChannelSink {
    fn send(&self, message: Outgoing) {
        if self.tx.send(message).is_err() {
            log::debug!(target: "dapwire::sink", "Channel sink receiver dropped");
        }
    }

    fn stop(&self) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(async {})
    }
}
