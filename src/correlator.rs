//! Response correlation for outstanding outbound calls.
//!
//! The Correlator tracks pending calls and completes them when a response
//! arrives:
//! - Before sending a request, `register(id)` returns a [`PendingResponse`]
//! - The dispatcher calls `route()` for every response event
//! - The caller awaits the [`PendingResponse`] without holding any lock
//!
//! Entries live in a sharded map so unrelated ids never contend. Removal
//! from the map is the single point of completion, which gives
//! at-most-once delivery per id even when responses, cancellation and
//! shutdown race.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use log::debug;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::sync::oneshot::error::TryRecvError;
use tokio_util::sync::CancellationToken;

use crate::error::{ErrorBody, ErrorKind, RpcError, WireError};
use crate::protocol::{Renor, RequestId};

/// Host hook turning an unrecognized failure code into a typed error.
///
/// Receives the raw error body and the method of the original call (if it
/// was registered with one). Returning `None` falls back to a generic
/// [`ErrorKind::UnknownError`].
pub type ErrorCustomizer = Arc<dyn Fn(&ErrorBody, Option<&str>) -> Option<RpcError> + Send + Sync>;

type Completion = oneshot::Sender<Result<Value, RpcError>>;

struct PendingCall {
    method: Option<String>,
    created_at: Instant,
    completion: Completion,
}

/// Owns the table of outstanding calls.
///
/// Cheap to clone; clones share the same table.
#[derive(Clone, Default)]
pub struct Correlator {
    pending: Arc<DashMap<RequestId, PendingCall>>,
    customizer: Option<ErrorCustomizer>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("pending", &self.pending.len())
            .field("customizer", &self.customizer.is_some())
            .finish()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_customizer(customizer: ErrorCustomizer) -> Self {
        Self {
            pending: Arc::default(),
            customizer: Some(customizer),
        }
    }

    /// Register an outbound call before it is sent.
    ///
    /// # Errors
    /// Returns [`WireError::DuplicateId`] if `id` is still outstanding.
    pub fn register(
        &self,
        id: RequestId,
        method: Option<&str>,
    ) -> Result<PendingResponse, WireError> {
        match self.pending.entry(id) {
            Entry::Occupied(_) => Err(WireError::DuplicateId(id)),
            Entry::Vacant(slot) => {
                let (tx, rx) = oneshot::channel();
                slot.insert(PendingCall {
                    method: method.map(str::to_string),
                    created_at: Instant::now(),
                    completion: tx,
                });
                Ok(PendingResponse {
                    id,
                    rx,
                    correlator: self.clone(),
                    settled: false,
                })
            }
        }
    }

    /// Route a response event. Ids that fail normalization are dropped.
    ///
    /// Returns `true` if a waiter received the response.
    pub fn route(&self, event: Renor) -> bool {
        match event {
            Renor::ResponseSuccess { id, result } => match RequestId::from_value(&id) {
                Some(id) => self.resolve_success(id, result),
                None => {
                    debug!(target: "dapwire::correlator", "Dropping response with unroutable id {}", id);
                    false
                }
            },
            Renor::ResponseFailure { id, error } => match RequestId::from_value(&id) {
                Some(id) => self.resolve_failure(id, error),
                None => {
                    debug!(target: "dapwire::correlator", "Dropping error with unroutable id {}", id);
                    false
                }
            },
            _ => false,
        }
    }

    /// Complete the pending call `id` with a result.
    ///
    /// Unknown ids (already resolved, cancelled, never registered) are
    /// discarded: late responses racing a cancellation are expected.
    pub fn resolve_success(&self, id: RequestId, result: Value) -> bool {
        match self.pending.remove(&id) {
            Some((_, call)) => {
                debug!(
                    target: "dapwire::correlator",
                    "Resolved {} after {:?}",
                    id,
                    call.created_at.elapsed()
                );
                call.completion.send(Ok(result)).is_ok()
            }
            None => {
                debug!(target: "dapwire::correlator", "Response for unknown id {}, dropping", id);
                false
            }
        }
    }

    /// Complete the pending call `id` with a typed failure.
    pub fn resolve_failure(&self, id: RequestId, error: ErrorBody) -> bool {
        match self.pending.remove(&id) {
            Some((_, call)) => {
                let error = self.map_error(&error, call.method.as_deref());
                debug!(target: "dapwire::correlator", "Failed {}: {}", id, error);
                call.completion.send(Err(error)).is_ok()
            }
            None => {
                debug!(target: "dapwire::correlator", "Error for unknown id {}, dropping", id);
                false
            }
        }
    }

    /// Translate a wire error body through the taxonomy.
    pub fn map_error(&self, body: &ErrorBody, method: Option<&str>) -> RpcError {
        if let Some(kind) = ErrorKind::from_code(body.code) {
            return RpcError {
                kind,
                code: body.code,
                message: body.message.clone(),
                data: body.data.clone(),
            };
        }
        self.customizer
            .as_ref()
            .and_then(|customize| customize(body, method))
            .unwrap_or_else(|| RpcError::unknown(body))
    }

    /// Drop a pending call without completing it.
    ///
    /// Returns `true` if the call was still pending.
    pub fn cancel(&self, id: RequestId) -> bool {
        self.pending.remove(&id).is_some()
    }

    pub fn is_pending(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Fail every pending call with an internal error.
    ///
    /// Called when the read loop ends or the engine shuts down so that no
    /// caller waits forever.
    pub fn fail_all(&self, message: &str) {
        let ids: Vec<RequestId> = self.pending.iter().map(|entry| *entry.key()).collect();
        for id in ids {
            if let Some((_, call)) = self.pending.remove(&id) {
                let _ = call.completion.send(Err(RpcError::internal(message)));
            }
        }
    }
}

/// Completion handle for one registered call.
///
/// Dropping the handle before an outcome arrived removes the entry, so an
/// abandoned call never lingers in the table.
pub struct PendingResponse {
    id: RequestId,
    rx: oneshot::Receiver<Result<Value, RpcError>>,
    correlator: Correlator,
    /// The outcome has been taken out of `rx`.
    settled: bool,
}

impl PendingResponse {
    pub fn id(&self) -> RequestId {
        self.id
    }

    /// Wait for the response.
    ///
    /// Cancelling `cancel` or exceeding `timeout` removes the pending entry
    /// and yields [`ErrorKind::RequestCancelled`]; a response arriving later
    /// is discarded by the correlator.
    pub async fn wait(
        mut self,
        cancel: &CancellationToken,
        timeout: Option<Duration>,
    ) -> Result<Value, RpcError> {
        let deadline = async move {
            match timeout {
                Some(duration) => tokio::time::sleep(duration).await,
                None => std::future::pending::<()>().await,
            }
        };

        // Unsettled outcomes leave removal to `Drop`.
        let (settled, outcome) = tokio::select! {
            biased;

            received = &mut self.rx => match received {
                Ok(outcome) => (true, outcome),
                // Entry removed without completion (explicit cancel).
                Err(_) => (true, Err(RpcError::cancelled())),
            },

            _ = cancel.cancelled() => (false, Err(RpcError::cancelled())),

            _ = deadline => (
                false,
                Err(RpcError::cancelled().with_data(json!({ "reason": "timeout" }))),
            ),
        };
        self.settled = settled;
        outcome
    }
}

impl Drop for PendingResponse {
    fn drop(&mut self) {
        // A sender that already fired or closed means the entry is gone, and
        // the id may belong to a newer registration by now.
        if self.settled || !matches!(self.rx.try_recv(), Err(TryRecvError::Empty)) {
            return;
        }
        if self.correlator.cancel(self.id) {
            debug!(target: "dapwire::correlator", "Abandoned pending call {}", self.id);
        }
    }
}
