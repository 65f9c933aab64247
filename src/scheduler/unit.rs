//! Scheduling units and their state machine.
//!
//! ```text
//! Queued -> Running -> Completed
//!    |         |-----> Faulted
//!    |         '-----> Cancelled
//!    '---------------> Cancelled
//! ```
//!
//! Terminal states absorb all further signals. Every transition goes
//! through `watch::Sender::send_if_modified`, so a transition and its
//! precondition are checked under one lock: the start of a unit and a
//! supersede signal can race, and exactly one of them wins.

use std::sync::{Arc, OnceLock};

use serde_json::Value;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use super::Policy;
use crate::protocol::RequestId;
use crate::registry::HandlerFuture;

/// Why a unit was cancelled. The first source to fire wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// Cancel event addressed to the unit's call id.
    Explicit,
    /// A newer Serial unit for the same method was accepted.
    Superseded,
    Shutdown,
    /// Exceeded the configured request timeout while running.
    Timeout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitState {
    Queued,
    Running,
    Completed,
    Cancelled(CancelReason),
    Faulted,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            UnitState::Completed | UnitState::Cancelled(_) | UnitState::Faulted
        )
    }
}

/// Work closure of a unit. Receives the unit's cancellation token.
pub type WorkClosure = Box<dyn FnOnce(CancellationToken) -> HandlerFuture + Send>;

/// A unit of inbound work waiting to be accepted by the scheduler.
pub struct SchedulingUnit {
    pub method: String,
    pub policy: Policy,
    /// Call id for requests; `None` for notifications.
    pub id: Option<RequestId>,
    pub work: WorkClosure,
}

impl SchedulingUnit {
    pub fn request<F>(id: RequestId, method: impl Into<String>, policy: Policy, work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> HandlerFuture + Send + 'static,
    {
        Self {
            method: method.into(),
            policy,
            id: Some(id),
            work: Box::new(work),
        }
    }

    pub fn notification<F>(method: impl Into<String>, policy: Policy, work: F) -> Self
    where
        F: FnOnce(CancellationToken) -> HandlerFuture + Send + 'static,
    {
        Self {
            method: method.into(),
            policy,
            id: None,
            work: Box::new(work),
        }
    }

    pub fn produces_result(&self) -> bool {
        self.id.is_some()
    }
}

impl std::fmt::Debug for SchedulingUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchedulingUnit")
            .field("method", &self.method)
            .field("policy", &self.policy)
            .field("id", &self.id)
            .finish_non_exhaustive()
    }
}

/// Shared state of one accepted unit.
#[derive(Debug)]
pub(crate) struct UnitCell {
    state: watch::Sender<UnitState>,
    token: CancellationToken,
    reason: OnceLock<CancelReason>,
}

impl UnitCell {
    pub(crate) fn new(token: CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            state: watch::Sender::new(UnitState::Queued),
            token,
            reason: OnceLock::new(),
        })
    }

    pub(crate) fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub(crate) fn state(&self) -> UnitState {
        *self.state.borrow()
    }

    /// Reason recorded by the first cancel source; shutdown when the token
    /// fired through its parent.
    pub(crate) fn cancel_reason(&self) -> CancelReason {
        self.reason.get().copied().unwrap_or(CancelReason::Shutdown)
    }

    /// Signal cancellation. Idempotent; only the first reason is kept.
    pub(crate) fn request_cancel(&self, reason: CancelReason) {
        if self.state().is_terminal() {
            return;
        }
        let _ = self.reason.set(reason);
        self.token.cancel();
    }

    /// Cancel only if the unit has not started yet.
    ///
    /// Returns `true` if this call moved the unit to `Cancelled`.
    pub(crate) fn supersede(&self) -> bool {
        let superseded = self.state.send_if_modified(|state| {
            if *state == UnitState::Queued {
                *state = UnitState::Cancelled(CancelReason::Superseded);
                true
            } else {
                false
            }
        });
        if superseded {
            let _ = self.reason.set(CancelReason::Superseded);
            self.token.cancel();
        }
        superseded
    }

    /// `Queued -> Running`. Fails if anything cancelled the unit first.
    pub(crate) fn try_start(&self) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        self.state.send_if_modified(|state| {
            if *state == UnitState::Queued {
                *state = UnitState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Move to a terminal state unless one was already reached.
    ///
    /// Returns the terminal state the unit ends up in.
    pub(crate) fn finish(&self, terminal: UnitState) -> UnitState {
        self.state.send_if_modified(|state| {
            if state.is_terminal() {
                false
            } else {
                *state = terminal;
                true
            }
        });
        self.state()
    }
}

/// Observer for an accepted unit.
#[derive(Debug, Clone)]
pub struct UnitHandle {
    pub(crate) cell: Arc<UnitCell>,
}

impl UnitHandle {
    pub fn state(&self) -> UnitState {
        self.cell.state()
    }

    /// Wait until the unit reaches a terminal state.
    ///
    /// By then the unit's result has been handed to the sink. Superseded
    /// units are the exception: they turn terminal at accept time and
    /// report shortly after.
    pub async fn finished(&self) -> UnitState {
        let mut rx = self.cell.state.subscribe();
        match rx.wait_for(|state| state.is_terminal()).await {
            Ok(state) => *state,
            Err(_) => self.cell.state(),
        }
    }

    /// Cancel this unit explicitly.
    pub fn cancel(&self) {
        self.cell.request_cancel(CancelReason::Explicit);
    }
}

/// Outcome of the work closure, before it is turned into output.
#[derive(Debug)]
pub(crate) enum WorkOutcome {
    Finished(Result<Value, crate::error::RpcError>),
    Panicked(String),
    Cancelled(CancelReason),
}
