//! Dispatch scheduler.
//!
//! Accepts [`SchedulingUnit`]s, applies their concurrency [`Policy`] and runs
//! them on tokio tasks. Results go straight to the [`OutputSink`].
//!
//! ## Module Structure
//!
//! - `policy` - per-method concurrency disciplines
//! - `unit` - unit state machine and observer handles
//! - `lane` - FIFO chains for Serial methods
//!
//! ## Cancellation
//!
//! A unit can be cancelled by an explicit cancel for its call id, by a
//! newer Serial unit of the same method (only while still queued), by the
//! request timeout, or by shutdown. The first source wins. Cancelled
//! requests report `RequestCancelled`, superseded ones `ContentModified`;
//! notifications report nothing.
//!
//! ## Fault isolation
//!
//! The work closure runs in its own task. A panic is caught at the join
//! point and turned into an `InternalError` response; sibling units and the
//! scheduler itself keep running.

mod lane;
mod policy;
mod unit;

pub use policy::Policy;
pub use unit::{CancelReason, SchedulingUnit, UnitHandle, UnitState, WorkClosure};

use std::sync::{Arc, Mutex};
use std::time::Duration;

use dashmap::DashMap;
use serde_json::json;
use tokio::sync::{
    OwnedRwLockReadGuard, OwnedRwLockWriteGuard, OwnedSemaphorePermit, RwLock, Semaphore,
};
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;

use crate::error::{LockResultExt, RpcError};
use crate::protocol::{Outgoing, RequestId};
use crate::sink::OutputSink;
use lane::{LaneWait, SerialLanes};
use unit::{UnitCell, WorkOutcome};

/// Tunables of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerOptions {
    /// Process-wide bound on Running units. `None` means unbounded.
    pub concurrency: Option<usize>,
    /// Whether a newer Serial unit cancels queued ones of the same method.
    pub supersede_serial: bool,
    /// Per-request ceiling on running time.
    pub request_timeout: Option<Duration>,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            concurrency: None,
            supersede_serial: true,
            request_timeout: None,
        }
    }
}

struct Inner {
    sink: Arc<dyn OutputSink>,
    options: SchedulerOptions,
    lanes: SerialLanes,
    /// Exclusive units take the write half, every other unit the read half.
    exclusive: Arc<RwLock<()>>,
    ceiling: Option<Arc<Semaphore>>,
    /// Request units by call id, for explicit cancellation.
    in_flight: DashMap<RequestId, Arc<UnitCell>>,
    shutdown: CancellationToken,
    tasks: Mutex<JoinSet<()>>,
}

/// Policy-aware executor of inbound work.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("options", &self.inner.options)
            .field("in_flight", &self.inner.in_flight.len())
            .finish_non_exhaustive()
    }
}

impl Scheduler {
    pub fn new(sink: Arc<dyn OutputSink>, options: SchedulerOptions) -> Self {
        let ceiling = options
            .concurrency
            .map(|permits| Arc::new(Semaphore::new(permits.max(1))));
        Self {
            inner: Arc::new(Inner {
                sink,
                options,
                lanes: SerialLanes::new(),
                exclusive: Arc::new(RwLock::new(())),
                ceiling,
                in_flight: DashMap::new(),
                shutdown: CancellationToken::new(),
                tasks: Mutex::new(JoinSet::new()),
            }),
        }
    }

    pub fn options(&self) -> SchedulerOptions {
        self.inner.options
    }

    /// Accept a unit and start driving it.
    ///
    /// Never blocks. Must be called from within a tokio runtime.
    pub fn accept(&self, unit: SchedulingUnit) -> UnitHandle {
        let inner = &self.inner;
        let cell = UnitCell::new(inner.shutdown.child_token());
        let handle = UnitHandle {
            cell: Arc::clone(&cell),
        };

        if let Some(id) = unit.id
            && let Some(previous) = inner.in_flight.insert(id, Arc::clone(&cell))
        {
            log::warn!(
                target: "dapwire::scheduler",
                "Request id {} reused while still in flight ({:?})",
                id,
                previous.state()
            );
        }

        let lane = if unit.policy.is_serial() {
            let slot = inner
                .lanes
                .enqueue(&unit.method, &cell, inner.options.supersede_serial);
            if slot.superseded > 0 {
                log::debug!(
                    target: "dapwire::scheduler",
                    "{} superseded {} queued unit(s)",
                    unit.method,
                    slot.superseded
                );
            }
            Some(slot)
        } else {
            None
        };

        let (predecessor, release) = match lane {
            Some(slot) => (slot.predecessor, Some(slot.release)),
            None => (None, None),
        };

        let mut tasks = inner.tasks.lock().recover_poison("Scheduler::accept");
        reap_finished(&mut tasks);
        tasks.spawn(drive_unit(
            Arc::clone(inner),
            cell,
            unit,
            predecessor,
            release,
        ));

        handle
    }

    /// Cancel the in-flight request `id`.
    ///
    /// Returns `false` if no such request is known.
    pub fn cancel(&self, id: RequestId) -> bool {
        let Some(cell) = self
            .inner
            .in_flight
            .get(&id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            log::debug!(target: "dapwire::scheduler", "Cancel for unknown request {}", id);
            return false;
        };
        cell.request_cancel(CancelReason::Explicit);
        true
    }

    /// Number of request units that have not reached a terminal state.
    /// Run a follow-up task that shutdown waits for like a unit.
    pub(crate) fn spawn_tracked<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.inner.tasks.lock().recover_poison("Scheduler::spawn_tracked");
        reap_finished(&mut tasks);
        tasks.spawn(task);
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.len()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Cancel every outstanding unit, wait up to `grace` for them to
    /// finish, then abort the rest.
    ///
    /// Units accepted afterwards are cancelled immediately.
    pub async fn shutdown(&self, grace: Duration) {
        self.inner.shutdown.cancel();

        let mut tasks = std::mem::take(
            &mut *self
                .inner
                .tasks
                .lock()
                .recover_poison("Scheduler::shutdown"),
        );
        if tasks.is_empty() {
            return;
        }
        log::debug!(
            target: "dapwire::scheduler",
            "Waiting for {} unit task(s) to wind down",
            tasks.len()
        );

        let graceful = tokio::time::timeout(grace, drain_join_set(&mut tasks, "Unit task")).await;
        if graceful.is_err() {
            log::warn!(
                target: "dapwire::scheduler",
                "Shutdown grace period ({:?}) expired, aborting {} unit task(s)",
                grace,
                tasks.len()
            );
            tasks.abort_all();
            drain_join_set(&mut tasks, "Aborted unit task").await;
        }
    }
}

fn reap_finished(tasks: &mut JoinSet<()>) {
    while let Some(result) = tasks.try_join_next() {
        if let Err(e) = result
            && e.is_panic()
        {
            log::error!(target: "dapwire::scheduler", "Unit task panicked: {}", e);
        }
    }
}

async fn drain_join_set(tasks: &mut JoinSet<()>, task_context: &str) {
    while let Some(result) = tasks.join_next().await {
        if let Err(e) = result
            && e.is_panic()
        {
            log::error!(target: "dapwire::scheduler", "{} panicked: {}", task_context, e);
        }
    }
}

/// Aborts the wrapped task when dropped.
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Settles the unit if its driver task is dropped or aborted mid-flight.
struct Settle {
    inner: Arc<Inner>,
    cell: Arc<UnitCell>,
    id: Option<RequestId>,
}

impl Drop for Settle {
    fn drop(&mut self) {
        self.cell
            .finish(UnitState::Cancelled(self.cell.cancel_reason()));
        if let Some(id) = self.id {
            self.inner
                .in_flight
                .remove_if(&id, |_, cell| Arc::ptr_eq(cell, &self.cell));
        }
    }
}

/// Held while a unit runs; dropping it lets the next policy holder in.
#[must_use]
struct PolicyGuard {
    _shared: Option<OwnedRwLockReadGuard<()>>,
    _exclusive: Option<OwnedRwLockWriteGuard<()>>,
}

impl PolicyGuard {
    fn shared(guard: OwnedRwLockReadGuard<()>) -> Self {
        Self {
            _shared: Some(guard),
            _exclusive: None,
        }
    }

    fn exclusive(guard: OwnedRwLockWriteGuard<()>) -> Self {
        Self {
            _shared: None,
            _exclusive: Some(guard),
        }
    }
}

async fn drive_unit(
    inner: Arc<Inner>,
    cell: Arc<UnitCell>,
    unit: SchedulingUnit,
    predecessor: Option<LaneWait>,
    release: Option<lane::LaneRelease>,
) {
    let SchedulingUnit {
        method,
        policy,
        id,
        work,
    } = unit;
    let _settle = Settle {
        inner: Arc::clone(&inner),
        cell: Arc::clone(&cell),
        id,
    };
    let token = cell.token().clone();

    // Lane order holds even for cancelled units: the successor must not
    // start before the predecessor has finished.
    let outcome = match admit(&inner, &token, policy, predecessor).await {
        Admission::Cancelled(wait) => {
            let reason = cell.cancel_reason();
            report(&inner, id, &method, WorkOutcome::Cancelled(reason));
            cell.finish(UnitState::Cancelled(reason));
            if let Some(wait) = wait {
                let _ = wait.await;
            }
            drop(release);
            return;
        }
        Admission::Admitted(_guard, _permit) => {
            if !cell.try_start() {
                WorkOutcome::Cancelled(cell.cancel_reason())
            } else {
                log::trace!(target: "dapwire::scheduler", "Running {} ({:?})", method, id);
                run_work(&inner, &cell, &token, id.is_some(), work).await
            }
        }
    };

    let terminal = match &outcome {
        WorkOutcome::Finished(_) => UnitState::Completed,
        WorkOutcome::Panicked(_) => UnitState::Faulted,
        WorkOutcome::Cancelled(reason) => UnitState::Cancelled(*reason),
    };
    report(&inner, id, &method, outcome);
    cell.finish(terminal);
    drop(release);
}

enum Admission {
    Admitted(PolicyGuard, Option<OwnedSemaphorePermit>),
    /// Carries the lane predecessor if it still has to be awaited.
    Cancelled(Option<LaneWait>),
}

/// Wait for the unit's turn: lane predecessor, policy lock, then a slot
/// under the ceiling.
async fn admit(
    inner: &Inner,
    token: &CancellationToken,
    policy: Policy,
    predecessor: Option<LaneWait>,
) -> Admission {
    if let Some(mut wait) = predecessor {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Admission::Cancelled(Some(wait)),
            _ = &mut wait => {}
        }
    }

    let guard = match policy {
        Policy::Exclusive => tokio::select! {
            biased;
            _ = token.cancelled() => return Admission::Cancelled(None),
            guard = Arc::clone(&inner.exclusive).write_owned() => PolicyGuard::exclusive(guard),
        },
        Policy::Parallel | Policy::Serial => tokio::select! {
            biased;
            _ = token.cancelled() => return Admission::Cancelled(None),
            guard = Arc::clone(&inner.exclusive).read_owned() => PolicyGuard::shared(guard),
        },
    };

    let permit = match &inner.ceiling {
        Some(ceiling) => tokio::select! {
            biased;
            _ = token.cancelled() => return Admission::Cancelled(None),
            permit = Arc::clone(ceiling).acquire_owned() => match permit {
                Ok(permit) => Some(permit),
                Err(_) => return Admission::Cancelled(None),
            },
        },
        None => None,
    };

    Admission::Admitted(guard, permit)
}

async fn run_work(
    inner: &Inner,
    cell: &UnitCell,
    token: &CancellationToken,
    is_request: bool,
    work: WorkClosure,
) -> WorkOutcome {
    let work_token = token.clone();
    let mut task = AbortOnDrop(tokio::spawn(async move { work(work_token).await }));

    // Only requests have a caller waiting on them.
    let deadline = inner.options.request_timeout.filter(|_| is_request);
    let expired = async move {
        match deadline {
            Some(deadline) => tokio::time::sleep(deadline).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        biased;
        joined = &mut task.0 => match joined {
            Ok(result) => WorkOutcome::Finished(result),
            Err(e) if e.is_panic() => WorkOutcome::Panicked(panic_message(e.into_panic())),
            Err(_) => WorkOutcome::Cancelled(cell.cancel_reason()),
        },
        _ = token.cancelled() => WorkOutcome::Cancelled(cell.cancel_reason()),
        _ = expired => {
            cell.request_cancel(CancelReason::Timeout);
            WorkOutcome::Cancelled(cell.cancel_reason())
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

fn cancellation_error(reason: CancelReason) -> RpcError {
    match reason {
        CancelReason::Superseded => RpcError::content_modified(),
        CancelReason::Timeout => RpcError::cancelled().with_data(json!({"reason": "timeout"})),
        CancelReason::Explicit | CancelReason::Shutdown => RpcError::cancelled(),
    }
}

/// Turn a unit outcome into output. Notifications only log.
fn report(inner: &Inner, id: Option<RequestId>, method: &str, outcome: WorkOutcome) {
    let Some(id) = id else {
        match outcome {
            WorkOutcome::Finished(Ok(_)) => {}
            WorkOutcome::Finished(Err(e)) => {
                log::warn!(target: "dapwire::scheduler", "Notification {} failed: {}", method, e);
            }
            WorkOutcome::Panicked(message) => {
                log::error!(
                    target: "dapwire::scheduler",
                    "Notification handler {} panicked: {}",
                    method,
                    message
                );
            }
            WorkOutcome::Cancelled(reason) => {
                log::debug!(
                    target: "dapwire::scheduler",
                    "Notification {} cancelled ({:?})",
                    method,
                    reason
                );
            }
        }
        return;
    };

    let result = match outcome {
        WorkOutcome::Finished(result) => result,
        WorkOutcome::Panicked(message) => {
            log::error!(
                target: "dapwire::scheduler",
                "Handler {} panicked on request {}: {}",
                method,
                id,
                message
            );
            Err(RpcError::internal(format!("Handler panicked: {}", message)))
        }
        WorkOutcome::Cancelled(reason) => {
            log::debug!(
                target: "dapwire::scheduler",
                "Request {} ({}) cancelled ({:?})",
                id,
                method,
                reason
            );
            Err(cancellation_error(reason))
        }
    };

    let message = match result {
        Ok(body) => Outgoing::Response {
            request_seq: id,
            command: method.to_string(),
            body,
        },
        Err(error) => Outgoing::Error {
            request_seq: Some(id),
            command: Some(method.to_string()),
            error: error.to_body(),
        },
    };
    inner.sink.send(message);
}
