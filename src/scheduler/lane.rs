//! Serial lanes: one FIFO chain per method.
//!
//! Each Serial unit takes the completion receiver of its predecessor and
//! leaves its own in the lane. A unit releases its successor by dropping
//! its sender, which happens only after its result has been sent, so
//! results of one method leave the scheduler in start order.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::oneshot;

use super::unit::{UnitCell, UnitState};

/// Released when the owning unit finishes.
pub(crate) type LaneRelease = oneshot::Sender<()>;
/// Resolves when the predecessor finishes.
pub(crate) type LaneWait = oneshot::Receiver<()>;

#[derive(Debug, Default)]
struct Lane {
    tail: Option<LaneWait>,
    /// Units that were still queued at their last observation.
    queued: Vec<Arc<UnitCell>>,
}

/// Position of a newly accepted unit in its lane.
#[derive(Debug)]
pub(crate) struct LaneSlot {
    pub(crate) predecessor: Option<LaneWait>,
    pub(crate) release: LaneRelease,
    /// Number of queued units this accept superseded.
    pub(crate) superseded: usize,
}

#[derive(Debug, Default)]
pub(crate) struct SerialLanes {
    lanes: DashMap<String, Lane>,
}

impl SerialLanes {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Append `cell` to the lane of `method`.
    ///
    /// With `supersede` set, every unit of the lane that has not started yet
    /// is cancelled first. Started units are never touched.
    pub(crate) fn enqueue(&self, method: &str, cell: &Arc<UnitCell>, supersede: bool) -> LaneSlot {
        let (release, wait) = oneshot::channel();
        let mut lane = self.lanes.entry(method.to_string()).or_default();

        let mut superseded = 0;
        if supersede {
            for queued in lane.queued.drain(..) {
                if queued.supersede() {
                    superseded += 1;
                }
            }
        } else {
            lane.queued.retain(|queued| queued.state() == UnitState::Queued);
        }
        lane.queued.push(Arc::clone(cell));

        LaneSlot {
            predecessor: lane.tail.replace(wait),
            release,
            superseded,
        }
    }

    #[cfg(test)]
    pub(crate) fn queued_len(&self, method: &str) -> usize {
        self.lanes
            .get(method)
            .map(|lane| {
                lane.queued
                    .iter()
                    .filter(|cell| cell.state() == UnitState::Queued)
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::unit::CancelReason;
    use tokio_util::sync::CancellationToken;

    #[test]
    fn first_unit_has_no_predecessor() {
        let lanes = SerialLanes::new();
        let cell = UnitCell::new(CancellationToken::new());
        let slot = lanes.enqueue("next", &cell, true);
        assert!(slot.predecessor.is_none());
        assert_eq!(slot.superseded, 0);
    }

    #[test]
    fn newer_unit_supersedes_queued_but_not_started() {
        let lanes = SerialLanes::new();
        let started = UnitCell::new(CancellationToken::new());
        let queued = UnitCell::new(CancellationToken::new());
        let newest = UnitCell::new(CancellationToken::new());

        let _first = lanes.enqueue("next", &started, true);
        assert!(started.try_start());
        let _second = lanes.enqueue("next", &queued, true);
        let third = lanes.enqueue("next", &newest, true);

        assert_eq!(third.superseded, 1);
        assert_eq!(started.state(), UnitState::Running);
        assert_eq!(
            queued.state(),
            UnitState::Cancelled(CancelReason::Superseded)
        );
        assert_eq!(newest.state(), UnitState::Queued);
        assert_eq!(lanes.queued_len("next"), 1);
    }

    #[test]
    fn lanes_are_independent_per_method() {
        let lanes = SerialLanes::new();
        let a = UnitCell::new(CancellationToken::new());
        let b = UnitCell::new(CancellationToken::new());
        let _ = lanes.enqueue("next", &a, true);
        let slot = lanes.enqueue("stepIn", &b, true);
        assert!(slot.predecessor.is_none());
        assert_eq!(a.state(), UnitState::Queued);
    }

    #[test]
    fn without_supersede_units_queue_up() {
        let lanes = SerialLanes::new();
        let a = UnitCell::new(CancellationToken::new());
        let b = UnitCell::new(CancellationToken::new());
        let _ = lanes.enqueue("next", &a, false);
        let slot = lanes.enqueue("next", &b, false);
        assert_eq!(slot.superseded, 0);
        assert_eq!(a.state(), UnitState::Queued);
        assert_eq!(lanes.queued_len("next"), 2);
    }

    #[tokio::test]
    async fn predecessor_resolves_when_release_is_dropped() {
        let lanes = SerialLanes::new();
        let a = UnitCell::new(CancellationToken::new());
        let b = UnitCell::new(CancellationToken::new());
        let first = lanes.enqueue("next", &a, false);
        let second = lanes.enqueue("next", &b, false);

        drop(first.release);
        let predecessor = second.predecessor.expect("second unit waits on first");
        assert!(predecessor.await.is_err());
    }
}
