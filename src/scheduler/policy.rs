//! Per-method concurrency policies.

use serde::{Deserialize, Serialize};

/// Concurrency discipline declared by a handler.
///
/// | Policy | Bound |
/// |---|---|
/// | `Parallel` | unbounded |
/// | `Serial` | one running unit per method, FIFO; newer units supersede queued ones |
/// | `Exclusive` | one running unit overall; never interleaves with other units |
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Policy {
    #[default]
    Parallel,
    Serial,
    Exclusive,
}

impl Policy {
    pub fn is_serial(self) -> bool {
        matches!(self, Policy::Serial)
    }
}
