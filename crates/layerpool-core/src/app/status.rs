//! Status views returned by the dispatcher.

use std::time::Duration;

use serde::Serialize;

/// Point-in-time view of one layer.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LayerStatus {
    pub worker_count: usize,
    /// Tasks of this layer waiting in the global queue.
    pub queue_depth: usize,
    /// Busy share of the layer's worker slots, in percent.
    pub utilization: f64,
    /// Tasks of this layer in the bounded completed history.
    pub completed_count: usize,
    /// Tasks of this layer currently running on a worker.
    pub active: usize,
}

/// Outcome of [`Dispatcher::shutdown`](super::Dispatcher::shutdown).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Queued tasks that never ran; each was reported failed.
    pub drained: usize,
    /// Whether every active task finished inside the grace period.
    pub graceful: bool,
    /// Active tasks still running when the grace period ran out; each was
    /// reported failed.
    pub forced: usize,
    #[serde(with = "millis")]
    pub elapsed: Duration,
}

mod millis {
    use serde::Serializer;
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }
}
