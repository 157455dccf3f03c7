//! Task lifecycle state.

use serde::{Deserialize, Serialize};

/// Where a task currently is.
///
/// State transitions:
/// - Queued -> Active -> Completed
/// - Queued -> Active -> Queued (failed, retries left)
/// - Queued -> Active -> Failed (failed, no retries left)
/// - Queued -> Failed (dispatcher shut down before dispatch)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    /// Waiting in the global queue.
    Queued,

    /// Owned by exactly one pool worker.
    Active,

    Completed,

    /// Terminal failure. Never resurrected.
    Failed,
}
