//! Dispatcher events.

use std::time::Duration;

use super::Task;
use crate::error::TaskError;

/// An event emitted by the dispatcher.
///
/// Events are delivered fire-and-forget: the dispatcher never waits for a
/// subscriber to process one.
#[derive(Debug, Clone)]
pub enum DispatchEvent {
    /// Accepted into the queue.
    TaskAdded { task: Task },

    TaskCompleted {
        task: Task,
        result: serde_json::Value,
        execution_time: Duration,
    },

    /// Final failure: retries exhausted, or aborted by shutdown.
    TaskFailed {
        task: Task,
        error: TaskError,
        execution_time: Duration,
    },
}

impl DispatchEvent {
    pub fn task(&self) -> &Task {
        match self {
            DispatchEvent::TaskAdded { task }
            | DispatchEvent::TaskCompleted { task, .. }
            | DispatchEvent::TaskFailed { task, .. } => task,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DispatchEvent::TaskAdded { .. } => "task_added",
            DispatchEvent::TaskCompleted { .. } => "task_completed",
            DispatchEvent::TaskFailed { .. } => "task_failed",
        }
    }
}
