//! EventSink port: typed observer for dispatcher events.

use std::time::Duration;

use crate::domain::{DispatchEvent, Task};
use crate::error::TaskError;

/// Receives dispatcher events.
///
/// Sinks are called from the event forwarder task, never from a dispatch loop,
/// so a slow sink delays other sinks but not dispatch. Implementations should
/// still return quickly and hand heavy work off elsewhere.
pub trait EventSink: Send + Sync {
    fn on_task_added(&self, _task: &Task) {}

    fn on_task_completed(
        &self,
        _task: &Task,
        _result: &serde_json::Value,
        _execution_time: Duration,
    ) {
    }

    fn on_task_failed(&self, _task: &Task, _error: &TaskError, _execution_time: Duration) {}

    /// Route one event to the matching callback.
    fn deliver(&self, event: &DispatchEvent) {
        match event {
            DispatchEvent::TaskAdded { task } => self.on_task_added(task),
            DispatchEvent::TaskCompleted {
                task,
                result,
                execution_time,
            } => self.on_task_completed(task, result, *execution_time),
            DispatchEvent::TaskFailed {
                task,
                error,
                execution_time,
            } => self.on_task_failed(task, error, *execution_time),
        }
    }
}

/// Sink that logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn on_task_added(&self, task: &Task) {
        tracing::debug!(task_id = %task.id(), layer = %task.layer(), "event: task added");
    }

    fn on_task_completed(
        &self,
        task: &Task,
        _result: &serde_json::Value,
        execution_time: Duration,
    ) {
        tracing::info!(
            task_id = %task.id(),
            layer = %task.layer(),
            elapsed_ms = execution_time.as_millis() as u64,
            "event: task completed"
        );
    }

    fn on_task_failed(&self, task: &Task, error: &TaskError, execution_time: Duration) {
        tracing::warn!(
            task_id = %task.id(),
            layer = %task.layer(),
            kind = ?error.kind(),
            elapsed_ms = execution_time.as_millis() as u64,
            %error,
            "event: task failed"
        );
    }
}
