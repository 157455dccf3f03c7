use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use super::{Layer, Priority, TaskId};
use crate::error::DispatchError;

/// Free-form operation tag ("analyze", "transform", ...). Opaque to the
/// dispatcher; handed through to the layer handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskType(String);

impl TaskType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for TaskType {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskType {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A unit of work submitted to the dispatcher.
///
/// The layer and id never change after submission. `retries_remaining` only
/// ever goes down.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    id: TaskId,
    layer: Layer,
    task_type: TaskType,
    payload: serde_json::Value,
    priority: Priority,
    timeout: Duration,
    max_retries: u32,
    retries_remaining: u32,
    submitted_at: DateTime<Utc>,
}

impl Task {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TaskId,
        layer: Layer,
        task_type: TaskType,
        payload: serde_json::Value,
        priority: Priority,
        timeout: Duration,
        max_retries: u32,
        submitted_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            layer,
            task_type,
            payload,
            priority,
            timeout,
            max_retries,
            retries_remaining: max_retries,
            submitted_at,
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn task_type(&self) -> &TaskType {
        &self.task_type
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retries_remaining(&self) -> u32 {
        self.retries_remaining
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.submitted_at
    }

    /// 1-based number of the current (or most recent) dispatch attempt.
    pub fn attempt(&self) -> u32 {
        self.max_retries - self.retries_remaining + 1
    }

    /// Spend one retry. Returns `false` (and leaves the counter alone) when
    /// none are left.
    pub fn consume_retry(&mut self) -> bool {
        if self.retries_remaining == 0 {
            return false;
        }
        self.retries_remaining -= 1;
        true
    }
}

/// Per-submission options. Unset fields fall back to the dispatcher config.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TaskOptions {
    pub priority: Option<Priority>,
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
}

impl TaskOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout_ms(self, millis: u64) -> Self {
        self.timeout(Duration::from_millis(millis))
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }
}

/// Untyped submission, e.g. decoded from JSON.
///
/// Layer and priority arrive as strings and are validated by
/// [`TaskRequest::into_parts`]; bad values are rejected, never defaulted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub layer: String,
    #[serde(rename = "type")]
    pub task_type: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,
}

impl TaskRequest {
    pub fn into_parts(
        self,
    ) -> Result<(Layer, TaskType, serde_json::Value, TaskOptions), DispatchError> {
        let layer: Layer = self.layer.parse()?;
        let priority = self
            .priority
            .as_deref()
            .map(str::parse::<Priority>)
            .transpose()?;

        let options = TaskOptions {
            priority,
            timeout: self.timeout_ms.map(Duration::from_millis),
            max_retries: self.max_retries,
        };
        Ok((layer, TaskType::new(self.task_type), self.payload, options))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ulid::Ulid;

    fn task(max_retries: u32) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            Layer::Core,
            TaskType::new("analyze"),
            serde_json::json!({"n": 1}),
            Priority::High,
            Duration::from_secs(1),
            max_retries,
            Utc::now(),
        )
    }

    #[test]
    fn consume_retry_counts_down_to_zero() {
        let mut t = task(2);
        assert_eq!(t.attempt(), 1);

        assert!(t.consume_retry());
        assert_eq!(t.retries_remaining(), 1);
        assert_eq!(t.attempt(), 2);

        assert!(t.consume_retry());
        assert!(!t.consume_retry());
        assert_eq!(t.retries_remaining(), 0);
        assert_eq!(t.attempt(), 3);
    }

    #[test]
    fn request_with_valid_fields_converts() {
        let req: TaskRequest = serde_json::from_value(serde_json::json!({
            "layer": "neural",
            "type": "transform",
            "payload": {"k": "v"},
            "priority": "critical",
            "timeout_ms": 250,
        }))
        .unwrap();

        let (layer, task_type, payload, options) = req.into_parts().unwrap();
        assert_eq!(layer, Layer::Neural);
        assert_eq!(task_type.as_str(), "transform");
        assert_eq!(payload["k"], "v");
        assert_eq!(options.priority, Some(Priority::Critical));
        assert_eq!(options.timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.max_retries, None);
    }

    #[test]
    fn request_with_bad_priority_is_rejected() {
        let req = TaskRequest {
            layer: "core".into(),
            task_type: "analyze".into(),
            payload: serde_json::Value::Null,
            priority: Some("urgent".into()),
            timeout_ms: None,
            max_retries: None,
        };
        assert!(matches!(
            req.into_parts(),
            Err(DispatchError::InvalidPriority(p)) if p == "urgent"
        ));
    }

    #[test]
    fn request_with_bad_layer_is_rejected() {
        let req = TaskRequest {
            layer: "agi_core".into(),
            task_type: "analyze".into(),
            payload: serde_json::Value::Null,
            priority: None,
            timeout_ms: None,
            max_retries: None,
        };
        assert!(matches!(req.into_parts(), Err(DispatchError::InvalidLayer(_))));
    }
}
