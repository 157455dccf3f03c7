//! LayerHandler port: the callback a layer pool runs for each task.
//!
//! The dispatcher never looks inside the payload or the result; both are
//! handed through untouched.

use std::future::Future;
use std::marker::PhantomData;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::domain::{Layer, Task, TaskId, TaskType};
use crate::error::HandlerError;

/// Everything a handler gets to see about one attempt of a task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    pub id: TaskId,
    pub layer: Layer,
    pub task_type: TaskType,
    pub payload: serde_json::Value,
    /// 1-based attempt number; stays the same id across attempts.
    pub attempt: u32,
    /// Fired when the attempt times out or the pool is destroyed.
    ///
    /// Cancellation is cooperative. A handler that never checks this token
    /// keeps running (and keeps its worker slot) after the dispatcher has
    /// already reported the timeout.
    pub cancellation: CancellationToken,
}

impl TaskContext {
    pub(crate) fn for_attempt(task: &Task, cancellation: CancellationToken) -> Self {
        Self {
            id: task.id(),
            layer: task.layer(),
            task_type: task.task_type().clone(),
            payload: task.payload().clone(),
            attempt: task.attempt(),
            cancellation,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }
}

/// Executes tasks for one layer.
#[async_trait]
pub trait LayerHandler: Send + Sync {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, HandlerError>;
}

/// Adapter turning an async closure into a [`LayerHandler`].
pub struct FnHandler<F, Fut> {
    f: F,
    _marker: PhantomData<fn() -> Fut>,
}

/// Wrap an async closure as a handler.
///
/// ```ignore
/// let handler = handler_fn(|ctx: TaskContext| async move {
///     Ok(serde_json::json!({ "echo": ctx.payload }))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F, Fut>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    FnHandler {
        f,
        _marker: PhantomData,
    }
}

#[async_trait]
impl<F, Fut> LayerHandler for FnHandler<F, Fut>
where
    F: Fn(TaskContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<serde_json::Value, HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, HandlerError> {
        (self.f)(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Priority;
    use std::time::Duration;
    use ulid::Ulid;

    #[tokio::test]
    async fn handler_fn_passes_context_through() {
        let handler = handler_fn(|ctx: TaskContext| async move {
            Ok::<_, HandlerError>(serde_json::json!({
                "type": ctx.task_type.as_str(),
                "attempt": ctx.attempt,
                "payload": ctx.payload,
            }))
        });

        let task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            Layer::Analytics,
            TaskType::new("validate"),
            serde_json::json!([1, 2, 3]),
            Priority::Medium,
            Duration::from_secs(1),
            1,
            chrono::Utc::now(),
        );
        let ctx = TaskContext::for_attempt(&task, CancellationToken::new());

        let out = handler.handle(ctx).await.unwrap();
        assert_eq!(out["type"], "validate");
        assert_eq!(out["attempt"], 1);
        assert_eq!(out["payload"], serde_json::json!([1, 2, 3]));
    }

    #[tokio::test]
    async fn handler_errors_propagate() {
        let handler = handler_fn(|_ctx: TaskContext| async {
            Err::<serde_json::Value, _>(HandlerError::new("nope"))
        });
        let task = Task::new(
            TaskId::from_ulid(Ulid::new()),
            Layer::Security,
            TaskType::new("secure"),
            serde_json::Value::Null,
            Priority::Low,
            Duration::from_secs(1),
            0,
            chrono::Utc::now(),
        );

        let err = handler
            .handle(TaskContext::for_attempt(&task, CancellationToken::new()))
            .await
            .unwrap_err();
        assert_eq!(err.message(), "nope");
    }
}
