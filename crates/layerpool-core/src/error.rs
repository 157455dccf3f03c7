use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::Layer;

/// Errors returned synchronously by dispatcher operations.
///
/// Validation failures are never coerced into defaults.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid layer name: {0:?}")]
    InvalidLayer(String),

    #[error("invalid priority: {0:?}")]
    InvalidPriority(String),

    #[error("invalid worker count {requested} for layer {layer}: expected 1..={max}")]
    InvalidWorkerCount {
        layer: Layer,
        requested: usize,
        max: usize,
    },

    #[error("no handler registered for layer {0}")]
    MissingHandler(Layer),

    #[error("dispatcher is shutting down")]
    ShuttingDown,

    #[error("dispatcher already shut down")]
    AlreadyShutDown,

    /// The worker infrastructure (tokio runtime) is unavailable.
    #[error("worker infrastructure unavailable: {0}")]
    Runtime(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("config I/O error: {0}")]
    ConfigIo(#[from] std::io::Error),
}

/// Error returned by a layer handler.
#[derive(Debug, Clone, Error, PartialEq, Eq, Serialize, Deserialize)]
#[error("{message}")]
pub struct HandlerError {
    message: String,
}

impl HandlerError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl From<String> for HandlerError {
    fn from(message: String) -> Self {
        Self { message }
    }
}

impl From<&str> for HandlerError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Coarse classification of a [`TaskError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The handler returned an error or panicked.
    Execution,
    /// The task deadline elapsed first.
    Timeout,
    /// The pool or the dispatcher went away underneath the task.
    Aborted,
}

/// Why one attempt of a task failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TaskError {
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    #[error("timed out after {}ms", .timeout.as_millis())]
    Timeout { timeout: Duration },

    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("pool for layer {0} is closed")]
    PoolClosed(Layer),

    #[error("dispatcher shut down before the task finished")]
    Shutdown,
}

impl TaskError {
    pub fn kind(&self) -> FailureKind {
        match self {
            TaskError::Handler(_) | TaskError::Panicked(_) => FailureKind::Execution,
            TaskError::Timeout { .. } => FailureKind::Timeout,
            TaskError::PoolClosed(_) | TaskError::Shutdown => FailureKind::Aborted,
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.kind() == FailureKind::Timeout
    }

    /// Execution errors and timeouts are retried; aborts are final.
    pub fn is_retryable(&self) -> bool {
        self.kind() != FailureKind::Aborted
    }
}
