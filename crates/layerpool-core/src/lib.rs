//! layerpool-core
//!
//! A layered task-pool dispatcher: a fixed set of named layers, each with its
//! own bounded worker pool, fed by one global priority queue.
//!
//! # Modules
//! - **domain**: tasks, layers, priorities, ids, states, events
//! - **ports**: seams (Clock, IdGenerator, EventSink, LayerHandler)
//! - **queue**: the global priority queue
//! - **pool**: per-layer worker pools
//! - **metrics**: the metrics aggregator and its snapshots
//! - **app**: DispatcherBuilder, Dispatcher and the dispatch loops
//! - **config**: DispatcherConfig (TOML + env overrides)
//! - **error**: DispatchError, TaskError, HandlerError
//! - **observability**: tracing setup

pub mod app;
pub mod config;
pub mod domain;
pub mod error;
pub mod metrics;
pub mod observability;
pub mod pool;
pub mod ports;
pub mod queue;

pub use app::{BuildError, Dispatcher, DispatcherBuilder, LayerStatus, ShutdownReport};
pub use config::DispatcherConfig;
pub use domain::{
    DispatchEvent, Layer, Priority, Task, TaskId, TaskOptions, TaskRequest, TaskState, TaskType,
};
pub use error::{DispatchError, FailureKind, HandlerError, TaskError};
pub use metrics::MetricsSnapshot;
pub use ports::{EventSink, LayerHandler, TaskContext, handler_fn};
