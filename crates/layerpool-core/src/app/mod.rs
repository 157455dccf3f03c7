//! App - the dispatcher itself.
//!
//! # Components
//! - **DispatcherBuilder**: wiring and start-up validation
//! - **Dispatcher**: the context object callers hold (submit, metrics, status, scale, shutdown)
//! - **dispatch_loop**: queue → pool loops with retry and timeout handling
//! - **events**: fire-and-forget event fan-out to sinks and subscribers
//! - **status**: read-only status views

pub mod builder;
mod dispatch_loop;
pub mod dispatcher;
mod events;
pub mod status;

pub use self::builder::{BuildError, DispatcherBuilder};
pub use self::dispatcher::{Dispatcher, REALTIME_TIMEOUT};
pub use self::status::{LayerStatus, ShutdownReport};
