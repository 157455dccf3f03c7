//! Ports: the seams between the dispatcher and its surroundings.
//!
//! Each trait hides something the dispatcher must not depend on directly:
//! wall-clock time, id generation, event consumers, and the task callbacks
//! themselves.

pub mod clock;
pub mod event_sink;
pub mod handler;
pub mod id_generator;

pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::event_sink::{EventSink, TracingEventSink};
pub use self::handler::{FnHandler, LayerHandler, TaskContext, handler_fn};
pub use self::id_generator::{IdGenerator, UlidGenerator};
