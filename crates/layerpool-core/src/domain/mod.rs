//! Domain model: identifiers, layers, priorities, tasks, states and events.

pub mod events;
pub mod ids;
pub mod layer;
pub mod priority;
pub mod state;
pub mod task;

pub use events::DispatchEvent;
pub use ids::TaskId;
pub use layer::Layer;
pub use priority::Priority;
pub use state::TaskState;
pub use task::{Task, TaskOptions, TaskRequest, TaskType};
