//! IdGenerator port.
//!
//! # Implementations
//! - **UlidGenerator**: ULID with clock timestamp + 80 random bits

use crate::domain::TaskId;
use crate::ports::Clock;
use ulid::Ulid;

/// Generates task ids. Must be safe to call from many submitters at once.
pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

/// ULID-based generator.
///
/// The timestamp part comes from the injected [`Clock`], so a `FixedClock`
/// yields ids that share a timestamp but still differ in their random part.
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        let ulid = Ulid::from_parts(timestamp_ms, rand::random());
        TaskId::from(ulid)
    }
}
