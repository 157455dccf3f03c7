//! Drop guards keeping pool counters honest when futures are cancelled.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, PoisonError};

use super::InFlight;

/// Increments a counter now and decrements it on drop.
pub(super) struct CounterGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> CounterGuard<'a> {
    pub(super) fn increment(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self { counter }
    }
}

impl Drop for CounterGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Lives inside a running attempt: counts it as active and unregisters its
/// abort handle when the attempt ends, however it ends.
pub(super) struct InFlightGuard {
    key: u64,
    in_flight: InFlight,
    active: Arc<AtomicUsize>,
}

impl InFlightGuard {
    pub(super) fn new(key: u64, in_flight: InFlight, active: Arc<AtomicUsize>) -> Self {
        active.fetch_add(1, Ordering::AcqRel);
        Self {
            key,
            in_flight,
            active,
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
        self.active.fetch_sub(1, Ordering::AcqRel);
    }
}
