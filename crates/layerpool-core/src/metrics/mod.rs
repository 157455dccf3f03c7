//! Metrics aggregation.
//!
//! The aggregator is plain data: the dispatcher owns it behind the same lock
//! as the active-task map, so every update and every snapshot is consistent
//! with task bookkeeping.

mod ring;

pub use ring::RingBuffer;

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::domain::{Layer, Task, TaskId};

/// One entry of the completed-task history.
#[derive(Debug, Clone)]
pub struct CompletedRecord {
    pub task_id: TaskId,
    pub layer: Layer,
    pub execution_time: Duration,
    pub completed_at: Instant,
}

/// One entry of the failed-task history.
#[derive(Debug, Clone)]
pub struct FailedRecord {
    pub task_id: TaskId,
    pub layer: Layer,
    pub failed_at: Instant,
}

/// Read-only, point-in-time copy of the dispatcher metrics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub total_tasks: u64,
    pub completed_tasks: u64,
    pub failed_tasks: u64,
    /// Mean execution time of completed tasks, in milliseconds.
    pub average_execution_ms: f64,
    /// Busy share of each layer's worker slots, in percent.
    pub layer_utilization: BTreeMap<Layer, f64>,
    /// Completions within the trailing throughput window.
    pub current_throughput: u64,
    /// Highest `current_throughput` ever observed. Never decreases.
    pub peak_throughput: u64,
}

#[derive(Debug, Clone)]
pub struct MetricsAggregator {
    total: u64,
    completed: u64,
    failed: u64,
    average_execution_ms: f64,
    layer_utilization: BTreeMap<Layer, f64>,
    current_throughput: u64,
    peak_throughput: u64,
    window: Duration,
    completed_history: RingBuffer<CompletedRecord>,
    failed_history: RingBuffer<FailedRecord>,
}

impl MetricsAggregator {
    pub fn new(window: Duration, completed_capacity: usize, failed_capacity: usize) -> Self {
        Self {
            total: 0,
            completed: 0,
            failed: 0,
            average_execution_ms: 0.0,
            layer_utilization: Layer::ALL.into_iter().map(|l| (l, 0.0)).collect(),
            current_throughput: 0,
            peak_throughput: 0,
            window,
            completed_history: RingBuffer::new(completed_capacity),
            failed_history: RingBuffer::new(failed_capacity),
        }
    }

    pub fn record_submission(&mut self) {
        self.total += 1;
    }

    /// Count a completion and fold its execution time into the running mean.
    pub fn record_completion(&mut self, task: &Task, execution_time: Duration, now: Instant) {
        self.completed += 1;
        let sample = execution_time.as_secs_f64() * 1000.0;
        self.average_execution_ms += (sample - self.average_execution_ms) / self.completed as f64;

        self.completed_history.push(CompletedRecord {
            task_id: task.id(),
            layer: task.layer(),
            execution_time,
            completed_at: now,
        });

        self.refresh_throughput(now);
    }

    /// Recount completions inside the window ending at `now`.
    pub fn refresh_throughput(&mut self, now: Instant) {
        self.current_throughput = self
            .completed_history
            .iter()
            .rev()
            .take_while(|r| now.saturating_duration_since(r.completed_at) < self.window)
            .count() as u64;
        self.peak_throughput = self.peak_throughput.max(self.current_throughput);
    }

    /// Count a final failure. Execution-time statistics are left alone.
    pub fn record_failure(&mut self, task: &Task, now: Instant) {
        self.failed += 1;
        self.failed_history.push(FailedRecord {
            task_id: task.id(),
            layer: task.layer(),
            failed_at: now,
        });
    }

    pub fn set_utilization(&mut self, layer: Layer, percent: f64) {
        self.layer_utilization
            .insert(layer, percent.clamp(0.0, 100.0));
    }

    pub fn utilization(&self, layer: Layer) -> f64 {
        self.layer_utilization.get(&layer).copied().unwrap_or(0.0)
    }

    /// Completed tasks of `layer` still held in the history ring.
    pub fn completed_in_history(&self, layer: Layer) -> usize {
        self.completed_history
            .iter()
            .filter(|r| r.layer == layer)
            .count()
    }

    pub fn recently_completed(&self, id: TaskId) -> bool {
        self.completed_history.iter().any(|r| r.task_id == id)
    }

    pub fn recently_failed(&self, id: TaskId) -> bool {
        self.failed_history.iter().any(|r| r.task_id == id)
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_tasks: self.total,
            completed_tasks: self.completed,
            failed_tasks: self.failed,
            average_execution_ms: self.average_execution_ms,
            layer_utilization: self.layer_utilization.clone(),
            current_throughput: self.current_throughput,
            peak_throughput: self.peak_throughput,
        }
    }
}
