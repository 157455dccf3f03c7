//! The global priority queue shared by every layer.
//!
//! Ordering: priority descending, then submission order ascending. Retried
//! tasks are placed at the head of their own priority band.
//!
//! Insertion and removal are `O(log n)` (binary heap). Depth per layer is kept
//! as a counter so status reads never scan the heap.

mod entry;

use std::collections::{BinaryHeap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::Notify;

use self::entry::{Lane, QueueEntry};
use crate::domain::{Layer, Task};
use crate::error::DispatchError;

#[derive(Debug, Default)]
struct QueueState {
    heap: BinaryHeap<QueueEntry>,
    next_fresh_seq: u64,
    next_retry_seq: u64,
    depth_by_layer: HashMap<Layer, usize>,
    closed: bool,
}

impl QueueState {
    fn insert(&mut self, task: Task, lane: Lane) {
        let seq = match lane {
            Lane::Fresh => {
                self.next_fresh_seq += 1;
                self.next_fresh_seq
            }
            Lane::Retry => {
                self.next_retry_seq += 1;
                self.next_retry_seq
            }
        };
        *self.depth_by_layer.entry(task.layer()).or_default() += 1;
        self.heap.push(QueueEntry {
            priority: task.priority(),
            lane,
            seq,
            task,
        });
    }

    fn pop(&mut self) -> Option<Task> {
        let entry = self.heap.pop()?;
        if let Some(depth) = self.depth_by_layer.get_mut(&entry.task.layer()) {
            *depth = depth.saturating_sub(1);
        }
        Some(entry.task)
    }
}

/// Multi-producer, multi-consumer priority queue of pending tasks.
///
/// Popping is exclusive: a task handed to one consumer is never seen by
/// another.
#[derive(Debug, Default)]
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Enqueue a newly submitted task.
    pub fn submit(&self, task: Task) -> Result<(), DispatchError> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(DispatchError::ShuttingDown);
            }
            state.insert(task, Lane::Fresh);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Re-enqueue a failed task ahead of fresh tasks of the same priority.
    ///
    /// Hands the task back if the queue has been closed.
    #[allow(clippy::result_large_err)]
    pub fn requeue_front(&self, task: Task) -> Result<(), Task> {
        {
            let mut state = self.lock();
            if state.closed {
                return Err(task);
            }
            state.insert(task, Lane::Retry);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Remove the next task to dispatch, if any.
    pub fn pop_next(&self) -> Option<Task> {
        self.lock().pop()
    }

    /// Wait until a task is available and take it.
    ///
    /// Cancel-safe: dropping the future never loses a task.
    pub async fn next(&self) -> Task {
        loop {
            let notified = self.notify.notified();
            if let Some(task) = self.pop_next() {
                return task;
            }
            notified.await;
        }
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Number of queued tasks belonging to `layer`.
    pub fn depth(&self, layer: Layer) -> usize {
        self.lock().depth_by_layer.get(&layer).copied().unwrap_or(0)
    }

    /// Refuse further inserts and hand back whatever is still queued, in
    /// dispatch order.
    pub fn close_and_drain(&self) -> Vec<Task> {
        let mut state = self.lock();
        state.closed = true;
        let mut drained = Vec::with_capacity(state.heap.len());
        while let Some(task) = state.pop() {
            drained.push(task);
        }
        drained
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Priority, TaskId, TaskType};
    use std::sync::Arc;
    use std::time::Duration;
    use ulid::Ulid;

    fn task(layer: Layer, priority: Priority) -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            layer,
            TaskType::new("process"),
            serde_json::Value::Null,
            priority,
            Duration::from_secs(1),
            2,
            chrono::Utc::now(),
        )
    }

    #[test]
    fn pops_by_priority_then_submission_order() {
        let queue = TaskQueue::new();
        let submitted: Vec<Task> = [
            Priority::Low,
            Priority::High,
            Priority::Critical,
            Priority::Medium,
            Priority::High,
        ]
        .into_iter()
        .map(|p| task(Layer::Core, p))
        .collect();
        for t in &submitted {
            queue.submit(t.clone()).unwrap();
        }

        let order: Vec<TaskId> = std::iter::from_fn(|| queue.pop_next())
            .map(|t| t.id())
            .collect();

        assert_eq!(
            order,
            vec![
                submitted[2].id(),
                submitted[1].id(),
                submitted[4].id(),
                submitted[3].id(),
                submitted[0].id(),
            ]
        );
    }

    #[test]
    fn empty_queue_pops_none() {
        let queue = TaskQueue::new();
        assert!(queue.pop_next().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn requeued_task_leads_its_band_but_not_higher_bands() {
        let queue = TaskQueue::new();
        let fresh_medium = task(Layer::Core, Priority::Medium);
        let critical = task(Layer::Core, Priority::Critical);
        let retried_medium = task(Layer::Core, Priority::Medium);
        let low = task(Layer::Core, Priority::Low);

        queue.submit(fresh_medium.clone()).unwrap();
        queue.submit(low.clone()).unwrap();
        queue.submit(critical.clone()).unwrap();
        queue.requeue_front(retried_medium.clone()).unwrap();

        let order: Vec<TaskId> = std::iter::from_fn(|| queue.pop_next())
            .map(|t| t.id())
            .collect();
        assert_eq!(
            order,
            vec![critical.id(), retried_medium.id(), fresh_medium.id(), low.id()]
        );
    }

    #[test]
    fn requeued_tasks_keep_fifo_among_themselves() {
        let queue = TaskQueue::new();
        let first = task(Layer::Neural, Priority::High);
        let second = task(Layer::Neural, Priority::High);

        queue.requeue_front(first.clone()).unwrap();
        queue.requeue_front(second.clone()).unwrap();

        assert_eq!(queue.pop_next().unwrap().id(), first.id());
        assert_eq!(queue.pop_next().unwrap().id(), second.id());
    }

    #[test]
    fn depth_tracks_each_layer() {
        let queue = TaskQueue::new();
        queue.submit(task(Layer::Core, Priority::Low)).unwrap();
        queue.submit(task(Layer::Core, Priority::High)).unwrap();
        queue.submit(task(Layer::Backup, Priority::Low)).unwrap();

        assert_eq!(queue.depth(Layer::Core), 2);
        assert_eq!(queue.depth(Layer::Backup), 1);
        assert_eq!(queue.depth(Layer::Storage), 0);

        let popped = queue.pop_next().unwrap();
        assert_eq!(popped.layer(), Layer::Core);
        assert_eq!(queue.depth(Layer::Core), 1);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn closed_queue_rejects_and_returns_requeues() {
        let queue = TaskQueue::new();
        let pending = task(Layer::Storage, Priority::Medium);
        queue.submit(pending.clone()).unwrap();

        let drained = queue.close_and_drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].id(), pending.id());
        assert!(queue.is_closed());

        assert!(matches!(
            queue.submit(task(Layer::Storage, Priority::Low)),
            Err(DispatchError::ShuttingDown)
        ));
        let retry = task(Layer::Storage, Priority::Low);
        let rejected = queue.requeue_front(retry.clone()).unwrap_err();
        assert_eq!(rejected.id(), retry.id());
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn next_waits_for_a_submission() {
        let queue = Arc::new(TaskQueue::new());
        let waiter = tokio::spawn({
            let queue = Arc::clone(&queue);
            async move { queue.next().await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        let t = task(Layer::Realtime, Priority::High);
        queue.submit(t.clone()).unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got.id(), t.id());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_and_consumers_lose_nothing() {
        let queue = Arc::new(TaskQueue::new());
        let producers: Vec<_> = (0..4)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    for i in 0..250 {
                        let p = Priority::ALL[i % Priority::ALL.len()];
                        queue.submit(task(Layer::Lightning, p)).unwrap();
                    }
                })
            })
            .collect();

        let consumers: Vec<_> = (0..3)
            .map(|_| {
                let queue = Arc::clone(&queue);
                tokio::spawn(async move {
                    let mut ids = Vec::new();
                    while let Ok(t) =
                        tokio::time::timeout(Duration::from_millis(200), queue.next()).await
                    {
                        ids.push(t.id());
                    }
                    ids
                })
            })
            .collect();

        for p in producers {
            p.await.unwrap();
        }
        let mut all = Vec::new();
        for c in consumers {
            all.extend(c.await.unwrap());
        }

        let unique: std::collections::HashSet<_> = all.iter().copied().collect();
        assert_eq!(all.len(), 1000);
        assert_eq!(unique.len(), 1000);
        assert!(queue.is_empty());
    }
}
