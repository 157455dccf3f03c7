//! The dispatcher context object.
//!
//! [`Dispatcher`] is a cheap, cloneable handle. Everything it needs lives in
//! one shared context built once by [`DispatcherBuilder`](super::DispatcherBuilder):
//! the global queue, one pool per layer, the handler table, task bookkeeping
//! with metrics, and the event bus.
//!
//! Task bookkeeping and metrics share one lock. Every state transition
//! (queued, active, completed, failed) updates both in the same critical
//! section, so a metrics snapshot never disagrees with the task states.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::{Notify, broadcast};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::events::EventBus;
use super::status::{LayerStatus, ShutdownReport};
use crate::config::DispatcherConfig;
use crate::domain::{
    DispatchEvent, Layer, Priority, Task, TaskId, TaskOptions, TaskRequest, TaskState, TaskType,
};
use crate::error::{DispatchError, TaskError};
use crate::metrics::{MetricsAggregator, MetricsSnapshot};
use crate::pool::LayerPool;
use crate::queue::TaskQueue;
use crate::ports::{Clock, IdGenerator, LayerHandler};

/// Timeout applied by [`Dispatcher::process_realtime_task`].
pub const REALTIME_TIMEOUT: Duration = Duration::from_secs(5);

struct ActiveEntry {
    task: Task,
    started: Instant,
}

struct DispatchState {
    queued: HashSet<TaskId>,
    active: HashMap<TaskId, ActiveEntry>,
    metrics: MetricsAggregator,
}

#[derive(Default)]
struct Background {
    loops: Vec<JoinHandle<()>>,
    forwarder: Option<JoinHandle<()>>,
}

pub(crate) struct Shared {
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdGenerator>,
    pub(crate) queue: TaskQueue,
    pools: HashMap<Layer, Arc<LayerPool>>,
    handlers: HashMap<Layer, Arc<dyn LayerHandler>>,
    state: Mutex<DispatchState>,
    /// Pinged whenever the active set becomes empty.
    idle: Notify,
    events: EventBus,
    /// Stops the dispatch loops from taking new tasks.
    pub(crate) stop: CancellationToken,
    shutting_down: AtomicBool,
    background: Mutex<Background>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, DispatchState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    pub(crate) fn pool(&self, layer: Layer) -> Option<Arc<LayerPool>> {
        self.pools.get(&layer).cloned()
    }

    pub(crate) fn handler(&self, layer: Layer) -> Option<Arc<dyn LayerHandler>> {
        self.handlers.get(&layer).cloned()
    }

    /// Move a freshly popped task from queued to active.
    pub(crate) fn begin(&self, task: &Task) -> Instant {
        let started = Instant::now();
        let mut state = self.lock();
        state.queued.remove(&task.id());
        state.active.insert(
            task.id(),
            ActiveEntry {
                task: task.clone(),
                started,
            },
        );
        started
    }

    pub(crate) fn complete(&self, task: Task, result: serde_json::Value, execution_time: Duration) {
        let layer = task.layer();
        let mut state = self.lock();
        state.active.remove(&task.id());
        state
            .metrics
            .record_completion(&task, execution_time, Instant::now());
        if let Some(pool) = self.pools.get(&layer) {
            state.metrics.set_utilization(layer, pool.utilization());
        }
        debug!(
            task_id = %task.id(),
            layer = %layer,
            attempt = task.attempt(),
            elapsed_ms = execution_time.as_millis() as u64,
            "task completed"
        );
        self.events.emit(DispatchEvent::TaskCompleted {
            task,
            result,
            execution_time,
        });
        self.notify_if_idle(&state);
    }

    /// Retry `task` if it has retries left and the dispatcher is still
    /// running, otherwise record it as finally failed.
    pub(crate) fn fail(&self, mut task: Task, error: TaskError, execution_time: Duration) {
        let mut state = self.lock();
        state.active.remove(&task.id());

        if error.is_retryable() && !self.is_shutting_down() && task.consume_retry() {
            let id = task.id();
            warn!(
                task_id = %id,
                layer = %task.layer(),
                attempt = task.attempt() - 1,
                retries_remaining = task.retries_remaining(),
                %error,
                "attempt failed, requeueing"
            );
            match self.queue.requeue_front(task) {
                Ok(()) => {
                    state.queued.insert(id);
                    self.notify_if_idle(&state);
                    return;
                }
                Err(returned) => task = returned,
            }
        }

        self.finalize_failure(&mut state, task, error, execution_time);
        self.notify_if_idle(&state);
    }

    fn finalize_failure(
        &self,
        state: &mut DispatchState,
        task: Task,
        error: TaskError,
        execution_time: Duration,
    ) {
        state.metrics.record_failure(&task, Instant::now());
        if let Some(pool) = self.pools.get(&task.layer()) {
            state.metrics.set_utilization(task.layer(), pool.utilization());
        }
        warn!(
            task_id = %task.id(),
            layer = %task.layer(),
            attempt = task.attempt(),
            kind = ?error.kind(),
            elapsed_ms = execution_time.as_millis() as u64,
            %error,
            "task failed"
        );
        self.events.emit(DispatchEvent::TaskFailed {
            task,
            error,
            execution_time,
        });
    }

    fn notify_if_idle(&self, state: &DispatchState) {
        if state.active.is_empty() {
            self.idle.notify_waiters();
        }
    }

    async fn wait_for(&self, done: impl Fn(&DispatchState) -> bool) {
        loop {
            let notified = self.idle.notified();
            let finished = done(&self.lock());
            if finished {
                return;
            }
            notified.await;
        }
    }
}

/// Handle to a running dispatcher. Clones share the same dispatcher.
#[derive(Clone)]
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn start(
        config: DispatcherConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdGenerator>,
        pools: HashMap<Layer, Arc<LayerPool>>,
        handlers: HashMap<Layer, Arc<dyn LayerHandler>>,
        events: EventBus,
        forwarder: JoinHandle<()>,
    ) -> Self {
        let metrics = MetricsAggregator::new(
            config.throughput_window(),
            config.completed_history,
            config.failed_history,
        );
        let loops = config.dispatch_loops;
        let shared = Arc::new(Shared {
            config,
            clock,
            ids,
            queue: TaskQueue::new(),
            pools,
            handlers,
            state: Mutex::new(DispatchState {
                queued: HashSet::new(),
                active: HashMap::new(),
                metrics,
            }),
            idle: Notify::new(),
            events,
            stop: CancellationToken::new(),
            shutting_down: AtomicBool::new(false),
            background: Mutex::new(Background::default()),
        });

        let handles = super::dispatch_loop::spawn(&shared, loops);
        {
            let mut background = shared
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            background.loops = handles;
            background.forwarder = Some(forwarder);
        }
        info!(dispatch_loops = loops, cpu_count = shared.config.cpu_count, "dispatcher started");
        Self { shared }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.shared.config
    }

    /// Enqueue a task and return its id right away.
    ///
    /// Unset options fall back to the configured defaults.
    pub fn submit(
        &self,
        layer: Layer,
        task_type: impl Into<TaskType>,
        payload: serde_json::Value,
        options: TaskOptions,
    ) -> Result<TaskId, DispatchError> {
        let shared = &self.shared;
        if shared.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }
        if !shared.handlers.contains_key(&layer) {
            return Err(DispatchError::MissingHandler(layer));
        }

        let resolved = shared.config.resolve(options);
        let task = Task::new(
            shared.ids.generate_task_id(),
            layer,
            task_type.into(),
            payload,
            resolved.priority,
            resolved.timeout,
            resolved.max_retries,
            shared.clock.now(),
        );
        let id = task.id();

        {
            let mut state = shared.lock();
            shared.queue.submit(task.clone())?;
            state.queued.insert(id);
            state.metrics.record_submission();
            debug!(
                task_id = %id,
                layer = %layer,
                priority = %task.priority(),
                "task submitted"
            );
            shared.events.emit(DispatchEvent::TaskAdded { task });
        }
        Ok(id)
    }

    /// Validate and submit an untyped request.
    pub fn submit_request(&self, request: TaskRequest) -> Result<TaskId, DispatchError> {
        let (layer, task_type, payload, options) = request.into_parts()?;
        self.submit(layer, task_type, payload, options)
    }

    /// `analyze` task on the core layer.
    pub fn process_core_task(
        &self,
        payload: serde_json::Value,
        priority: Option<Priority>,
    ) -> Result<TaskId, DispatchError> {
        let options = TaskOptions {
            priority,
            ..TaskOptions::default()
        };
        self.submit(Layer::Core, "analyze", payload, options)
    }

    /// `process` task on the realtime layer: high priority unless told
    /// otherwise, with a short timeout.
    pub fn process_realtime_task(
        &self,
        payload: serde_json::Value,
        priority: Option<Priority>,
    ) -> Result<TaskId, DispatchError> {
        let options = TaskOptions::new()
            .priority(priority.unwrap_or(Priority::High))
            .timeout(REALTIME_TIMEOUT);
        self.submit(Layer::Realtime, "process", payload, options)
    }

    /// `analyze` task on the neural layer.
    pub fn process_neural_task(
        &self,
        payload: serde_json::Value,
        priority: Option<Priority>,
    ) -> Result<TaskId, DispatchError> {
        let options = TaskOptions {
            priority,
            ..TaskOptions::default()
        };
        self.submit(Layer::Neural, "analyze", payload, options)
    }

    /// Receive every event emitted from now on.
    ///
    /// A receiver that falls more than `event_capacity` events behind gets
    /// `RecvError::Lagged`; registered sinks never miss events.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.shared.events.subscribe()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let mut state = self.shared.lock();
        for (layer, pool) in &self.shared.pools {
            state.metrics.set_utilization(*layer, pool.utilization());
        }
        state.metrics.refresh_throughput(Instant::now());
        state.metrics.snapshot()
    }

    pub fn layer_status(&self) -> BTreeMap<Layer, LayerStatus> {
        let state = self.shared.lock();
        Layer::ALL
            .into_iter()
            .filter_map(|layer| {
                let pool = self.shared.pools.get(&layer)?;
                Some((
                    layer,
                    LayerStatus {
                        worker_count: pool.worker_count(),
                        queue_depth: self.shared.queue.depth(layer),
                        utilization: pool.utilization(),
                        completed_count: state.metrics.completed_in_history(layer),
                        active: pool.active_count(),
                    },
                ))
            })
            .collect()
    }

    /// Tasks currently owned by a pool worker.
    pub fn active_tasks(&self) -> Vec<Task> {
        let state = self.shared.lock();
        let mut active: Vec<(Instant, Task)> = state
            .active
            .values()
            .map(|entry| (entry.started, entry.task.clone()))
            .collect();
        active.sort_by_key(|(started, _)| *started);
        active.into_iter().map(|(_, task)| task).collect()
    }

    /// Tasks queued or running.
    pub fn in_flight(&self) -> usize {
        let state = self.shared.lock();
        state.queued.len() + state.active.len()
    }

    /// Best-effort lookup. Finished tasks are only remembered while they are
    /// in the bounded completed/failed histories.
    pub fn task_state(&self, id: TaskId) -> Option<TaskState> {
        let state = self.shared.lock();
        if state.active.contains_key(&id) {
            Some(TaskState::Active)
        } else if state.queued.contains(&id) {
            Some(TaskState::Queued)
        } else if state.metrics.recently_completed(id) {
            Some(TaskState::Completed)
        } else if state.metrics.recently_failed(id) {
            Some(TaskState::Failed)
        } else {
            None
        }
    }

    /// Resolve once nothing is queued or running.
    pub async fn wait_until_drained(&self) {
        self.shared
            .wait_for(|state| state.active.is_empty() && state.queued.is_empty())
            .await;
    }

    /// Resize one layer's pool to `worker_count` slots, `1..=cpu_count`.
    pub fn scale_layer(&self, layer: Layer, worker_count: usize) -> Result<(), DispatchError> {
        if self.shared.is_shutting_down() {
            return Err(DispatchError::ShuttingDown);
        }
        let max = self.shared.config.cpu_count;
        if worker_count == 0 || worker_count > max {
            return Err(DispatchError::InvalidWorkerCount {
                layer,
                requested: worker_count,
                max,
            });
        }
        let pool = self
            .shared
            .pools
            .get(&layer)
            .ok_or_else(|| DispatchError::InvalidLayer(layer.to_string()))?;
        pool.scale(worker_count)
    }

    /// [`Dispatcher::shutdown`] with the configured grace period.
    pub async fn shutdown_default(&self) -> Result<ShutdownReport, DispatchError> {
        self.shutdown(self.shared.config.shutdown_grace()).await
    }

    /// Stop dispatching, fail whatever is still queued, give active tasks up
    /// to `grace` to finish, then destroy every pool.
    ///
    /// Every submitted task ends up reported as completed or failed. Returns
    /// `AlreadyShutDown` on a second call.
    pub async fn shutdown(&self, grace: Duration) -> Result<ShutdownReport, DispatchError> {
        let shared = &self.shared;
        if shared.shutting_down.swap(true, Ordering::AcqRel) {
            return Err(DispatchError::AlreadyShutDown);
        }
        let started = Instant::now();
        info!(grace_ms = grace.as_millis() as u64, "dispatcher shutdown started");
        shared.stop.cancel();

        let drained = {
            let mut state = shared.lock();
            let drained = shared.queue.close_and_drain();
            for task in &drained {
                state.queued.remove(&task.id());
                shared.finalize_failure(
                    &mut state,
                    task.clone(),
                    TaskError::Shutdown,
                    Duration::ZERO,
                );
            }
            drained.len()
        };

        let graceful = tokio::time::timeout(grace, shared.wait_for(|state| state.active.is_empty()))
            .await
            .is_ok();
        if !graceful {
            warn!(
                still_active = shared.lock().active.len(),
                "grace period elapsed, destroying pools"
            );
        }

        for pool in shared.pools.values() {
            pool.destroy();
        }

        let (loops, forwarder) = {
            let mut background = shared
                .background
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (std::mem::take(&mut background.loops), background.forwarder.take())
        };
        for handle in &loops {
            handle.abort();
        }
        for handle in loops {
            let _ = handle.await;
        }

        let forced = {
            let mut state = shared.lock();
            let leftovers: Vec<ActiveEntry> =
                state.active.drain().map(|(_, entry)| entry).collect();
            for entry in &leftovers {
                shared.finalize_failure(
                    &mut state,
                    entry.task.clone(),
                    TaskError::Shutdown,
                    entry.started.elapsed(),
                );
            }
            shared.idle.notify_waiters();
            leftovers.len()
        };

        shared.events.close();
        if let Some(forwarder) = forwarder {
            let _ = forwarder.await;
        }

        let report = ShutdownReport {
            drained,
            graceful,
            forced,
            elapsed: started.elapsed(),
        };
        info!(
            drained = report.drained,
            forced = report.forced,
            graceful = report.graceful,
            elapsed_ms = report.elapsed.as_millis() as u64,
            "dispatcher shutdown finished"
        );
        Ok(report)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shared.is_shutting_down()
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("queued", &self.shared.queue.len())
            .field("shutting_down", &self.shared.is_shutting_down())
            .finish()
    }
}
