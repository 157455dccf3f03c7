//! Layer pools.
//!
//! A [`LayerPool`] is a bounded set of worker slots for one layer. Each slot is
//! a semaphore permit; an attempt holds its permit for as long as its handler
//! runs, on a tokio task of its own.
//!
//! Rescaling swaps in a fresh semaphore (a new "generation"). Attempts already
//! running keep their old permits and finish normally; attempts still waiting
//! for a slot move over to the new generation.

mod guard;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use self::guard::{CounterGuard, InFlightGuard};
use crate::domain::{Layer, Task};
use crate::error::{DispatchError, TaskError};
use crate::ports::{LayerHandler, TaskContext};

/// CPU count used when the platform cannot report one.
pub const FALLBACK_CPU_COUNT: usize = 8;

/// Number of CPUs available to this process.
pub fn detect_cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(FALLBACK_CPU_COUNT)
}

type InFlight = Arc<Mutex<HashMap<u64, AbortHandle>>>;

#[derive(Debug, Clone)]
struct Generation {
    number: u64,
    worker_count: usize,
    semaphore: Arc<Semaphore>,
}

/// Worker pool for a single layer.
pub struct LayerPool {
    layer: Layer,
    generation: RwLock<Generation>,
    /// Attempts waiting for a worker slot.
    waiting: AtomicUsize,
    /// Attempts whose handler is running, across all generations.
    active: Arc<AtomicUsize>,
    next_attempt_key: AtomicU64,
    in_flight: InFlight,
    closed: AtomicBool,
    cancel: CancellationToken,
}

impl LayerPool {
    /// Create a pool with `worker_count` slots.
    ///
    /// Fails when no tokio runtime is available to run workers on.
    pub fn new(layer: Layer, worker_count: usize) -> Result<Self, DispatchError> {
        tokio::runtime::Handle::try_current()
            .map_err(|e| DispatchError::Runtime(format!("layer {layer}: {e}")))?;
        let generation = Generation {
            number: 1,
            worker_count,
            semaphore: Self::semaphore(layer, worker_count)?,
        };
        info!(layer = %layer, workers = worker_count, "layer pool created");

        Ok(Self {
            layer,
            generation: RwLock::new(generation),
            waiting: AtomicUsize::new(0),
            active: Arc::new(AtomicUsize::new(0)),
            next_attempt_key: AtomicU64::new(0),
            in_flight: Arc::new(Mutex::new(HashMap::new())),
            closed: AtomicBool::new(false),
            cancel: CancellationToken::new(),
        })
    }

    fn semaphore(layer: Layer, worker_count: usize) -> Result<Arc<Semaphore>, DispatchError> {
        if worker_count == 0 || worker_count > Semaphore::MAX_PERMITS {
            return Err(DispatchError::InvalidWorkerCount {
                layer,
                requested: worker_count,
                max: Semaphore::MAX_PERMITS,
            });
        }
        Ok(Arc::new(Semaphore::new(worker_count)))
    }

    fn current(&self) -> Generation {
        self.generation
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn layer(&self) -> Layer {
        self.layer
    }

    pub fn worker_count(&self) -> usize {
        self.current().worker_count
    }

    pub fn active_count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Attempts waiting for a free worker slot.
    pub fn waiting_count(&self) -> usize {
        self.waiting.load(Ordering::Acquire)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Busy share of the current generation's slots, in percent, clamped to
    /// `[0, 100]`.
    pub fn utilization(&self) -> f64 {
        let generation = self.current();
        let idle = generation.semaphore.available_permits();
        let busy = generation.worker_count.saturating_sub(idle);
        (busy as f64 / generation.worker_count as f64 * 100.0).clamp(0.0, 100.0)
    }

    /// Run one attempt of `task` on this pool, bounded by the task timeout.
    ///
    /// The deadline covers the wait for a free slot as well as execution. On
    /// timeout the attempt's cancellation token fires and the timeout is
    /// reported right away, without waiting for the handler to notice.
    pub async fn run(
        &self,
        task: &Task,
        handler: Arc<dyn LayerHandler>,
    ) -> Result<serde_json::Value, TaskError> {
        let timeout = task.timeout();
        let deadline = Instant::now() + timeout;
        if timeout.is_zero() {
            return Err(TaskError::Timeout { timeout });
        }

        let permit = self.acquire(timeout, deadline).await?;
        if Instant::now() >= deadline {
            return Err(TaskError::Timeout { timeout });
        }

        let token = self.cancel.child_token();
        let ctx = TaskContext::for_attempt(task, token.clone());
        let key = self.next_attempt_key.fetch_add(1, Ordering::Relaxed);

        let guard = InFlightGuard::new(key, Arc::clone(&self.in_flight), Arc::clone(&self.active));
        let join = tokio::spawn(async move {
            let _permit = permit;
            let _guard = guard;
            handler.handle(ctx).await
        });
        {
            let mut in_flight = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
            in_flight.insert(key, join.abort_handle());
            // A finished attempt has already dropped its guard.
            if join.is_finished() {
                in_flight.remove(&key);
            }
        }
        debug!(
            task_id = %task.id(),
            layer = %self.layer,
            attempt = task.attempt(),
            "attempt started"
        );

        match tokio::time::timeout_at(deadline, join).await {
            Ok(Ok(Ok(value))) => Ok(value),
            Ok(Ok(Err(err))) => Err(TaskError::Handler(err)),
            Ok(Err(join_err)) if join_err.is_cancelled() => Err(TaskError::PoolClosed(self.layer)),
            Ok(Err(join_err)) => Err(TaskError::Panicked(panic_message(join_err))),
            Err(_elapsed) => {
                token.cancel();
                Err(TaskError::Timeout { timeout })
            }
        }
    }

    async fn acquire(
        &self,
        timeout: Duration,
        deadline: Instant,
    ) -> Result<OwnedSemaphorePermit, TaskError> {
        let _waiting = CounterGuard::increment(&self.waiting);
        loop {
            if self.is_closed() {
                return Err(TaskError::PoolClosed(self.layer));
            }
            let semaphore = self.current().semaphore;
            match tokio::time::timeout_at(deadline, semaphore.acquire_owned()).await {
                Ok(Ok(permit)) => return Ok(permit),
                // The generation was retired (rescale) or the pool was
                // destroyed; re-check which.
                Ok(Err(_closed)) => continue,
                Err(_elapsed) => return Err(TaskError::Timeout { timeout }),
            }
        }
    }

    /// Replace the pool's capacity with `worker_count` slots.
    ///
    /// Running attempts finish on their old slots; waiting attempts move to
    /// the new ones. Nothing in flight is dropped.
    pub fn scale(&self, worker_count: usize) -> Result<(), DispatchError> {
        if self.is_closed() {
            return Err(DispatchError::ShuttingDown);
        }
        let semaphore = Self::semaphore(self.layer, worker_count)?;
        let retired = {
            let mut generation = self.generation.write().unwrap_or_else(PoisonError::into_inner);
            let next = Generation {
                number: generation.number + 1,
                worker_count,
                semaphore,
            };
            std::mem::replace(&mut *generation, next)
        };
        retired.semaphore.close();
        info!(
            layer = %self.layer,
            from = retired.worker_count,
            to = worker_count,
            still_running = self.active_count(),
            "layer pool rescaled"
        );
        Ok(())
    }

    /// Tear the pool down: refuse new attempts, signal cancellation to every
    /// running handler, then abort them.
    pub fn destroy(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.current().semaphore.close();
        self.cancel.cancel();
        let handles: Vec<AbortHandle> = self
            .in_flight
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .map(|(_, handle)| handle)
            .collect();
        let aborted = handles.len();
        for handle in handles {
            handle.abort();
        }
        info!(layer = %self.layer, aborted, "layer pool destroyed");
    }
}

impl std::fmt::Debug for LayerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LayerPool")
            .field("layer", &self.layer)
            .field("worker_count", &self.worker_count())
            .field("active", &self.active_count())
            .field("waiting", &self.waiting_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn panic_message(err: tokio::task::JoinError) -> String {
    match err.try_into_panic() {
        Ok(payload) => payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "non-string panic payload".to_string()),
        Err(err) => err.to_string(),
    }
}
