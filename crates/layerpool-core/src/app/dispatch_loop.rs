//! Dispatch loops: pop the next task, run it on its layer's pool, record
//! the outcome.
//!
//! Several loops share the queue. Popping is exclusive, so a task is only
//! ever dispatched by one loop. An idle loop parks on the queue instead of
//! polling it.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, error};

use super::dispatcher::Shared;
use crate::domain::Task;
use crate::error::TaskError;

pub(crate) fn spawn(shared: &Arc<Shared>, count: usize) -> Vec<JoinHandle<()>> {
    (0..count)
        .map(|loop_id| tokio::spawn(dispatch_loop(loop_id, Arc::clone(shared))))
        .collect()
}

async fn dispatch_loop(loop_id: usize, shared: Arc<Shared>) {
    debug!(loop_id, "dispatch loop started");
    loop {
        // Stop wins over a ready task; `next` is cancel-safe.
        let task = tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break,
            task = shared.queue.next() => task,
        };
        dispatch(&shared, task).await;
    }
    debug!(loop_id, "dispatch loop stopped");
}

async fn dispatch(shared: &Shared, task: Task) {
    let started = shared.begin(&task);
    let layer = task.layer();

    let (Some(pool), Some(handler)) = (shared.pool(layer), shared.handler(layer)) else {
        // Submission rejects layers without a handler, so this is a wiring bug.
        error!(task_id = %task.id(), layer = %layer, "no pool or handler for layer");
        shared.fail(task, TaskError::PoolClosed(layer), started.elapsed());
        return;
    };

    debug!(
        task_id = %task.id(),
        layer = %layer,
        priority = %task.priority(),
        attempt = task.attempt(),
        "dispatching task"
    );

    let outcome = pool.run(&task, handler).await;
    let execution_time = started.elapsed();
    match outcome {
        Ok(result) => shared.complete(task, result, execution_time),
        Err(err) => shared.fail(task, err, execution_time),
    }
}
