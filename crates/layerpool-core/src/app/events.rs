//! Event bus: fire-and-forget fan-out of dispatcher events.
//!
//! Producers push onto an unbounded channel and return immediately. A single
//! forwarder task calls the registered sinks in order, then broadcasts the
//! event to subscribers.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, trace};

use crate::domain::DispatchEvent;
use crate::ports::EventSink;

pub(crate) struct EventBus {
    tx: Mutex<Option<mpsc::UnboundedSender<DispatchEvent>>>,
    broadcast: broadcast::Sender<DispatchEvent>,
}

impl EventBus {
    /// Create the bus and spawn its forwarder on the current runtime.
    pub(crate) fn spawn(sinks: Vec<Arc<dyn EventSink>>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (broadcast, _) = broadcast::channel(capacity);
        let forwarder = tokio::spawn(forward(rx, sinks, broadcast.clone()));
        let bus = Self {
            tx: Mutex::new(Some(tx)),
            broadcast,
        };
        (bus, forwarder)
    }

    /// Never blocks. Events emitted after [`EventBus::close`] are dropped.
    pub(crate) fn emit(&self, event: DispatchEvent) {
        let tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(tx) = tx.as_ref() {
            // The forwarder only stops after close(), so a send error means
            // the runtime itself is going away.
            let _ = tx.send(event);
        }
    }

    pub(crate) fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.broadcast.subscribe()
    }

    /// Stop accepting events. The forwarder delivers what is already queued
    /// and then exits.
    pub(crate) fn close(&self) {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner).take();
    }
}

async fn forward(
    mut rx: mpsc::UnboundedReceiver<DispatchEvent>,
    sinks: Vec<Arc<dyn EventSink>>,
    broadcast: broadcast::Sender<DispatchEvent>,
) {
    while let Some(event) = rx.recv().await {
        trace!(event = event.name(), task_id = %event.task().id(), "forwarding event");
        for sink in &sinks {
            // A panicking sink must not take the other sinks down with it.
            if catch_unwind(AssertUnwindSafe(|| sink.deliver(&event))).is_err() {
                error!(event = event.name(), "event sink panicked");
            }
        }
        // No subscribers is fine.
        let _ = broadcast.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Layer, Priority, Task, TaskId, TaskType};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use ulid::Ulid;

    fn task() -> Task {
        Task::new(
            TaskId::from_ulid(Ulid::new()),
            Layer::Communication,
            TaskType::new("process"),
            serde_json::Value::Null,
            Priority::Medium,
            Duration::from_secs(1),
            0,
            chrono::Utc::now(),
        )
    }

    struct Counting(AtomicUsize);

    impl EventSink for Counting {
        fn on_task_added(&self, _task: &Task) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Exploding;

    impl EventSink for Exploding {
        fn on_task_added(&self, _task: &Task) {
            panic!("sink failure");
        }
    }

    #[tokio::test]
    async fn delivers_to_sinks_and_subscribers_in_order() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let (bus, forwarder) = EventBus::spawn(vec![counting.clone() as Arc<dyn EventSink>], 16);
        let mut rx = bus.subscribe();

        let first = task();
        let second = task();
        bus.emit(DispatchEvent::TaskAdded { task: first.clone() });
        bus.emit(DispatchEvent::TaskAdded { task: second.clone() });

        assert_eq!(rx.recv().await.unwrap().task().id(), first.id());
        assert_eq!(rx.recv().await.unwrap().task().id(), second.id());

        bus.close();
        forwarder.await.unwrap();
        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn panicking_sink_does_not_stop_delivery() {
        let counting = Arc::new(Counting(AtomicUsize::new(0)));
        let exploding: Arc<dyn EventSink> = Arc::new(Exploding);
        let sinks = vec![exploding, counting.clone() as Arc<dyn EventSink>];
        let (bus, forwarder) = EventBus::spawn(sinks, 16);

        bus.emit(DispatchEvent::TaskAdded { task: task() });
        bus.emit(DispatchEvent::TaskAdded { task: task() });
        bus.close();
        forwarder.await.unwrap();

        assert_eq!(counting.0.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn emit_after_close_is_dropped() {
        let (bus, forwarder) = EventBus::spawn(Vec::new(), 4);
        let mut rx = bus.subscribe();
        bus.close();
        bus.emit(DispatchEvent::TaskAdded { task: task() });
        drop(bus);
        forwarder.await.unwrap();
        assert!(matches!(rx.recv().await, Err(broadcast::error::RecvError::Closed)));
    }
}
