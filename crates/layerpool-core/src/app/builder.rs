//! DispatcherBuilder: wiring and start-up validation.
//!
//! Problems are reported by `build()`, before any task is accepted: a bad
//! config, a missing runtime, or a layer that was expected but has no
//! handler.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::debug;

use super::dispatcher::Dispatcher;
use super::events::EventBus;
use crate::config::DispatcherConfig;
use crate::domain::Layer;
use crate::error::DispatchError;
use crate::pool::LayerPool;
use crate::ports::{Clock, EventSink, IdGenerator, LayerHandler, SystemClock, UlidGenerator};

/// Builds a [`Dispatcher`].
///
/// ```ignore
/// let dispatcher = DispatcherBuilder::new()
///     .handler(Layer::Core, handler_fn(|ctx| async move { Ok(ctx.payload) }))?
///     .expect_layers(&[Layer::Core])
///     .build()?;
/// ```
pub struct DispatcherBuilder {
    config: DispatcherConfig,
    clock: Arc<dyn Clock>,
    ids: Option<Arc<dyn IdGenerator>>,
    handlers: HashMap<Layer, Arc<dyn LayerHandler>>,
    sinks: Vec<Arc<dyn EventSink>>,
    expected_layers: Option<Vec<Layer>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("handler for layer '{0}' is already registered")]
    AlreadyRegistered(Layer),

    #[error("missing handlers for layers {0:?}; these layers were expected but not registered")]
    MissingHandlers(Vec<Layer>),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

impl DispatcherBuilder {
    pub fn new() -> Self {
        Self {
            config: DispatcherConfig::default(),
            clock: Arc::new(SystemClock),
            ids: None,
            handlers: HashMap::new(),
            sinks: Vec::new(),
            expected_layers: None,
        }
    }

    pub fn config(mut self, config: DispatcherConfig) -> Self {
        self.config = config;
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Defaults to a [`UlidGenerator`] on the builder's clock.
    pub fn id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Register the handler for one layer.
    pub fn handler<H: LayerHandler + 'static>(
        mut self,
        layer: Layer,
        handler: H,
    ) -> Result<Self, BuildError> {
        if self.handlers.contains_key(&layer) {
            return Err(BuildError::AlreadyRegistered(layer));
        }
        self.handlers.insert(layer, Arc::new(handler));
        Ok(self)
    }

    /// Share one handler across every layer that has none yet.
    pub fn handler_for_all<H: LayerHandler + 'static>(mut self, handler: H) -> Self {
        let handler: Arc<dyn LayerHandler> = Arc::new(handler);
        for layer in Layer::ALL {
            self.handlers
                .entry(layer)
                .or_insert_with(|| Arc::clone(&handler));
        }
        self
    }

    pub fn sink<S: EventSink + 'static>(mut self, sink: S) -> Self {
        self.sinks.push(Arc::new(sink));
        self
    }

    /// Fail `build()` unless every one of `layers` has a handler.
    pub fn expect_layers(mut self, layers: &[Layer]) -> Self {
        self.expected_layers = Some(layers.to_vec());
        self
    }

    /// Validate, create one pool per layer, and start the dispatch loops.
    ///
    /// Must be called inside a tokio runtime.
    pub fn build(self) -> Result<Dispatcher, BuildError> {
        self.config.validate()?;
        tokio::runtime::Handle::try_current()
            .map_err(|e| DispatchError::Runtime(e.to_string()))?;

        if let Some(expected) = &self.expected_layers {
            let mut missing: Vec<Layer> = expected
                .iter()
                .copied()
                .filter(|layer| !self.handlers.contains_key(layer))
                .collect();
            if !missing.is_empty() {
                missing.sort();
                missing.dedup();
                return Err(BuildError::MissingHandlers(missing));
            }
        }

        let cpu_count = self.config.cpu_count;
        let mut pools = HashMap::with_capacity(Layer::ALL.len());
        for layer in Layer::ALL {
            let workers = layer.initial_worker_count(cpu_count);
            pools.insert(layer, Arc::new(LayerPool::new(layer, workers)?));
        }
        debug!(cpu_count, handlers = self.handlers.len(), "layer pools created");

        let ids: Arc<dyn IdGenerator> = match self.ids {
            Some(ids) => ids,
            None => Arc::new(UlidGenerator::new(Arc::clone(&self.clock))),
        };
        let (events, forwarder) = EventBus::spawn(self.sinks, self.config.event_capacity);

        Ok(Dispatcher::start(
            self.config,
            self.clock,
            ids,
            pools,
            self.handlers,
            events,
            forwarder,
        ))
    }
}

impl Default for DispatcherBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::HandlerError;
    use crate::ports::{TaskContext, handler_fn};

    fn echo() -> impl LayerHandler {
        handler_fn(|ctx: TaskContext| async move { Ok::<_, HandlerError>(ctx.payload) })
    }

    fn config(cpu_count: usize) -> DispatcherConfig {
        DispatcherConfig {
            cpu_count,
            ..DispatcherConfig::default()
        }
    }

    #[tokio::test]
    async fn build_success() {
        let dispatcher = DispatcherBuilder::new()
            .handler(Layer::Core, echo())
            .unwrap()
            .expect_layers(&[Layer::Core])
            .build();
        assert!(dispatcher.is_ok());
    }

    #[tokio::test]
    async fn build_missing_handlers() {
        let dispatcher = DispatcherBuilder::new()
            .handler(Layer::Core, echo())
            .unwrap()
            .expect_layers(&[Layer::Core, Layer::Neural, Layer::Backup])
            .build();
        assert!(matches!(
            dispatcher,
            Err(BuildError::MissingHandlers(missing))
                if missing == vec![Layer::Neural, Layer::Backup]
        ));
    }

    #[tokio::test]
    async fn duplicate_handler_is_rejected() {
        let result = DispatcherBuilder::new()
            .handler(Layer::Security, echo())
            .unwrap()
            .handler(Layer::Security, echo());
        assert!(matches!(result, Err(BuildError::AlreadyRegistered(Layer::Security))));
    }

    #[tokio::test]
    async fn handler_for_all_fills_only_the_gaps() {
        let dispatcher = DispatcherBuilder::new()
            .handler(Layer::Core, echo())
            .unwrap()
            .handler_for_all(echo())
            .expect_layers(&Layer::ALL)
            .build();
        assert!(dispatcher.is_ok());
    }

    #[tokio::test]
    async fn pools_follow_the_sizing_table() {
        let dispatcher = DispatcherBuilder::new()
            .config(config(10))
            .handler_for_all(echo())
            .build()
            .unwrap();

        let status = dispatcher.layer_status();
        assert_eq!(status.len(), Layer::ALL.len());
        assert_eq!(status[&Layer::Core].worker_count, 3);
        assert_eq!(status[&Layer::Neural].worker_count, 2);
        assert_eq!(status[&Layer::Monitoring].worker_count, 1);
        dispatcher.shutdown(std::time::Duration::ZERO).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_config_fails_the_build() {
        let result = DispatcherBuilder::new()
            .config(DispatcherConfig {
                dispatch_loops: 0,
                ..DispatcherConfig::default()
            })
            .handler_for_all(echo())
            .build();
        assert!(matches!(result, Err(BuildError::Dispatch(DispatchError::Config(_)))));
    }

    #[test]
    fn build_outside_a_runtime_fails() {
        let result = DispatcherBuilder::new().handler_for_all(echo()).build();
        assert!(matches!(result, Err(BuildError::Dispatch(DispatchError::Runtime(_)))));
    }
}
