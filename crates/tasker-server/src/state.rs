//! Shared application state.

use std::sync::Arc;

use thiserror::Error;

use crate::broker::{Broker, InMemoryBroker};
use crate::cache::{CacheBackend, MemoryCacheBackend, ResultCache};
use crate::config::{Config, ConfigError};
use crate::dispatch::DispatchRouter;
use crate::metrics::Metrics;
use crate::registry::TaskRegistry;
use crate::store::{InMemoryTaskStore, TaskStore};

/// Errors building the application state.
#[derive(Debug, Error)]
pub enum StateError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

/// Shared application state.
pub struct AppState {
    /// Validated configuration.
    pub config: Config,

    /// Source of truth for task records.
    pub store: Arc<dyn TaskStore>,

    /// Cache of terminal task records.
    pub cache: ResultCache,

    /// Task type handlers.
    pub registry: TaskRegistry,

    /// Routes tasks to queues.
    pub router: DispatchRouter,

    /// Queue transport.
    pub broker: Arc<dyn Broker>,

    /// Recorded counters and histograms.
    pub metrics: Arc<Metrics>,
}

impl AppState {
    /// Wire the components together.
    pub fn new(
        config: Config,
        store: Arc<dyn TaskStore>,
        cache_backend: Arc<dyn CacheBackend>,
        broker: Arc<dyn Broker>,
    ) -> Result<Arc<Self>, StateError> {
        config.validate()?;

        let metrics = Arc::new(Metrics::new());
        let cache = if config.cache.enabled {
            ResultCache::new(cache_backend, config.cache.ttl, metrics.clone())
        } else {
            ResultCache::disabled(metrics.clone())
        };
        let registry = TaskRegistry::from_config(&config)?;
        let router = DispatchRouter::new(&config, broker.clone());

        Ok(Arc::new(Self {
            config,
            store,
            cache,
            registry,
            router,
            broker,
            metrics,
        }))
    }

    /// State backed entirely by in-process components.
    pub fn in_memory(config: Config) -> Result<Arc<Self>, StateError> {
        let broker = Arc::new(InMemoryBroker::from_config(&config));
        Self::new(
            config,
            Arc::new(InMemoryTaskStore::new()),
            Arc::new(MemoryCacheBackend::default()),
            broker,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_in_memory_state() {
        let state = AppState::in_memory(Config::default()).unwrap();
        assert_eq!(state.registry.task_types().len(), 3);
        assert_eq!(state.cache.ttl(), Config::default().cache.ttl);
    }

    #[test]
    fn test_disabled_cache_has_zero_ttl() {
        let mut config = Config::default();
        config.cache.enabled = false;
        let state = AppState::in_memory(config).unwrap();
        assert!(state.cache.ttl().is_zero());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let mut config = Config::default();
        config.queues.retain(|q| q.name != crate::config::EXTERNAL_API_QUEUE);
        assert!(matches!(
            AppState::in_memory(config),
            Err(StateError::Config(ConfigError::UndeclaredQueue { .. }))
        ));
    }
}
