//! Construction of the shared services.

use crate::caching::{ModelCache, Requester};
use crate::config::{Config, Hooks};
use crate::model::ModelRegistry;
use crate::resources::Orchestrator;

/// The cache, the requester and the orchestrator as one explicitly owned unit.
///
/// Independent instances never share any state. Call [`Services::shutdown`] at the end of the
/// lifecycle to drop all cached models and pending eviction timers.
#[derive(Clone, Debug)]
pub struct Services {
    pub cache: ModelCache,
    pub requester: Requester,
    pub orchestrator: Orchestrator,
}

impl Services {
    pub fn new(config: &Config, hooks: Hooks, registry: ModelRegistry) -> Self {
        let cache = ModelCache::from_config(config);
        let requester = Requester::new(cache.clone(), hooks);
        let orchestrator = Orchestrator::new(requester.clone(), registry);

        Self {
            cache,
            requester,
            orchestrator,
        }
    }

    pub fn shutdown(&self) {
        tracing::debug!(entries = self.cache.len(), "Shutting down services");
        self.cache.clear();
    }
}
