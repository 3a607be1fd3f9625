use std::sync::Arc;

use serde_json::Value;

use resourcerer::{Config, Hooks, ModelRegistry, ModelType, Props, Services};
use resourcerer_test::{MockTransport, json_model_type};

/// Builds props from key/value pairs.
pub fn props(pairs: &[(&str, Value)]) -> Props {
    pairs
        .iter()
        .map(|(key, value)| ((*key).to_owned(), value.clone()))
        .collect()
}

/// A JSON model type fetched through `transport`, fingerprinted by `fields`.
pub fn model_type(key: &str, fields: &[&str], transport: &Arc<MockTransport>) -> ModelType {
    fields
        .iter()
        .fold(json_model_type(key, transport.clone()), |model_type, field| {
            model_type.dependency(*field)
        })
}

pub fn services(registry: ModelRegistry) -> Services {
    services_with_hooks(registry, Hooks::new())
}

pub fn services_with_hooks(registry: ModelRegistry, hooks: Hooks) -> Services {
    Services::new(&Config::default(), hooks, registry)
}
