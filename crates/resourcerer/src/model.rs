//! The contract between the cache and the models it stores.
//!
//! A [`Model`] is an externally implemented entity that knows how to fetch itself. The cache only
//! ever sees models through this trait. Each model type is described by an explicit
//! [`ModelType`] record, and all known types are collected in a [`ModelRegistry`] that is handed
//! to the orchestrator.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::watch;

use crate::caching::CacheKey;
use crate::error::FetchError;
use crate::types::{FetchStatus, Payload};

/// The request handed to [`Model::fetch`].
#[derive(Clone, Debug, PartialEq)]
pub struct FetchRequest {
    /// The fingerprint the model is cached under.
    pub key: CacheKey,
    /// The resource payload the request was built from.
    pub payload: Payload,
}

/// A cacheable entity.
pub trait Model: fmt::Debug + Send + Sync + 'static {
    /// Starts fetching this model.
    ///
    /// This is called synchronously when the fetch is initiated. The returned future performs the
    /// actual I/O and updates the model in place.
    fn fetch(&self, request: &FetchRequest) -> BoxFuture<'static, Result<FetchStatus, FetchError>>;

    /// Returns a feed of change notifications, if this model emits any.
    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        None
    }

    fn as_any(&self) -> &dyn Any;
}

impl dyn Model {
    /// Downcasts to the concrete model type.
    pub fn downcast_ref<T: Model>(&self) -> Option<&T> {
        self.as_any().downcast_ref()
    }
}

type DeriveFn = Arc<dyn Fn(&Map<String, Value>) -> Map<String, Value> + Send + Sync>;
type Constructor = Arc<dyn Fn(&Payload) -> Arc<dyn Model> + Send + Sync>;

/// A field contributing to a model's fingerprint.
#[derive(Clone)]
pub enum DependencyField {
    /// A named field, resolved from the payload.
    Name(String),
    /// A function of the merged payload, whose returned pairs all contribute.
    Derived(DeriveFn),
}

impl DependencyField {
    pub fn derived<F>(f: F) -> Self
    where
        F: Fn(&Map<String, Value>) -> Map<String, Value> + Send + Sync + 'static,
    {
        Self::Derived(Arc::new(f))
    }
}

impl fmt::Debug for DependencyField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Name(name) => f.debug_tuple("Name").field(name).finish(),
            Self::Derived(_) => f.write_str("Derived(..)"),
        }
    }
}

impl From<&str> for DependencyField {
    fn from(name: &str) -> Self {
        Self::Name(name.to_owned())
    }
}

/// Metadata describing a kind of model.
#[derive(Clone)]
pub struct ModelType {
    key: String,
    dependencies: Vec<DependencyField>,
    fetch: bool,
    measure: bool,
    constructor: Constructor,
}

impl ModelType {
    pub fn new<F>(key: impl Into<String>, constructor: F) -> Self
    where
        F: Fn(&Payload) -> Arc<dyn Model> + Send + Sync + 'static,
    {
        Self {
            key: key.into(),
            dependencies: Vec::new(),
            fetch: true,
            measure: false,
            constructor: Arc::new(constructor),
        }
    }

    /// Appends a field to the fingerprint dependencies.
    pub fn dependency(mut self, field: impl Into<DependencyField>) -> Self {
        self.dependencies.push(field.into());
        self
    }

    /// Marks this type as never fetched from the network.
    pub fn unfetched(mut self) -> Self {
        self.fetch = false;
        self
    }

    /// Reports fetch durations for every model of this type.
    pub fn measured(mut self) -> Self {
        self.measure = true;
        self
    }

    /// The fingerprint base name.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn dependencies(&self) -> &[DependencyField] {
        &self.dependencies
    }

    pub fn should_fetch(&self) -> bool {
        self.fetch
    }

    pub fn should_measure(&self) -> bool {
        self.measure
    }

    pub fn construct(&self, payload: &Payload) -> Arc<dyn Model> {
        (self.constructor)(payload)
    }
}

impl fmt::Debug for ModelType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelType")
            .field("key", &self.key)
            .field("dependencies", &self.dependencies)
            .field("fetch", &self.fetch)
            .field("measure", &self.measure)
            .finish_non_exhaustive()
    }
}

/// Maps model keys to their [`ModelType`].
#[derive(Clone, Debug, Default)]
pub struct ModelRegistry {
    types: HashMap<String, Arc<ModelType>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a model type, replacing any previous type with the same key.
    pub fn register(&mut self, model_type: ModelType) -> &mut Self {
        self.types
            .insert(model_type.key().to_owned(), Arc::new(model_type));
        self
    }

    pub fn with(mut self, model_type: ModelType) -> Self {
        self.register(model_type);
        self
    }

    pub fn get(&self, key: &str) -> Option<Arc<ModelType>> {
        self.types.get(key).cloned()
    }
}
