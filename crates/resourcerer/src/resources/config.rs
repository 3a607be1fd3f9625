use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::model::Model;
use crate::types::Payload;

/// The declarative resource map a consumer asks for, keyed by resource name.
pub type ResourceMap = BTreeMap<String, ResourceConfig>;

type ProvideFn = Arc<dyn Fn(&dyn Model) -> Option<Value> + Send + Sync>;
type MeasureFn = Arc<dyn Fn(&Payload) -> bool + Send + Sync>;

/// A value derived from a loaded model and handed to the consumer's props.
#[derive(Clone)]
pub enum Provide {
    /// Provides a single prop.
    Named(String, ProvideFn),
    /// Spreads every entry of the returned object into the props.
    Spread(ProvideFn),
}

impl fmt::Debug for Provide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Named(prop, _) => f.debug_tuple("Named").field(prop).finish(),
            Self::Spread(_) => f.write_str("Spread"),
        }
    }
}

/// Whether fetch durations of a resource are reported.
#[derive(Clone, Default)]
pub enum Measure {
    #[default]
    Off,
    On,
    When(MeasureFn),
}

impl Measure {
    pub(crate) fn applies(&self, payload: &Payload) -> bool {
        match self {
            Measure::Off => false,
            Measure::On => true,
            Measure::When(f) => f(payload),
        }
    }
}

impl fmt::Debug for Measure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Off => f.write_str("Off"),
            Self::On => f.write_str("On"),
            Self::When(_) => f.write_str("When(..)"),
        }
    }
}

/// Describes one resource a consumer needs.
///
/// ```
/// use resourcerer::ResourceConfig;
///
/// let todos = ResourceConfig::new()
///     .model("todos")
///     .data("user_id", 42)
///     .depends_on("user_id")
///     .noncritical();
/// # let _ = todos;
/// ```
#[derive(Clone, Debug)]
pub struct ResourceConfig {
    pub(crate) model_key: Option<String>,
    pub(crate) critical: bool,
    pub(crate) payload: Payload,
    pub(crate) depends_on: Vec<String>,
    pub(crate) provides: Vec<Provide>,
    pub(crate) prefetches: Vec<Payload>,
    pub(crate) force_fetch: bool,
    pub(crate) lazy: bool,
    pub(crate) listen: bool,
    pub(crate) measure: Measure,
}

impl Default for ResourceConfig {
    fn default() -> Self {
        Self {
            model_key: None,
            critical: true,
            payload: Payload::default(),
            depends_on: Vec::new(),
            provides: Vec::new(),
            prefetches: Vec::new(),
            force_fetch: false,
            lazy: false,
            listen: false,
            measure: Measure::Off,
        }
    }
}

impl ResourceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registered model key to use. Defaults to the resource name.
    pub fn model(mut self, key: impl Into<String>) -> Self {
        self.model_key = Some(key.into());
        self
    }

    /// Excludes this resource from the consumer's aggregate state and fetches it after all
    /// critical resources.
    pub fn noncritical(mut self) -> Self {
        self.critical = false;
        self
    }

    pub fn payload(mut self, payload: Payload) -> Self {
        self.payload = payload;
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload = self.payload.data(key, value);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload = self.payload.attribute(key, value);
        self
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.payload = self.payload.option(key, value);
        self
    }

    /// Gates the fetch on `field` being present.
    pub fn depends_on(mut self, field: impl Into<String>) -> Self {
        self.depends_on.push(field.into());
        self
    }

    /// Provides `prop` to the consumer once this resource has loaded.
    pub fn provides<F>(mut self, prop: impl Into<String>, f: F) -> Self
    where
        F: Fn(&dyn Model) -> Option<Value> + Send + Sync + 'static,
    {
        self.provides.push(Provide::Named(prop.into(), Arc::new(f)));
        self
    }

    /// Provides every entry of the object returned by `f`.
    pub fn provides_all<F>(mut self, f: F) -> Self
    where
        F: Fn(&dyn Model) -> Option<Value> + Send + Sync + 'static,
    {
        self.provides.push(Provide::Spread(Arc::new(f)));
        self
    }

    /// Fetches the resource again with `partial` merged over its payload, after every critical
    /// and noncritical resource.
    pub fn prefetch(mut self, partial: Payload) -> Self {
        self.prefetches.push(partial);
        self
    }

    pub fn force_fetch(mut self) -> Self {
        self.force_fetch = true;
        self
    }

    pub fn lazy(mut self) -> Self {
        self.lazy = true;
        self
    }

    /// Pushes a new state whenever the loaded model reports a change.
    pub fn listen(mut self) -> Self {
        self.listen = true;
        self
    }

    pub fn measure(mut self, measure: Measure) -> Self {
        self.measure = measure;
        self
    }
}
