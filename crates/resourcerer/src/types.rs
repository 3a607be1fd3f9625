//! Common types shared by the cache and the orchestrator.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// External inputs of a consumer, plus any values provided by its resolved resources.
pub type Props = Map<String, Value>;

/// Identifies a holder of interest in cached models.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ConsumerId(Uuid);

impl ConsumerId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConsumerId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// The lifecycle state of a single resource.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadingState {
    /// Not yet eligible to fetch, because a dependency is unmet.
    #[default]
    Pending,
    Loading,
    Loaded,
    Error,
}

/// Status information reported by a completed fetch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FetchStatus {
    /// The status code reported by the transport, if any.
    pub code: Option<u16>,
}

impl FetchStatus {
    pub fn with_code(code: u16) -> Self {
        Self { code: Some(code) }
    }
}

/// The three payload sections of a resource descriptor.
///
/// Field lookups go through [`Payload::resolve`], which checks `options`, then `attributes`,
/// then `data`. A `null` value counts as absent.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Payload {
    pub options: Map<String, Value>,
    pub attributes: Map<String, Value>,
    pub data: Map<String, Value>,
}

impl Payload {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn option(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }

    fn sections(&self) -> [&Map<String, Value>; 3] {
        [&self.options, &self.attributes, &self.data]
    }

    /// Resolves a single field in priority order.
    pub fn resolve(&self, field: &str) -> Option<&Value> {
        self.sections()
            .into_iter()
            .filter_map(|section| section.get(field))
            .find(|value| !value.is_null())
    }

    /// Returns the union of all sections, where earlier sections win.
    pub fn merged(&self) -> Map<String, Value> {
        let mut merged = Map::new();
        for section in self.sections() {
            for (key, value) in section {
                if value.is_null() || merged.contains_key(key) {
                    continue;
                }
                merged.insert(key.clone(), value.clone());
            }
        }
        merged
    }

    /// Returns a copy of this payload with every key of `partial` replacing ours.
    pub fn overlay(&self, partial: &Payload) -> Payload {
        let mut payload = self.clone();
        payload.options.extend(partial.options.clone());
        payload.attributes.extend(partial.attributes.clone());
        payload.data.extend(partial.data.clone());
        payload
    }

    pub fn is_empty(&self) -> bool {
        self.sections().iter().all(|section| section.is_empty())
    }
}
