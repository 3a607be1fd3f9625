use std::collections::BTreeMap;
use std::sync::Arc;

use crate::caching::CacheKey;
use crate::error::FetchError;
use crate::model::Model;
use crate::types::{LoadingState, Props};

/// The externally visible state of a single resource.
#[derive(Clone, Debug)]
pub struct ResourceView {
    pub state: LoadingState,
    /// The status code of the last settled fetch, if the transport reported one.
    pub status: Option<u16>,
    pub error: Option<FetchError>,
    pub model: Option<Arc<dyn Model>>,
    /// The fingerprint the resource currently resolves to. `None` while pending or supplied.
    pub cache_key: Option<CacheKey>,
    pub critical: bool,
}

impl ResourceView {
    /// Downcasts the loaded model.
    pub fn model<T: Model>(&self) -> Option<&T> {
        self.model.as_deref()?.downcast_ref()
    }
}

/// A snapshot of all resources of one consumer, as pushed to its sink.
#[derive(Clone, Debug, Default)]
pub struct ResourcesState {
    /// All resources except prefetches.
    pub resources: BTreeMap<String, ResourceView>,
    /// Values provided by loaded resources.
    pub provided: Props,
    /// Any critical resource is loading.
    pub is_loading: bool,
    /// Any critical resource has errored.
    pub has_errored: bool,
    /// All critical resources are loaded.
    pub has_loaded: bool,
    /// `has_loaded` was true at some point for this consumer.
    pub has_initially_loaded: bool,
}

impl ResourcesState {
    pub fn get(&self, name: &str) -> Option<&ResourceView> {
        self.resources.get(name)
    }

    pub fn state_of(&self, name: &str) -> Option<LoadingState> {
        self.get(name).map(|view| view.state)
    }

    pub fn model<T: Model>(&self, name: &str) -> Option<&T> {
        self.get(name)?.model()
    }
}

/// The aggregate flags derived from the critical resources.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Aggregate {
    pub is_loading: bool,
    pub has_errored: bool,
    pub has_loaded: bool,
}

impl Aggregate {
    /// Pending resources never count as loading or errored, but keep `has_loaded` false.
    pub fn from_states(states: impl IntoIterator<Item = LoadingState>) -> Self {
        let mut aggregate = Aggregate {
            has_loaded: true,
            ..Default::default()
        };
        for state in states {
            aggregate.is_loading |= state == LoadingState::Loading;
            aggregate.has_errored |= state == LoadingState::Error;
            aggregate.has_loaded &= state == LoadingState::Loaded;
        }
        aggregate
    }
}
