//! # Resource orchestration
//!
//! A consumer describes the resources it needs as a [`ResourceMap`], built from its current
//! props. The [`Orchestrator`] turns that map into a fetch plan and keeps a [`ResourcesState`]
//! up to date as fetches settle:
//!
//! - Critical resources are fetched first, then noncritical ones, then prefetches. The order is
//!   the order in which fetches are *initiated*; all of them run concurrently.
//! - A resource whose `depends_on` fields are missing stays [`Pending`](LoadingState::Pending)
//!   and is not fetched. Values provided by loaded resources are merged into the props, which can
//!   unblock pending resources on the next plan.
//! - When a fetch settles for a fingerprint that is no longer the resource's current one, the
//!   result is only kept in the cache and does not change the resource's state.
//!
//! Every consumer registers itself for each fingerprint it holds, and unregisters once it no
//! longer needs it. Dropping the [`Consumer`] releases everything.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::task::AbortHandle;

use crate::caching::{CacheKey, FetchOutcome, ModelCache, RequestOptions, Requester};
use crate::error::FetchError;
use crate::model::{Model, ModelRegistry, ModelType};
use crate::types::{ConsumerId, LoadingState, Props};

mod config;
mod plan;
mod state;

pub use config::{Measure, Provide, ResourceConfig, ResourceMap};
pub use plan::Tier;
pub use state::{ResourceView, ResourcesState};

use plan::Descriptor;
use state::Aggregate;

type Builder = Arc<dyn Fn(&Props) -> ResourceMap + Send + Sync>;
type Sink = Arc<dyn Fn(&ResourcesState) + Send + Sync>;

/// Drives resource plans for mounted consumers.
#[derive(Clone)]
pub struct Orchestrator {
    requester: Requester,
    registry: Arc<ModelRegistry>,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Orchestrator")
            .field("requester", &self.requester)
            .field("registry", &self.registry)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(requester: Requester, registry: ModelRegistry) -> Self {
        Self {
            requester,
            registry: Arc::new(registry),
        }
    }

    pub fn requester(&self) -> &Requester {
        &self.requester
    }

    fn cache(&self) -> &ModelCache {
        self.requester.cache()
    }

    /// Mounts a consumer.
    ///
    /// `builder` is evaluated against the consumer's props every time the plan is computed, and
    /// `sink` receives a new [`ResourcesState`] whenever something changed. The initial state is
    /// pushed before this returns.
    ///
    /// This has to be called from within a Tokio runtime.
    pub fn mount<B, S>(&self, builder: B, inputs: Props, sink: S) -> Consumer
    where
        B: Fn(&Props) -> ResourceMap + Send + Sync + 'static,
        S: Fn(&ResourcesState) + Send + Sync + 'static,
    {
        let shared = Arc::new(Shared {
            id: ConsumerId::new(),
            orchestrator: self.clone(),
            builder: Arc::new(builder),
            sink: Arc::new(sink),
            inner: Mutex::new(ConsumerInner {
                inputs,
                ..Default::default()
            }),
        });
        tracing::debug!(consumer = %shared.id, "Mounted consumer");
        shared.replan(|_| ());
        Consumer { shared }
    }
}

/// A mounted consumer.
///
/// Dropping the consumer unregisters it from every cache entry it holds. Fetches that are still
/// running complete in the background and only update the cache.
pub struct Consumer {
    shared: Arc<Shared>,
}

impl fmt::Debug for Consumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Consumer")
            .field("id", &self.shared.id)
            .finish_non_exhaustive()
    }
}

impl Consumer {
    pub fn id(&self) -> ConsumerId {
        self.shared.id
    }

    /// Replaces the external inputs and recomputes the plan.
    pub fn update(&self, inputs: Props) {
        self.shared.replan(|inner| inner.inputs = inputs);
    }

    /// Fetches the named resources again, bypassing the cache.
    ///
    /// Resources that are pending, supplied or unknown are skipped.
    pub fn refetch<S: AsRef<str>>(&self, names: &[S]) {
        self.shared.refetch(names);
    }

    /// Supplies the model for `name` from the outside. It is never fetched and counts as loaded.
    pub fn supply(&self, name: impl Into<String>, model: Arc<dyn Model>) {
        let name = name.into();
        self.shared.replan(|inner| {
            inner.supplied.insert(name, model);
        });
    }

    /// Returns the current state.
    pub fn state(&self) -> ResourcesState {
        self.shared.inner.lock().snapshot()
    }

    /// Unmounts the consumer. Same as dropping it.
    pub fn dispose(self) {}
}

impl Drop for Consumer {
    fn drop(&mut self) {
        self.shared.dispose();
    }
}

/// A fetch to initiate once the consumer lock is released.
struct Dispatch {
    name: String,
    tier: Tier,
    key: CacheKey,
    model_type: Arc<ModelType>,
    options: RequestOptions,
}

struct Entry {
    descriptor: Descriptor,
    key: Option<CacheKey>,
    state: LoadingState,
    status: Option<u16>,
    error: Option<FetchError>,
    model: Option<Arc<dyn Model>>,
    listener: Option<AbortHandle>,
}

impl Entry {
    fn new(descriptor: Descriptor) -> Self {
        Self {
            descriptor,
            key: None,
            state: LoadingState::Pending,
            status: None,
            error: None,
            model: None,
            listener: None,
        }
    }

    fn set_state(&mut self, state: LoadingState) {
        self.state = state;
        self.status = None;
        self.error = None;
    }

    fn stop_listening(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.abort();
        }
    }

    fn view(&self) -> ResourceView {
        ResourceView {
            state: self.state,
            status: self.status,
            error: self.error.clone(),
            model: self.model.clone(),
            cache_key: self.key.clone(),
            critical: self.descriptor.tier == Tier::Critical,
        }
    }
}

#[derive(Default)]
struct ConsumerInner {
    inputs: Props,
    provided: Props,
    entries: BTreeMap<String, Entry>,
    supplied: HashMap<String, Arc<dyn Model>>,
    has_initially_loaded: bool,
    disposed: bool,
}

impl ConsumerInner {
    /// The inputs, overridden by provided values.
    fn props(&self) -> Props {
        let mut props = self.inputs.clone();
        props.extend(self.provided.clone());
        props
    }

    fn holds(&self, key: &CacheKey) -> bool {
        self.entries
            .values()
            .any(|entry| entry.key.as_ref() == Some(key))
    }

    fn snapshot(&mut self) -> ResourcesState {
        let aggregate = Aggregate::from_states(
            self.entries
                .values()
                .filter(|entry| entry.descriptor.tier == Tier::Critical)
                .map(|entry| entry.state),
        );
        self.has_initially_loaded |= aggregate.has_loaded;

        ResourcesState {
            resources: self
                .entries
                .iter()
                .filter(|(_, entry)| entry.descriptor.tier != Tier::Prefetch)
                .map(|(name, entry)| (name.clone(), entry.view()))
                .collect(),
            provided: self.provided.clone(),
            is_loading: aggregate.is_loading,
            has_errored: aggregate.has_errored,
            has_loaded: aggregate.has_loaded,
            has_initially_loaded: self.has_initially_loaded,
        }
    }
}

struct Shared {
    id: ConsumerId,
    orchestrator: Orchestrator,
    builder: Builder,
    sink: Sink,
    inner: Mutex<ConsumerInner>,
}

impl Shared {
    fn cache(&self) -> &ModelCache {
        self.orchestrator.cache()
    }

    /// Unregisters from `key` unless another resource of this consumer still holds it.
    fn release(&self, inner: &ConsumerInner, key: Option<CacheKey>) {
        if let Some(key) = key {
            if !inner.holds(&key) {
                self.cache().unregister(self.id, Some(&key));
            }
        }
    }

    /// Applies `change`, recomputes the plan, initiates new fetches and pushes the new state.
    fn replan(self: &Arc<Self>, change: impl FnOnce(&mut ConsumerInner)) {
        let (dispatches, snapshot) = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }
            change(&mut inner);
            let dispatches = self.plan(&mut inner);
            (dispatches, inner.snapshot())
        };
        self.dispatch(dispatches);
        (self.sink)(&snapshot);
    }

    /// Evaluates the resource map until the provided values stop changing.
    fn plan(self: &Arc<Self>, inner: &mut ConsumerInner) -> Vec<Dispatch> {
        let mut dispatches = Vec::new();
        let mut rounds = 0;

        loop {
            let props = inner.props();
            let descriptors = plan::expand((self.builder)(&props));
            let max_rounds = descriptors.len() + 1;

            let provided_changed = self.apply(inner, descriptors, &mut dispatches);
            rounds += 1;
            if !provided_changed {
                break;
            }
            if rounds >= max_rounds {
                tracing::warn!(consumer = %self.id, "Provided values did not settle");
                break;
            }
        }

        dispatches.sort_by_key(|dispatch| dispatch.tier);
        dispatches
    }

    /// Reconciles the entries with `descriptors`. Returns whether any provided value changed.
    fn apply(
        self: &Arc<Self>,
        inner: &mut ConsumerInner,
        descriptors: Vec<Descriptor>,
        dispatches: &mut Vec<Dispatch>,
    ) -> bool {
        let removed: Vec<String> = inner
            .entries
            .keys()
            .filter(|name| !descriptors.iter().any(|d| &d.name == *name))
            .cloned()
            .collect();
        for name in removed {
            if let Some(mut entry) = inner.entries.remove(&name) {
                entry.stop_listening();
                dispatches.retain(|dispatch| dispatch.name != name);
                self.release(inner, entry.key);
            }
        }

        let mut provided_changed = false;
        for descriptor in descriptors {
            provided_changed |= self.apply_one(inner, descriptor, dispatches);
        }
        provided_changed
    }

    fn apply_one(
        self: &Arc<Self>,
        inner: &mut ConsumerInner,
        descriptor: Descriptor,
        dispatches: &mut Vec<Dispatch>,
    ) -> bool {
        let name = descriptor.name.clone();
        let supplied = inner.supplied.get(&name).cloned();
        let model_type = self.orchestrator.registry.get(&descriptor.model_key);
        let unmet = descriptor.unmet_dependency().map(str::to_owned);

        let entry = inner
            .entries
            .entry(name.clone())
            .or_insert_with(|| Entry::new(descriptor.clone()));
        entry.descriptor = descriptor;

        // every branch but the last one leaves the entry without a fingerprint
        let next = if let Some(model) = supplied {
            Next::Supplied(model)
        } else if let Some(field) = unmet {
            Next::Pending(field)
        } else if let Some(model_type) = model_type {
            let key = CacheKey::for_model(&model_type, &entry.descriptor.payload);
            if entry.key.as_ref() == Some(&key) {
                return false;
            }
            Next::Fetch(key, model_type)
        } else {
            Next::Unknown
        };

        if !matches!(next, Next::Fetch(..)) && entry.key.is_none() {
            // nothing to release, only make sure the state is right
            let unchanged = match &next {
                Next::Supplied(model) => {
                    entry.model.as_ref().is_some_and(|m| Arc::ptr_eq(m, model))
                }
                Next::Pending(_) => entry.state == LoadingState::Pending,
                Next::Unknown => entry.state == LoadingState::Error,
                Next::Fetch(..) => false,
            };
            if unchanged {
                return false;
            }
        }

        entry.stop_listening();
        let previous = entry.key.take();
        dispatches.retain(|dispatch| dispatch.name != name);

        let provided_changed = match next {
            Next::Supplied(model) => {
                entry.set_state(LoadingState::Loaded);
                let changed = provide(&mut inner.provided, &entry.descriptor, model.as_ref());
                entry.model = Some(model);
                changed
            }
            Next::Pending(field) => {
                tracing::trace!(consumer = %self.id, resource = %name, field = %field, "Dependency unmet");
                entry.set_state(LoadingState::Pending);
                entry.model = None;
                false
            }
            Next::Unknown => {
                let model_key = entry.descriptor.model_key.clone();
                tracing::error!(consumer = %self.id, resource = %name, model_key = %model_key, "Unknown model");
                entry.set_state(LoadingState::Error);
                entry.error = Some(FetchError::UnknownModel(model_key));
                entry.model = None;
                false
            }
            Next::Fetch(key, model_type) => {
                entry.key = Some(key.clone());
                let cached = match entry.descriptor.force_fetch {
                    true => None,
                    false => self.orchestrator.requester.peek(&key),
                };

                match cached {
                    Some(model) => {
                        tracing::trace!(consumer = %self.id, resource = %name, cache_key = %key, "Resolved from cache");
                        self.cache().register(self.id, &key);
                        entry.set_state(LoadingState::Loaded);
                        entry.listener = self.listen(&entry.descriptor, &model);
                        let changed =
                            provide(&mut inner.provided, &entry.descriptor, model.as_ref());
                        entry.model = Some(model);
                        changed
                    }
                    None => {
                        entry.set_state(LoadingState::Loading);
                        entry.model = None;
                        dispatches.push(self.prepare(&entry.descriptor, key, model_type, false));
                        false
                    }
                }
            }
        };

        self.release(inner, previous);
        provided_changed
    }

    fn prepare(
        &self,
        descriptor: &Descriptor,
        key: CacheKey,
        model_type: Arc<ModelType>,
        refetch: bool,
    ) -> Dispatch {
        Dispatch {
            name: descriptor.name.clone(),
            tier: descriptor.tier,
            key,
            model_type,
            options: RequestOptions {
                consumer: Some(self.id),
                payload: descriptor.payload.clone(),
                force_fetch: refetch || descriptor.force_fetch,
                lazy: !refetch && descriptor.lazy,
                measure: descriptor.measure.applies(&descriptor.payload),
                resource_name: Some(descriptor.name.clone()),
            },
        }
    }

    /// Initiates the fetches in order and spawns a task settling each of them.
    fn dispatch(self: &Arc<Self>, dispatches: Vec<Dispatch>) {
        for dispatch in dispatches {
            let Dispatch {
                name,
                key,
                model_type,
                options,
                ..
            } = dispatch;
            tracing::trace!(consumer = %self.id, resource = %name, cache_key = %key, "Dispatching");
            let request = self
                .orchestrator
                .requester
                .request(key.clone(), &model_type, options);

            let consumer = Arc::downgrade(self);
            let cache = self.cache().clone();
            let id = self.id;
            tokio::spawn(async move {
                let outcome = request.await;
                match consumer.upgrade() {
                    Some(consumer) => consumer.settle(&name, &key, outcome),
                    // the consumer is gone, only the cache keeps the result
                    None => cache.unregister(id, Some(&key)),
                }
            });
        }
    }

    /// Applies the outcome of a fetch for `key` to the resource `name`.
    fn settle(self: &Arc<Self>, name: &str, key: &CacheKey, outcome: FetchOutcome) {
        let (dispatches, snapshot) = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                drop(inner);
                self.cache().unregister(self.id, Some(key));
                return;
            }

            let inner = &mut *inner;
            let Some(entry) = inner
                .entries
                .get_mut(name)
                .filter(|entry| entry.key.as_ref() == Some(key))
            else {
                tracing::debug!(consumer = %self.id, resource = name, cache_key = %key, "Discarded stale response");
                if !inner.holds(key) {
                    self.cache().unregister(self.id, Some(key));
                }
                return;
            };

            let mut provided_changed = false;
            match outcome {
                Ok((model, status)) => {
                    entry.set_state(LoadingState::Loaded);
                    entry.status = status.code;
                    if entry.listener.is_none() {
                        entry.listener = self.listen(&entry.descriptor, &model);
                    }
                    provided_changed =
                        provide(&mut inner.provided, &entry.descriptor, model.as_ref());
                    entry.model = Some(model);
                }
                Err(error) => {
                    entry.set_state(LoadingState::Error);
                    entry.status = error.status_code();
                    entry.error = Some(error);
                    entry.model = None;
                    entry.stop_listening();
                }
            }

            let dispatches = match provided_changed {
                true => self.plan(inner),
                false => Vec::new(),
            };
            (dispatches, inner.snapshot())
        };

        self.dispatch(dispatches);
        (self.sink)(&snapshot);
    }

    fn refetch<S: AsRef<str>>(self: &Arc<Self>, names: &[S]) {
        let (dispatches, snapshot) = {
            let mut inner = self.inner.lock();
            if inner.disposed {
                return;
            }

            let mut dispatches = Vec::new();
            for name in names {
                let name = name.as_ref();
                if inner.supplied.contains_key(name) {
                    continue;
                }
                let Some(entry) = inner.entries.get_mut(name) else {
                    continue;
                };
                let Some(key) = entry.key.clone() else {
                    continue;
                };
                let Some(model_type) = self
                    .orchestrator
                    .registry
                    .get(&entry.descriptor.model_key)
                else {
                    continue;
                };

                entry.set_state(LoadingState::Loading);
                dispatches.push(self.prepare(&entry.descriptor, key, model_type, true));
            }

            dispatches.sort_by_key(|dispatch| dispatch.tier);
            (dispatches, inner.snapshot())
        };

        self.dispatch(dispatches);
        (self.sink)(&snapshot);
    }

    /// Starts pushing new states whenever `model` changes, if the resource listens.
    fn listen(
        self: &Arc<Self>,
        descriptor: &Descriptor,
        model: &Arc<dyn Model>,
    ) -> Option<AbortHandle> {
        if !descriptor.listen {
            return None;
        }
        let mut changes = model.subscribe()?;
        let consumer = Arc::downgrade(self);
        let name = descriptor.name.clone();

        let task = tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let Some(consumer) = Weak::upgrade(&consumer) else {
                    break;
                };
                consumer.model_changed(&name);
            }
        });
        Some(task.abort_handle())
    }

    fn model_changed(self: &Arc<Self>, name: &str) {
        tracing::trace!(consumer = %self.id, resource = name, "Model changed");
        self.replan(|inner| {
            let inner = &mut *inner;
            if let Some(entry) = inner.entries.get(name) {
                if let Some(model) = &entry.model {
                    provide(&mut inner.provided, &entry.descriptor, model.as_ref());
                }
            }
        });
    }

    fn dispose(&self) {
        let mut inner = self.inner.lock();
        if inner.disposed {
            return;
        }
        inner.disposed = true;
        for entry in inner.entries.values_mut() {
            entry.stop_listening();
        }
        inner.entries.clear();
        drop(inner);

        self.cache().unregister(self.id, None);
        tracing::debug!(consumer = %self.id, "Disposed consumer");
    }
}

enum Next {
    Supplied(Arc<dyn Model>),
    Pending(String),
    Unknown,
    Fetch(CacheKey, Arc<ModelType>),
}

/// Runs the provide transforms of `descriptor` and stores their values.
///
/// Returns whether any provided value changed.
fn provide(provided: &mut Props, descriptor: &Descriptor, model: &dyn Model) -> bool {
    let mut changed = false;
    let mut set = |prop: String, value: Value| {
        if value.is_null() || provided.get(&prop) == Some(&value) {
            return;
        }
        provided.insert(prop, value);
        changed = true;
    };

    for provide in &descriptor.provides {
        match provide {
            Provide::Named(prop, f) => {
                if let Some(value) = f(model) {
                    set(prop.clone(), value);
                }
            }
            Provide::Spread(f) => {
                if let Some(Value::Object(values)) = f(model) {
                    for (prop, value) in values {
                        set(prop, value);
                    }
                }
            }
        }
    }
    changed
}
