use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::channel::oneshot;
use futures::future::{self, BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use sentry::{Hub, SentryFutureExt};
use tokio::time::Instant;

use super::{CacheKey, ModelCache};
use crate::config::{Hooks, TrackEvent};
use crate::error::FetchError;
use crate::model::{FetchRequest, Model, ModelType};
use crate::types::{ConsumerId, FetchStatus, Payload};
use crate::utils::futures::CallOnDrop;

/// The value every caller of [`Requester::request`] resolves to.
pub type FetchOutcome = Result<(Arc<dyn Model>, FetchStatus), FetchError>;

type FetchChannel = Shared<oneshot::Receiver<FetchOutcome>>;
type FetchMap = Arc<Mutex<HashMap<CacheKey, FetchChannel>>>;

/// The event name reported to the tracking hook for measured fetches.
pub const FETCH_EVENT: &str = "API Fetch";

/// Per-call options for [`Requester::request`].
#[derive(Clone, Debug, Default)]
pub struct RequestOptions {
    /// The consumer to register once the request resolves.
    pub consumer: Option<ConsumerId>,
    /// The payload handed to model construction and to [`Model::fetch`].
    pub payload: Payload,
    /// Bypass a cached entry and fetch again.
    pub force_fetch: bool,
    /// Construct the model without fetching, unless it is cached already.
    pub lazy: bool,
    /// Report the fetch duration to the tracking hook.
    pub measure: bool,
    /// The resource name reported alongside measurements.
    pub resource_name: Option<String>,
}

/// Fetches models through the [`ModelCache`], coalescing concurrent fetches for the same key.
#[derive(Clone)]
pub struct Requester {
    cache: ModelCache,
    hooks: Hooks,

    /// Used for deduplicating concurrent fetches.
    in_flight: FetchMap,
}

impl fmt::Debug for Requester {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Requester")
            .field("cache", &self.cache)
            .field("in_flight", &self.in_flight.lock().len())
            .finish()
    }
}

impl Requester {
    pub fn new(cache: ModelCache, hooks: Hooks) -> Self {
        Self {
            cache,
            hooks,
            in_flight: Default::default(),
        }
    }

    pub fn cache(&self) -> &ModelCache {
        &self.cache
    }

    /// Returns whether a fetch for `key` is currently running.
    pub fn is_in_flight(&self, key: &CacheKey) -> bool {
        self.in_flight.lock().contains_key(key)
    }

    /// Returns the cached model for `key` if it can be used without fetching.
    ///
    /// Lazily constructed models and models with a running fetch do not count.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<dyn Model>> {
        let in_flight = self.in_flight.lock();
        if in_flight.contains_key(key) || self.cache.is_lazy(key) {
            return None;
        }
        self.cache.get(key)
    }

    /// Requests the model for `key`.
    ///
    /// In order, the request:
    ///
    /// - constructs and caches the model without fetching, when `lazy` is set and nothing is
    ///   cached yet. The entry is tagged as lazy.
    /// - joins a fetch that is already running for the same key, even with `force_fetch`.
    /// - constructs and caches the model without fetching, when the model type is unfetched.
    /// - resolves with the cached model, unless `force_fetch` is set or the entry is lazy.
    /// - otherwise stores the model right away and fetches it. A failed fetch removes the entry.
    ///
    /// A successful resolution registers the consumer, if one is given.
    ///
    /// NOTE: This function itself is *not* `async`, because it should eagerly start the fetch,
    /// even if the returned future is never awaited.
    pub fn request(
        &self,
        key: CacheKey,
        model_type: &ModelType,
        options: RequestOptions,
    ) -> BoxFuture<'static, FetchOutcome> {
        let consumer = options.consumer;

        let (channel, started) = {
            let mut in_flight = self.in_flight.lock();

            if options.lazy && !self.cache.contains(&key) {
                let model = model_type.construct(&options.payload);
                self.cache.put(key.clone(), Arc::clone(&model), consumer);
                self.cache.mark_lazy(&key);
                tracing::trace!(cache_key = %key, "Constructed lazy model");
                metric!(counter("resources.request") += 1, "outcome" => "lazy");
                return resolved(model);
            }

            if let Some(channel) = in_flight.get(&key) {
                tracing::trace!(cache_key = %key, "Joined in-flight fetch");
                metric!(counter("resources.request") += 1, "outcome" => "coalesced");
                (channel.clone(), None)
            } else if !model_type.should_fetch() {
                let model = self
                    .cache
                    .get(&key)
                    .unwrap_or_else(|| model_type.construct(&options.payload));
                self.cache.put(key.clone(), Arc::clone(&model), consumer);
                metric!(counter("resources.request") += 1, "outcome" => "unfetched");
                return resolved(model);
            } else if let Some(model) = self.cached(&key, &options) {
                if let Some(consumer) = consumer {
                    self.cache.register(consumer, &key);
                }
                tracing::trace!(cache_key = %key, "Resolved from cache");
                metric!(counter("resources.request") += 1, "outcome" => "cached");
                return resolved(model);
            } else {
                self.cache.take_lazy(&key);
                let model = self
                    .cache
                    .get(&key)
                    .unwrap_or_else(|| model_type.construct(&options.payload));
                // store right away, so that the entry is held while the fetch is running
                self.cache.put(key.clone(), Arc::clone(&model), consumer);

                let (sender, receiver) = oneshot::channel();
                let channel = receiver.shared();
                let evicted = in_flight.insert(key.clone(), channel.clone());
                debug_assert!(evicted.is_none());
                metric!(counter("resources.request") += 1, "outcome" => "fetch");
                (channel, Some((model, sender)))
            }
        };

        if let Some((model, sender)) = started {
            self.spawn_fetch(key.clone(), model, model_type, options, sender);
        }

        let cache = self.cache.clone();
        let future = channel.map(move |outcome| {
            let outcome = outcome.unwrap_or(Err(FetchError::Canceled));
            if let (Ok(_), Some(consumer)) = (&outcome, consumer) {
                cache.register(consumer, &key);
            }
            outcome
        });

        Box::pin(future)
    }

    fn cached(&self, key: &CacheKey, options: &RequestOptions) -> Option<Arc<dyn Model>> {
        if options.force_fetch {
            return None;
        }
        // a lazy entry only satisfies other lazy requests
        if !options.lazy && self.cache.is_lazy(key) {
            return None;
        }
        self.cache.get(key)
    }

    /// Starts the fetch and spawns a task that publishes its outcome on `sender`.
    fn spawn_fetch(
        &self,
        key: CacheKey,
        model: Arc<dyn Model>,
        model_type: &ModelType,
        options: RequestOptions,
        sender: oneshot::Sender<FetchOutcome>,
    ) {
        let in_flight = Arc::clone(&self.in_flight);
        let remove_fetch_token = CallOnDrop::new({
            let key = key.clone();
            move || {
                in_flight.lock().remove(&key);
            }
        });

        let measure = options.measure || model_type.should_measure();
        let request = self.hooks.prefilter(FetchRequest {
            key: key.clone(),
            payload: options.payload,
        });

        tracing::debug!(cache_key = %key, "Fetching model");
        let fetch = model.fetch(&request);
        let started = Instant::now();

        let cache = self.cache.clone();
        let hooks = self.hooks.clone();
        let resource_name = options.resource_name;
        let task = async move {
            let result = fetch.await;

            if measure {
                let duration = started.elapsed();
                metric!(timer("resources.fetch.duration") = duration);
                let event = TrackEvent {
                    resource_name,
                    payload: request.payload,
                    duration_ms: duration.as_millis() as u64,
                };
                hooks.track(FETCH_EVENT, &event);
            }

            let outcome = match result {
                Ok(status) => {
                    // the entry may have been evicted while the fetch was running
                    if cache.restore(key.clone(), Arc::clone(&model)) {
                        tracing::debug!(cache_key = %key, "Restored model evicted during fetch");
                    }
                    Ok((model, status))
                }
                Err(error) => {
                    // failed fetches are never cached
                    cache.remove(&key);
                    tracing::warn!(cache_key = %key, error = %error, "Fetch failed");
                    metric!(counter("resources.fetch.failed") += 1);
                    hooks.log_error(&key, &error);
                    Err(error)
                }
            };

            // Drop the token first to evict from the map. This ensures that callers either
            // get a channel that will receive data, or they start a new fetch.
            drop(remove_fetch_token);
            sender.send(outcome).ok();
        }
        .bind_hub(Hub::new_from_top(Hub::current()));

        tokio::spawn(task);
    }
}

fn resolved(model: Arc<dyn Model>) -> BoxFuture<'static, FetchOutcome> {
    Box::pin(future::ready(Ok((model, FetchStatus::default()))))
}
