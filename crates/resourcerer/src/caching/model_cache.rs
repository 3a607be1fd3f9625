use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use super::CacheKey;
use crate::config::Config;
use crate::model::Model;
use crate::types::ConsumerId;

/// The default time an entry survives without any consumers.
pub const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(120);

struct PendingEviction {
    token: CancellationToken,
    generation: u64,
}

struct Entry {
    model: Arc<dyn Model>,
    consumers: HashSet<ConsumerId>,
    lazy: bool,
    eviction: Option<PendingEviction>,
}

impl Entry {
    fn cancel_eviction(&mut self) {
        if let Some(eviction) = self.eviction.take() {
            eviction.token.cancel();
        }
    }
}

#[derive(Default)]
struct CacheInner {
    entries: HashMap<CacheKey, Entry>,
    next_generation: u64,
}

impl CacheInner {
    /// Removes the entry if the timer with `generation` is still the one pending for it.
    fn evict(&mut self, key: &CacheKey, generation: u64) {
        let current = self.entries.get(key).and_then(|entry| {
            let eviction = entry.eviction.as_ref()?;
            Some(eviction.generation == generation && entry.consumers.is_empty())
        });

        if current == Some(true) {
            self.entries.remove(key);
            tracing::debug!(cache_key = %key, "Evicted model after grace period");
            metric!(counter("resources.cache.evicted") += 1);
            self.report_size();
        }
    }

    fn report_size(&self) {
        metric!(gauge("resources.cache.entries") = self.entries.len() as u64);
    }
}

/// A reference-counted store of models, keyed by their fingerprint.
///
/// Every entry tracks the consumers interested in it. Once the last consumer goes away, the entry
/// is removed after a grace period, unless a consumer registers again before that.
///
/// Eviction timers run as Tokio tasks, so the cache has to be used from within a runtime.
/// Cloning the cache is cheap and all clones share the same entries.
#[derive(Clone)]
pub struct ModelCache {
    inner: Arc<Mutex<CacheInner>>,
    grace_period: Duration,
}

impl fmt::Debug for ModelCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelCache")
            .field("entries", &self.len())
            .field("grace_period", &self.grace_period)
            .finish()
    }
}

impl Default for ModelCache {
    fn default() -> Self {
        Self::new(DEFAULT_GRACE_PERIOD)
    }
}

impl ModelCache {
    pub fn new(grace_period: Duration) -> Self {
        Self {
            inner: Default::default(),
            grace_period,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.caches.grace_period)
    }

    pub fn grace_period(&self) -> Duration {
        self.grace_period
    }

    pub fn get(&self, key: &CacheKey) -> Option<Arc<dyn Model>> {
        let inner = self.inner.lock();
        inner.entries.get(key).map(|entry| Arc::clone(&entry.model))
    }

    /// Stores `model` under `key`.
    ///
    /// The consumers of a replaced entry are kept. With a `consumer`, it is registered and any
    /// pending eviction is canceled. Without one, an entry that has no consumers is scheduled for
    /// eviction.
    pub fn put(&self, key: CacheKey, model: Arc<dyn Model>, consumer: Option<ConsumerId>) {
        let mut inner = self.inner.lock();
        let entry = inner.entries.entry(key.clone()).or_insert_with(|| Entry {
            model: Arc::clone(&model),
            consumers: HashSet::new(),
            lazy: false,
            eviction: None,
        });
        entry.model = model;
        metric!(counter("resources.cache.put") += 1);

        match consumer {
            Some(consumer) => {
                entry.consumers.insert(consumer);
                entry.cancel_eviction();
            }
            None if entry.consumers.is_empty() && entry.eviction.is_none() => {
                self.schedule_eviction(&mut inner, &key);
            }
            None => {}
        }
        inner.report_size();
    }

    /// Registers `consumer` for an existing entry and cancels its pending eviction.
    ///
    /// Registering for a key without an entry does nothing.
    pub fn register(&self, consumer: ConsumerId, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(entry) = inner.entries.get_mut(key) {
            entry.consumers.insert(consumer);
            if entry.eviction.is_some() {
                tracing::trace!(cache_key = %key, %consumer, "Canceled pending eviction");
                entry.cancel_eviction();
            }
        }
    }

    /// Removes `consumer` from `key`, or from every key if none is given.
    ///
    /// Entries left without consumers are scheduled for eviction. Unregistering a consumer that
    /// was never registered does nothing.
    pub fn unregister(&self, consumer: ConsumerId, key: Option<&CacheKey>) {
        let mut inner = self.inner.lock();

        let released: Vec<CacheKey> = match key {
            Some(key) => {
                let released = inner.entries.get_mut(key).is_some_and(|entry| {
                    entry.consumers.remove(&consumer) && entry.consumers.is_empty()
                });
                released.then(|| key.clone()).into_iter().collect()
            }
            None => inner
                .entries
                .iter_mut()
                .filter_map(|(key, entry)| {
                    let released = entry.consumers.remove(&consumer) && entry.consumers.is_empty();
                    released.then(|| key.clone())
                })
                .collect(),
        };

        for key in released {
            self.schedule_eviction(&mut inner, &key);
        }
    }

    /// Stores `model` under `key` unless an entry exists already.
    ///
    /// The restored entry has no consumers and is scheduled for eviction. Returns whether the
    /// model was stored.
    pub fn restore(&self, key: CacheKey, model: Arc<dyn Model>) -> bool {
        let mut inner = self.inner.lock();
        if inner.entries.contains_key(&key) {
            return false;
        }
        inner.entries.insert(
            key.clone(),
            Entry {
                model,
                consumers: HashSet::new(),
                lazy: false,
                eviction: None,
            },
        );
        inner.report_size();
        self.schedule_eviction(&mut inner, &key);
        true
    }

    /// Removes an entry immediately, canceling its pending eviction.
    pub fn remove(&self, key: &CacheKey) {
        let mut inner = self.inner.lock();
        if let Some(mut entry) = inner.entries.remove(key) {
            entry.cancel_eviction();
            metric!(counter("resources.cache.removed") += 1);
            inner.report_size();
        }
    }

    /// Tags an entry as lazily constructed, meaning it was never actually fetched.
    pub fn mark_lazy(&self, key: &CacheKey) {
        if let Some(entry) = self.inner.lock().entries.get_mut(key) {
            entry.lazy = true;
        }
    }

    /// Clears the lazy tag, returning whether it was set.
    pub fn take_lazy(&self, key: &CacheKey) -> bool {
        match self.inner.lock().entries.get_mut(key) {
            Some(entry) => std::mem::take(&mut entry.lazy),
            None => false,
        }
    }

    pub fn is_lazy(&self, key: &CacheKey) -> bool {
        let inner = self.inner.lock();
        inner.entries.get(key).is_some_and(|entry| entry.lazy)
    }

    pub fn contains(&self, key: &CacheKey) -> bool {
        self.inner.lock().entries.contains_key(key)
    }

    pub fn consumers(&self, key: &CacheKey) -> Vec<ConsumerId> {
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .map(|entry| entry.consumers.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn has_pending_eviction(&self, key: &CacheKey) -> bool {
        let inner = self.inner.lock();
        inner
            .entries
            .get(key)
            .is_some_and(|entry| entry.eviction.is_some())
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes all entries and cancels all pending evictions.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        for (_, mut entry) in inner.entries.drain() {
            entry.cancel_eviction();
        }
        inner.report_size();
    }

    fn schedule_eviction(&self, inner: &mut CacheInner, key: &CacheKey) {
        let generation = inner.next_generation;
        let Some(entry) = inner.entries.get_mut(key) else {
            return;
        };
        inner.next_generation += 1;

        entry.cancel_eviction();
        let token = CancellationToken::new();
        entry.eviction = Some(PendingEviction {
            token: token.clone(),
            generation,
        });

        tracing::trace!(cache_key = %key, "Scheduled eviction");
        let cache: Weak<Mutex<CacheInner>> = Arc::downgrade(&self.inner);
        let key = key.clone();
        let grace_period = self.grace_period;
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(grace_period) => {
                    if let Some(cache) = cache.upgrade() {
                        cache.lock().evict(&key, generation);
                    }
                }
            }
        });
    }
}
