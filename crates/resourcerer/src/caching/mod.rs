//! # Caching infrastructure
//!
//! Models are shared between all consumers that ask for the same data. This module holds the
//! pieces that make this sharing work:
//!
//! - [`CacheKey`] is the fingerprint of a model instance. It is derived from the dependency
//!   fields declared on the [`ModelType`](crate::model::ModelType), resolved against the
//!   resource payload, so that two resources asking for the same data end up with the same key.
//! - [`ModelCache`] is a reference-counted map from fingerprint to model. Every entry remembers
//!   its consumers. When the last consumer goes away, a timer removes the entry after a grace
//!   period. Any registration before the timer fires cancels it, and the very same model instance
//!   keeps being served.
//! - [`Requester`] sits in front of the cache. It serves cached models, constructs lazy and
//!   unfetched models without any I/O, and deduplicates concurrent fetches: every caller asking
//!   for a key while a fetch is running gets the result of that single fetch.
//!
//! ## Failures
//!
//! Failed fetches are never cached. The entry is removed as soon as the fetch fails, and every
//! caller waiting on it receives a clone of the [`FetchError`](crate::error::FetchError).
//!
//! ### Metrics
//!
//! - `resources.request`: All requests, tagged with `outcome` (`lazy`, `coalesced`, `cached`,
//!   `unfetched` or `fetch`).
//! - `resources.fetch.failed`: Fetches that failed.
//! - `resources.fetch.duration`: Duration of measured fetches.
//! - `resources.cache.put`, `resources.cache.removed`, `resources.cache.evicted`: Cache entry
//!   bookkeeping.

mod cache_key;
mod model_cache;
mod request;

pub use cache_key::{CacheKey, CacheKeyBuilder};
pub use model_cache::{DEFAULT_GRACE_PERIOD, ModelCache};
pub use request::{FETCH_EVENT, FetchOutcome, RequestOptions, Requester};
