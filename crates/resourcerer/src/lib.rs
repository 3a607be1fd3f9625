//! Declarative resource fetching with a shared, reference-counted model cache.
//!
//! The crate is layered bottom-up:
//!
//! - [`caching`] builds fingerprints, stores models with delayed eviction and coalesces
//!   concurrent fetches for the same fingerprint.
//! - [`resources`] turns a declarative resource map into a prioritized fetch plan and tracks
//!   per-resource and aggregate loading states for each mounted consumer.
//! - [`services`] wires both together into one explicitly owned unit.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod error;
pub mod logging;
pub mod model;
pub mod resources;
pub mod services;
pub mod types;
pub mod utils;


pub use caching::{CacheKey, ModelCache, RequestOptions, Requester};
pub use config::{Config, Hooks, TrackEvent};
pub use error::FetchError;
pub use model::{DependencyField, FetchRequest, Model, ModelRegistry, ModelType};
pub use resources::{Consumer, Orchestrator, ResourceConfig, ResourceMap, ResourcesState};
pub use services::Services;
pub use types::{ConsumerId, FetchStatus, LoadingState, Payload, Props};
