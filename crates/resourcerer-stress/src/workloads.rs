use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use futures::future::BoxFuture;
use rand::Rng;
use resourcerer::{
    Config, FetchError, FetchRequest, Hooks, ModelRegistry, Props, ResourceConfig, ResourceMap,
    Services,
};
use resourcerer_test::{JsonModel, Response, Transport, json_model_type};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::watch;

/// How long a single operation may take before it is counted as timed out.
const OPERATION_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
pub struct WorkloadsConfig {
    pub workloads: Vec<Workload>,
}

#[derive(Debug, Deserialize)]
pub struct Workload {
    pub concurrency: usize,
    /// Number of consumers mounted together by each operation, all asking for the same ids.
    #[serde(default = "default_consumers")]
    pub consumers: usize,
    pub resources: Vec<ResourceSpec>,
}

fn default_consumers() -> usize {
    1
}

#[derive(Clone, Debug, Deserialize)]
pub struct ResourceSpec {
    pub name: String,
    /// The model key, defaults to `name`.
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_critical")]
    pub critical: bool,
    /// Number of distinct ids to pick from.
    #[serde(default = "default_ids")]
    pub ids: u64,
    /// Another resource whose `id` has to be provided before this one is fetched.
    #[serde(default)]
    pub depends_on: Option<String>,
    #[serde(default, with = "humantime_serde")]
    pub latency: Duration,
    #[serde(default)]
    pub failure_rate: f64,
}

fn default_critical() -> bool {
    true
}

fn default_ids() -> u64 {
    1
}

impl ResourceSpec {
    fn model_key(&self) -> &str {
        self.model.as_deref().unwrap_or(&self.name)
    }
}

/// The prop a resource provides for its dependents.
fn provided_field(name: &str) -> String {
    format!("{name}_id")
}

/// A [`Transport`] answering after a randomized latency, failing at a configured rate.
#[derive(Debug)]
pub struct SimulatedTransport {
    latency: Duration,
    failure_rate: f64,
    fetches: Arc<AtomicUsize>,
}

impl Transport for SimulatedTransport {
    fn fetch(&self, request: &FetchRequest) -> BoxFuture<'static, Result<Response, FetchError>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);

        let (latency, failed) = {
            let mut rng = rand::rng();
            let jitter = rng.random_range(0.5..1.5);
            let failed = rng.random_bool(self.failure_rate.clamp(0.0, 1.0));
            (self.latency.mul_f64(jitter), failed)
        };
        let body = Value::Object(request.payload.merged());

        Box::pin(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if failed {
                return Ok(Response {
                    status: 503,
                    body: Value::String("simulated failure".into()),
                });
            }
            Ok(Response::ok(body))
        })
    }
}

/// A workload with its own set of services.
pub struct PreparedWorkload {
    pub concurrency: usize,
    consumers: usize,
    resources: Arc<[ResourceSpec]>,
    services: Services,
    fetches: Arc<AtomicUsize>,
}

/// The outcome of a single operation.
#[derive(Clone, Copy, Debug)]
pub enum Outcome {
    Loaded,
    Errored,
    TimedOut,
}

pub fn prepare_workload(config: &Config, workload: Workload) -> Result<PreparedWorkload> {
    if workload.concurrency == 0 {
        bail!("workload concurrency must be positive");
    }

    let names: Vec<&str> = workload.resources.iter().map(|r| r.name.as_str()).collect();
    for resource in &workload.resources {
        if let Some(parent) = &resource.depends_on {
            if !names.contains(&parent.as_str()) || parent == &resource.name {
                bail!(
                    "resource `{}` depends on unknown resource `{parent}`",
                    resource.name
                );
            }
        }
    }

    // the first resource using a model defines its transport characteristics
    let fetches = Arc::new(AtomicUsize::new(0));
    let mut model_fields: BTreeMap<&str, (&ResourceSpec, Vec<String>)> = BTreeMap::new();
    for resource in &workload.resources {
        let (_, fields) = model_fields
            .entry(resource.model_key())
            .or_insert_with(|| (resource, vec![]));
        if let Some(parent) = &resource.depends_on {
            fields.push(provided_field(parent));
        }
    }

    let mut registry = ModelRegistry::new();
    for (key, (resource, fields)) in model_fields {
        let transport = Arc::new(SimulatedTransport {
            latency: resource.latency,
            failure_rate: resource.failure_rate,
            fetches: Arc::clone(&fetches),
        });
        let mut model_type = json_model_type(key, transport).dependency("id");
        for field in &fields {
            model_type = model_type.dependency(field.as_str());
        }
        registry.register(model_type);
    }

    Ok(PreparedWorkload {
        concurrency: workload.concurrency,
        consumers: workload.consumers.max(1),
        resources: workload.resources.into(),
        services: Services::new(config, Hooks::default(), registry),
        fetches,
    })
}

fn resource_map(
    resources: &[ResourceSpec],
    ids: &HashMap<String, u64>,
    props: &Props,
) -> ResourceMap {
    let mut map = ResourceMap::new();
    for resource in resources {
        let id = ids.get(&resource.name).copied().unwrap_or_default();
        let mut config = ResourceConfig::new()
            .model(resource.model_key())
            .data("id", id)
            .provides(provided_field(&resource.name), |model| {
                model.downcast_ref::<JsonModel>()?.get("id")
            });

        if !resource.critical {
            config = config.noncritical();
        }
        if let Some(parent) = &resource.depends_on {
            let field = provided_field(parent);
            if let Some(value) = props.get(&field) {
                config = config.data(field.clone(), value.clone());
            }
            config = config.depends_on(field);
        }

        map.insert(resource.name.clone(), config);
    }
    map
}

impl PreparedWorkload {
    /// Number of resources requested by a single operation.
    pub fn requests_per_operation(&self) -> usize {
        self.consumers * self.resources.len()
    }

    /// Fetches that actually reached the transport.
    pub fn transport_fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Mounts the consumers of one operation and waits until all of them loaded or errored.
    pub async fn run_operation(&self) -> Outcome {
        let ids: HashMap<String, u64> = {
            let mut rng = rand::rng();
            self.resources
                .iter()
                .map(|r| (r.name.clone(), rng.random_range(0..r.ids.max(1))))
                .collect()
        };
        let ids = Arc::new(ids);

        let mut mounted = Vec::with_capacity(self.consumers);
        for _ in 0..self.consumers {
            let (done, receiver) = watch::channel(None);
            let resources = Arc::clone(&self.resources);
            let ids = Arc::clone(&ids);

            let consumer = self.services.orchestrator.mount(
                move |props| resource_map(&resources, &ids, props),
                Props::new(),
                move |state| {
                    if state.has_loaded {
                        done.send_replace(Some(Outcome::Loaded));
                    } else if state.has_errored {
                        done.send_replace(Some(Outcome::Errored));
                    }
                },
            );
            mounted.push((consumer, receiver));
        }

        let wait_all = async {
            let mut outcome = Outcome::Loaded;
            for (_, receiver) in &mut mounted {
                let errored = matches!(
                    receiver.wait_for(Option::is_some).await.as_deref(),
                    Ok(Some(Outcome::Errored))
                );
                if errored {
                    outcome = Outcome::Errored;
                }
            }
            outcome
        };
        let outcome = tokio::time::timeout(OPERATION_TIMEOUT, wait_all)
            .await
            .unwrap_or(Outcome::TimedOut);

        for (consumer, _) in mounted {
            consumer.dispose();
        }
        outcome
    }

    pub fn shutdown(&self) {
        self.services.shutdown();
    }
}
