//! Helpers for testing resource fetching without any network.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that all console output
//!    is captured by the test runner.
//!
//!  - Tests that depend on timing should run with a paused clock
//!    (`#[tokio::test(start_paused = true)]`). Use [`settle`] to let all spawned fetches and
//!    state updates run to completion, and [`sleep_past`] to move past eviction timers.
//!
//!  - [`MockTransport`] records every fetch synchronously, at the moment it is initiated, so
//!    [`MockTransport::calls`] reflects the initiation order even though the fetches themselves
//!    run concurrently.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{Map, Value};
use tokio::sync::watch;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use resourcerer::{FetchError, FetchRequest, FetchStatus, Model, ModelType, ResourcesState};

/// Setup the test environment.
///
///  - Initializes logs: The logger only captures logs from the `resourcerer` crate
///    and mutes all other logs (such as tokio).
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("resourcerer=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// Sleeps just past `duration`, so that timers due at exactly that point have fired.
pub async fn sleep_past(duration: Duration) {
    tokio::time::sleep(duration + Duration::from_millis(1)).await;
    tokio::task::yield_now().await;
}

/// Lets all ready tasks run, including fetches without latency and their state updates.
pub async fn settle() {
    sleep_past(Duration::ZERO).await;
}

/// A response produced by a [`Transport`].
#[derive(Clone, Debug, PartialEq)]
pub struct Response {
    pub status: u16,
    pub body: Value,
}

impl Response {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, body }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Delivers fetches for [`JsonModel`]s.
///
/// `fetch` is called when the fetch is initiated. All I/O happens in the returned future.
pub trait Transport: fmt::Debug + Send + Sync + 'static {
    fn fetch(&self, request: &FetchRequest) -> BoxFuture<'static, Result<Response, FetchError>>;
}

/// A model holding a JSON object, fetched through a [`Transport`].
pub struct JsonModel {
    transport: Arc<dyn Transport>,
    attributes: Arc<Mutex<Map<String, Value>>>,
    changes: Arc<watch::Sender<u64>>,
}

impl fmt::Debug for JsonModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonModel")
            .field("attributes", &self.attributes())
            .finish()
    }
}

impl JsonModel {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let (changes, _) = watch::channel(0);
        Self {
            transport,
            attributes: Default::default(),
            changes: Arc::new(changes),
        }
    }

    pub fn attributes(&self) -> Map<String, Value> {
        self.attributes.lock().unwrap().clone()
    }

    pub fn get(&self, field: &str) -> Option<Value> {
        self.attributes.lock().unwrap().get(field).cloned()
    }

    /// Changes a single attribute locally and notifies listeners.
    pub fn set(&self, field: &str, value: Value) {
        self.attributes.lock().unwrap().insert(field.into(), value);
        self.changes.send_modify(|version| *version += 1);
    }
}

impl Model for JsonModel {
    fn fetch(&self, request: &FetchRequest) -> BoxFuture<'static, Result<FetchStatus, FetchError>> {
        let response = self.transport.fetch(request);
        let attributes = Arc::clone(&self.attributes);
        let changes = Arc::clone(&self.changes);

        Box::pin(async move {
            let response = response.await?;
            if !response.is_success() {
                return Err(FetchError::Status {
                    code: response.status,
                    message: response.body.to_string(),
                });
            }
            if let Value::Object(body) = response.body {
                *attributes.lock().unwrap() = body;
                changes.send_modify(|version| *version += 1);
            }
            Ok(FetchStatus::with_code(response.status))
        })
    }

    fn subscribe(&self) -> Option<watch::Receiver<u64>> {
        Some(self.changes.subscribe())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A model type constructing [`JsonModel`]s fetched through `transport`.
pub fn json_model_type(key: &str, transport: Arc<dyn Transport>) -> ModelType {
    ModelType::new(key, move |_payload| {
        Arc::new(JsonModel::new(Arc::clone(&transport))) as Arc<dyn Model>
    })
}

/// Releases a response held by [`MockTransport::hold`].
#[derive(Debug)]
pub struct Gate(watch::Sender<bool>);

impl Gate {
    pub fn release(&self) {
        self.0.send_replace(true);
    }
}

#[derive(Debug, Default)]
struct MockState {
    calls: Vec<String>,
    responses: HashMap<String, Response>,
    gates: HashMap<String, watch::Receiver<bool>>,
    latency: Duration,
}

/// A scriptable in-memory [`Transport`].
///
/// Responses are configured per fingerprint. Unconfigured fingerprints answer with `200` and
/// the merged request payload as body.
#[derive(Debug, Default)]
pub struct MockTransport {
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::default()
    }

    pub fn respond(&self, key: &str, response: Response) {
        let mut state = self.state.lock().unwrap();
        state.responses.insert(key.into(), response);
    }

    pub fn fail(&self, key: &str, status: u16) {
        self.respond(
            key,
            Response {
                status,
                body: Value::String("mock failure".into()),
            },
        );
    }

    /// Holds every response for `key` until the returned gate is released.
    pub fn hold(&self, key: &str) -> Gate {
        let (sender, receiver) = watch::channel(false);
        self.state.lock().unwrap().gates.insert(key.into(), receiver);
        Gate(sender)
    }

    /// Delays every response by `latency`.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().unwrap().latency = latency;
    }

    /// All fetched fingerprints, in initiation order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn hits(&self, key: &str) -> usize {
        let state = self.state.lock().unwrap();
        state.calls.iter().filter(|call| *call == key).count()
    }
}

impl Transport for MockTransport {
    fn fetch(&self, request: &FetchRequest) -> BoxFuture<'static, Result<Response, FetchError>> {
        let key = request.key.to_string();
        let mut state = self.state.lock().unwrap();
        state.calls.push(key.clone());

        let response = state
            .responses
            .get(&key)
            .cloned()
            .unwrap_or_else(|| Response::ok(Value::Object(request.payload.merged())));
        let gate = state.gates.get(&key).cloned();
        let latency = state.latency;

        Box::pin(async move {
            if let Some(mut gate) = gate {
                // a dropped gate releases as well
                gate.wait_for(|open| *open).await.ok();
            }
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok(response)
        })
    }
}

/// Collects every state pushed to a consumer's sink.
#[derive(Clone, Debug, Default)]
pub struct StateLog {
    states: Arc<Mutex<Vec<ResourcesState>>>,
}

impl StateLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a sink that appends to this log.
    pub fn sink(&self) -> impl Fn(&ResourcesState) + Send + Sync + 'static {
        let states = Arc::clone(&self.states);
        move |state| states.lock().unwrap().push(state.clone())
    }

    pub fn all(&self) -> Vec<ResourcesState> {
        self.states.lock().unwrap().clone()
    }

    pub fn last(&self) -> Option<ResourcesState> {
        self.states.lock().unwrap().last().cloned()
    }

    pub fn len(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
