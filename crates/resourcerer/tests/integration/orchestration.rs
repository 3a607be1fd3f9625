use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{Value, json};

use resourcerer::resources::Measure;
use resourcerer::{
    CacheKey, Hooks, LoadingState, Model, ModelRegistry, Payload, Props, ResourceConfig,
    ResourceMap, TrackEvent,
};
use resourcerer_test::{JsonModel, MockTransport, Response, StateLog, settle, setup};

use crate::{model_type, props, services, services_with_hooks};

fn user_resources(props: &Props) -> ResourceMap {
    let mut user = ResourceConfig::new().depends_on("id");
    if let Some(id) = props.get("id") {
        user = user.data("id", id.clone());
    }
    ResourceMap::from([("user".into(), user)])
}

fn attribute(model: &dyn Model, field: &str) -> Option<Value> {
    model.downcast_ref::<JsonModel>()?.get(field)
}

#[tokio::test(start_paused = true)]
async fn test_fetches_are_initiated_by_tier() {
    setup();
    let transport = MockTransport::new();
    let services = services(ModelRegistry::new().with(model_type("item", &["id"], &transport)));

    let log = StateLog::new();
    let consumer = services.orchestrator.mount(
        |_| {
            ResourceMap::from([
                (
                    "a_noncritical".into(),
                    ResourceConfig::new().model("item").data("id", 2).noncritical(),
                ),
                (
                    "z_critical".into(),
                    ResourceConfig::new()
                        .model("item")
                        .data("id", 1)
                        .prefetch(Payload::new().data("id", 3)),
                ),
            ])
        },
        Props::new(),
        log.sink(),
    );

    assert_eq!(transport.calls(), vec!["item~id=1", "item~id=2", "item~id=3"]);
    settle().await;

    let state = consumer.state();
    // prefetches are invisible to the consumer
    assert_eq!(
        state.resources.keys().collect::<Vec<_>>(),
        vec!["a_noncritical", "z_critical"]
    );
    assert!(state.has_loaded);

    // but they are cached and held by the consumer
    let prefetched = CacheKey::from_raw("item~id=3");
    assert_eq!(services.cache.consumers(&prefetched), vec![consumer.id()]);
}

#[tokio::test(start_paused = true)]
async fn test_failed_prefetch_does_not_affect_aggregate() {
    setup();
    let transport = MockTransport::new();
    transport.fail("item~id=2", 500);
    let services = services(ModelRegistry::new().with(model_type("item", &["id"], &transport)));

    let consumer = services.orchestrator.mount(
        |_| {
            ResourceMap::from([(
                "item".into(),
                ResourceConfig::new()
                    .data("id", 1)
                    .prefetch(Payload::new().data("id", 2)),
            )])
        },
        Props::new(),
        |_| {},
    );
    settle().await;

    let state = consumer.state();
    assert_eq!(transport.hits("item~id=2"), 1);
    assert_eq!(state.resources.keys().collect::<Vec<_>>(), vec!["item"]);
    assert_eq!(state.state_of("item"), Some(LoadingState::Loaded));
    assert!(state.has_loaded);
    assert!(!state.has_errored);
    assert!(!services.cache.contains(&CacheKey::from_raw("item~id=2")));
}

#[tokio::test(start_paused = true)]
async fn test_stale_response_is_discarded() {
    setup();
    let transport = MockTransport::new();
    let services = services(ModelRegistry::new().with(model_type("user", &["id"], &transport)));
    let gate = transport.hold("user~id=A");

    let log = StateLog::new();
    let consumer = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!("A"))]), log.sink());
    settle().await;
    assert_eq!(consumer.state().state_of("user"), Some(LoadingState::Loading));

    consumer.update(props(&[("id", json!("B"))]));
    settle().await;

    gate.release();
    settle().await;

    let state = consumer.state();
    let user = state.get("user").unwrap();
    assert_eq!(user.state, LoadingState::Loaded);
    assert_eq!(user.cache_key, Some(CacheKey::from_raw("user~id=B")));
    assert_eq!(
        attribute(user.model.as_deref().unwrap(), "id"),
        Some(json!("B"))
    );

    // no pushed state ever showed the stale response
    let stale = CacheKey::from_raw("user~id=A");
    assert!(log.all().iter().all(|state| {
        let user = state.get("user").unwrap();
        user.state != LoadingState::Loaded || user.cache_key.as_ref() != Some(&stale)
    }));

    // the cache still gained the stale entry, without this consumer holding it
    assert!(services.cache.contains(&stale));
    assert!(services.cache.consumers(&stale).is_empty());
    assert!(services.cache.has_pending_eviction(&stale));
}

#[tokio::test(start_paused = true)]
async fn test_dependency_unblocked_by_provided_value() {
    setup();
    let transport = MockTransport::new();
    transport.respond("session", Response::ok(json!({"user_id": 7, "team": "core"})));
    let registry = ModelRegistry::new()
        .with(model_type("session", &[], &transport))
        .with(model_type("profile", &["user_id"], &transport));
    let services = services(registry);

    let log = StateLog::new();
    let consumer = services.orchestrator.mount(
        |props| {
            let mut profile = ResourceConfig::new().depends_on("user_id");
            if let Some(user_id) = props.get("user_id") {
                profile = profile.data("user_id", user_id.clone());
            }
            ResourceMap::from([
                (
                    "session".into(),
                    ResourceConfig::new().provides_all(|model| {
                        let session = model.downcast_ref::<JsonModel>()?;
                        Some(Value::Object(session.attributes()))
                    }),
                ),
                ("profile".into(), profile),
            ])
        },
        Props::new(),
        log.sink(),
    );

    let state = consumer.state();
    assert_eq!(state.state_of("session"), Some(LoadingState::Loading));
    assert_eq!(state.state_of("profile"), Some(LoadingState::Pending));
    assert_eq!(transport.calls(), vec!["session"]);

    settle().await;

    let state = consumer.state();
    assert_eq!(state.state_of("profile"), Some(LoadingState::Loaded));
    assert_eq!(state.provided.get("team"), Some(&json!("core")));
    assert_eq!(transport.calls(), vec!["session", "profile~user_id=7"]);

    let profile_states: Vec<_> = log
        .all()
        .iter()
        .filter_map(|state| state.state_of("profile"))
        .collect();
    assert_eq!(profile_states.first(), Some(&LoadingState::Pending));
    assert!(profile_states.contains(&LoadingState::Loading));
    assert_eq!(profile_states.last(), Some(&LoadingState::Loaded));
}

#[tokio::test(start_paused = true)]
async fn test_dependency_regression_releases_key() {
    setup();
    let transport = MockTransport::new();
    let services = services(ModelRegistry::new().with(model_type("user", &["id"], &transport)));

    let consumer = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!(1))]), |_| {});
    settle().await;
    let key = CacheKey::from_raw("user~id=1");
    assert_eq!(services.cache.consumers(&key), vec![consumer.id()]);

    consumer.update(Props::new());
    let state = consumer.state();
    assert_eq!(state.state_of("user"), Some(LoadingState::Pending));
    assert!(!state.has_loaded);
    assert!(state.has_initially_loaded);
    assert!(services.cache.consumers(&key).is_empty());

    // coming back resolves from the cache right away
    consumer.update(props(&[("id", json!(1))]));
    assert_eq!(consumer.state().state_of("user"), Some(LoadingState::Loaded));
    assert_eq!(transport.hits("user~id=1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_noncritical_error_is_excluded_from_aggregate() {
    setup();
    let transport = MockTransport::new();
    transport.fail("feed", 500);
    let registry = ModelRegistry::new()
        .with(model_type("user", &[], &transport))
        .with(model_type("feed", &[], &transport));
    let services = services(registry);

    let consumer = services.orchestrator.mount(
        |_| {
            ResourceMap::from([
                ("user".into(), ResourceConfig::new()),
                ("feed".into(), ResourceConfig::new().noncritical()),
            ])
        },
        Props::new(),
        |_| {},
    );
    settle().await;

    let state = consumer.state();
    assert_eq!(state.state_of("user"), Some(LoadingState::Loaded));
    let feed = state.get("feed").unwrap();
    assert_eq!(feed.state, LoadingState::Error);
    assert_eq!(feed.status, Some(500));
    assert!(!feed.critical);
    assert!(state.has_loaded);
    assert!(!state.has_errored);
    assert!(!state.is_loading);
}

#[tokio::test(start_paused = true)]
async fn test_refetch_is_deduplicated() {
    setup();
    let transport = MockTransport::new();
    let services = services(ModelRegistry::new().with(model_type("user", &["id"], &transport)));

    let consumer = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!(1))]), |_| {});
    settle().await;
    let model = consumer.state().get("user").unwrap().model.clone().unwrap();

    let gate = transport.hold("user~id=1");
    consumer.refetch(&["user"]);
    consumer.refetch(&["user", "unknown"]);

    let state = consumer.state();
    assert_eq!(state.state_of("user"), Some(LoadingState::Loading));
    assert!(state.is_loading);
    assert!(!state.has_loaded);
    assert!(state.has_initially_loaded);
    assert_eq!(transport.hits("user~id=1"), 2);

    gate.release();
    settle().await;

    let state = consumer.state();
    let user = state.get("user").unwrap();
    assert_eq!(user.state, LoadingState::Loaded);
    assert!(Arc::ptr_eq(user.model.as_ref().unwrap(), &model));
    assert_eq!(transport.hits("user~id=1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_late_response_after_dispose() {
    setup();
    let transport = MockTransport::new();
    let services = services(ModelRegistry::new().with(model_type("user", &["id"], &transport)));
    let gate = transport.hold("user~id=1");

    let log = StateLog::new();
    let consumer = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!(1))]), log.sink());
    settle().await;
    let pushed = log.len();

    drop(consumer);
    gate.release();
    settle().await;

    assert_eq!(log.len(), pushed);
    let key = CacheKey::from_raw("user~id=1");
    assert!(services.cache.contains(&key));
    assert!(services.cache.consumers(&key).is_empty());
    assert!(services.cache.has_pending_eviction(&key));
}

#[tokio::test(start_paused = true)]
async fn test_lazy_resource_is_fetched_by_next_consumer() {
    setup();
    let transport = MockTransport::new();
    let services = services(ModelRegistry::new().with(model_type("draft", &[], &transport)));

    let lazy = services.orchestrator.mount(
        |_| ResourceMap::from([("draft".into(), ResourceConfig::new().lazy())]),
        Props::new(),
        |_| {},
    );
    settle().await;
    let state = lazy.state();
    assert_eq!(state.state_of("draft"), Some(LoadingState::Loaded));
    assert!(transport.calls().is_empty());

    let eager = services.orchestrator.mount(
        |_| ResourceMap::from([("draft".into(), ResourceConfig::new())]),
        Props::new(),
        |_| {},
    );
    assert_eq!(eager.state().state_of("draft"), Some(LoadingState::Loading));
    settle().await;

    assert_eq!(transport.hits("draft"), 1);
    let lazy_model = state.get("draft").unwrap().model.clone().unwrap();
    let eager_model = eager.state().get("draft").unwrap().model.clone().unwrap();
    assert!(Arc::ptr_eq(&lazy_model, &eager_model));
}

#[tokio::test(start_paused = true)]
async fn test_force_fetch_bypasses_cache() {
    setup();
    let transport = MockTransport::new();
    let services = services(ModelRegistry::new().with(model_type("user", &["id"], &transport)));

    let _first = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!(1))]), |_| {});
    settle().await;

    let forced = services.orchestrator.mount(
        |_| {
            ResourceMap::from([(
                "user".into(),
                ResourceConfig::new().data("id", 1).force_fetch(),
            )])
        },
        Props::new(),
        |_| {},
    );
    assert_eq!(forced.state().state_of("user"), Some(LoadingState::Loading));
    settle().await;

    assert_eq!(forced.state().state_of("user"), Some(LoadingState::Loaded));
    assert_eq!(transport.hits("user~id=1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_listen_pushes_model_changes() {
    setup();
    let transport = MockTransport::new();
    let services = services(ModelRegistry::new().with(model_type("user", &[], &transport)));

    let listening = StateLog::new();
    let consumer = services.orchestrator.mount(
        |_| {
            ResourceMap::from([(
                "user".into(),
                ResourceConfig::new()
                    .data("name", "before")
                    .listen()
                    .provides("name", |model| attribute(model, "name")),
            )])
        },
        Props::new(),
        listening.sink(),
    );
    let quiet = StateLog::new();
    let _other = services.orchestrator.mount(
        |_| ResourceMap::from([("user".into(), ResourceConfig::new())]),
        Props::new(),
        quiet.sink(),
    );
    settle().await;

    let pushed = listening.len();
    let quiet_pushed = quiet.len();
    let state = consumer.state();
    assert_eq!(state.provided.get("name"), Some(&json!("before")));

    let user = state.model::<JsonModel>("user").unwrap();
    user.set("name", json!("after"));
    settle().await;

    assert!(listening.len() > pushed);
    assert_eq!(quiet.len(), quiet_pushed);
    let last = listening.last().unwrap();
    assert_eq!(last.provided.get("name"), Some(&json!("after")));
}

#[tokio::test(start_paused = true)]
async fn test_measured_fetches_are_tracked() {
    setup();
    let transport = MockTransport::new();
    transport.set_latency(Duration::from_millis(250));
    let tracked: Arc<Mutex<Vec<(String, TrackEvent)>>> = Default::default();
    let hooks = Hooks::new().on_track({
        let tracked = Arc::clone(&tracked);
        move |name, event| tracked.lock().unwrap().push((name.to_owned(), event.clone()))
    });
    let registry = ModelRegistry::new().with(model_type("item", &["id"], &transport));
    let services = services_with_hooks(registry, hooks);

    let _consumer = services.orchestrator.mount(
        |_| {
            let only_first = Measure::When(Arc::new(|payload: &Payload| {
                payload.resolve("id") == Some(&json!(1))
            }));
            ResourceMap::from([
                (
                    "first".into(),
                    ResourceConfig::new()
                        .model("item")
                        .data("id", 1)
                        .measure(only_first.clone()),
                ),
                (
                    "second".into(),
                    ResourceConfig::new()
                        .model("item")
                        .data("id", 2)
                        .measure(only_first),
                ),
            ])
        },
        Props::new(),
        |_| {},
    );
    tokio::time::sleep(Duration::from_millis(300)).await;

    let tracked = tracked.lock().unwrap();
    assert_eq!(tracked.len(), 1);
    let (name, event) = &tracked[0];
    assert_eq!(name, "API Fetch");
    assert_eq!(event.resource_name.as_deref(), Some("first"));
    assert!(event.duration_ms >= 250);
}

#[tokio::test(start_paused = true)]
async fn test_errors_are_logged_once() {
    setup();
    let transport = MockTransport::new();
    transport.fail("user~id=1", 404);
    let errors: Arc<Mutex<Vec<String>>> = Default::default();
    let hooks = Hooks::new().on_error({
        let errors = Arc::clone(&errors);
        move |key, _error| errors.lock().unwrap().push(key.to_string())
    });
    let services = services_with_hooks(
        ModelRegistry::new().with(model_type("user", &["id"], &transport)),
        hooks,
    );

    let _consumers: Vec<_> = (0..3)
        .map(|_| {
            services
                .orchestrator
                .mount(user_resources, props(&[("id", json!(1))]), |_| {})
        })
        .collect();
    settle().await;

    assert_eq!(*errors.lock().unwrap(), vec!["user~id=1".to_owned()]);
}
