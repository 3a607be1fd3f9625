use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use resourcerer::config::CacheConfig;
use resourcerer::{
    CacheKey, Config, Hooks, ModelRegistry, Payload, RequestOptions, ResourceConfig, ResourceMap,
    Services,
};
use resourcerer_test::{MockTransport, StateLog, settle, setup, sleep_past};

use crate::{model_type, props, services};

fn user_resources(props: &resourcerer::Props) -> ResourceMap {
    let mut user = ResourceConfig::new().depends_on("id");
    if let Some(id) = props.get("id") {
        user = user.data("id", id.clone());
    }
    ResourceMap::from([("user".into(), user)])
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_consumers_share_one_fetch() {
    setup();
    let transport = MockTransport::new();
    transport.set_latency(Duration::from_millis(100));
    let services = services(ModelRegistry::new().with(model_type("user", &["id"], &transport)));
    let orchestrator = &services.orchestrator;

    let consumers: Vec<_> = (0..5)
        .map(|_| orchestrator.mount(user_resources, props(&[("id", json!(1))]), |_| {}))
        .collect();
    sleep_past(Duration::from_millis(100)).await;

    assert_eq!(transport.calls(), vec!["user~id=1"]);
    let models: Vec<_> = consumers
        .iter()
        .map(|consumer| consumer.state().get("user").unwrap().model.clone().unwrap())
        .collect();
    assert!(models.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));

    let key = CacheKey::from_raw("user~id=1");
    assert_eq!(services.cache.consumers(&key).len(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_requests_coalesce_to_same_instance() {
    setup();
    let transport = MockTransport::new();
    transport.set_latency(Duration::from_millis(10));
    let user = model_type("user", &["id"], &transport);
    let services = services(ModelRegistry::new());

    let payload = Payload::new().data("id", 3);
    let key = CacheKey::for_model(&user, &payload);
    let options = RequestOptions {
        payload,
        ..Default::default()
    };
    let requests: Vec<_> = (0..3)
        .map(|_| services.requester.request(key.clone(), &user, options.clone()))
        .collect();

    let results = futures::future::join_all(requests).await;
    let models: Vec<_> = results.into_iter().map(|result| result.unwrap().0).collect();
    assert!(models.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(transport.hits("user~id=3"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_failed_fetch_is_not_cached() {
    setup();
    let transport = MockTransport::new();
    transport.fail("user~id=1", 503);
    let services = services(ModelRegistry::new().with(model_type("user", &["id"], &transport)));

    let log = StateLog::new();
    let consumer = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!(1))]), log.sink());
    settle().await;

    let state = consumer.state();
    let user = state.get("user").unwrap();
    assert_eq!(user.state, resourcerer::LoadingState::Error);
    assert_eq!(user.status, Some(503));
    assert!(state.has_errored);
    assert!(services.cache.get(&CacheKey::from_raw("user~id=1")).is_none());

    // no automatic retry
    settle().await;
    assert_eq!(transport.hits("user~id=1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_remount_within_grace_period_reuses_model() {
    setup();
    let transport = MockTransport::new();
    let services = services(ModelRegistry::new().with(model_type("user", &["id"], &transport)));
    let key = CacheKey::from_raw("user~id=1");

    let first = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!(1))]), |_| {});
    settle().await;
    let model = first.state().get("user").unwrap().model.clone().unwrap();
    drop(first);
    assert!(services.cache.has_pending_eviction(&key));

    sleep_past(Duration::from_secs(60)).await;
    let second = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!(1))]), |_| {});

    // served from the cache without a loading state
    let state = second.state();
    let user = state.get("user").unwrap();
    assert_eq!(user.state, resourcerer::LoadingState::Loaded);
    assert!(Arc::ptr_eq(user.model.as_ref().unwrap(), &model));
    assert!(!services.cache.has_pending_eviction(&key));

    sleep_past(Duration::from_secs(300)).await;
    assert!(services.cache.contains(&key));
    assert_eq!(transport.hits("user~id=1"), 1);
}

#[tokio::test(start_paused = true)]
async fn test_eviction_after_grace_period() {
    setup();
    let transport = MockTransport::new();
    let services = services(ModelRegistry::new().with(model_type("user", &["id"], &transport)));
    let key = CacheKey::from_raw("user~id=1");

    let consumer = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!(1))]), |_| {});
    settle().await;
    consumer.dispose();

    sleep_past(services.cache.grace_period()).await;
    assert!(!services.cache.contains(&key));

    let _consumer = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!(1))]), |_| {});
    settle().await;
    assert_eq!(transport.hits("user~id=1"), 2);
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_clears_cache() {
    setup();
    let transport = MockTransport::new();
    let registry = ModelRegistry::new().with(model_type("user", &["id"], &transport));
    let services = services(registry.clone());
    let other = crate::services(registry);

    let _consumer = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!(1))]), |_| {});
    settle().await;
    assert_eq!(services.cache.len(), 1);
    assert!(other.cache.is_empty());

    services.shutdown();
    assert!(services.cache.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_slow_fetch_outliving_grace_period_is_cached() {
    setup();
    let transport = MockTransport::new();
    transport.set_latency(Duration::from_secs(10));
    let config = Config {
        caches: CacheConfig {
            grace_period: Duration::from_secs(2),
        },
        ..Default::default()
    };
    let registry = ModelRegistry::new().with(model_type("user", &["id"], &transport));
    let services = Services::new(&config, Hooks::new(), registry);
    let key = CacheKey::from_raw("user~id=A");

    let consumer = services
        .orchestrator
        .mount(user_resources, props(&[("id", json!("A"))]), |_| {});
    consumer.update(props(&[("id", json!("B"))]));

    // the released entry is evicted while its fetch is still running
    sleep_past(Duration::from_secs(2)).await;
    assert!(!services.cache.contains(&key));

    sleep_past(Duration::from_secs(8)).await;
    assert!(services.cache.contains(&key));
    assert!(services.cache.consumers(&key).is_empty());
    assert!(services.cache.has_pending_eviction(&key));
    assert_eq!(transport.hits("user~id=A"), 1);

    let state = consumer.state();
    let user = state.get("user").unwrap();
    assert_eq!(user.state, resourcerer::LoadingState::Loaded);
}
