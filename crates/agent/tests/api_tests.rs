//! Integration tests for the agent's HTTP surface

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use remedy_lib::{
    bus::{EventBus, InMemoryBus, Subscription},
    coordinator::{router, CoordinatorState, RemoteCoordinator},
    events::{Channel, Event, HealthAlert},
    health::{components, HealthRegistry},
    http::ops_router,
    store::{CoordinationStore, MemoryStore},
    Emitter, PipelineMetrics, TargetRef,
};
use std::sync::Arc;
use std::time::Duration;
use tower::ServiceExt;

fn setup_test_app() -> (Router, HealthRegistry) {
    let health_registry = HealthRegistry::new();
    health_registry.register(components::BUS);
    health_registry.register(components::STORE);
    health_registry.register(components::STAGE);

    // Touch the metrics so the registry has families to encode
    let _ = PipelineMetrics::new();
    let router = ops_router(health_registry.clone());

    (router, health_registry)
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, serde_json::from_slice(&body).unwrap())
}

/// Serve the coordinator (plus ops routes) on an ephemeral port
async fn spawn_coordinator() -> String {
    let state = Arc::new(CoordinatorState::new(
        Arc::new(InMemoryBus::new()),
        Arc::new(MemoryStore::new()),
    ));
    let registry = HealthRegistry::new();
    registry.set_ready(true);
    let app = router(state).merge(ops_router(registry));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

#[tokio::test]
async fn test_healthz_returns_ok_when_healthy() {
    let (app, _registry) = setup_test_app();
    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["components"]["store"]["status"], "healthy");
}

#[tokio::test]
async fn test_healthz_returns_ok_when_degraded() {
    let (app, registry) = setup_test_app();
    registry.set_degraded(components::BUS, "slow polls");

    let (status, health) = get_json(app, "/healthz").await;

    // Degraded still returns 200 (operational)
    assert_eq!(status, StatusCode::OK);
    assert_eq!(health["status"], "degraded");
}

#[tokio::test]
async fn test_healthz_returns_503_when_unhealthy() {
    let (app, registry) = setup_test_app();
    registry.set_unhealthy(components::STORE, "connection refused");

    let (status, health) = get_json(app, "/healthz").await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(health["status"], "unhealthy");
    assert_eq!(health["components"]["store"]["message"], "connection refused");
}

#[tokio::test]
async fn test_readyz_tracks_stage_state() {
    let (app, registry) = setup_test_app();

    let (status, readiness) = get_json(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["ready"], false);

    registry.set_ready(true);
    let (status, readiness) = get_json(app.clone(), "/readyz").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(readiness["ready"], true);

    registry.set_unhealthy(components::STAGE, "runner failed");
    let (status, readiness) = get_json(app, "/readyz").await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(readiness["reason"], "Critical component unhealthy");
}

#[tokio::test]
async fn test_metrics_endpoint_exposes_pipeline_metrics() {
    let (app, _registry) = setup_test_app();
    PipelineMetrics::new().inc_handler_faults("api-test");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap();
    assert!(content_type.starts_with("text/plain"));

    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains("remedy_handler_faults_total"));
}

#[tokio::test]
async fn test_unknown_route_is_404() {
    let (app, _registry) = setup_test_app();
    let response = app
        .oneshot(
            Request::builder()
                .uri("/nonexistent")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_remote_coordinator_health_check() {
    let base_url = spawn_coordinator().await;
    let remote = RemoteCoordinator::new(&base_url).unwrap();
    remote.health().await.unwrap();

    // Nothing listens on port 9 locally
    let unreachable = RemoteCoordinator::new("http://127.0.0.1:9")
        .unwrap()
        .with_request_timeout(Duration::from_millis(500));
    assert!(unreachable.health().await.is_err());
}

#[tokio::test]
async fn test_remote_claims_are_exclusive_across_clients() {
    let base_url = spawn_coordinator().await;
    let first = RemoteCoordinator::new(&base_url).unwrap();
    let second = RemoteCoordinator::new(&base_url).unwrap();
    let ttl = Duration::from_secs(60);

    let (a, b) = tokio::join!(
        first.claim("cooldown:db-1", "replica-a", ttl),
        second.claim("cooldown:db-1", "replica-b", ttl),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a ^ b, "exactly one replica wins the claim");

    let entry = first.get("cooldown:db-1").await.unwrap().unwrap();
    assert!(entry.ttl() <= ttl);
    assert_eq!(second.keys("cooldown:").await.unwrap(), vec!["cooldown:db-1"]);

    assert!(second.delete("cooldown:db-1").await.unwrap());
    assert!(first.get("cooldown:db-1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_remote_bus_delivers_events() {
    let base_url = spawn_coordinator().await;
    let remote = Arc::new(RemoteCoordinator::new(&base_url).unwrap());
    let mut subscription = remote.subscribe(Channel::HealthAlert).await.unwrap();

    let emitter = Emitter::new(remote.clone(), PipelineMetrics::new());
    let alert = HealthAlert {
        target: TargetRef::new("api-2", "api"),
        ..Default::default()
    };
    emitter
        .emit(Event::HealthAlert(alert.clone()))
        .await
        .unwrap();

    let envelope = subscription
        .recv(Duration::from_secs(2))
        .await
        .unwrap()
        .expect("envelope delivered");
    assert_eq!(Event::decode(&envelope).unwrap(), Event::HealthAlert(alert));
}
