//! HTTP surface against the in-memory backend.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{Request, StatusCode, header},
};
use lineage_db_memory::InMemoryStore;
use lineage_engine::{Engine, EngineConfig, SchedulerConfig, ViewConfig};
use lineage_server::{AppConfig, AppState, Runtime, build_app};
use lineage_storage::{EntityPath, JoinColumn};
use serde_json::{Value, json};
use tower::ServiceExt;

async fn default_app() -> Router {
    let cfg = AppConfig::default();
    let runtime = Runtime::build(&cfg).await.expect("runtime");
    build_app(runtime.state(), &cfg)
}

fn app_for(engine: Engine) -> Router {
    let state = AppState {
        engine: Arc::new(engine),
    };
    build_app(state, &AppConfig::default())
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

async fn create(app: &Router, id: &str, path: &str) {
    let (status, body) = send(
        app,
        "POST",
        "/entities",
        Some(json!({ "id": id, "path": path, "entityType": "organization" })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED, "create {path}: {body}");
}

async fn seed(app: &Router) {
    create(app, "root", "root").await;
    create(app, "acme", "root.acme").await;
    create(app, "division-a", "root.acme.division_a").await;
}

#[tokio::test]
async fn healthz_reports_backend() {
    let app = default_app().await;
    let (status, body) = send(&app, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["backend"], "memory");
}

#[tokio::test]
async fn resolve_by_id_then_served_from_local_tier() {
    let app = default_app().await;
    seed(&app).await;

    let (status, body) = send(&app, "GET", "/resolve/division-a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entityId"], "division-a");
    assert_eq!(body["ancestors"], json!(["root", "acme"]));
    assert_eq!(body["descendantCount"], 0);
    assert_eq!(body["source"], "L4");
    assert_eq!(body["stale"], false);

    let (_, body) = send(&app, "GET", "/resolve/division-a", None).await;
    assert_eq!(body["source"], "L1");
}

#[tokio::test]
async fn resolve_by_path_query() {
    let app = default_app().await;
    seed(&app).await;

    let (status, body) = send(&app, "GET", "/resolve?path=root.acme", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entityId"], "acme");
    assert_eq!(body["descendantCount"], 1);

    let (status, _) = send(&app, "GET", "/resolve", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "GET", "/resolve?path=root..acme", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, "GET", "/resolve?path=root.globex", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn unknown_entity_is_not_found() {
    let app = default_app().await;
    let (status, body) = send(&app, "GET", "/resolve/nobody", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "not-found");
    assert_eq!(body["retryable"], false);
}

#[tokio::test]
async fn create_rejects_orphans_and_duplicates() {
    let app = default_app().await;
    create(&app, "root", "root").await;

    let (status, _) = send(
        &app,
        "POST",
        "/entities",
        Some(json!({ "path": "root.missing.child", "entityType": "unit" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &app,
        "POST",
        "/entities",
        Some(json!({ "path": "root", "entityType": "organization" })),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn rename_is_visible_to_descendants() {
    let app = default_app().await;
    seed(&app).await;
    let (_, before) = send(&app, "GET", "/resolve/division-a", None).await;
    assert_eq!(before["ancestors"], json!(["root", "acme"]));

    let (status, body) = send(
        &app,
        "POST",
        "/entities/acme/rename",
        Some(json!({ "name": "Acme Corp" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "renamed");

    let (_, after) = send(&app, "GET", "/resolve/division-a", None).await;
    assert_eq!(after["ancestors"], json!(["root", "Acme Corp"]));
    assert_eq!(after["stale"], false);
}

#[tokio::test]
async fn move_rewrites_path() {
    let app = default_app().await;
    seed(&app).await;
    create(&app, "globex", "root.globex").await;
    send(&app, "GET", "/resolve/division-a", None).await;

    let (status, body) = send(
        &app,
        "POST",
        "/entities/division-a/move",
        Some(json!({ "newParent": "root.globex" })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entity"]["path"], "root.globex.division_a");

    let (_, after) = send(&app, "GET", "/resolve/division-a", None).await;
    assert_eq!(after["path"], "root.globex.division_a");
    assert_eq!(after["ancestors"], json!(["root", "globex"]));

    let (_, acme) = send(&app, "GET", "/resolve/acme", None).await;
    assert_eq!(acme["descendantCount"], 0);
}

#[tokio::test]
async fn confidence_is_clamped_and_clearable() {
    let app = default_app().await;
    seed(&app).await;

    let (status, body) = send(
        &app,
        "POST",
        "/entities/acme/confidence",
        Some(json!({ "confidence": 1.7 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "updated");
    assert_eq!(body["entity"]["confidence"], 1.0);

    let (status, body) = send(&app, "POST", "/entities/acme/confidence", Some(json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entity"]["confidence"], Value::Null);

    let (status, _) = send(
        &app,
        "POST",
        "/entities/missing/confidence",
        Some(json!({ "confidence": 0.5 })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn deactivate_requires_leaf() {
    let app = default_app().await;
    seed(&app).await;

    let (status, _) = send(&app, "DELETE", "/entities/acme", None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&app, "DELETE", "/entities/division-a", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["kind"], "deactivated");

    let (status, _) = send(&app, "GET", "/resolve/division-a", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn invalidate_evicts_cached_answer() {
    let app = default_app().await;
    seed(&app).await;
    send(&app, "GET", "/resolve/division-a", None).await;

    let (status, body) = send(
        &app,
        "POST",
        "/invalidate",
        Some(json!({ "entityId": "division-a", "affectedPrefixes": ["root.acme.division_a"] })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert!(body["localEvicted"].as_u64().unwrap() >= 1);

    let (_, after) = send(&app, "GET", "/resolve/division-a", None).await;
    assert_ne!(after["source"], "L1");

    let (status, _) = send(
        &app,
        "POST",
        "/invalidate",
        Some(json!({ "entityId": "division-a", "affectedPrefixes": ["not a path"] })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stats_report_tiers() {
    let app = default_app().await;
    seed(&app).await;
    send(&app, "GET", "/resolve/division-a", None).await;
    send(&app, "GET", "/resolve/division-a", None).await;

    let (status, body) = send(&app, "GET", "/stats", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["resolution"]["total"], 2);
    assert_eq!(body["localCache"]["size"], 1);
    assert!(body["distributed"].is_null());
}

#[tokio::test]
async fn schema_violation_is_an_explicit_server_error() {
    let store = Arc::new(
        InMemoryStore::new().with_join_column(JoinColumn::new("row_id").unwrap()),
    );
    let engine = Engine::builder(store.clone(), store).build();
    let materializer = engine.materializer().clone();
    let app = app_for(engine);
    seed(&app).await;
    materializer.rebuild_all(None).await.unwrap();

    let (status, body) = send(&app, "GET", "/resolve/division-a", None).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "schema-invariant-violation");
    assert_eq!(body["joinColumn"], "row_id");
    assert_eq!(body["entityId"], "division-a");
}

#[tokio::test]
async fn saturated_pool_returns_retry_after() {
    let store = Arc::new(InMemoryStore::new().with_pool_limit(1, Duration::from_millis(10)));
    let engine = Engine::builder(store.clone(), store.clone()).build();
    let app = app_for(engine);
    seed(&app).await;

    let _held = store.pool_handle().unwrap().acquire_owned().await.unwrap();
    let request = Request::builder()
        .uri("/resolve/division-a")
        .body(Body::empty())
        .unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert!(response.headers().contains_key(header::RETRY_AFTER));
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&bytes).unwrap();
    assert_eq!(body["retryable"], true);
}

#[tokio::test]
async fn manual_view_refresh() {
    let store = Arc::new(InMemoryStore::new());
    let config = EngineConfig {
        refresh: SchedulerConfig {
            views: vec![
                ViewConfig::new("acme").with_scope(EntityPath::parse("root.acme").unwrap()),
            ],
            ..Default::default()
        },
        ..Default::default()
    };
    let engine = Engine::builder(store.clone(), store).with_config(config).build();
    let app = app_for(engine);
    seed(&app).await;

    let (status, views) = send(&app, "GET", "/views", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(views[0]["name"], "acme");
    assert_eq!(views[0]["pendingChanges"], 3);

    let (status, body) = send(&app, "POST", "/views/acme/refresh", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "refreshed");
    assert_eq!(body["rebuilt"], 2);

    let (_, views) = send(&app, "GET", "/views", None).await;
    assert_eq!(views[0]["pendingChanges"], 0);

    let (status, _) = send(&app, "POST", "/views/nope/refresh", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (_, answer) = send(&app, "GET", "/resolve/division-a", None).await;
    assert_eq!(answer["source"], "L3");
}

#[tokio::test]
async fn metrics_endpoint_renders_engine_metrics() {
    lineage_server::metrics::init_metrics();
    let app = default_app().await;
    seed(&app).await;
    send(&app, "GET", "/resolve/division-a", None).await;

    let request = Request::builder().uri("/metrics").body(Body::empty()).unwrap();
    let response = app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(text.contains("lineage_resolve_duration_seconds"));
    assert!(text.contains("http_requests_total"));
}

#[tokio::test]
async fn request_id_is_echoed() {
    let app = default_app().await;
    let request = Request::builder()
        .uri("/healthz")
        .header("x-request-id", "abc-123")
        .body(Body::empty())
        .unwrap();
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "abc-123");
}
