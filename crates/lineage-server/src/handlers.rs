use axum::{
    Json,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::IntoResponse,
};
use lineage_engine::{RefreshOutcome, Resolution};
use lineage_storage::{Entity, EntityId, EntityPath, MutationOutcome, NewEntity};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::server::AppState;

type ApiResult<T> = Result<T, ApiError>;

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    backend: &'static str,
}

pub async fn healthz(State(state): State<AppState>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(HealthResponse {
            status: "ok",
            backend: state.engine.store().backend_name(),
        }),
    )
}

pub async fn metrics() -> impl IntoResponse {
    match crate::metrics::render_metrics() {
        Some(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        ),
        None => (
            StatusCode::SERVICE_UNAVAILABLE,
            [(header::CONTENT_TYPE, "text/plain")],
            "metrics exporter not installed\n".to_string(),
        ),
    }
}

pub async fn stats(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.stats())
}

// ---------------------------------------------------------------------------
// Resolution
// ---------------------------------------------------------------------------

pub async fn resolve_by_id(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<Resolution>> {
    let answer = state.engine.resolve(&EntityId::new(id)).await?;
    Ok(Json(answer))
}

#[derive(Debug, Deserialize)]
pub struct ResolveQuery {
    pub path: Option<String>,
}

pub async fn resolve_by_path(
    State(state): State<AppState>,
    Query(query): Query<ResolveQuery>,
) -> ApiResult<Json<Resolution>> {
    let raw = query
        .path
        .ok_or_else(|| ApiError::bad_request("query parameter 'path' is required"))?;
    let path = EntityPath::parse(&raw)?;
    let answer = state.engine.resolve_by_path(&path).await?;
    Ok(Json(answer))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvalidateRequest {
    pub entity_id: String,
    #[serde(default)]
    pub affected_prefixes: Vec<String>,
}

pub async fn invalidate(
    State(state): State<AppState>,
    Json(body): Json<InvalidateRequest>,
) -> ApiResult<impl IntoResponse> {
    if body.entity_id.is_empty() {
        return Err(ApiError::bad_request("entityId must not be empty"));
    }
    let prefixes = parse_paths(&body.affected_prefixes)?;
    let report = state
        .engine
        .invalidate(&EntityId::new(body.entity_id), &prefixes)
        .await;
    Ok((StatusCode::ACCEPTED, Json(report)))
}

// ---------------------------------------------------------------------------
// Entity writes
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEntityRequest {
    #[serde(default)]
    pub id: Option<String>,
    pub path: String,
    pub entity_type: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub confidence: Option<f64>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub entity: Entity,
    pub kind: String,
    pub revision: u64,
    pub affected_prefixes: Vec<EntityPath>,
}

impl From<MutationOutcome> for MutationResponse {
    fn from(outcome: MutationOutcome) -> Self {
        Self {
            entity: outcome.entity,
            kind: outcome.kind.to_string(),
            revision: outcome.revision,
            affected_prefixes: outcome.affected_prefixes,
        }
    }
}

pub async fn create_entity(
    State(state): State<AppState>,
    Json(body): Json<CreateEntityRequest>,
) -> ApiResult<impl IntoResponse> {
    let path = EntityPath::parse(&body.path)?;
    let mut entity = NewEntity::new(path, body.entity_type);
    if let Some(id) = body.id {
        entity = entity.with_id(EntityId::new(id));
    }
    if let Some(name) = body.name {
        entity = entity.with_name(name);
    }
    entity.confidence = body.confidence;

    let outcome = state.engine.create_entity(entity).await?;
    Ok((StatusCode::CREATED, Json(MutationResponse::from(outcome))))
}

#[derive(Debug, Deserialize)]
pub struct RenameRequest {
    pub name: String,
}

pub async fn rename_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<RenameRequest>,
) -> ApiResult<Json<MutationResponse>> {
    let outcome = state
        .engine
        .rename_entity(&EntityId::new(id), &body.name)
        .await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveRequest {
    pub new_parent: String,
}

pub async fn move_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<MoveRequest>,
) -> ApiResult<Json<MutationResponse>> {
    let parent = EntityPath::parse(&body.new_parent)?;
    let outcome = state
        .engine
        .move_entity(&EntityId::new(id), &parent)
        .await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Deserialize)]
pub struct ConfidenceRequest {
    #[serde(default)]
    pub confidence: Option<f64>,
}

/// Sets or clears an entity's confidence score. Values outside [0, 1] are
/// clamped by the store.
pub async fn set_confidence(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<ConfidenceRequest>,
) -> ApiResult<Json<MutationResponse>> {
    let outcome = state
        .engine
        .set_confidence(&EntityId::new(id), body.confidence)
        .await?;
    Ok(Json(outcome.into()))
}

pub async fn deactivate_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<MutationResponse>> {
    let outcome = state.engine.deactivate_entity(&EntityId::new(id)).await?;
    Ok(Json(outcome.into()))
}

// ---------------------------------------------------------------------------
// Views
// ---------------------------------------------------------------------------

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub view: String,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rebuilt: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

pub async fn list_views(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.engine.scheduler().registry().statuses())
}

pub async fn refresh_view(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let outcome = state
        .engine
        .scheduler()
        .refresh_now(&name)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("View not found: {name}")))?;
    let (status, body) = match outcome {
        RefreshOutcome::Refreshed { view, report, .. } => (
            StatusCode::OK,
            RefreshResponse {
                view,
                status: "refreshed",
                rebuilt: Some(report.rebuilt),
                error: None,
            },
        ),
        RefreshOutcome::AlreadyRunning { view } => (
            StatusCode::CONFLICT,
            RefreshResponse {
                view,
                status: "already-running",
                rebuilt: None,
                error: None,
            },
        ),
        RefreshOutcome::Failed { view, error, .. } => (
            StatusCode::SERVICE_UNAVAILABLE,
            RefreshResponse {
                view,
                status: "failed",
                rebuilt: None,
                error: Some(error),
            },
        ),
    };
    Ok((status, Json(body)))
}

fn parse_paths(raw: &[String]) -> ApiResult<Vec<EntityPath>> {
    raw.iter()
        .map(|p| EntityPath::parse(p).map_err(ApiError::from))
        .collect()
}
