use crate::core::{Core, SubmitError};
use crate::models::{IntentStatus, PolicyPlane};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

// Surface HTTP mince au-dessus du Core. L'authentification et le rate
// limiting sont des collaborateurs externes : le kernel fait confiance à
// son appelant.

#[derive(Clone)]
pub struct AppState {
    pub core: Core,
}

#[derive(Debug, Deserialize)]
struct SubmitBody {
    description: String,
    submitter: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntentFilter {
    status: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PolicyFilter {
    plane: Option<String>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(get_health))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/intents", post(submit_intent).get(list_intents))
        .route("/api/v1/intents/{id}", get(get_intent).delete(revoke_intent))
        .route("/api/v1/policies", get(list_policies))
        .route("/api/v1/catalog/reload", post(reload_catalog))
        .with_state(state)
}

fn error_response(err: SubmitError) -> (StatusCode, Json<serde_json::Value>) {
    let code = match &err {
        SubmitError::Parse(_) | SubmitError::Compile(_) => StatusCode::BAD_REQUEST,
        SubmitError::NotFound(_) => StatusCode::NOT_FOUND,
        SubmitError::Conflict(_) => StatusCode::CONFLICT,
        SubmitError::Degraded | SubmitError::Store(_) => StatusCode::SERVICE_UNAVAILABLE,
        SubmitError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(json!({ "error": { "kind": err.kind(), "message": err.to_string() } })))
}

// POST /api/v1/intents
async fn submit_intent(
    State(app): State<AppState>,
    Json(body): Json<SubmitBody>,
) -> Result<(StatusCode, Json<serde_json::Value>), (StatusCode, Json<serde_json::Value>)> {
    let submitter = body.submitter.as_deref().unwrap_or("anonymous");
    match app.core.submit(&body.description, submitter).await {
        Ok(receipt) => Ok((StatusCode::CREATED, Json(json!({ "success": true, "intent": receipt })))),
        Err(e) => Err(error_response(e)),
    }
}

// GET /api/v1/intents?status=applied
async fn list_intents(
    State(app): State<AppState>,
    Query(filter): Query<IntentFilter>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let status = match filter.status.as_deref() {
        Some(s) => Some(s.parse::<IntentStatus>().map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": { "kind": "bad_filter", "message": e } })))
        })?),
        None => None,
    };
    match app.core.list_intents(status).await {
        Ok(intents) => Ok(Json(json!({ "count": intents.len(), "intents": intents }))),
        Err(e) => Err(error_response(e)),
    }
}

// GET /api/v1/intents/:id
async fn get_intent(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match app.core.get_intent(&id).await {
        Ok(Some(view)) => Ok(Json(json!({ "intent": view }))),
        Ok(None) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": { "kind": "not_found", "message": id } })),
        )),
        Err(e) => Err(error_response(e)),
    }
}

// DELETE /api/v1/intents/:id
async fn revoke_intent(
    State(app): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match app.core.revoke_intent(&id).await {
        Ok(()) => Ok(Json(json!({ "ok": true }))),
        Err(e) => Err(error_response(e)),
    }
}

// GET /api/v1/policies?plane=device
async fn list_policies(
    State(app): State<AppState>,
    Query(filter): Query<PolicyFilter>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let plane = match filter.plane.as_deref() {
        Some(p) => Some(p.parse::<PolicyPlane>().map_err(|e| {
            (StatusCode::BAD_REQUEST, Json(json!({ "error": { "kind": "bad_filter", "message": e } })))
        })?),
        None => None,
    };
    match app.core.list_policies(plane).await {
        Ok(policies) => Ok(Json(json!({ "count": policies.len(), "policies": policies }))),
        Err(e) => Err(error_response(e)),
    }
}

// GET /health
async fn get_health(State(app): State<AppState>) -> Json<serde_json::Value> {
    let health = app.core.health().await;
    Json(serde_json::to_value(health).unwrap_or_else(|_| json!({ "status": "error" })))
}

// GET /metrics : exposition Prometheus texte
async fn get_metrics(State(app): State<AppState>) -> String {
    let health = app.core.health().await;
    app.core.metrics().render_prometheus(
        health.active_intents,
        health.devices_known,
        health.mqtt_status == "connected",
        health.uptime_seconds,
    )
}

// POST /api/v1/catalog/reload : swap atomique du Catalog
async fn reload_catalog(
    State(app): State<AppState>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    match app.core.catalog().reload().await {
        Ok(()) => Ok(Json(json!({ "ok": true }))),
        Err(e) => Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": { "kind": "config_invalid", "message": e.to_string() } })),
        )),
    }
}
