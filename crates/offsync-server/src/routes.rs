use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use offsync_core::hub::Hub;
use offsync_core::protocol::{PullQuery, PullResponse, PushOutcome, PushRequest, PushResponse};
use serde::Serialize;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::auth::{extract_bearer_token, tokens_match};
use crate::config::AppConfig;
use crate::error::AppError;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    hub: Arc<Hub>,
}

impl AppState {
    pub fn from_config(config: Arc<AppConfig>) -> Self {
        Self::with_hub(config, Arc::new(Hub::new()))
    }

    pub const fn with_hub(config: Arc<AppConfig>, hub: Arc<Hub>) -> Self {
        Self { config, hub }
    }
}

pub fn app_router(state: AppState) -> Router {
    let protected_routes = Router::new()
        .route("/sync/push", post(push))
        .route("/sync/pull", get(pull))
        .route_layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/healthz", get(healthz))
        .nest("/v1", protected_routes)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_headers(Any)
                .allow_methods(Any),
        )
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: i64,
    records: usize,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: Utc::now().timestamp(),
        records: state.hub.len(),
    })
}

async fn require_auth(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    if let Some(expected) = state.config.token.as_deref() {
        let token = extract_bearer_token(request.headers())?;
        if !tokens_match(token, expected) {
            return Err(AppError::unauthorized("Bearer token is not valid"));
        }
    }
    Ok(next.run(request).await)
}

async fn push(
    State(state): State<AppState>,
    Json(request): Json<PushRequest>,
) -> Result<Json<PushResponse>, AppError> {
    let limit = state.config.max_push_entries;
    if request.entries.len() > limit {
        return Err(AppError::TooLarge(format!(
            "push carries {} entries, limit is {limit}",
            request.entries.len()
        )));
    }
    if let Some(entry) = request
        .entries
        .iter()
        .find(|entry| entry.idempotency_key.trim().is_empty())
    {
        return Err(AppError::bad_request(format!(
            "entry {} has an empty idempotency_key",
            entry.sequence
        )));
    }

    let results = state.hub.push(&request.entries);
    let count = |outcome| {
        results
            .iter()
            .filter(|result| result.outcome == outcome)
            .count()
    };
    tracing::info!(
        endpoint = "sync_push",
        entries = request.entries.len(),
        accepted = count(PushOutcome::Accepted),
        conflicts = count(PushOutcome::Conflict),
        rejected = count(PushOutcome::Rejected),
        "Applied push"
    );
    Ok(Json(PushResponse { results }))
}

async fn pull(
    State(state): State<AppState>,
    Query(query): Query<PullQuery>,
) -> Result<Json<PullResponse>, AppError> {
    let limit = query
        .limit
        .unwrap_or(state.config.pull_limit)
        .min(state.config.pull_limit);
    let page = state.hub.pull(query.since.as_deref(), limit)?;
    tracing::debug!(
        endpoint = "sync_pull",
        records = page.records.len(),
        watermark = %page.new_watermark,
        has_more = page.has_more,
        "Served pull"
    );
    Ok(Json(page))
}
