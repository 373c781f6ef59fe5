//! API route handlers for shop-credentials.
//!
//! All handlers receive `SharedState` via Axum state extraction. Shop
//! endpoints are internal: callers present `x-internal-secret`.

use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::error::{Result, ServiceError};
use crate::SharedState;

// =============================================================================
// V1 Router
// =============================================================================

pub fn v1_router(state: SharedState) -> Router {
    Router::new()
        // ── Health ───────────────────────────────────────────────────────
        .route("/status", get(status))
        // ── Scheduler trigger ────────────────────────────────────────────
        .route(
            "/cron/refresh-tokens",
            get(cron_refresh_tokens).post(cron_refresh_tokens),
        )
        // ── Shop credentials ─────────────────────────────────────────────
        .route("/shops/authenticate", post(shop_authenticate))
        .route("/shops/{shop_id}/refresh", post(shop_refresh))
        .route("/shops/{shop_id}/token", get(shop_token))
        // ── Sync status ──────────────────────────────────────────────────
        .route("/shops/{shop_id}/sync", get(sync_query))
        .route("/shops/{shop_id}/sync/start", post(sync_start))
        .route("/shops/{shop_id}/sync/complete", post(sync_complete))
        .route("/shops/{shop_id}/sync/fail", post(sync_fail))
        .with_state(state)
}

// =============================================================================
// Health
// =============================================================================

async fn status() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "shop-credentials",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// =============================================================================
// Caller auth
// =============================================================================

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn require_internal(state: &SharedState, headers: &HeaderMap) -> Result<()> {
    let provided = header(headers, "x-internal-secret").ok_or(ServiceError::Unauthorized)?;
    if !state
        .crypto
        .secrets_match(provided, &state.config.auth_service_secret)
    {
        return Err(ServiceError::Unauthorized);
    }
    Ok(())
}

/// Platform scheduler marker, or `Authorization` equal to the cron secret
/// (raw or as a bearer token).
fn require_cron(state: &SharedState, headers: &HeaderMap) -> Result<()> {
    if headers.contains_key(state.config.cron_trusted_header.as_str()) {
        return Ok(());
    }

    let Some(secret) = state.config.cron_secret.as_deref() else {
        return Err(ServiceError::Config("CRON_SECRET is not configured".into()));
    };

    let provided = header(headers, "authorization").ok_or(ServiceError::Unauthorized)?;
    let provided = provided.strip_prefix("Bearer ").unwrap_or(provided);
    if !state.crypto.secrets_match(provided, secret) {
        return Err(ServiceError::Unauthorized);
    }
    Ok(())
}

// =============================================================================
// Scheduler trigger
// =============================================================================

/// GET|POST /v1/cron/refresh-tokens: Run one refresh pass and return its report.
async fn cron_refresh_tokens(
    State(state): State<SharedState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse> {
    require_cron(&state, &headers)?;
    let report = state.scheduler.run().await?;
    Ok(Json(report))
}

// =============================================================================
// Shop credentials
// =============================================================================

#[derive(Deserialize)]
struct AuthenticateBody {
    code: String,
    /// Optional when the gateway response names the shop.
    shop_id: Option<i64>,
}

/// POST /v1/shops/authenticate: Exchange an authorization code and store the credential.
async fn shop_authenticate(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Json(body): Json<AuthenticateBody>,
) -> Result<impl IntoResponse> {
    require_internal(&state, &headers)?;
    if body.code.trim().is_empty() {
        return Err(ServiceError::InvalidRequest("code must not be empty".into()));
    }

    let token = state.tokens.authenticate(body.code.trim(), body.shop_id).await?;
    info!(shop_id = token.shop_id, "Shop authorized via API");
    Ok(Json(json!({ "data": token.summary() })))
}

/// POST /v1/shops/{shop_id}/refresh: Force a refresh of the shop's credential.
async fn shop_refresh(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(shop_id): Path<i64>,
) -> Result<impl IntoResponse> {
    require_internal(&state, &headers)?;
    let token = state.tokens.refresh(shop_id).await?;
    Ok(Json(json!({ "data": token.summary() })))
}

/// GET /v1/shops/{shop_id}/token: A usable access token, refreshed if needed.
async fn shop_token(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(shop_id): Path<i64>,
) -> Result<impl IntoResponse> {
    require_internal(&state, &headers)?;
    let token = state.tokens.valid_token(shop_id).await?;
    Ok(Json(json!({
        "data": {
            "access_token": token.access_token,
            "expired_at": token.expired_at,
            "shop_id": token.shop_id,
            "merchant_id": token.merchant_id,
        }
    })))
}

// =============================================================================
// Sync status
// =============================================================================

#[derive(Deserialize)]
struct CompleteSyncBody {
    synced_count: u64,
}

#[derive(Deserialize)]
struct FailSyncBody {
    error: String,
}

/// GET /v1/shops/{shop_id}/sync
async fn sync_query(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(shop_id): Path<i64>,
) -> Result<impl IntoResponse> {
    require_internal(&state, &headers)?;
    let status = state.sync.query(shop_id).await?;
    Ok(Json(json!({ "data": status, "state": status.state().as_str() })))
}

/// POST /v1/shops/{shop_id}/sync/start: 409 when a run is already active.
async fn sync_start(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(shop_id): Path<i64>,
) -> Result<impl IntoResponse> {
    require_internal(&state, &headers)?;
    let status = state.sync.start(shop_id).await?;
    Ok(Json(json!({ "data": status })))
}

/// POST /v1/shops/{shop_id}/sync/complete
async fn sync_complete(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(shop_id): Path<i64>,
    Json(body): Json<CompleteSyncBody>,
) -> Result<impl IntoResponse> {
    require_internal(&state, &headers)?;
    let status = state.sync.complete(shop_id, body.synced_count).await?;
    Ok(Json(json!({ "data": status })))
}

/// POST /v1/shops/{shop_id}/sync/fail
async fn sync_fail(
    State(state): State<SharedState>,
    headers: HeaderMap,
    Path(shop_id): Path<i64>,
    Json(body): Json<FailSyncBody>,
) -> Result<impl IntoResponse> {
    require_internal(&state, &headers)?;
    if body.error.trim().is_empty() {
        return Err(ServiceError::InvalidRequest("error must not be empty".into()));
    }
    let status = state.sync.fail(shop_id, &body.error).await?;
    Ok(Json(json!({ "data": status })))
}
