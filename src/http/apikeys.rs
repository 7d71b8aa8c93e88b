//! `/api/apikeys` — key management and both verification paths.
//!
//! Management endpoints require an authenticated principal. The
//! verification endpoints (`verify`, `challenge`, `verify-challenge`) are
//! unauthenticated by nature — they *are* authentication — and sit behind
//! the per-IP rate limiter instead.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{delete, get, post},
};
use serde::Deserialize;
use serde_json::json;

use super::respond::ApiResult;
use super::{AppState, AuthedPrincipal};

/// API-key routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/apikeys", post(create_key).get(list_keys))
        .route("/api/apikeys/{id}", delete(revoke_key))
        .route("/api/apikeys/verify", post(verify_key))
        .route("/api/apikeys/challenge", get(issue_challenge))
        .route("/api/apikeys/verify-challenge", post(verify_challenge))
}

#[derive(Debug, Deserialize)]
struct CreateKeyRequest {
    name: String,
    #[serde(default)]
    scopes: Vec<String>,
}

/// `POST /api/apikeys` — issue a key. The raw value appears in this
/// response and never again.
async fn create_key(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    Json(body): Json<CreateKeyRequest>,
) -> ApiResult<impl IntoResponse> {
    let created = state
        .apikeys
        .create(&principal, &body.name, body.scopes)
        .await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// `GET /api/apikeys` — the caller's keys, metadata only.
async fn list_keys(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
) -> ApiResult<impl IntoResponse> {
    let keys = state.apikeys.list(&principal).await?;
    Ok(Json(json!({ "api_keys": keys })))
}

/// `DELETE /api/apikeys/{id}` — revoke a key (owner or tenant admin).
async fn revoke_key(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    Path(id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let is_admin = state.is_admin(&principal, &principal.tenant_id).await?;
    state.apikeys.revoke(&principal, &id, is_admin).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct VerifyKeyRequest {
    #[serde(rename = "apiKey")]
    api_key: String,
}

/// `POST /api/apikeys/verify` — direct verification of a raw key.
async fn verify_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<VerifyKeyRequest>,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&headers)?;
    let principal = state.apikeys.verify_direct(&body.api_key).await?;
    Ok(Json(json!({
        "valid": true,
        "userId": principal.user_id,
        "tenantId": principal.tenant_id,
        "scopes": principal.scopes,
    })))
}

/// `GET /api/apikeys/challenge` — issue a login nonce.
async fn issue_challenge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&headers)?;
    let challenge = state.apikeys.issue_challenge();
    let expires_in = state.apikeys.challenges().ttl_secs();
    Ok(Json(json!({
        "challenge": challenge,
        "expiresIn": expires_in,
    })))
}

#[derive(Debug, Deserialize)]
struct VerifyChallengeRequest {
    challenge: String,
    response: String,
}

/// `POST /api/apikeys/verify-challenge` — answer a nonce with
/// `<keyId>.<mac>`.
async fn verify_challenge(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<VerifyChallengeRequest>,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&headers)?;
    let principal = state
        .apikeys
        .verify_challenge(&body.challenge, &body.response)
        .await?;
    Ok(Json(json!({
        "valid": true,
        "userId": principal.user_id,
        "tenantId": principal.tenant_id,
        "scopes": principal.scopes,
    })))
}
