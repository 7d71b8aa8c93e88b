//! `/kek/*` — KEK version lifecycle and blob distribution.
//!
//! Version reads require tenant membership; version mutations and blob
//! provisioning require tenant admin. A user always reads their own blobs;
//! reading someone else's requires admin.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post, put},
};
use serde::Deserialize;
use serde_json::json;

use super::respond::ApiResult;
use super::{AppState, AuthedPrincipal};
use crate::kek::KekStatus;
use crate::principal::tag_user;
use crate::Error;

/// KEK version and blob routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/kek/versions", get(list_versions).post(create_version))
        .route("/kek/versions/active", get(get_active_version))
        .route("/kek/versions/{id}/status", put(update_version_status))
        .route("/kek/rotate", post(rotate))
        .route("/kek/blobs", post(provision_blob))
        .route("/kek/blobs/me", get(get_my_blobs))
        .route("/kek/blobs/users/{user_id}", get(get_user_blobs))
        .route(
            "/kek/blobs/users/{user_id}/versions/{version_id}",
            get(get_blob).delete(delete_blob),
        )
}

/// `GET /kek/versions` — every version for the tenant.
async fn list_versions(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_member(&principal, &tenant).await?;

    let versions = state.kek_registry.list(&tenant).await?;
    Ok(Json(json!({ "versions": versions })))
}

/// `GET /kek/versions/active` — the tenant's active version.
async fn get_active_version(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_member(&principal, &tenant).await?;

    let version = state.kek_registry.get_active(&tenant).await?;
    Ok(Json(version))
}

#[derive(Debug, Deserialize)]
struct CreateVersionRequest {
    reason: String,
}

/// `POST /kek/versions` — create a new active version; the previous active
/// one is demoted in the same step.
async fn create_version(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Json(body): Json<CreateVersionRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_admin(&principal, &tenant).await?;

    let version = state
        .kek_registry
        .create(&tenant, &principal.user_ref(), &body.reason)
        .await?;
    Ok((StatusCode::CREATED, Json(version)))
}

#[derive(Debug, Deserialize)]
struct UpdateStatusRequest {
    status: KekStatus,
}

/// `PUT /kek/versions/{id}/status` — walk the status DAG. Illegal edges
/// are a 409.
async fn update_version_status(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<UpdateStatusRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_admin(&principal, &tenant).await?;

    let version = state
        .kek_registry
        .update_status(&tenant, &id, body.status)
        .await?;
    Ok(Json(version))
}

#[derive(Debug, Deserialize)]
struct RotateRequest {
    reason: String,
    #[serde(default)]
    removed_users: Vec<String>,
}

/// `POST /kek/rotate` — rotate the KEK, deny-listing `removed_users`
/// against the new version.
async fn rotate(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Json(body): Json<RotateRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_admin(&principal, &tenant).await?;

    let version = state
        .kek_registry
        .rotate(
            &tenant,
            &principal.user_ref(),
            &body.reason,
            &body.removed_users,
        )
        .await?;
    Ok((StatusCode::CREATED, Json(version)))
}

#[derive(Debug, Deserialize)]
struct ProvisionBlobRequest {
    user_id: String,
    kek_version_id: String,
    encrypted_blob: String,
}

/// `POST /kek/blobs` — provision a wrapped KEK for a user. Admin only.
async fn provision_blob(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Json(body): Json<ProvisionBlobRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_admin(&principal, &tenant).await?;

    let blob = state
        .kek_blobs
        .set(&tenant, &body.user_id, &body.kek_version_id, &body.encrypted_blob)
        .await?;
    Ok((StatusCode::CREATED, Json(blob)))
}

/// `GET /kek/blobs/me` — the caller's own blobs. No further authorization.
async fn get_my_blobs(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    let blobs = state
        .kek_blobs
        .list_for_user(&tenant, &principal.user_ref())
        .await?;
    Ok(Json(json!({ "blobs": blobs })))
}

/// `GET /kek/blobs/users/{userId}` — a user's blobs. Self or admin.
async fn get_user_blobs(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    require_self_or_admin(&state, &principal, &tenant, &user_id).await?;

    let blobs = state.kek_blobs.list_for_user(&tenant, &user_id).await?;
    Ok(Json(json!({ "blobs": blobs })))
}

/// `GET /kek/blobs/users/{userId}/versions/{versionId}` — one blob. Self
/// or admin.
async fn get_blob(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Path((user_id, version_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    require_self_or_admin(&state, &principal, &tenant, &user_id).await?;

    let blob = state.kek_blobs.get(&tenant, &user_id, &version_id).await?;
    Ok(Json(blob))
}

/// `DELETE /kek/blobs/users/{userId}/versions/{versionId}` — remove a
/// blob. Admin only.
async fn delete_blob(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Path((user_id, version_id)): Path<(String, String)>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_admin(&principal, &tenant).await?;

    state.kek_blobs.delete(&tenant, &user_id, &version_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Own blobs are always readable; anyone else's require admin.
async fn require_self_or_admin(
    state: &AppState,
    principal: &crate::principal::Principal,
    tenant: &str,
    target_user: &str,
) -> crate::Result<()> {
    if tag_user(target_user) == principal.user_ref() {
        return Ok(());
    }
    state.require_admin(principal, tenant).await.map_err(|_| {
        Error::AccessDenied("reading another user's blobs requires tenant admin".to_string())
    })
}
