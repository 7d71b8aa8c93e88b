//! `/kek/recovery` and `/public-keys` — threshold recovery and the
//! public-key registry.
//!
//! Initiating a recovery requires tenant admin; submitting a share
//! requires membership; completion and cancellation are initiator-only
//! (enforced in the recovery service). Session reads never include share
//! ciphertext.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::json;

use super::respond::ApiResult;
use super::{AppState, AuthedPrincipal};
use crate::kek::PURPOSE_ADMIN_PROMOTION;
use crate::principal::tag_user;
use crate::Error;

/// Recovery and public-key routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/kek/recovery", post(initiate_recovery))
        .route(
            "/kek/recovery/{session_id}",
            get(get_recovery_session).delete(cancel_recovery),
        )
        .route("/kek/recovery/{session_id}/shares", post(submit_share))
        .route("/kek/recovery/{session_id}/complete", post(complete_recovery))
        .route("/public-keys", post(store_public_key))
        .route("/public-keys/verify", post(verify_public_key))
        // One template, two meanings: GET addresses by user id, PUT/DELETE
        // by record id.
        .route(
            "/public-keys/{id}",
            get(get_public_key)
                .put(update_public_key)
                .delete(delete_public_key),
        )
}

#[derive(Debug, Deserialize)]
struct InitiateRequest {
    #[serde(rename = "versionId")]
    version_id: String,
    threshold: usize,
    #[serde(default)]
    reason: String,
    #[serde(rename = "expiresIn", default = "default_expires_in")]
    expires_in: u64,
}

fn default_expires_in() -> u64 {
    3600
}

/// `POST /kek/recovery` — start a recovery session. Admin only.
async fn initiate_recovery(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Json(body): Json<InitiateRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_admin(&principal, &tenant).await?;

    let session = state
        .recovery
        .initiate(
            &tenant,
            &principal.user_ref(),
            &body.version_id,
            body.threshold,
            &body.reason,
            Duration::from_secs(body.expires_in),
        )
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(crate::kek::RecoverySessionView::from(&session)),
    ))
}

/// `GET /kek/recovery/{sessionId}` — session state, submitters only.
async fn get_recovery_session(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_member(&principal, &tenant).await?;

    let view = state.recovery.get_session(&tenant, &session_id).await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct SubmitShareRequest {
    share: String,
    #[serde(rename = "encryptedFor", default)]
    encrypted_for: String,
}

/// `POST /kek/recovery/{sessionId}/shares` — submit one share. Member
/// only; one submission per user.
async fn submit_share(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<SubmitShareRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_member(&principal, &tenant).await?;

    let view = state
        .recovery
        .submit_share(
            &tenant,
            &session_id,
            &principal.user_ref(),
            &body.encrypted_for,
            &body.share,
        )
        .await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct NewVersionBody {
    id: String,
    #[serde(default)]
    reason: String,
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    #[serde(rename = "recoveredKEK")]
    recovered_kek: String,
    #[serde(rename = "newKEKVersion")]
    new_version: NewVersionBody,
}

/// `POST /kek/recovery/{sessionId}/complete` — initiator finishes the
/// session; a new KEK version activates atomically with the status flip.
async fn complete_recovery(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Path(session_id): Path<String>,
    Json(body): Json<CompleteRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_member(&principal, &tenant).await?;

    let (view, version) = state
        .recovery
        .complete(
            &tenant,
            &session_id,
            &principal.user_ref(),
            &body.recovered_kek,
            &body.new_version.id,
            &body.new_version.reason,
        )
        .await?;
    Ok(Json(json!({
        "session": view,
        "new_version": version,
    })))
}

/// `DELETE /kek/recovery/{sessionId}` — initiator cancels a pending
/// session.
async fn cancel_recovery(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Path(session_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    let view = state
        .recovery
        .cancel(&tenant, &session_id, &principal.user_ref())
        .await?;
    Ok(Json(view))
}

#[derive(Debug, Deserialize)]
struct StorePublicKeyRequest {
    #[serde(rename = "publicKey")]
    public_key: String,
    #[serde(default = "default_purpose")]
    purpose: String,
    /// Register on behalf of another user; requires admin.
    #[serde(rename = "userId", default)]
    user_id: Option<String>,
}

fn default_purpose() -> String {
    PURPOSE_ADMIN_PROMOTION.to_string()
}

/// `POST /public-keys` — upsert a public key for the caller (or, as
/// admin, for another user).
async fn store_public_key(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Json(body): Json<StorePublicKeyRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;

    let target = match body.user_id {
        Some(ref other) if tag_user(other) != principal.user_ref() => {
            state.require_admin(&principal, &tenant).await?;
            tag_user(other)
        }
        _ => principal.user_ref(),
    };

    let record = state
        .pubkeys
        .store(&tenant, &target, &body.purpose, &body.public_key)
        .await?;
    Ok((StatusCode::CREATED, Json(record)))
}

#[derive(Debug, Deserialize)]
struct PurposeQuery {
    #[serde(default = "default_purpose")]
    purpose: String,
}

/// `GET /public-keys/user/{userId}?purpose=…` — fetch a user's registered
/// key.
async fn get_public_key(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Path(user_id): Path<String>,
    Query(query): Query<PurposeQuery>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_member(&principal, &tenant).await?;

    let record = state.pubkeys.get(&tenant, &user_id, &query.purpose).await?;
    Ok(Json(record))
}

#[derive(Debug, Deserialize)]
struct UpdatePublicKeyRequest {
    #[serde(rename = "publicKey")]
    public_key: String,
}

/// `PUT /public-keys/{keyId}` — replace key material. Owner or admin.
async fn update_public_key(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Path(key_id): Path<String>,
    Json(body): Json<UpdatePublicKeyRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    require_key_owner_or_admin(&state, &principal, &tenant, &key_id).await?;

    let record = state.pubkeys.update(&tenant, &key_id, &body.public_key).await?;
    Ok(Json(record))
}

/// `DELETE /public-keys/{keyId}` — remove a key. Owner or admin.
async fn delete_public_key(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Path(key_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    require_key_owner_or_admin(&state, &principal, &tenant, &key_id).await?;

    state.pubkeys.delete(&tenant, &key_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct VerifyPublicKeyRequest {
    #[serde(rename = "userId")]
    user_id: String,
    #[serde(default = "default_purpose")]
    purpose: String,
    #[serde(rename = "publicKey")]
    public_key: String,
}

/// `POST /public-keys/verify` — does the presented key match the stored
/// record?
async fn verify_public_key(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    headers: HeaderMap,
    Json(body): Json<VerifyPublicKeyRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, Some(&principal))?;
    state.require_member(&principal, &tenant).await?;

    let valid = state
        .pubkeys
        .verify(&tenant, &body.user_id, &body.purpose, &body.public_key)
        .await?;
    Ok(Json(json!({ "valid": valid })))
}

async fn require_key_owner_or_admin(
    state: &AppState,
    principal: &crate::principal::Principal,
    tenant: &str,
    key_id: &str,
) -> crate::Result<()> {
    let record = state.pubkeys.get_by_id(tenant, key_id).await?;
    if record.user_id == principal.user_ref() {
        return Ok(());
    }
    state.require_admin(principal, tenant).await.map_err(|_| {
        Error::AccessDenied("modifying another user's public key requires tenant admin".to_string())
    })
}
