//! `/api/tenants` — tenant lifecycle.
//!
//! Creation is the bootstrap call: it registers the tenant, records the
//! named admin as both `admin` and `member`, and initializes the tenant's
//! first active KEK version in the same flow. A failure after the
//! registration rolls the tenant back — no partial tenants.
//!
//! Deletion cascades through everything the tenant owns: tuples, KEK
//! versions and blobs, public keys, recovery sessions, API keys, and the
//! cached decisions.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, post},
};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use super::respond::ApiResult;
use super::{AppState, AuthedPrincipal};
use crate::principal::tag_user;

/// Tenancy routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/tenants", post(create_tenant).get(list_tenants))
        .route("/api/tenants/{tenant_id}", delete(delete_tenant))
        .route("/api/tenants/{tenant_id}/users", post(add_user))
        .route(
            "/api/tenants/{tenant_id}/users/{user_id}/role",
            post(update_user_role),
        )
}

#[derive(Debug, Deserialize)]
struct CreateTenantRequest {
    #[serde(rename = "tenantId")]
    tenant_id: String,
    #[serde(rename = "adminUserId")]
    admin_user_id: String,
}

/// `POST /api/tenants` — bootstrap a tenant. 201 on success, 409 on id
/// collision.
async fn create_tenant(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateTenantRequest>,
) -> ApiResult<impl IntoResponse> {
    let admin = tag_user(&body.admin_user_id);
    state.authz.create_tenant(&body.tenant_id, &admin).await?;

    // Bootstrap step (c): a fresh active KEK version. If this fails, the
    // tenant registration is rolled back so a retry starts clean.
    if let Err(err) = state
        .kek_registry
        .create(&body.tenant_id, &admin, "tenant bootstrap")
        .await
    {
        let _ = state.authz.delete_tenant(&body.tenant_id, &admin).await;
        return Err(err.into());
    }

    info!(tenant = %body.tenant_id, admin = %admin, audit = true, "Tenant bootstrapped");
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "status": "success",
            "tenant_id": body.tenant_id,
            "admin_user_id": admin,
        })),
    ))
}

/// `GET /api/tenants` — all registered tenant ids.
async fn list_tenants(State(state): State<Arc<AppState>>) -> ApiResult<impl IntoResponse> {
    let tenants = state.authz.list_tenants().await?;
    Ok(Json(json!({ "tenants": tenants })))
}

/// `DELETE /api/tenants/{tenantId}` — cascade-delete a tenant. Requires
/// the caller to be admin of that tenant or a system admin.
async fn delete_tenant(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    Path(tenant_id): Path<String>,
) -> ApiResult<impl IntoResponse> {
    // The authz layer enforces the admin-or-system-admin rule and removes
    // tuples, registry entry, and cached decisions.
    state
        .authz
        .delete_tenant(&tenant_id, &principal.user_ref())
        .await?;

    state.kek_blobs.purge_tenant(&tenant_id).await?;
    state.kek_registry.purge_tenant(&tenant_id).await?;
    state.pubkeys.purge_tenant(&tenant_id).await?;
    state.recovery.purge_tenant(&tenant_id).await?;
    state.apikeys.purge_tenant(&tenant_id).await?;

    info!(tenant = %tenant_id, audit = true, "Tenant cascade delete complete");
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct AddUserRequest {
    #[serde(rename = "userId")]
    user_id: String,
    role: String,
}

/// `POST /api/tenants/{tenantId}/users` — add a user as `admin` or
/// `member`. Requires tenant admin.
async fn add_user(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    Path(tenant_id): Path<String>,
    Json(body): Json<AddUserRequest>,
) -> ApiResult<impl IntoResponse> {
    state.require_admin(&principal, &tenant_id).await?;
    state
        .authz
        .add_user_to_tenant(&tenant_id, &body.user_id, &body.role)
        .await?;
    Ok(StatusCode::CREATED)
}

#[derive(Debug, Deserialize)]
struct UpdateRoleRequest {
    role: String,
}

/// `POST /api/tenants/{tenantId}/users/{userId}/role` — replace the
/// user's membership role. Requires tenant admin.
async fn update_user_role(
    State(state): State<Arc<AppState>>,
    AuthedPrincipal(principal): AuthedPrincipal,
    Path((tenant_id, user_id)): Path<(String, String)>,
    Json(body): Json<UpdateRoleRequest>,
) -> ApiResult<impl IntoResponse> {
    state.require_admin(&principal, &tenant_id).await?;
    state
        .authz
        .update_user_role(&tenant_id, &user_id, &body.role)
        .await?;
    Ok(StatusCode::OK)
}
