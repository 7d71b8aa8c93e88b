//! `/api/auth/*` — sessions, token exchange, and authorization checks.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::HeaderMap,
    response::IntoResponse,
    routing::post,
};
use serde::Deserialize;
use serde_json::json;

use super::respond::{ApiResult, success};
use super::{AppState, bearer_token};
use crate::principal::tag_user;
use crate::tuple::Tuple;
use crate::Error;

/// Auth and authorization routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/auth/login", post(login))
        .route("/api/auth/m2m", post(m2m))
        .route("/api/auth/validate", post(validate))
        .route("/api/auth/logout", post(logout))
        .route("/api/auth/login-with-api-key", post(login_with_api_key))
        .route("/api/auth/exchange-token", post(exchange_token))
        .route(
            "/api/auth/exchange-token-for-resource",
            post(exchange_token_for_resource),
        )
        .route("/api/auth/verify-resource-token", post(verify_resource_token))
        .route("/api/auth/check", post(check))
        .route("/api/auth/grant", post(grant))
        .route("/api/auth/revoke", post(revoke))
}

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

/// `POST /api/auth/login` — password login via the identity provider.
async fn login(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<LoginRequest>,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&headers)?;
    let tenant = state.effective_tenant(&headers, None)?;

    let outcome = state
        .identity
        .login(&body.username, &body.password, &tenant)
        .await?;

    Ok(Json(json!({
        "token": outcome.token,
        "user_id": outcome.principal.user_id,
        "tenant_id": outcome.principal.tenant_id,
        "user": {
            "id": outcome.principal.user_id,
            "email": outcome.identity.email,
        },
    })))
}

#[derive(Debug, Deserialize)]
struct M2mRequest {
    #[serde(rename = "clientId")]
    client_id: String,
    #[serde(rename = "clientSecret")]
    client_secret: String,
}

/// `POST /api/auth/m2m` — client-credentials login.
async fn m2m(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<M2mRequest>,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&headers)?;
    let tenant = state.effective_tenant(&headers, None)?;

    let outcome = state
        .identity
        .m2m_login(&body.client_id, &body.client_secret, &tenant)
        .await?;

    Ok(Json(json!({ "token": outcome.token })))
}

#[derive(Debug, Deserialize, Default)]
struct ValidateRequest {
    #[serde(default)]
    token: Option<String>,
}

/// `POST /api/auth/validate` — validate a session token from the body
/// (`{}` falls back to the `Authorization` header). 200 with the
/// principal if valid, 401 otherwise.
async fn validate(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ValidateRequest>,
) -> ApiResult<impl IntoResponse> {
    let token = body
        .token
        .as_deref()
        .or_else(|| bearer_token(&headers))
        .ok_or_else(|| Error::Validation("token is required".to_string()))?;

    let principal = state.identity.validate(token)?;
    Ok(Json(json!({
        "valid": true,
        "user": {
            "id": principal.user_id,
            "tenant_id": principal.tenant_id,
            "scopes": principal.scopes,
        },
    })))
}

#[derive(Debug, Deserialize)]
struct LogoutRequest {
    #[serde(rename = "userId")]
    user_id: String,
}

/// `POST /api/auth/logout` — best-effort revocation of a user's sessions.
async fn logout(
    State(state): State<Arc<AppState>>,
    Json(body): Json<LogoutRequest>,
) -> ApiResult<impl IntoResponse> {
    if body.user_id.is_empty() {
        return Err(Error::Validation("userId is required".to_string()).into());
    }
    state.identity.logout(&body.user_id);
    Ok(success(json!({})))
}

#[derive(Debug, Deserialize)]
struct ApiKeyLoginRequest {
    #[serde(rename = "apiKey")]
    api_key: String,
}

/// `POST /api/auth/login-with-api-key` — authenticate with a raw API key
/// and mint a session.
async fn login_with_api_key(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ApiKeyLoginRequest>,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&headers)?;

    let principal = state.apikeys.verify_direct(&body.api_key).await?;
    let token = state.sessions.mint_session(&principal)?;

    Ok(Json(json!({
        "token": token,
        "user_id": principal.user_id,
        "tenant_id": principal.tenant_id,
        "user": { "id": principal.user_id },
    })))
}

#[derive(Debug, Deserialize)]
struct ExchangeRequest {
    token: String,
}

/// `POST /api/auth/exchange-token` — identity token in, session token out.
async fn exchange_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ExchangeRequest>,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&headers)?;
    let tenant = state.effective_tenant(&headers, None)?;

    let token = state.exchange.exchange(&body.token, &tenant).await?;
    Ok(Json(json!({ "token": token })))
}

#[derive(Debug, Deserialize)]
struct ResourceExchangeRequest {
    token: String,
    resource: String,
}

/// `POST /api/auth/exchange-token-for-resource` — identity token in,
/// resource-scoped token out.
async fn exchange_token_for_resource(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ResourceExchangeRequest>,
) -> ApiResult<impl IntoResponse> {
    state.check_rate(&headers)?;
    let tenant = state.effective_tenant(&headers, None)?;

    let token = state
        .exchange
        .exchange_for_resource(&body.token, &tenant, &body.resource)
        .await?;
    Ok(Json(json!({ "token": token })))
}

/// `POST /api/auth/verify-resource-token` — validate a resource token's
/// signature, expiry, and tenant binding.
async fn verify_resource_token(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<ExchangeRequest>,
) -> ApiResult<impl IntoResponse> {
    let expected_tenant = super::tenant_header(&headers);
    let claims = state
        .exchange
        .verify_resource_token(&body.token, expected_tenant.as_deref(), None)?;

    Ok(Json(json!({
        "valid": true,
        "userId": claims.sub,
        "tenantId": claims.tenant_id,
        "resource": claims.resource,
    })))
}

#[derive(Debug, Deserialize)]
struct ContextualTupleBody {
    user: String,
    relation: String,
    object: String,
}

#[derive(Debug, Deserialize)]
struct CheckRequest {
    user: String,
    relation: String,
    object: String,
    #[serde(rename = "contextualTuples", default)]
    contextual_tuples: Vec<ContextualTupleBody>,
}

/// `POST /api/auth/check` — evaluate a relation.
async fn check(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<CheckRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, None)?;
    let contextual: Vec<Tuple> = body
        .contextual_tuples
        .iter()
        .map(|t| Tuple::new(tag_user(&t.user), t.relation.clone(), t.object.clone()))
        .collect();

    let allowed = state
        .authz
        .check(
            Some(&tenant),
            &tag_user(&body.user),
            &body.relation,
            &body.object,
            &contextual,
        )
        .await?;
    Ok(Json(json!({ "allowed": allowed })))
}

#[derive(Debug, Deserialize)]
struct GrantRequest {
    user: String,
    relation: String,
    object: String,
}

/// `POST /api/auth/grant` — write a relationship tuple. Idempotent.
async fn grant(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<GrantRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, None)?;
    state
        .authz
        .grant(Some(&tenant), &tag_user(&body.user), &body.relation, &body.object)
        .await?;
    Ok(success(json!({})))
}

/// `POST /api/auth/revoke` — delete a relationship tuple. Idempotent.
async fn revoke(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(body): Json<GrantRequest>,
) -> ApiResult<impl IntoResponse> {
    let tenant = state.effective_tenant(&headers, None)?;
    state
        .authz
        .revoke(Some(&tenant), &tag_user(&body.user), &body.relation, &body.object)
        .await?;
    Ok(success(json!({})))
}
