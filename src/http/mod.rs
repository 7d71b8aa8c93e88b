//! HTTP surface — application state, authentication extraction, and the
//! router.
//!
//! Handlers are grouped per endpoint family: session/auth, tenancy, API
//! keys, KEK lifecycle and blobs, recovery and public keys. They all share
//! one [`AppState`] and speak the envelope defined in [`respond`].
//!
//! Tenant scoping: every request resolves an effective tenant from the
//! `X-Tenant-ID` header, falling back to the authenticated principal's
//! tenant and then the configured default. A credential issued for one
//! tenant can never act in another — a mismatch is a 403, not a silent
//! re-scope.

pub mod apikeys;
pub mod auth;
pub mod kek;
pub mod recovery;
pub mod respond;
pub mod tenants;

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::FromRequestParts,
    http::{HeaderMap, request::Parts},
    response::IntoResponse,
    routing::get,
};
use governor::{Quota, RateLimiter};
use serde_json::json;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::apikey::ApiKeyService;
use crate::authz::AuthzService;
use crate::cache::DecisionCache;
use crate::config::Config;
use crate::exchange::TokenExchange;
use crate::identity::{IdentityGateway, SessionService};
use crate::kek::{KekBlobStore, KekRegistry, PublicKeyRegistry, RecoveryService};
use crate::principal::Principal;
use crate::{Error, Result};

use respond::ApiError;

/// Keyed rate limiter over client IPs.
pub type IpRateLimiter = governor::DefaultKeyedRateLimiter<String>;

/// Shared application state behind every handler.
pub struct AppState {
    /// Service configuration.
    pub config: Config,
    /// Authorization service.
    pub authz: Arc<AuthzService>,
    /// Identity gateway.
    pub identity: Arc<IdentityGateway>,
    /// Session/resource token service.
    pub sessions: Arc<SessionService>,
    /// API-key subsystem.
    pub apikeys: Arc<ApiKeyService>,
    /// Token exchange.
    pub exchange: Arc<TokenExchange>,
    /// KEK version registry.
    pub kek_registry: Arc<KekRegistry>,
    /// KEK blob store.
    pub kek_blobs: Arc<KekBlobStore>,
    /// Public-key registry.
    pub pubkeys: Arc<PublicKeyRegistry>,
    /// Recovery sessions.
    pub recovery: Arc<RecoveryService>,
    /// Decision cache, when enabled.
    pub cache: Option<Arc<DecisionCache>>,
    /// Rate limiter for credential-accepting endpoints, when enabled.
    pub rate_limiter: Option<IpRateLimiter>,
}

impl AppState {
    /// Build the rate limiter from configuration.
    #[must_use]
    pub fn build_rate_limiter(config: &Config) -> Option<IpRateLimiter> {
        if !config.rate_limit.enabled {
            return None;
        }
        let per_minute = NonZeroU32::new(config.rate_limit.per_minute.max(1))?;
        let burst = NonZeroU32::new(config.rate_limit.burst.max(1))?;
        Some(RateLimiter::keyed(
            Quota::per_minute(per_minute).allow_burst(burst),
        ))
    }

    /// Enforce the per-IP rate limit on a credential-accepting endpoint.
    pub fn check_rate(&self, headers: &HeaderMap) -> Result<()> {
        let Some(limiter) = &self.rate_limiter else {
            return Ok(());
        };
        let key = client_ip(headers).map_or_else(|| "local".to_string(), |ip| ip.to_string());
        limiter.check_key(&key).map_err(|_| Error::RateLimited)
    }

    /// Resolve the effective tenant for a request.
    ///
    /// The header wins when present; an authenticated principal bound to a
    /// different tenant is rejected rather than silently re-scoped.
    pub fn effective_tenant(
        &self,
        headers: &HeaderMap,
        principal: Option<&Principal>,
    ) -> Result<String> {
        let header_tenant = tenant_header(headers);
        match (header_tenant, principal) {
            (Some(header), Some(p)) if !p.tenant_id.is_empty() && p.tenant_id != header => {
                Err(Error::AccessDenied(format!(
                    "credential is scoped to tenant '{}'",
                    p.tenant_id
                )))
            }
            (Some(header), _) => Ok(header),
            (None, Some(p)) if !p.tenant_id.is_empty() => Ok(p.tenant_id.clone()),
            (None, _) => Ok(self.config.default_tenant.clone()),
        }
    }

    /// `true` if the principal is admin of `tenant` or of the system.
    pub async fn is_admin(&self, principal: &Principal, tenant: &str) -> Result<bool> {
        let user = principal.user_ref();
        if self
            .authz
            .check(Some(tenant), &user, "admin", &format!("tenant:{tenant}"), &[])
            .await?
        {
            return Ok(true);
        }
        self.authz
            .check(Some(tenant), &user, "admin", "system:*", &[])
            .await
    }

    /// Require tenant (or system) admin standing.
    pub async fn require_admin(&self, principal: &Principal, tenant: &str) -> Result<()> {
        if self.is_admin(principal, tenant).await? {
            Ok(())
        } else {
            Err(Error::AccessDenied(format!(
                "requires admin of tenant '{tenant}'"
            )))
        }
    }

    /// Require tenant membership (admins qualify).
    pub async fn require_member(&self, principal: &Principal, tenant: &str) -> Result<()> {
        let user = principal.user_ref();
        let member = self
            .authz
            .check(Some(tenant), &user, "member", &format!("tenant:{tenant}"), &[])
            .await?;
        if member || self.is_admin(principal, tenant).await? {
            Ok(())
        } else {
            Err(Error::AccessDenied(format!(
                "requires membership of tenant '{tenant}'"
            )))
        }
    }
}

/// The `X-Tenant-ID` header, if present and non-empty.
#[must_use]
pub fn tenant_header(headers: &HeaderMap) -> Option<String> {
    headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// Client IP from `X-Forwarded-For` or `X-Real-IP`.
#[must_use]
pub fn client_ip(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|s| s.trim().parse().ok())
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.trim().parse().ok())
        })
}

/// Bearer credential from the `Authorization` header.
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
}

/// An authenticated caller, extracted from the bearer credential.
///
/// Accepts an internal session token or a raw API key; anything else is a
/// 401. Handlers that take this extractor are authenticated by
/// construction.
#[derive(Debug, Clone)]
pub struct AuthedPrincipal(pub Principal);

impl FromRequestParts<Arc<AppState>> for AuthedPrincipal {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> std::result::Result<Self, Self::Rejection> {
        let Some(token) = bearer_token(&parts.headers) else {
            return Err(ApiError(Error::Authentication(
                "missing Authorization header".to_string(),
            )));
        };

        // Session token first (cheap, local), then the API-key digest path.
        if let Ok(principal) = state.identity.validate(token) {
            return Ok(Self(principal));
        }
        if token.contains('.') {
            if let Ok(principal) = state.apikeys.verify_direct(token).await {
                return Ok(Self(principal));
            }
        }

        Err(ApiError(Error::Authentication(
            "invalid bearer credential".to_string(),
        )))
    }
}

/// Assemble the full router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .merge(auth::routes())
        .merge(tenants::routes())
        .merge(apikeys::routes())
        .merge(kek::routes())
        .merge(recovery::routes())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// `GET /health` — liveness, public.
async fn health(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> impl IntoResponse {
    let cache = state.cache.as_ref().map(|c| c.stats());
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "cache": cache,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn tenant_header_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(tenant_header(&headers), None);

        headers.insert("x-tenant-id", HeaderValue::from_static("acme"));
        assert_eq!(tenant_header(&headers).as_deref(), Some("acme"));

        headers.insert("x-tenant-id", HeaderValue::from_static("  "));
        assert_eq!(tenant_header(&headers), None);
    }

    #[test]
    fn bearer_token_parsing() {
        let mut headers = HeaderMap::new();
        assert_eq!(bearer_token(&headers), None);

        headers.insert("authorization", HeaderValue::from_static("Bearer abc"));
        assert_eq!(bearer_token(&headers), Some("abc"));

        headers.insert("authorization", HeaderValue::from_static("bearer xyz"));
        assert_eq!(bearer_token(&headers), Some("xyz"));

        headers.insert("authorization", HeaderValue::from_static("Basic abc"));
        assert_eq!(bearer_token(&headers), None);
    }

    #[test]
    fn client_ip_prefers_forwarded_for() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("10.1.2.3, 172.16.0.1"),
        );
        headers.insert("x-real-ip", HeaderValue::from_static("192.168.9.9"));

        assert_eq!(client_ip(&headers), Some("10.1.2.3".parse().unwrap()));
    }
}
