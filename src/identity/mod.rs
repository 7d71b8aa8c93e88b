//! Identity gateway — verifies external identity-provider credentials and
//! issues internal session tokens.
//!
//! Four entry points: password login and M2M (client-credentials) login
//! delegate the credential check to the external provider's token endpoint;
//! `validate` checks an internal session token; `logout` revokes a user's
//! sessions through the deny-list. All of them resolve to a
//! [`Principal`](crate::principal::Principal) on success.
//!
//! The gateway never sees password hashes or provider keys: passwords go to
//! the provider over TLS, and the provider's answer (a JWT) is verified
//! against its JWKS like any other identity token.

pub mod jwks;
pub mod session;

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::IdentityProviderConfig;
use crate::principal::Principal;
use crate::{Error, Result};

pub use jwks::{IdpVerifier, VerifiedIdentity};
pub use session::{SessionService, TokenClaims, TokenKind};

/// A successful login: the minted session token plus the resolved
/// principal.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    /// Internal session token for downstream calls.
    pub token: String,
    /// Resolved principal.
    pub principal: Principal,
    /// Identity details from the provider.
    pub identity: VerifiedIdentity,
}

/// Token-endpoint response from the identity provider.
#[derive(Debug, Deserialize)]
struct GrantResponse {
    access_token: String,
}

/// Identity gateway over the external provider and the session service.
pub struct IdentityGateway {
    config: IdentityProviderConfig,
    verifier: Arc<IdpVerifier>,
    sessions: Arc<SessionService>,
    http: reqwest::Client,
}

impl IdentityGateway {
    /// Create the gateway.
    pub fn new(
        config: IdentityProviderConfig,
        verifier: Arc<IdpVerifier>,
        sessions: Arc<SessionService>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("identity provider client: {e}")))?;
        Ok(Self {
            config,
            verifier,
            sessions,
            http,
        })
    }

    /// Password login: delegate to the provider's password grant, verify
    /// the returned token, and mint a session.
    pub async fn login(
        &self,
        username: &str,
        password: &str,
        tenant: &str,
    ) -> Result<LoginOutcome> {
        if username.is_empty() || password.is_empty() {
            return Err(Error::Validation("username and password are required".to_string()));
        }
        let params = [
            ("grant_type", "password"),
            ("username", username),
            ("password", password),
        ];
        self.grant_login(&params, tenant).await
    }

    /// Machine-to-machine login via the client-credentials grant.
    pub async fn m2m_login(
        &self,
        client_id: &str,
        client_secret: &str,
        tenant: &str,
    ) -> Result<LoginOutcome> {
        if client_id.is_empty() || client_secret.is_empty() {
            return Err(Error::Validation("clientId and clientSecret are required".to_string()));
        }
        let params = [
            ("grant_type", "client_credentials"),
            ("client_id", client_id),
            ("client_secret", client_secret),
        ];
        self.grant_login(&params, tenant).await
    }

    async fn grant_login(&self, params: &[(&str, &str)], tenant: &str) -> Result<LoginOutcome> {
        if self.config.token_endpoint.is_empty() {
            return Err(Error::Config(
                "identity_provider.token_endpoint is not configured".to_string(),
            ));
        }

        let response = self
            .http
            .post(&self.config.token_endpoint)
            .form(params)
            .send()
            .await?;

        if !response.status().is_success() {
            // 4xx from the provider means the credentials were wrong; the
            // exact reason is the provider's business, not the caller's.
            let status = response.status();
            if status.is_client_error() {
                warn!(status = %status, audit = true, "Identity provider rejected login");
                return Err(Error::Authentication("invalid credentials".to_string()));
            }
            return Err(Error::BackendUnavailable(format!(
                "identity provider returned {status}"
            )));
        }

        let grant: GrantResponse = response
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("malformed grant response: {e}")))?;

        let identity = self.verifier.verify(&grant.access_token).await?;
        let principal = self.principal_for(&identity, tenant);
        let token = self.sessions.mint_session(&principal)?;

        info!(user = %principal.user_id, tenant = %principal.tenant_id, audit = true, "Login succeeded");
        Ok(LoginOutcome {
            token,
            principal,
            identity,
        })
    }

    /// Exchange an already-verified identity into a session for `tenant`.
    /// Used by the token-exchange service after its own membership check.
    pub fn mint_for_identity(&self, identity: &VerifiedIdentity, tenant: &str) -> Result<String> {
        let principal = self.principal_for(identity, tenant);
        self.sessions.mint_session(&principal)
    }

    fn principal_for(&self, identity: &VerifiedIdentity, tenant: &str) -> Principal {
        // The request tenant wins; the token's tenant claim is the fallback.
        let tenant_id = if tenant.is_empty() {
            identity.tenant.clone().unwrap_or_default()
        } else {
            tenant.to_string()
        };
        Principal::new(crate::principal::tag_user(&identity.subject), tenant_id)
    }

    /// Validate an internal session token, returning the principal.
    pub fn validate(&self, token: &str) -> Result<Principal> {
        let claims = self.sessions.verify_session(token)?;
        debug!(user = %claims.sub, "Session validated");
        Ok(Principal {
            user_id: claims.sub,
            tenant_id: claims.tenant_id,
            scopes: claims.scopes,
        })
    }

    /// Best-effort logout: deny every session the user currently holds.
    pub fn logout(&self, user: &str) {
        self.sessions.revoke_user(user);
    }
}

/// Spawn the deny-list reaper.
///
/// Ticks on `interval` and exits when `shutdown` fires.
pub fn spawn_deny_list_sweeper(
    sessions: Arc<SessionService>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    sessions.sweep_deny_list();
                }
                _ = shutdown.recv() => {
                    debug!("Deny-list sweeper shutting down");
                    break;
                }
            }
        }
    });
}
