//! Internal session and resource tokens.
//!
//! Both token kinds are HS256 JWTs signed with the configured symmetric
//! secret. A `typ` claim discriminates them so a resource token can never
//! be presented where a session token is expected, and vice versa.
//!
//! Sessions are stateless; logout is best-effort revocation through a
//! per-user deny-list. A deny-list entry records *when* the user logged
//! out: tokens issued at or before that instant are rejected, tokens from
//! a later login pass. Entries outlive the longest token they could deny
//! and are then reaped.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use dashmap::DashMap;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::principal::Principal;
use crate::{Error, Result};

/// Discriminator between the two internal token kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// General-purpose session token.
    Session,
    /// Short-lived token bound to a single tenant and resource.
    Resource,
}

/// Claims carried by internal tokens.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject (tagged user reference).
    pub sub: String,
    /// Tenant the token was issued for.
    pub tenant_id: String,
    /// Token kind discriminator.
    pub typ: TokenKind,
    /// Bound resource; present on resource tokens only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource: Option<String>,
    /// Scope hints granted at issuance.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scopes: Vec<String>,
    /// Issued-at (Unix epoch seconds).
    pub iat: u64,
    /// Expires-at (Unix epoch seconds).
    pub exp: u64,
}

/// Unix epoch seconds now.
#[must_use]
pub fn epoch_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::ZERO)
        .as_secs()
}

/// Mints and verifies internal tokens; owns the logout deny-list.
pub struct SessionService {
    encoding: EncodingKey,
    decoding: DecodingKey,
    session_ttl: Duration,
    resource_ttl: Duration,
    /// user id → epoch second of revocation
    deny_list: DashMap<String, u64>,
}

impl SessionService {
    /// Create a service signing with `secret`.
    #[must_use]
    pub fn new(secret: &str, session_ttl: Duration, resource_ttl: Duration) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            session_ttl,
            resource_ttl,
            deny_list: DashMap::new(),
        }
    }

    /// Mint a session token for `principal`.
    pub fn mint_session(&self, principal: &Principal) -> Result<String> {
        let now = epoch_now();
        let claims = TokenClaims {
            sub: principal.user_ref(),
            tenant_id: principal.tenant_id.clone(),
            typ: TokenKind::Session,
            resource: None,
            scopes: principal.scopes.clone(),
            iat: now,
            exp: now + self.session_ttl.as_secs(),
        };
        self.encode(&claims)
    }

    /// Mint a resource token binding `(tenant, resource)`.
    pub fn mint_resource(&self, user: &str, tenant: &str, resource: &str) -> Result<String> {
        let now = epoch_now();
        let claims = TokenClaims {
            sub: user.to_string(),
            tenant_id: tenant.to_string(),
            typ: TokenKind::Resource,
            resource: Some(resource.to_string()),
            scopes: Vec::new(),
            iat: now,
            exp: now + self.resource_ttl.as_secs(),
        };
        self.encode(&claims)
    }

    fn encode(&self, claims: &TokenClaims) -> Result<String> {
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), claims, &self.encoding)
            .map_err(|e| Error::Internal(format!("token encoding failed: {e}")))
    }

    fn decode(&self, token: &str) -> Result<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 30;

        jsonwebtoken::decode::<TokenClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| Error::Authentication(format!("invalid token: {e}")))
    }

    /// Verify a session token: signature, expiry, kind, and the deny-list.
    pub fn verify_session(&self, token: &str) -> Result<TokenClaims> {
        let claims = self.decode(token)?;
        if claims.typ != TokenKind::Session {
            return Err(Error::Authentication(
                "expected a session token".to_string(),
            ));
        }
        if self.is_denied(&claims.sub, claims.iat) {
            return Err(Error::Authentication("session revoked".to_string()));
        }
        Ok(claims)
    }

    /// Verify a resource token: signature, expiry, and kind. Tenant and
    /// resource binding are checked by the caller against the request.
    pub fn verify_resource(&self, token: &str) -> Result<TokenClaims> {
        let claims = self.decode(token)?;
        if claims.typ != TokenKind::Resource {
            return Err(Error::Authentication(
                "expected a resource token".to_string(),
            ));
        }
        if claims.resource.as_deref().unwrap_or("").is_empty() {
            return Err(Error::Authentication(
                "resource token carries no resource".to_string(),
            ));
        }
        Ok(claims)
    }

    /// Revoke every session the user currently holds. Tokens issued after
    /// this call (a fresh login) are unaffected.
    pub fn revoke_user(&self, user: &str) {
        let user = crate::principal::tag_user(user);
        self.deny_list.insert(user.clone(), epoch_now());
        info!(user = %user, audit = true, "Sessions revoked");
    }

    fn is_denied(&self, sub: &str, iat: u64) -> bool {
        self.deny_list
            .get(sub)
            .is_some_and(|denied_at| iat <= *denied_at)
    }

    /// Drop deny-list entries old enough that every token they could deny
    /// has expired. Called by the background sweeper.
    pub fn sweep_deny_list(&self) -> usize {
        let cutoff = epoch_now().saturating_sub(self.session_ttl.as_secs() + 60);
        let doomed: Vec<String> = self
            .deny_list
            .iter()
            .filter(|e| *e.value() < cutoff)
            .map(|e| e.key().clone())
            .collect();

        let count = doomed.len();
        for user in doomed {
            self.deny_list.remove(&user);
        }
        if count > 0 {
            debug!(count, "Reaped expired deny-list entries");
        }
        count
    }
}
