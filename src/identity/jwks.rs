//! Identity-provider token verification — JWT signature validation and JWKS
//! caching.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) to extract `kid` and `alg`.
//! 2. Fetch the provider's JWKS (cached; refreshed once on unknown `kid`).
//! 3. Verify the signature and standard claims (`exp`, `iss`, `aud`).
//! 4. Return a [`VerifiedIdentity`] with the extracted claims.
//!
//! Unknown `kid` triggers a single cache refresh before failing, so a key
//! that truly does not exist cannot cause a re-fetch loop. A 60-second
//! leeway tolerates clock skew between the provider and this host.

use std::time::{Duration, Instant};

use jsonwebtoken::{
    Algorithm, DecodingKey, Header, TokenData, Validation,
    jwk::{AlgorithmParameters, JwkSet},
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::IdentityProviderConfig;
use crate::{Error, Result};

/// Verified identity extracted from a valid identity-provider token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifiedIdentity {
    /// Provider `sub` claim (opaque user id).
    pub subject: String,
    /// Tenant claim carried by the token, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant: Option<String>,
    /// Email address, if the provider includes one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    /// Issuer URL.
    pub issuer: String,
}

/// Raw claims extracted from an identity token.
#[derive(Debug, Deserialize)]
struct IdTokenClaims {
    iss: String,
    sub: String,
    #[serde(default)]
    aud: serde_json::Value,
    /// Validated by jsonwebtoken internally
    #[allow(dead_code)]
    exp: u64,
    #[serde(default)]
    email: Option<String>,
    /// Tenant claim; providers differ on the name
    #[serde(default, alias = "org_id")]
    tenant_id: Option<String>,
}

struct CachedJwks {
    keys: JwkSet,
    fetched_at: Instant,
}

/// Identity-provider token verifier: one configured issuer, one cached
/// JWKS.
pub struct IdpVerifier {
    config: IdentityProviderConfig,
    http: reqwest::Client,
    jwks: RwLock<Option<CachedJwks>>,
}

impl IdpVerifier {
    /// Create a verifier from provider configuration.
    pub fn new(config: IdentityProviderConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("identity provider client: {e}")))?;
        Ok(Self {
            config,
            http,
            jwks: RwLock::new(None),
        })
    }

    /// Verify an identity-provider token and return the extracted identity.
    ///
    /// # Errors
    ///
    /// [`Error::Authentication`] for any invalid, expired, or mis-issued
    /// token; [`Error::BackendUnavailable`] when the JWKS endpoint cannot
    /// be reached.
    pub async fn verify(&self, token: &str) -> Result<VerifiedIdentity> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| Error::Authentication(format!("malformed token: {e}")))?;
        let kid = header
            .kid
            .clone()
            .ok_or_else(|| Error::Authentication("token missing 'kid' header".to_string()))?;

        let decoding_key = self.find_decoding_key(&kid).await?;
        let mut validation = build_validation(&header);
        validation.set_issuer(&[&self.config.issuer]);
        // Audience handled manually: `aud` may be a string or an array.
        validation.validate_aud = false;

        let token_data: TokenData<IdTokenClaims> =
            jsonwebtoken::decode(token, &decoding_key, &validation)
                .map_err(|e| Error::Authentication(format!("token verification failed: {e}")))?;
        let claims = token_data.claims;

        if !self.config.audiences.is_empty() && !audience_matches(&claims.aud, &self.config.audiences)
        {
            return Err(Error::Authentication("audience mismatch".to_string()));
        }

        Ok(VerifiedIdentity {
            subject: claims.sub,
            tenant: claims.tenant_id,
            email: claims.email,
            issuer: claims.iss,
        })
    }

    /// Find a decoding key by `kid`, refreshing the JWKS once if absent.
    async fn find_decoding_key(&self, kid: &str) -> Result<DecodingKey> {
        if let Some(key) = self.cached_key(kid) {
            return Ok(key);
        }

        debug!(kid = %kid, "Key not in cached JWKS, refreshing");
        self.refresh_jwks().await?;
        self.cached_key(kid)
            .ok_or_else(|| Error::Authentication(format!("unknown signing key '{kid}'")))
    }

    fn cached_key(&self, kid: &str) -> Option<DecodingKey> {
        let guard = self.jwks.read();
        let cached = guard.as_ref()?;
        if cached.fetched_at.elapsed() >= Duration::from_secs(self.config.jwks_ttl_secs) {
            return None;
        }
        find_key_in_jwks(&cached.keys, kid)
    }

    async fn refresh_jwks(&self) -> Result<()> {
        let uri = self.config.effective_jwks_uri();
        let jwks: JwkSet = self
            .http
            .get(&uri)
            .send()
            .await?
            .error_for_status()
            .map_err(|e| Error::BackendUnavailable(format!("JWKS fetch failed: {e}")))?
            .json()
            .await
            .map_err(|e| Error::BackendUnavailable(format!("malformed JWKS: {e}")))?;

        *self.jwks.write() = Some(CachedJwks {
            keys: jwks,
            fetched_at: Instant::now(),
        });
        Ok(())
    }
}

/// Find a JWK by `kid` in a `JwkSet` and convert it to a `DecodingKey`.
fn find_key_in_jwks(jwks: &JwkSet, kid: &str) -> Option<DecodingKey> {
    for jwk in &jwks.keys {
        let jwk_kid = jwk.common.key_id.as_deref().unwrap_or("");
        if jwk_kid != kid {
            continue;
        }

        return match &jwk.algorithm {
            AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e).ok(),
            AlgorithmParameters::EllipticCurve(ec) => {
                DecodingKey::from_ec_components(&ec.x, &ec.y).ok()
            }
            AlgorithmParameters::OctetKey(_) | AlgorithmParameters::OctetKeyPair(_) => None,
        };
    }
    None
}

/// Build a [`Validation`] from the JWT header algorithm.
fn build_validation(header: &Header) -> Validation {
    let alg = match header.alg {
        Algorithm::RS256 => Algorithm::RS256,
        Algorithm::RS384 => Algorithm::RS384,
        Algorithm::RS512 => Algorithm::RS512,
        Algorithm::ES256 => Algorithm::ES256,
        Algorithm::ES384 => Algorithm::ES384,
        other => {
            warn!(alg = ?other, "Unsupported identity token algorithm, defaulting to RS256");
            Algorithm::RS256
        }
    };

    let mut v = Validation::new(alg);
    v.leeway = 60;
    v
}

/// `true` if the token's `aud` claim (string or array) matches any expected
/// audience.
fn audience_matches(aud_claim: &serde_json::Value, expected: &[String]) -> bool {
    match aud_claim {
        serde_json::Value::String(s) => expected.iter().any(|e| e == s),
        serde_json::Value::Array(arr) => arr
            .iter()
            .any(|v| v.as_str().is_some_and(|s| expected.iter().any(|e| e == s))),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audience_accepts_string_and_array_forms() {
        // GIVEN: expected audience "tessera"
        let expected = vec!["tessera".to_string()];

        // THEN: both claim forms match
        assert!(audience_matches(&serde_json::json!("tessera"), &expected));
        assert!(audience_matches(
            &serde_json::json!(["other", "tessera"]),
            &expected
        ));
    }

    #[test]
    fn audience_rejects_mismatch_and_empty() {
        let expected = vec!["tessera".to_string()];
        assert!(!audience_matches(&serde_json::json!("wrong"), &expected));
        assert!(!audience_matches(&serde_json::json!([]), &expected));
        assert!(!audience_matches(&serde_json::json!(null), &expected));
    }

    #[test]
    fn unsupported_algorithms_fall_back_to_rs256() {
        let header = Header::new(Algorithm::HS256);
        let validation = build_validation(&header);
        assert_eq!(validation.algorithms, vec![Algorithm::RS256]);
    }

    #[tokio::test]
    async fn malformed_token_is_an_authentication_failure() {
        let verifier = IdpVerifier::new(IdentityProviderConfig::default()).unwrap();
        let err = verifier.verify("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }
}
