//! API keys — issuance, digest storage, and both verification paths.
//!
//! A raw key has the form `<id>.<secret>` and is disclosed exactly once,
//! in the creation response. The server retains two derivations and never
//! the secret itself:
//!
//! - `digest` = SHA-256 over a per-key random salt and the secret, compared
//!   constant-time on the **direct** path (client sends the raw key).
//! - `mac_key` = SHA-256 of the secret alone, used as the HMAC key on the
//!   **challenge** path. The client derives the same value from its copy of
//!   the secret and answers a nonce with
//!   `<keyId>.<hex(HMAC-SHA256(mac_key, nonce))>`.
//!
//! Revocation is a tombstone: the record stays, flagged `revoked`, so a
//! revoked key can never authenticate on any path.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, KeyInit, Mac};
use rand::RngExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{info, warn};

use crate::challenge::ChallengeMap;
use crate::kv::KvStore;
use crate::principal::Principal;
use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

/// Stored API key record. The `secret` never appears here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    /// Key id (the public half of the raw key).
    pub id: String,
    /// Owning user (tagged reference).
    pub user_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Human-readable label.
    pub name: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Per-key salt, base64url.
    pub salt: String,
    /// Salted verification digest, hex.
    pub digest: String,
    /// Challenge MAC key (SHA-256 of the secret), hex.
    pub mac_key: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry, if the key expires.
    pub expires_at: Option<DateTime<Utc>>,
    /// Tombstone flag; a revoked key never authenticates.
    pub revoked: bool,
    /// Last successful verification on any path.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl ApiKeyRecord {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Utc::now() >= at)
    }
}

/// Public metadata for listings; carries no verification material.
#[derive(Debug, Clone, Serialize)]
pub struct ApiKeyInfo {
    /// Key id.
    pub id: String,
    /// Human-readable label.
    pub name: String,
    /// Granted scopes.
    pub scopes: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Expiry, if any.
    pub expires_at: Option<DateTime<Utc>>,
    /// Tombstone flag.
    pub revoked: bool,
    /// Last successful verification.
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<&ApiKeyRecord> for ApiKeyInfo {
    fn from(record: &ApiKeyRecord) -> Self {
        Self {
            id: record.id.clone(),
            name: record.name.clone(),
            scopes: record.scopes.clone(),
            created_at: record.created_at,
            expires_at: record.expires_at,
            revoked: record.revoked,
            last_used_at: record.last_used_at,
        }
    }
}

/// A freshly created key: the raw value (shown once) plus its metadata.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedApiKey {
    /// The raw key, `<id>.<secret>`. Never retrievable again.
    pub api_key: String,
    /// Metadata for display.
    #[serde(flatten)]
    pub info: ApiKeyInfo,
}

/// API-key service over the KV store and the in-memory challenge map.
pub struct ApiKeyService {
    kv: Arc<dyn KvStore>,
    challenges: Arc<ChallengeMap>,
    default_key_ttl: Option<Duration>,
}

impl ApiKeyService {
    /// Create the service. `default_key_ttl` of `None` means keys do not
    /// expire unless a caller asks for an expiry.
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        challenges: Arc<ChallengeMap>,
        default_key_ttl: Option<Duration>,
    ) -> Self {
        Self {
            kv,
            challenges,
            default_key_ttl,
        }
    }

    /// The challenge map, for issuance endpoints and sweeper wiring.
    #[must_use]
    pub fn challenges(&self) -> Arc<ChallengeMap> {
        Arc::clone(&self.challenges)
    }

    fn record_key(id: &str) -> String {
        format!("apikey:{id}")
    }

    fn user_index_key(tenant: &str, user: &str) -> String {
        format!("apikey:byUser:{tenant}:{user}")
    }

    /// Issue a new key for the principal. The raw value appears only in the
    /// returned [`CreatedApiKey`].
    pub async fn create(
        &self,
        principal: &Principal,
        name: &str,
        scopes: Vec<String>,
    ) -> Result<CreatedApiKey> {
        if name.is_empty() {
            return Err(Error::Validation("key name is required".to_string()));
        }

        let id = uuid::Uuid::new_v4().to_string();
        let secret = generate_secret();
        let salt = generate_secret();

        let record = ApiKeyRecord {
            id: id.clone(),
            user_id: principal.user_ref(),
            tenant_id: principal.tenant_id.clone(),
            name: name.to_string(),
            scopes,
            salt: salt.clone(),
            digest: salted_digest(&salt, &secret),
            mac_key: mac_key(&secret),
            created_at: Utc::now(),
            expires_at: self
                .default_key_ttl
                .map(|ttl| Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64)),
            revoked: false,
            last_used_at: None,
        };

        self.persist(&record).await?;
        self.kv
            .set_add(
                &Self::user_index_key(&record.tenant_id, &record.user_id),
                &id,
            )
            .await?;

        info!(key_id = %id, user = %record.user_id, tenant = %record.tenant_id, audit = true, "API key created");
        Ok(CreatedApiKey {
            api_key: format!("{id}.{secret}"),
            info: ApiKeyInfo::from(&record),
        })
    }

    async fn persist(&self, record: &ApiKeyRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| Error::Internal(format!("key serialization: {e}")))?;
        self.kv.put(&Self::record_key(&record.id), json).await
    }

    async fn load(&self, id: &str) -> Result<Option<ApiKeyRecord>> {
        match self.kv.get(&Self::record_key(id)).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| Error::Internal(format!("key deserialization: {e}"))),
            None => Ok(None),
        }
    }

    /// List the principal's keys (metadata only).
    pub async fn list(&self, principal: &Principal) -> Result<Vec<ApiKeyInfo>> {
        let ids = self
            .kv
            .set_members(&Self::user_index_key(&principal.tenant_id, &principal.user_ref()))
            .await?;

        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.load(&id).await? {
                out.push(ApiKeyInfo::from(&record));
            }
        }
        Ok(out)
    }

    /// Revoke a key. Only the owner (or a caller the handler has already
    /// authorized as tenant admin) may revoke; the record remains as a
    /// tombstone.
    pub async fn revoke(&self, principal: &Principal, id: &str, is_admin: bool) -> Result<()> {
        let mut record = self
            .load(id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("api key '{id}'")))?;

        if record.tenant_id != principal.tenant_id {
            return Err(Error::NotFound(format!("api key '{id}'")));
        }
        if record.user_id != principal.user_ref() && !is_admin {
            return Err(Error::AccessDenied("not the key owner".to_string()));
        }

        record.revoked = true;
        self.persist(&record).await?;
        info!(key_id = %id, audit = true, "API key revoked");
        Ok(())
    }

    /// Direct verification: the caller presents the raw key.
    pub async fn verify_direct(&self, raw_key: &str) -> Result<Principal> {
        let (id, secret) = split_raw_key(raw_key)?;
        let record = self.usable_record(id).await?;

        let expected = salted_digest(&record.salt, secret);
        if !constant_time_eq(&expected, &record.digest) {
            warn!(key_id = %id, audit = true, "API key digest mismatch");
            return Err(Error::Authentication("invalid API key".to_string()));
        }

        self.touch(record).await
    }

    /// Issue a login challenge nonce.
    #[must_use]
    pub fn issue_challenge(&self) -> String {
        self.challenges.issue()
    }

    /// Challenge verification: the caller answers a nonce with
    /// `<keyId>.<hex mac>`. The nonce is consumed only on success.
    pub async fn verify_challenge(&self, nonce: &str, response: &str) -> Result<Principal> {
        self.challenges.peek(nonce)?;

        let (id, mac_hex) = response
            .split_once('.')
            .ok_or_else(|| Error::Validation("response must be '<keyId>.<mac>'".to_string()))?;
        let record = self.usable_record(id).await?;

        let expected = challenge_mac(&record.mac_key, nonce)?;
        if !constant_time_eq(&expected, mac_hex) {
            warn!(key_id = %id, audit = true, "Challenge MAC mismatch");
            return Err(Error::Authentication("invalid challenge response".to_string()));
        }

        self.challenges.consume(nonce);
        self.touch(record).await
    }

    /// Load a record and reject tombstoned or expired keys.
    async fn usable_record(&self, id: &str) -> Result<ApiKeyRecord> {
        let record = self
            .load(id)
            .await?
            .ok_or_else(|| Error::Authentication("invalid API key".to_string()))?;

        if record.revoked {
            warn!(key_id = %id, audit = true, "Revoked API key presented");
            return Err(Error::Authentication("invalid API key".to_string()));
        }
        if record.is_expired() {
            return Err(Error::Authentication("API key expired".to_string()));
        }
        Ok(record)
    }

    /// Record the successful use and resolve the principal.
    async fn touch(&self, mut record: ApiKeyRecord) -> Result<Principal> {
        record.last_used_at = Some(Utc::now());
        self.persist(&record).await?;

        Ok(Principal {
            user_id: record.user_id,
            tenant_id: record.tenant_id,
            scopes: record.scopes,
        })
    }

    /// Purge every key belonging to a tenant. Part of the tenant-deletion
    /// cascade: records are keyed by bare id, so the per-user index sets
    /// are walked first.
    pub async fn purge_tenant(&self, tenant: &str) -> Result<usize> {
        let index_prefix = format!("apikey:byUser:{tenant}:");
        let mut removed = 0;
        for index in self.kv.set_keys_with_prefix(&index_prefix).await? {
            for id in self.kv.set_members(&index).await? {
                self.kv.delete(&Self::record_key(&id)).await?;
                removed += 1;
            }
        }
        self.kv.delete_prefix(&index_prefix).await?;
        Ok(removed)
    }
}

/// Split a raw key `<id>.<secret>`.
fn split_raw_key(raw: &str) -> Result<(&str, &str)> {
    raw.split_once('.')
        .filter(|(id, secret)| !id.is_empty() && !secret.is_empty())
        .ok_or_else(|| Error::Validation("API key must be '<id>.<secret>'".to_string()))
}

/// 256-bit random value, base64url.
fn generate_secret() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    base64::Engine::encode(
        &base64::engine::general_purpose::URL_SAFE_NO_PAD,
        random_bytes,
    )
}

/// Hex SHA-256 over salt and secret.
fn salted_digest(salt: &str, secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(salt.as_bytes());
    hasher.update(secret.as_bytes());
    hex::encode(hasher.finalize())
}

/// Hex SHA-256 of the secret alone; the HMAC key both sides derive.
fn mac_key(secret: &str) -> String {
    hex::encode(Sha256::digest(secret.as_bytes()))
}

/// Hex HMAC-SHA256 of the nonce under the derived mac key.
fn challenge_mac(mac_key_hex: &str, nonce: &str) -> Result<String> {
    let key = hex::decode(mac_key_hex)
        .map_err(|e| Error::Internal(format!("stored mac key corrupt: {e}")))?;
    let mut mac = HmacSha256::new_from_slice(&key)
        .map_err(|e| Error::Internal(format!("mac init: {e}")))?;
    mac.update(nonce.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Constant-time string equality.
fn constant_time_eq(a: &str, b: &str) -> bool {
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

/// Compute the challenge response for a raw key. Client-side half of the
/// protocol, exposed for SDKs and the test suite.
pub fn challenge_response(raw_key: &str, nonce: &str) -> Result<String> {
    let (id, secret) = split_raw_key(raw_key)?;
    let mac = challenge_mac(&mac_key(secret), nonce)?;
    Ok(format!("{id}.{mac}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn service() -> ApiKeyService {
        ApiKeyService::new(
            Arc::new(MemoryKvStore::new()),
            Arc::new(ChallengeMap::new(Duration::from_secs(300))),
            None,
        )
    }

    fn principal() -> Principal {
        let mut p = Principal::new("user:alice", "acme");
        p.scopes = vec!["logs:write".to_string()];
        p
    }

    #[tokio::test]
    async fn create_then_verify_direct() {
        // GIVEN: a freshly created key
        let service = service();
        let created = service
            .create(&principal(), "ci", vec!["logs:write".to_string()])
            .await
            .unwrap();

        // WHEN: the raw key is presented directly
        let resolved = service.verify_direct(&created.api_key).await.unwrap();

        // THEN: it resolves to the owning principal with its scopes
        assert_eq!(resolved.user_id, "user:alice");
        assert_eq!(resolved.tenant_id, "acme");
        assert_eq!(resolved.scopes, vec!["logs:write"]);
    }

    #[tokio::test]
    async fn listing_never_discloses_the_secret() {
        let service = service();
        let created = service
            .create(&principal(), "ci", vec![])
            .await
            .unwrap();
        let secret_half = created.api_key.split_once('.').unwrap().1.to_string();

        let listed = service.list(&principal()).await.unwrap();
        assert_eq!(listed.len(), 1);

        let json = serde_json::to_string(&listed).unwrap();
        assert!(!json.contains(&secret_half));
        assert!(json.contains(&created.info.id));
    }

    #[tokio::test]
    async fn wrong_secret_fails_constant_time_compare() {
        let service = service();
        let created = service.create(&principal(), "ci", vec![]).await.unwrap();
        let id = created.info.id.clone();

        let err = service
            .verify_direct(&format!("{id}.not-the-secret"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn revoked_key_never_authenticates() {
        let service = service();
        let created = service.create(&principal(), "ci", vec![]).await.unwrap();

        service
            .revoke(&principal(), &created.info.id, false)
            .await
            .unwrap();

        // Direct path
        assert!(service.verify_direct(&created.api_key).await.is_err());

        // Challenge path
        let nonce = service.issue_challenge();
        let response = challenge_response(&created.api_key, &nonce).unwrap();
        let err = service.verify_challenge(&nonce, &response).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));
    }

    #[tokio::test]
    async fn challenge_round_trip_and_replay() {
        // GIVEN: a key and an issued nonce
        let service = service();
        let created = service
            .create(&principal(), "ci", vec!["logs:write".to_string()])
            .await
            .unwrap();
        let nonce = service.issue_challenge();

        // WHEN: the client answers correctly
        let response = challenge_response(&created.api_key, &nonce).unwrap();
        let resolved = service.verify_challenge(&nonce, &response).await.unwrap();

        // THEN: the principal resolves with scopes
        assert_eq!(resolved.scopes, vec!["logs:write"]);

        // AND: replaying the same (nonce, response) fails — consumed
        let err = service.verify_challenge(&nonce, &response).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn bad_mac_leaves_challenge_outstanding() {
        let service = service();
        let created = service.create(&principal(), "ci", vec![]).await.unwrap();
        let nonce = service.issue_challenge();

        // A wrong MAC is a 401 and does not consume the nonce
        let bogus = format!("{}.{}", created.info.id, "00".repeat(32));
        let err = service.verify_challenge(&nonce, &bogus).await.unwrap_err();
        assert!(matches!(err, Error::Authentication(_)));

        // The correct answer still works afterwards
        let response = challenge_response(&created.api_key, &nonce).unwrap();
        service.verify_challenge(&nonce, &response).await.unwrap();
    }

    #[tokio::test]
    async fn revocation_is_owner_or_admin_only() {
        let service = service();
        let created = service.create(&principal(), "ci", vec![]).await.unwrap();

        let stranger = Principal::new("user:bob", "acme");
        let err = service
            .revoke(&stranger, &created.info.id, false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));

        // Tenant admin may revoke
        service.revoke(&stranger, &created.info.id, true).await.unwrap();

        // A key in another tenant reads as absent
        let foreign = Principal::new("user:carol", "globex");
        let err = service
            .revoke(&foreign, &created.info.id, true)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn last_used_updates_on_success() {
        let service = service();
        let created = service.create(&principal(), "ci", vec![]).await.unwrap();
        assert!(created.info.last_used_at.is_none());

        service.verify_direct(&created.api_key).await.unwrap();

        let listed = service.list(&principal()).await.unwrap();
        assert!(listed[0].last_used_at.is_some());
    }

    #[tokio::test]
    async fn tenant_purge_removes_records_and_indices() {
        let service = service();
        let created = service.create(&principal(), "ci", vec![]).await.unwrap();

        let removed = service.purge_tenant("acme").await.unwrap();
        assert_eq!(removed, 1);

        assert!(service.verify_direct(&created.api_key).await.is_err());
        assert!(service.list(&principal()).await.unwrap().is_empty());
    }

    #[test]
    fn raw_key_format_is_enforced() {
        assert!(split_raw_key("id.secret").is_ok());
        assert!(split_raw_key("no-dot").is_err());
        assert!(split_raw_key(".secret").is_err());
        assert!(split_raw_key("id.").is_err());
    }
}
