//! Public-key registry — per-user keys by purpose.
//!
//! Stores one public key per `(user, purpose, tenant)`. Purposes are open
//! strings; `admin-promotion` is the canonical one, used to encrypt
//! recovery shares for a newly promoted admin. Beyond base64 encoding and
//! non-emptiness, the key material is not interpreted.
//!
//! `store` is an upsert: re-registering a purpose replaces the key while
//! keeping the record id and creation time.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::kv::KvStore;
use crate::{Error, Result};

/// Canonical purpose for keys that receive recovery shares.
pub const PURPOSE_ADMIN_PROMOTION: &str = "admin-promotion";

/// A registered public key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublicKeyRecord {
    /// Record id, addressable via `PUT /public-keys/{keyId}`.
    pub id: String,
    /// Owning user (tagged reference).
    pub user_id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// Purpose string.
    pub purpose: String,
    /// The public key, base64.
    pub public_key: String,
    /// First registration time.
    pub created_at: DateTime<Utc>,
    /// Last update time.
    pub updated_at: DateTime<Utc>,
}

/// Public-key registry over the KV store.
pub struct PublicKeyRegistry {
    kv: Arc<dyn KvStore>,
}

impl PublicKeyRegistry {
    /// Create the registry.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    fn record_key(tenant: &str, user: &str, purpose: &str) -> String {
        format!("pubkey:{tenant}:{user}:{purpose}")
    }

    fn id_pointer_key(tenant: &str, id: &str) -> String {
        format!("pubkey:id:{tenant}:{id}")
    }

    async fn persist(&self, record: &PublicKeyRecord) -> Result<()> {
        let json = serde_json::to_string(record)
            .map_err(|e| Error::Internal(format!("public key serialization: {e}")))?;
        let primary = Self::record_key(&record.tenant_id, &record.user_id, &record.purpose);
        self.kv.put(&primary, json).await?;
        self.kv
            .put(&Self::id_pointer_key(&record.tenant_id, &record.id), primary)
            .await
    }

    async fn load_at(&self, key: &str) -> Result<Option<PublicKeyRecord>> {
        match self.kv.get(key).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| Error::Internal(format!("public key deserialization: {e}"))),
            None => Ok(None),
        }
    }

    /// Upsert the key for `(user, purpose)`.
    pub async fn store(
        &self,
        tenant: &str,
        user: &str,
        purpose: &str,
        public_key: &str,
    ) -> Result<PublicKeyRecord> {
        super::require_base64("publicKey", public_key)?;
        if purpose.is_empty() {
            return Err(Error::Validation("purpose must not be empty".to_string()));
        }
        let user = crate::principal::tag_user(user);

        let existing = self
            .load_at(&Self::record_key(tenant, &user, purpose))
            .await?;
        let record = match existing {
            Some(mut record) => {
                record.public_key = public_key.to_string();
                record.updated_at = Utc::now();
                record
            }
            None => PublicKeyRecord {
                id: uuid::Uuid::new_v4().to_string(),
                user_id: user.clone(),
                tenant_id: tenant.to_string(),
                purpose: purpose.to_string(),
                public_key: public_key.to_string(),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            },
        };

        self.persist(&record).await?;
        info!(tenant = %tenant, user = %user, purpose = %purpose, audit = true, "Public key stored");
        Ok(record)
    }

    /// The key registered for `(user, purpose)`.
    pub async fn get(&self, tenant: &str, user: &str, purpose: &str) -> Result<PublicKeyRecord> {
        let user = crate::principal::tag_user(user);
        self.load_at(&Self::record_key(tenant, &user, purpose))
            .await?
            .ok_or_else(|| {
                Error::NotFound(format!("public key for {user} purpose '{purpose}'"))
            })
    }

    /// A record by its id.
    pub async fn get_by_id(&self, tenant: &str, id: &str) -> Result<PublicKeyRecord> {
        let primary = self
            .kv
            .get(&Self::id_pointer_key(tenant, id))
            .await?
            .ok_or_else(|| Error::NotFound(format!("public key '{id}'")))?;
        self.load_at(&primary)
            .await?
            .ok_or_else(|| Error::NotFound(format!("public key '{id}'")))
    }

    /// Replace the key material of an existing record.
    pub async fn update(&self, tenant: &str, id: &str, public_key: &str) -> Result<PublicKeyRecord> {
        super::require_base64("publicKey", public_key)?;
        let mut record = self.get_by_id(tenant, id).await?;
        record.public_key = public_key.to_string();
        record.updated_at = Utc::now();
        self.persist(&record).await?;
        info!(tenant = %tenant, key_id = %id, audit = true, "Public key updated");
        Ok(record)
    }

    /// Remove a record by id.
    pub async fn delete(&self, tenant: &str, id: &str) -> Result<()> {
        let record = self.get_by_id(tenant, id).await?;
        self.kv
            .delete(&Self::record_key(tenant, &record.user_id, &record.purpose))
            .await?;
        self.kv.delete(&Self::id_pointer_key(tenant, id)).await?;
        info!(tenant = %tenant, key_id = %id, audit = true, "Public key deleted");
        Ok(())
    }

    /// `true` if `presented` matches the stored key for `(user, purpose)`.
    pub async fn verify(
        &self,
        tenant: &str,
        user: &str,
        purpose: &str,
        presented: &str,
    ) -> Result<bool> {
        match self.get(tenant, user, purpose).await {
            Ok(record) => Ok(record.public_key == presented),
            Err(Error::NotFound(_)) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Drop every public key for a tenant. Part of the tenant-deletion
    /// cascade.
    pub async fn purge_tenant(&self, tenant: &str) -> Result<usize> {
        let mut removed = 0;
        removed += self.kv.delete_prefix(&format!("pubkey:{tenant}:")).await?;
        self.kv.delete_prefix(&format!("pubkey:id:{tenant}:")).await?;
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn registry() -> PublicKeyRegistry {
        PublicKeyRegistry::new(Arc::new(MemoryKvStore::new()))
    }

    const KEY_A: &str = "cHVibGljLWtleS1h"; // base64("public-key-a")
    const KEY_B: &str = "cHVibGljLWtleS1i"; // base64("public-key-b")

    #[tokio::test]
    async fn store_and_get_by_purpose() {
        let registry = registry();
        registry
            .store("acme", "user:alice", PURPOSE_ADMIN_PROMOTION, KEY_A)
            .await
            .unwrap();

        let record = registry
            .get("acme", "user:alice", PURPOSE_ADMIN_PROMOTION)
            .await
            .unwrap();
        assert_eq!(record.public_key, KEY_A);
        assert_eq!(record.user_id, "user:alice");
    }

    #[tokio::test]
    async fn store_is_an_upsert_preserving_identity() {
        let registry = registry();
        let first = registry
            .store("acme", "user:alice", PURPOSE_ADMIN_PROMOTION, KEY_A)
            .await
            .unwrap();
        let second = registry
            .store("acme", "user:alice", PURPOSE_ADMIN_PROMOTION, KEY_B)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(first.created_at, second.created_at);
        assert_eq!(second.public_key, KEY_B);
    }

    #[tokio::test]
    async fn update_and_delete_by_id() {
        let registry = registry();
        let record = registry
            .store("acme", "user:alice", PURPOSE_ADMIN_PROMOTION, KEY_A)
            .await
            .unwrap();

        let updated = registry.update("acme", &record.id, KEY_B).await.unwrap();
        assert_eq!(updated.public_key, KEY_B);
        assert_eq!(
            registry.get_by_id("acme", &record.id).await.unwrap().public_key,
            KEY_B
        );

        registry.delete("acme", &record.id).await.unwrap();
        assert!(registry.get_by_id("acme", &record.id).await.is_err());
        assert!(registry
            .get("acme", "user:alice", PURPOSE_ADMIN_PROMOTION)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn verify_matches_exact_material() {
        let registry = registry();
        registry
            .store("acme", "user:alice", PURPOSE_ADMIN_PROMOTION, KEY_A)
            .await
            .unwrap();

        assert!(registry
            .verify("acme", "user:alice", PURPOSE_ADMIN_PROMOTION, KEY_A)
            .await
            .unwrap());
        assert!(!registry
            .verify("acme", "user:alice", PURPOSE_ADMIN_PROMOTION, KEY_B)
            .await
            .unwrap());
        assert!(!registry
            .verify("acme", "user:nobody", PURPOSE_ADMIN_PROMOTION, KEY_A)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn purposes_are_independent() {
        let registry = registry();
        registry
            .store("acme", "user:alice", PURPOSE_ADMIN_PROMOTION, KEY_A)
            .await
            .unwrap();
        registry
            .store("acme", "user:alice", "share-encryption", KEY_B)
            .await
            .unwrap();

        assert_eq!(
            registry
                .get("acme", "user:alice", PURPOSE_ADMIN_PROMOTION)
                .await
                .unwrap()
                .public_key,
            KEY_A
        );
        assert_eq!(
            registry
                .get("acme", "user:alice", "share-encryption")
                .await
                .unwrap()
                .public_key,
            KEY_B
        );
    }

    #[tokio::test]
    async fn invalid_material_is_rejected() {
        let registry = registry();
        for bad in ["", "spaces are not base64 !!"] {
            let err = registry
                .store("acme", "user:alice", PURPOSE_ADMIN_PROMOTION, bad)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::Validation(_)));
        }

        let err = registry
            .store("acme", "user:alice", "", KEY_A)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }
}
