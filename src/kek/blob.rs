//! KEK blob store — per-(tenant, user, version) encrypted key material.
//!
//! A blob is the KEK wrapped for one user under one version, produced and
//! consumed entirely client-side. The server never decrypts it and
//! validates nothing beyond base64 encoding and non-emptiness.
//!
//! Provisioning rules enforced here: the referenced version must exist and
//! not be deprecated, and the user must not be on the rotation deny-list
//! for that version. Who may read or provision whose blobs is the
//! handlers' authorization call.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use super::version::{KekRegistry, KekStatus};
use crate::kv::KvStore;
use crate::{Error, Result};

/// A stored blob record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KekBlob {
    /// Owning tenant.
    pub tenant_id: String,
    /// User the KEK is wrapped for.
    pub user_id: String,
    /// KEK version the blob belongs to.
    pub kek_version_id: String,
    /// The wrapped KEK, base64. Opaque to the server.
    pub encrypted_blob: String,
    /// Provisioning time.
    pub created_at: DateTime<Utc>,
}

/// Blob store over the KV namespace, consulting the version registry for
/// provisioning rules.
pub struct KekBlobStore {
    kv: Arc<dyn KvStore>,
    registry: Arc<KekRegistry>,
}

impl KekBlobStore {
    /// Create the store.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, registry: Arc<KekRegistry>) -> Self {
        Self { kv, registry }
    }

    fn blob_key(tenant: &str, user: &str, version_id: &str) -> String {
        format!("kek:blob:{tenant}:{user}:{version_id}")
    }

    fn user_index_key(tenant: &str, user: &str) -> String {
        format!("kek:blobs:{tenant}:{user}")
    }

    /// Fetch one blob.
    pub async fn get(&self, tenant: &str, user: &str, version_id: &str) -> Result<KekBlob> {
        let user = crate::principal::tag_user(user);
        match self.kv.get(&Self::blob_key(tenant, &user, version_id)).await? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| Error::Internal(format!("blob deserialization: {e}"))),
            None => Err(Error::NotFound(format!(
                "KEK blob for {user} under version '{version_id}'"
            ))),
        }
    }

    /// Every blob provisioned for `user` in `tenant`, ordered by version id.
    pub async fn list_for_user(&self, tenant: &str, user: &str) -> Result<Vec<KekBlob>> {
        let user = crate::principal::tag_user(user);
        let version_ids = self
            .kv
            .set_members(&Self::user_index_key(tenant, &user))
            .await?;

        let mut blobs = Vec::with_capacity(version_ids.len());
        for version_id in version_ids {
            if let Ok(blob) = self.get(tenant, &user, &version_id).await {
                blobs.push(blob);
            }
        }
        Ok(blobs)
    }

    /// Provision (or replace) a blob.
    ///
    /// # Errors
    ///
    /// - [`Error::NotFound`] if the version does not exist.
    /// - [`Error::Validation`] if the version is deprecated or the payload
    ///   is not non-empty base64.
    /// - [`Error::AccessDenied`] if the user was removed in the rotation
    ///   that created this version.
    pub async fn set(
        &self,
        tenant: &str,
        user: &str,
        version_id: &str,
        encrypted_blob: &str,
    ) -> Result<KekBlob> {
        super::require_base64("encrypted_blob", encrypted_blob)?;
        let user = crate::principal::tag_user(user);

        let version = self.registry.get(tenant, version_id).await?;
        if version.status == KekStatus::Deprecated {
            return Err(Error::Validation(format!(
                "cannot provision blobs under deprecated version '{version_id}'"
            )));
        }
        if self.registry.is_user_removed(tenant, version_id, &user).await? {
            return Err(Error::AccessDenied(format!(
                "{user} was removed in the rotation that created version '{version_id}'"
            )));
        }

        let blob = KekBlob {
            tenant_id: tenant.to_string(),
            user_id: user.clone(),
            kek_version_id: version_id.to_string(),
            encrypted_blob: encrypted_blob.to_string(),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&blob)
            .map_err(|e| Error::Internal(format!("blob serialization: {e}")))?;
        self.kv
            .put(&Self::blob_key(tenant, &user, version_id), json)
            .await?;
        self.kv
            .set_add(&Self::user_index_key(tenant, &user), version_id)
            .await?;

        info!(tenant = %tenant, user = %user, version = %version_id, audit = true, "KEK blob provisioned");
        Ok(blob)
    }

    /// Delete one blob. Deleting an absent blob is a 404.
    pub async fn delete(&self, tenant: &str, user: &str, version_id: &str) -> Result<()> {
        let user = crate::principal::tag_user(user);
        let key = Self::blob_key(tenant, &user, version_id);
        if self.kv.get(&key).await?.is_none() {
            return Err(Error::NotFound(format!(
                "KEK blob for {user} under version '{version_id}'"
            )));
        }
        self.kv.delete(&key).await?;
        self.kv
            .set_remove(&Self::user_index_key(tenant, &user), version_id)
            .await?;
        info!(tenant = %tenant, user = %user, version = %version_id, audit = true, "KEK blob deleted");
        Ok(())
    }

    /// Drop every blob for a tenant. Part of the tenant-deletion cascade.
    pub async fn purge_tenant(&self, tenant: &str) -> Result<usize> {
        let mut removed = 0;
        removed += self.kv.delete_prefix(&format!("kek:blob:{tenant}:")).await?;
        removed += self.kv.delete_prefix(&format!("kek:blobs:{tenant}:")).await?;
        Ok(removed)
    }
}
