//! KEK version registry — the per-tenant key lifecycle.
//!
//! Every tenant owns a set of KEK versions walking a one-way state
//! machine: `active → decrypt-only → deprecated` (with the explicit
//! shortcut `active → deprecated` for rotate-and-retire). At most one
//! version is `active` at any time; creating a new version demotes the
//! previous active one in the same serialized step.
//!
//! All mutations for a tenant run under a tenant-scoped mutex. A
//! horizontally scaled deployment swaps that for a lease-based lock on the
//! KV store; the registry's read-demote-write sequence is already shaped
//! for it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::kv::KvStore;
use crate::{Error, Result};

/// KEK version status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum KekStatus {
    /// The one version new material is encrypted under.
    Active,
    /// Still usable for decryption; no new material.
    DecryptOnly,
    /// Retired for good. A deprecated version never comes back.
    Deprecated,
}

impl std::fmt::Display for KekStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Active => "active",
            Self::DecryptOnly => "decrypt-only",
            Self::Deprecated => "deprecated",
        };
        f.write_str(s)
    }
}

/// `true` if `from → to` is an edge of the status DAG.
#[must_use]
pub fn transition_allowed(from: KekStatus, to: KekStatus) -> bool {
    matches!(
        (from, to),
        (KekStatus::Active, KekStatus::DecryptOnly)
            | (KekStatus::Active, KekStatus::Deprecated)
            | (KekStatus::DecryptOnly, KekStatus::Deprecated)
    )
}

/// A KEK version record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KekVersion {
    /// Version id, unique per tenant.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// User that initiated the creation.
    pub created_by: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Operator-supplied reason for the creation/rotation.
    pub reason: String,
    /// Lifecycle status.
    pub status: KekStatus,
}

/// Per-tenant KEK version registry over the KV store.
pub struct KekRegistry {
    kv: Arc<dyn KvStore>,
    /// Tenant-scoped serialization of creations and status transitions.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl KekRegistry {
    /// Create the registry.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            locks: DashMap::new(),
        }
    }

    fn tenant_lock(&self, tenant: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(tenant.to_string())
            .or_default()
            .clone()
    }

    fn version_key(tenant: &str, id: &str) -> String {
        format!("kek:version:{tenant}:{id}")
    }

    fn index_key(tenant: &str) -> String {
        format!("kek:versions:{tenant}")
    }

    fn active_key(tenant: &str) -> String {
        format!("kek:active:{tenant}")
    }

    fn removed_key(tenant: &str, version_id: &str) -> String {
        format!("kek:removed:{tenant}:{version_id}")
    }

    async fn persist(&self, version: &KekVersion) -> Result<()> {
        let json = serde_json::to_string(version)
            .map_err(|e| Error::Internal(format!("version serialization: {e}")))?;
        self.kv
            .put(&Self::version_key(&version.tenant_id, &version.id), json)
            .await
    }

    async fn load(&self, tenant: &str, id: &str) -> Result<Option<KekVersion>> {
        match self.kv.get(&Self::version_key(tenant, id)).await? {
            Some(json) => serde_json::from_str(&json)
                .map(Some)
                .map_err(|e| Error::Internal(format!("version deserialization: {e}"))),
            None => Ok(None),
        }
    }

    /// All versions for a tenant, newest first.
    pub async fn list(&self, tenant: &str) -> Result<Vec<KekVersion>> {
        let ids = self.kv.set_members(&Self::index_key(tenant)).await?;
        let mut versions = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(version) = self.load(tenant, &id).await? {
                versions.push(version);
            }
        }
        versions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(versions)
    }

    /// The tenant's active version.
    pub async fn get_active(&self, tenant: &str) -> Result<KekVersion> {
        let id = self
            .kv
            .get(&Self::active_key(tenant))
            .await?
            .ok_or_else(|| Error::NotFound(format!("no active KEK version for tenant '{tenant}'")))?;
        self.load(tenant, &id)
            .await?
            .ok_or_else(|| Error::Internal(format!("active pointer dangles for tenant '{tenant}'")))
    }

    /// One version by id.
    pub async fn get(&self, tenant: &str, id: &str) -> Result<KekVersion> {
        self.load(tenant, id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("KEK version '{id}'")))
    }

    /// Create a new active version with a generated id, demoting the
    /// previous active version to decrypt-only in the same serialized step.
    pub async fn create(
        &self,
        tenant: &str,
        initiator: &str,
        reason: &str,
    ) -> Result<KekVersion> {
        let id = format!("v-{}", uuid::Uuid::new_v4());
        self.create_with_id(tenant, &id, initiator, reason).await
    }

    /// Create a new active version under a caller-chosen id (used by the
    /// recovery protocol's `newVersion`).
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] if the id is already taken for this tenant.
    pub async fn create_with_id(
        &self,
        tenant: &str,
        id: &str,
        initiator: &str,
        reason: &str,
    ) -> Result<KekVersion> {
        if id.is_empty() {
            return Err(Error::Validation("version id must not be empty".to_string()));
        }
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;

        if self.load(tenant, id).await?.is_some() {
            return Err(Error::Conflict(format!("KEK version '{id}' already exists")));
        }

        // Demote the previous active version, if any. First version for a
        // tenant has nothing to demote.
        if let Some(previous_id) = self.kv.get(&Self::active_key(tenant)).await? {
            if let Some(mut previous) = self.load(tenant, &previous_id).await? {
                previous.status = KekStatus::DecryptOnly;
                self.persist(&previous).await?;
                info!(tenant = %tenant, version = %previous_id, audit = true, "KEK version demoted to decrypt-only");
            }
        }

        let version = KekVersion {
            id: id.to_string(),
            tenant_id: tenant.to_string(),
            created_by: initiator.to_string(),
            created_at: Utc::now(),
            reason: reason.to_string(),
            status: KekStatus::Active,
        };
        self.persist(&version).await?;
        self.kv.set_add(&Self::index_key(tenant), id).await?;
        self.kv.put(&Self::active_key(tenant), id.to_string()).await?;

        info!(tenant = %tenant, version = %id, initiator = %initiator, audit = true, "KEK version created");
        Ok(version)
    }

    /// Apply a status transition, enforcing the DAG.
    ///
    /// # Errors
    ///
    /// [`Error::InvalidTransition`] for any edge outside
    /// `active → decrypt-only → deprecated` (including re-activation).
    pub async fn update_status(
        &self,
        tenant: &str,
        id: &str,
        new_status: KekStatus,
    ) -> Result<KekVersion> {
        let lock = self.tenant_lock(tenant);
        let _guard = lock.lock().await;

        let mut version = self.get(tenant, id).await?;
        if !transition_allowed(version.status, new_status) {
            return Err(Error::InvalidTransition(format!(
                "KEK version '{id}' cannot move {} → {new_status}",
                version.status
            )));
        }

        let was_active = version.status == KekStatus::Active;
        version.status = new_status;
        self.persist(&version).await?;

        // Demoting the active version leaves the tenant without one until
        // the next create; the pointer must not dangle.
        if was_active {
            self.kv.delete(&Self::active_key(tenant)).await?;
        }

        info!(tenant = %tenant, version = %id, status = %new_status, audit = true, "KEK version status changed");
        Ok(version)
    }

    /// Rotate: create a new active version and deny-list `removed_users`
    /// against it. Blobs for those users must never be provisioned under
    /// the new version.
    pub async fn rotate(
        &self,
        tenant: &str,
        initiator: &str,
        reason: &str,
        removed_users: &[String],
    ) -> Result<KekVersion> {
        let version = self.create(tenant, initiator, reason).await?;
        for user in removed_users {
            let user = crate::principal::tag_user(user);
            self.kv
                .set_add(&Self::removed_key(tenant, &version.id), &user)
                .await?;
        }
        if !removed_users.is_empty() {
            info!(
                tenant = %tenant,
                version = %version.id,
                removed = removed_users.len(),
                audit = true,
                "KEK rotation with user removal"
            );
        }
        Ok(version)
    }

    /// `true` if `user` is deny-listed for `(tenant, version_id)`.
    pub async fn is_user_removed(
        &self,
        tenant: &str,
        version_id: &str,
        user: &str,
    ) -> Result<bool> {
        let user = crate::principal::tag_user(user);
        let removed = self
            .kv
            .set_members(&Self::removed_key(tenant, version_id))
            .await?;
        Ok(removed.contains(&user))
    }

    /// Drop every KEK version, pointer, and deny-list for a tenant. Part of
    /// the tenant-deletion cascade.
    pub async fn purge_tenant(&self, tenant: &str) -> Result<usize> {
        let mut removed = 0;
        removed += self.kv.delete_prefix(&format!("kek:version:{tenant}:")).await?;
        removed += self.kv.delete_prefix(&format!("kek:removed:{tenant}:")).await?;
        self.kv.delete(&Self::index_key(tenant)).await?;
        self.kv.delete(&Self::active_key(tenant)).await?;
        self.locks.remove(tenant);
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    fn registry() -> KekRegistry {
        KekRegistry::new(Arc::new(MemoryKvStore::new()))
    }

    #[tokio::test]
    async fn first_version_is_active_with_nothing_demoted() {
        // GIVEN: an empty registry
        let registry = registry();

        // WHEN: the first version is created
        let v1 = registry
            .create_with_id("acme", "v1", "user:alice", "bootstrap")
            .await
            .unwrap();

        // THEN: it is active and is the active version
        assert_eq!(v1.status, KekStatus::Active);
        assert_eq!(registry.get_active("acme").await.unwrap().id, "v1");
    }

    #[tokio::test]
    async fn creation_atomically_demotes_previous_active() {
        // GIVEN: v1 active
        let registry = registry();
        registry
            .create_with_id("acme", "v1", "user:alice", "bootstrap")
            .await
            .unwrap();

        // WHEN: v2 is created
        registry
            .create_with_id("acme", "v2", "user:alice", "quarterly")
            .await
            .unwrap();

        // THEN: v2 is active, v1 is decrypt-only
        assert_eq!(registry.get_active("acme").await.unwrap().id, "v2");
        assert_eq!(
            registry.get("acme", "v1").await.unwrap().status,
            KekStatus::DecryptOnly
        );
    }

    #[tokio::test]
    async fn single_active_invariant_under_concurrent_creates() {
        // GIVEN: concurrent creations for one tenant
        let registry = Arc::new(registry());
        let mut handles = Vec::new();
        for i in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(tokio::spawn(async move {
                registry
                    .create_with_id("acme", &format!("v{i}"), "user:alice", "race")
                    .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        // THEN: exactly one version is active
        let versions = registry.list("acme").await.unwrap();
        let active: Vec<_> = versions
            .iter()
            .filter(|v| v.status == KekStatus::Active)
            .collect();
        assert_eq!(versions.len(), 8);
        assert_eq!(active.len(), 1);
        assert_eq!(registry.get_active("acme").await.unwrap().id, active[0].id);
    }

    #[tokio::test]
    async fn status_machine_enforces_the_dag() {
        let registry = registry();
        registry
            .create_with_id("acme", "v1", "user:alice", "bootstrap")
            .await
            .unwrap();
        registry
            .create_with_id("acme", "v2", "user:alice", "rotate")
            .await
            .unwrap();

        // v1 is decrypt-only now; moving it back to active is illegal
        let err = registry
            .update_status("acme", "v1", KekStatus::Active)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));

        // decrypt-only → deprecated is legal and final
        registry
            .update_status("acme", "v1", KekStatus::Deprecated)
            .await
            .unwrap();
        for target in [KekStatus::Active, KekStatus::DecryptOnly, KekStatus::Deprecated] {
            let err = registry
                .update_status("acme", "v1", target)
                .await
                .unwrap_err();
            assert!(matches!(err, Error::InvalidTransition(_)));
        }
    }

    #[tokio::test]
    async fn active_may_retire_directly() {
        let registry = registry();
        registry
            .create_with_id("acme", "v1", "user:alice", "bootstrap")
            .await
            .unwrap();

        // The explicit rotate-plus-retire edge
        registry
            .update_status("acme", "v1", KekStatus::Deprecated)
            .await
            .unwrap();

        // No active version remains; the pointer does not dangle
        assert!(matches!(
            registry.get_active("acme").await.unwrap_err(),
            Error::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn duplicate_version_id_conflicts() {
        let registry = registry();
        registry
            .create_with_id("acme", "v1", "user:alice", "bootstrap")
            .await
            .unwrap();

        let err = registry
            .create_with_id("acme", "v1", "user:alice", "again")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn rotation_deny_lists_removed_users() {
        let registry = registry();
        registry
            .create_with_id("acme", "v1", "user:alice", "bootstrap")
            .await
            .unwrap();

        let v = registry
            .rotate(
                "acme",
                "user:alice",
                "remove mallory",
                &["user:mallory".to_string()],
            )
            .await
            .unwrap();

        assert!(registry
            .is_user_removed("acme", &v.id, "user:mallory")
            .await
            .unwrap());
        assert!(!registry
            .is_user_removed("acme", &v.id, "user:alice")
            .await
            .unwrap());
        // The deny-list is scoped to the new version only
        assert!(!registry
            .is_user_removed("acme", "v1", "user:mallory")
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn tenants_do_not_share_versions() {
        let registry = registry();
        registry
            .create_with_id("acme", "v1", "user:alice", "bootstrap")
            .await
            .unwrap();

        assert!(matches!(
            registry.get("globex", "v1").await.unwrap_err(),
            Error::NotFound(_)
        ));
        assert!(registry.get_active("globex").await.is_err());
    }

    #[tokio::test]
    async fn purge_drops_the_tenant_namespace() {
        let registry = registry();
        registry
            .create_with_id("acme", "v1", "user:alice", "bootstrap")
            .await
            .unwrap();
        registry
            .rotate("acme", "user:alice", "r", &["user:mallory".to_string()])
            .await
            .unwrap();

        let removed = registry.purge_tenant("acme").await.unwrap();
        assert!(removed > 0);
        assert!(registry.list("acme").await.unwrap().is_empty());
        assert!(registry.get_active("acme").await.is_err());
    }
}
