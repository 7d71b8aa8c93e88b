//! Authorization service — tenant-scoped check/grant/revoke plus the tenant
//! lifecycle.
//!
//! Sits between the HTTP layer and the tuple store, adding three things:
//! permission-to-relation mapping, the decision cache, and the tenant
//! registry. Grants and revokes invalidate the exact cache key **before**
//! returning success, so a caller that grants and immediately checks
//! observes its own write.
//!
//! Tuples about `system:` objects and the tenant-exists registry live in a
//! reserved `system` scope rather than any tenant's graph; in per-tenant
//! deployments that scope maps to its own backing store.

use std::sync::Arc;

use tracing::{debug, info};

use crate::cache::DecisionCache;
use crate::principal::TypedRef;
use crate::tuple::{Tuple, TupleFilter, TupleStore};
use crate::{Error, Result};

/// Reserved scope for global tuples: the tenant registry and `system:`
/// object grants.
pub const SYSTEM_SCOPE: &str = "system";

/// Userset standing for "the platform" on registry tuples.
const REGISTRY_USER: &str = "system:*";

/// Tenant membership roles assignable through the identity bootstrap calls.
pub const TENANT_ROLES: &[&str] = &["admin", "member"];

/// Map a permission name to its relation.
///
/// `read`/`write`/`admin`/`owner` map onto their relations; any other name
/// passes through verbatim and is resolved by the schema.
#[must_use]
pub fn permission_to_relation(permission: &str) -> &str {
    match permission {
        "read" => "reader",
        "write" => "writer",
        other => other,
    }
}

/// Authorization service over the tuple store and decision cache.
pub struct AuthzService {
    store: Arc<dyn TupleStore>,
    cache: Option<Arc<DecisionCache>>,
    default_tenant: String,
}

impl AuthzService {
    /// Create the service. `cache` is `None` when the decision cache is
    /// disabled by configuration.
    #[must_use]
    pub fn new(
        store: Arc<dyn TupleStore>,
        cache: Option<Arc<DecisionCache>>,
        default_tenant: impl Into<String>,
    ) -> Self {
        Self {
            store,
            cache,
            default_tenant: default_tenant.into(),
        }
    }

    /// Resolve the effective tenant: the request header, or the configured
    /// default when the header is absent. Kept for backward compatibility
    /// with clients that predate multi-tenancy.
    #[must_use]
    pub fn effective_tenant(&self, tenant: Option<&str>) -> String {
        match tenant {
            Some(t) if !t.is_empty() => t.to_string(),
            _ => self.default_tenant.clone(),
        }
    }

    /// Scope that owns tuples about `object`: the reserved system scope for
    /// `system:` objects, the tenant otherwise.
    fn scope_for<'a>(tenant: &'a str, object: &str) -> &'a str {
        if object.starts_with("system:") {
            SYSTEM_SCOPE
        } else {
            tenant
        }
    }

    /// Evaluate whether `user` holds `permission` on `object` within
    /// `tenant`.
    ///
    /// Results without contextual tuples are served from the decision cache
    /// when possible; contextual checks always go to the store. A backend
    /// failure propagates — it is never folded into `false`.
    pub async fn check(
        &self,
        tenant: Option<&str>,
        user: &str,
        permission: &str,
        object: &str,
        contextual: &[Tuple],
    ) -> Result<bool> {
        let tenant = self.effective_tenant(tenant);
        let relation = permission_to_relation(permission);
        TypedRef::parse(user)?;
        TypedRef::parse(object)?;
        let scope = Self::scope_for(&tenant, object);

        // Contextual checks are never cached: the context is part of the
        // question and unbounded.
        if !contextual.is_empty() {
            return self.store.check(scope, user, relation, object, contextual).await;
        }

        let key = DecisionCache::key(scope, user, relation, object);
        if let Some(cache) = &self.cache {
            if let Some(allowed) = cache.get(&key) {
                return Ok(allowed);
            }
        }

        let allowed = self.store.check(scope, user, relation, object, &[]).await?;
        if let Some(cache) = &self.cache {
            cache.set(&key, allowed);
        }
        Ok(allowed)
    }

    /// Grant `relation` on `object` to `user`. Idempotent: re-granting an
    /// existing tuple succeeds.
    pub async fn grant(
        &self,
        tenant: Option<&str>,
        user: &str,
        permission: &str,
        object: &str,
    ) -> Result<()> {
        let tenant = self.effective_tenant(tenant);
        let relation = permission_to_relation(permission);
        TypedRef::parse(user)?;
        TypedRef::parse(object)?;
        let scope = Self::scope_for(&tenant, object);

        self.store
            .write_tuples(scope, &[Tuple::new(user, relation, object)])
            .await?;
        self.invalidate(scope, user, relation, object);
        debug!(tenant = %tenant, user = %user, relation = %relation, object = %object, "Granted");
        Ok(())
    }

    /// Revoke `relation` on `object` from `user`. Idempotent: revoking a
    /// missing tuple succeeds.
    pub async fn revoke(
        &self,
        tenant: Option<&str>,
        user: &str,
        permission: &str,
        object: &str,
    ) -> Result<()> {
        let tenant = self.effective_tenant(tenant);
        let relation = permission_to_relation(permission);
        TypedRef::parse(user)?;
        TypedRef::parse(object)?;
        let scope = Self::scope_for(&tenant, object);

        self.store
            .delete_tuples(scope, &[Tuple::new(user, relation, object)])
            .await?;
        self.invalidate(scope, user, relation, object);
        debug!(tenant = %tenant, user = %user, relation = %relation, object = %object, "Revoked");
        Ok(())
    }

    fn invalidate(&self, scope: &str, user: &str, relation: &str, object: &str) {
        if let Some(cache) = &self.cache {
            cache.invalidate(&DecisionCache::key(scope, user, relation, object));
        }
    }

    /// `true` if the tenant is registered.
    pub async fn tenant_exists(&self, tenant_id: &str) -> Result<bool> {
        self.store
            .check(
                SYSTEM_SCOPE,
                REGISTRY_USER,
                "exists",
                &format!("tenant:{tenant_id}"),
                &[],
            )
            .await
    }

    /// Bootstrap a tenant: register it and record `admin_user` as both
    /// `admin` and `member`.
    ///
    /// The caller is responsible for initializing the tenant's first KEK
    /// version in the same bootstrap flow (see the tenants handler).
    ///
    /// # Errors
    ///
    /// [`Error::Conflict`] if the tenant id is taken. No partial state
    /// remains on failure.
    pub async fn create_tenant(&self, tenant_id: &str, admin_user: &str) -> Result<()> {
        validate_tenant_id(tenant_id)?;
        let admin_user = crate::principal::tag_user(admin_user);
        TypedRef::parse(&admin_user)?;

        if self.tenant_exists(tenant_id).await? {
            return Err(Error::Conflict(format!("tenant '{tenant_id}' already exists")));
        }

        self.store.ensure_store(tenant_id).await?;
        self.store.ensure_model(tenant_id).await?;

        let tenant_object = format!("tenant:{tenant_id}");
        let exists = Tuple::new(REGISTRY_USER, "exists", tenant_object.clone());
        self.store.write_tuples(SYSTEM_SCOPE, &[exists.clone()]).await?;

        let roles = vec![
            Tuple::new(admin_user.clone(), "admin", tenant_object.clone()),
            Tuple::new(admin_user.clone(), "member", tenant_object.clone()),
        ];
        if let Err(err) = self.store.write_tuples(tenant_id, &roles).await {
            // Roll the registry entry back so a retry can succeed cleanly.
            let _ = self.store.delete_tuples(SYSTEM_SCOPE, &[exists]).await;
            return Err(err);
        }
        // A check that ran before the tenant existed may have cached a deny
        // for these exact keys.
        self.invalidate(tenant_id, &admin_user, "admin", &tenant_object);
        self.invalidate(tenant_id, &admin_user, "member", &tenant_object);

        info!(tenant = %tenant_id, admin = %admin_user, "Tenant created");
        Ok(())
    }

    /// Delete a tenant: requires the caller to be `admin` of the tenant or
    /// `admin` of `system:*`. Removes the tenant's tuples, its registry
    /// entry, and every cached decision under the tenant prefix.
    pub async fn delete_tenant(&self, tenant_id: &str, caller: &str) -> Result<()> {
        if !self.tenant_exists(tenant_id).await? {
            return Err(Error::NotFound(format!("tenant '{tenant_id}'")));
        }

        let caller = crate::principal::tag_user(caller);
        let tenant_object = format!("tenant:{tenant_id}");
        let tenant_admin = self
            .store
            .check(tenant_id, &caller, "admin", &tenant_object, &[])
            .await?;
        let system_admin = self
            .store
            .check(SYSTEM_SCOPE, &caller, "admin", "system:*", &[])
            .await?;
        if !tenant_admin && !system_admin {
            return Err(Error::AccessDenied(format!(
                "deleting tenant '{tenant_id}' requires tenant or system admin"
            )));
        }

        let purged = self.store.purge_tenant(tenant_id).await?;
        self.store
            .delete_tuples(
                SYSTEM_SCOPE,
                &[Tuple::new(REGISTRY_USER, "exists", tenant_object)],
            )
            .await?;
        if let Some(cache) = &self.cache {
            cache.invalidate_tenant(tenant_id);
        }

        info!(tenant = %tenant_id, tuples = purged, audit = true, "Tenant deleted");
        Ok(())
    }

    /// All registered tenant ids, sorted.
    pub async fn list_tenants(&self) -> Result<Vec<String>> {
        let filter = TupleFilter {
            relation: Some("exists".to_string()),
            object: Some("tenant:".to_string()),
            ..TupleFilter::default()
        };
        let mut ids: Vec<String> = self
            .store
            .read(SYSTEM_SCOPE, &filter)
            .await?
            .into_iter()
            .filter_map(|t| t.object.strip_prefix("tenant:").map(str::to_string))
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    /// Add `user` to `tenant_id` with `role` (`admin` or `member`).
    pub async fn add_user_to_tenant(
        &self,
        tenant_id: &str,
        user: &str,
        role: &str,
    ) -> Result<()> {
        if !TENANT_ROLES.contains(&role) {
            return Err(Error::Validation(format!(
                "role must be one of {TENANT_ROLES:?}, got '{role}'"
            )));
        }
        if !self.tenant_exists(tenant_id).await? {
            return Err(Error::NotFound(format!("tenant '{tenant_id}'")));
        }
        let user = crate::principal::tag_user(user);
        self.grant(Some(tenant_id), &user, role, &format!("tenant:{tenant_id}"))
            .await
    }

    /// Replace the user's tenant role: grants `role` and revokes the other
    /// membership role.
    pub async fn update_user_role(
        &self,
        tenant_id: &str,
        user: &str,
        role: &str,
    ) -> Result<()> {
        if !TENANT_ROLES.contains(&role) {
            return Err(Error::Validation(format!(
                "role must be one of {TENANT_ROLES:?}, got '{role}'"
            )));
        }
        if !self.tenant_exists(tenant_id).await? {
            return Err(Error::NotFound(format!("tenant '{tenant_id}'")));
        }

        let user = crate::principal::tag_user(user);
        let object = format!("tenant:{tenant_id}");
        self.grant(Some(tenant_id), &user, role, &object).await?;
        for other in TENANT_ROLES.iter().filter(|r| **r != role) {
            self.revoke(Some(tenant_id), &user, other, &object).await?;
        }
        Ok(())
    }
}

/// Tenant ids become key prefixes and object namespaces; keep them to a
/// conservative charset.
fn validate_tenant_id(tenant_id: &str) -> crate::Result<()> {
    let valid = !tenant_id.is_empty()
        && tenant_id.len() <= 64
        && tenant_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(Error::Validation(format!("invalid tenant id '{tenant_id}'")))
    }
}
