//! Tuple-store adapter — the seam to the relationship-authorization backend.
//!
//! The rest of the crate sees one narrow interface, [`TupleStore`]: write
//! and delete relationship tuples, evaluate checks (optionally with
//! contextual tuples), and make sure a tenant's store and model exist.
//! Three backends implement it:
//!
//! - [`http::HttpTupleStore`] in **local** mode: one shared backend
//!   instance, one store, logical tenant isolation via object namespacing.
//! - [`http::HttpTupleStore`] in **per-tenant** mode: tenant-specific
//!   backend addresses derived from a namespace template, one store and
//!   model per tenant.
//! - [`memory::MemoryTupleStore`]: embedded evaluator of the fixed schema,
//!   used for development and by the test suite.
//!
//! The factory [`connect`] picks the backend from configuration; callers
//! never inspect the concrete type.

pub mod http;
pub mod memory;
pub mod schema;

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::config::{TupleStoreConfig, TupleStoreMode};
use crate::kv::KvStore;
use crate::{Error, Result};

/// A relationship tuple `(user, relation, object)`.
///
/// `user` may itself be an object or userset reference
/// (`role:engineer#assignee`) to encode set membership. Tuples order
/// lexicographically; batched writes are sorted before dispatch so a
/// retried batch replays in the same order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Tuple {
    /// User or userset reference.
    pub user: String,
    /// Relation name.
    pub relation: String,
    /// Object reference.
    pub object: String,
}

impl Tuple {
    /// Construct a tuple.
    #[must_use]
    pub fn new(
        user: impl Into<String>,
        relation: impl Into<String>,
        object: impl Into<String>,
    ) -> Self {
        Self {
            user: user.into(),
            relation: relation.into(),
            object: object.into(),
        }
    }
}

impl std::fmt::Display for Tuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.user, self.relation, self.object)
    }
}

/// Filter for [`TupleStore::read`]. `None` fields match anything.
#[derive(Debug, Clone, Default)]
pub struct TupleFilter {
    /// Match this exact user reference.
    pub user: Option<String>,
    /// Match this exact relation.
    pub relation: Option<String>,
    /// Match objects equal to this reference, or with this `<type>:` prefix
    /// when the value ends in `:`.
    pub object: Option<String>,
}

impl TupleFilter {
    /// `true` if `tuple` passes the filter.
    #[must_use]
    pub fn matches(&self, tuple: &Tuple) -> bool {
        if let Some(ref user) = self.user {
            if &tuple.user != user {
                return false;
            }
        }
        if let Some(ref relation) = self.relation {
            if &tuple.relation != relation {
                return false;
            }
        }
        if let Some(ref object) = self.object {
            let matched = if object.ends_with(':') {
                tuple.object.starts_with(object)
            } else {
                &tuple.object == object
            };
            if !matched {
                return false;
            }
        }
        true
    }
}

/// Trait abstracting the relationship-tuple backend.
///
/// Every operation is scoped to a tenant. How that scoping is realized —
/// object namespacing, a per-tenant store, or a per-tenant map — is the
/// backend's business. Objects of type `system` are global; callers route
/// them through the reserved `system` scope (see `authz`).
#[async_trait::async_trait]
pub trait TupleStore: Send + Sync + 'static {
    /// Write tuples into the tenant's graph. Writing an existing tuple is
    /// not an error; grants are idempotent.
    async fn write_tuples(&self, tenant: &str, tuples: &[Tuple]) -> Result<()>;

    /// Delete tuples from the tenant's graph. Deleting a missing tuple is
    /// not an error; revokes are idempotent.
    async fn delete_tuples(&self, tenant: &str, tuples: &[Tuple]) -> Result<()>;

    /// Evaluate whether `user` holds `relation` on `object`, considering
    /// `contextual` tuples for this evaluation only.
    async fn check(
        &self,
        tenant: &str,
        user: &str,
        relation: &str,
        object: &str,
        contextual: &[Tuple],
    ) -> Result<bool>;

    /// Read persisted tuples matching `filter`.
    async fn read(&self, tenant: &str, filter: &TupleFilter) -> Result<Vec<Tuple>>;

    /// Ensure the tenant's store exists. Idempotent: an existing store (by
    /// name) is reused, and its id is persisted to skip the round-trip next
    /// time.
    async fn ensure_store(&self, tenant: &str) -> Result<()>;

    /// Ensure the tenant's store carries the current authorization model.
    /// Installs a new model version without touching existing tuples.
    async fn ensure_model(&self, tenant: &str) -> Result<()>;

    /// Remove every tuple in the tenant's graph. Used by tenant deletion.
    async fn purge_tenant(&self, tenant: &str) -> Result<usize>;
}

/// Sort tuples into the deterministic write order.
///
/// Batched writes are not transactional; replaying a partially applied
/// batch must be safe, which requires a stable order.
#[must_use]
pub fn sorted_for_write(tuples: &[Tuple]) -> Vec<Tuple> {
    let mut sorted = tuples.to_vec();
    sorted.sort();
    sorted.dedup();
    sorted
}

/// Construct the configured tuple-store backend.
///
/// # Errors
///
/// Returns [`Error::Config`] if the configuration is unusable for the
/// selected mode.
pub fn connect(config: &TupleStoreConfig, kv: Arc<dyn KvStore>) -> Result<Arc<dyn TupleStore>> {
    match config.mode {
        TupleStoreMode::Memory => Ok(Arc::new(memory::MemoryTupleStore::new())),
        TupleStoreMode::Local => {
            if config.url.is_empty() {
                return Err(Error::Config(
                    "tuple_store.url required in local mode".to_string(),
                ));
            }
            Ok(Arc::new(http::HttpTupleStore::local(config, kv)?))
        }
        TupleStoreMode::PerTenant => {
            if !config.namespace_template.contains("{tenant}") {
                return Err(Error::Config(
                    "tuple_store.namespace_template must contain '{tenant}'".to_string(),
                ));
            }
            Ok(Arc::new(http::HttpTupleStore::per_tenant(config, kv)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_order_is_sorted_and_deduplicated() {
        let tuples = vec![
            Tuple::new("user:bob", "reader", "log:sys"),
            Tuple::new("user:alice", "admin", "tenant:acme"),
            Tuple::new("user:bob", "reader", "log:sys"),
        ];

        let sorted = sorted_for_write(&tuples);
        assert_eq!(sorted.len(), 2);
        assert_eq!(sorted[0].user, "user:alice");
        assert_eq!(sorted[1].user, "user:bob");
    }

    #[test]
    fn filter_matches_exact_and_prefix() {
        let tuple = Tuple::new("user:alice", "reader", "log:sys");

        let by_user = TupleFilter {
            user: Some("user:alice".to_string()),
            ..TupleFilter::default()
        };
        assert!(by_user.matches(&tuple));

        let by_object_prefix = TupleFilter {
            object: Some("log:".to_string()),
            ..TupleFilter::default()
        };
        assert!(by_object_prefix.matches(&tuple));

        let wrong_relation = TupleFilter {
            relation: Some("writer".to_string()),
            ..TupleFilter::default()
        };
        assert!(!wrong_relation.matches(&tuple));
    }
}
