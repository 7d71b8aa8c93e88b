//! Embedded in-memory tuple backend.
//!
//! Implements the fixed schema's semantics directly: direct tuples, userset
//! expansion (`role:engineer#assignee`), the admin union behind `reader` /
//! `writer` / `manager`, admin inheritance down `parent` chains, and role
//! recursion. Evaluation is depth-bounded; `role.parent:role` is
//! self-referential and a cyclic graph must terminate.
//!
//! Tenants get disjoint tuple sets, so isolation is structural rather than
//! a property of namespacing discipline. This backend exists for
//! development and tests; production deployments point the adapter at an
//! external relationship store.

use std::collections::BTreeSet;

use dashmap::DashMap;

use super::schema::{self, ADMIN_UNION_RELATIONS};
use super::{Tuple, TupleFilter, TupleStore, sorted_for_write};
use crate::{Error, Result};

/// Maximum recursion depth for an evaluation. Deep enough for any sane
/// role/organization hierarchy, small enough to cut cycles fast.
const MAX_DEPTH: u32 = 16;

/// In-memory tuple backend, one tuple set per tenant scope.
#[derive(Default)]
pub struct MemoryTupleStore {
    scopes: DashMap<String, BTreeSet<Tuple>>,
}

impl MemoryTupleStore {
    /// Create an empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate a tuple against the schema before persisting it.
    fn validate(tuple: &Tuple) -> Result<()> {
        let object_type = tuple
            .object
            .split(':')
            .next()
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::BackendRejected(format!("untyped object in {tuple}")))?;

        if tuple.relation == "parent" {
            // Parent tuples are written child-side: (child, parent, parent-object)
            let child_type = tuple.user.split(':').next().unwrap_or_default();
            if !schema::parent_allowed(child_type, object_type) {
                return Err(Error::BackendRejected(format!(
                    "schema violation: {child_type} may not take a {object_type} parent"
                )));
            }
            return Ok(());
        }

        if !schema::relation_exists(object_type, &tuple.relation) {
            return Err(Error::BackendRejected(format!(
                "schema violation: no relation '{}' on type '{object_type}'",
                tuple.relation
            )));
        }
        Ok(())
    }
}

/// One evaluation pass over a tenant's persisted tuples plus the check's
/// contextual tuples.
struct Evaluation<'a> {
    persisted: &'a BTreeSet<Tuple>,
    contextual: &'a [Tuple],
}

impl Evaluation<'_> {
    fn contains(&self, user: &str, relation: &str, object: &str) -> bool {
        self.iter()
            .any(|t| t.user == user && t.relation == relation && t.object == object)
    }

    fn iter(&self) -> impl Iterator<Item = &Tuple> {
        self.persisted.iter().chain(self.contextual.iter())
    }

    fn eval(&self, user: &str, relation: &str, object: &str, depth: u32) -> bool {
        if depth == 0 {
            return false;
        }

        if self.contains(user, relation, object) {
            return true;
        }

        // Userset expansion: (role:eng#assignee, reader, log:x) grants
        // reader to anyone holding assignee on role:eng.
        for t in self
            .iter()
            .filter(|t| t.relation == relation && t.object == object)
        {
            if let Some((set_object, set_relation)) = t.user.split_once('#') {
                if self.eval(user, set_relation, set_object, depth - 1) {
                    return true;
                }
            }
        }

        // reader/writer/manager union in admin on the same object
        if ADMIN_UNION_RELATIONS.contains(&relation)
            && self.eval(user, "admin", object, depth - 1)
        {
            return true;
        }

        // admin is inherited from parent objects, transitively
        if relation == "admin" {
            for t in self
                .iter()
                .filter(|t| t.user == object && t.relation == "parent")
            {
                if self.eval(user, "admin", &t.object, depth - 1) {
                    return true;
                }
            }
        }

        // Role recursion: assignees of a child role count as assignees of
        // its parent role.
        if relation == "assignee" {
            for t in self
                .iter()
                .filter(|t| t.relation == "parent" && t.object == object)
            {
                if self.eval(user, "assignee", &t.user, depth - 1) {
                    return true;
                }
            }
        }

        false
    }
}

#[async_trait::async_trait]
impl TupleStore for MemoryTupleStore {
    async fn write_tuples(&self, tenant: &str, tuples: &[Tuple]) -> Result<()> {
        let sorted = sorted_for_write(tuples);
        for tuple in &sorted {
            Self::validate(tuple)?;
        }

        let mut scope = self.scopes.entry(tenant.to_string()).or_default();
        for tuple in sorted {
            scope.insert(tuple);
        }
        Ok(())
    }

    async fn delete_tuples(&self, tenant: &str, tuples: &[Tuple]) -> Result<()> {
        if let Some(mut scope) = self.scopes.get_mut(tenant) {
            for tuple in sorted_for_write(tuples) {
                scope.remove(&tuple);
            }
        }
        Ok(())
    }

    async fn check(
        &self,
        tenant: &str,
        user: &str,
        relation: &str,
        object: &str,
        contextual: &[Tuple],
    ) -> Result<bool> {
        let empty = BTreeSet::new();
        let scope = self.scopes.get(tenant);
        let persisted = scope.as_deref().unwrap_or(&empty);

        let evaluation = Evaluation {
            persisted,
            contextual,
        };
        Ok(evaluation.eval(user, relation, object, MAX_DEPTH))
    }

    async fn read(&self, tenant: &str, filter: &TupleFilter) -> Result<Vec<Tuple>> {
        Ok(self
            .scopes
            .get(tenant)
            .map(|scope| scope.iter().filter(|t| filter.matches(t)).cloned().collect())
            .unwrap_or_default())
    }

    async fn ensure_store(&self, _tenant: &str) -> Result<()> {
        Ok(())
    }

    async fn ensure_model(&self, _tenant: &str) -> Result<()> {
        Ok(())
    }

    async fn purge_tenant(&self, tenant: &str) -> Result<usize> {
        Ok(self.scopes.remove(tenant).map_or(0, |(_, set)| set.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with(tenant: &str, tuples: &[Tuple]) -> MemoryTupleStore {
        let store = MemoryTupleStore::new();
        store.write_tuples(tenant, tuples).await.unwrap();
        store
    }

    #[tokio::test]
    async fn direct_tuple_checks() {
        // GIVEN: alice is admin of tenant:acme
        let store = store_with(
            "acme",
            &[Tuple::new("user:alice", "admin", "tenant:acme")],
        )
        .await;

        // THEN: the direct check passes, an unrelated one does not
        assert!(store
            .check("acme", "user:alice", "admin", "tenant:acme", &[])
            .await
            .unwrap());
        assert!(!store
            .check("acme", "user:bob", "member", "tenant:acme", &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn admin_unions_into_reader_through_parent() {
        // GIVEN: alice is tenant admin, log:sys hangs off the tenant
        let store = store_with(
            "acme",
            &[
                Tuple::new("user:alice", "admin", "tenant:acme"),
                Tuple::new("log:sys", "parent", "tenant:acme"),
            ],
        )
        .await;

        // THEN: admin of the parent is an implicit reader and writer
        assert!(store
            .check("acme", "user:alice", "reader", "log:sys", &[])
            .await
            .unwrap());
        assert!(store
            .check("acme", "user:alice", "writer", "log:sys", &[])
            .await
            .unwrap());

        // WHEN: the admin grant is revoked
        store
            .delete_tuples("acme", &[Tuple::new("user:alice", "admin", "tenant:acme")])
            .await
            .unwrap();

        // THEN: the derived reader access is gone
        assert!(!store
            .check("acme", "user:alice", "reader", "log:sys", &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn admin_inherits_across_organization_layer() {
        let store = store_with(
            "acme",
            &[
                Tuple::new("user:alice", "admin", "tenant:acme"),
                Tuple::new("organization:core", "parent", "tenant:acme"),
                Tuple::new("log:audit", "parent", "organization:core"),
            ],
        )
        .await;

        assert!(store
            .check("acme", "user:alice", "reader", "log:audit", &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn userset_membership_expands() {
        // GIVEN: readers of log:sys include assignees of role:engineer
        let store = store_with(
            "acme",
            &[
                Tuple::new("role:engineer#assignee", "reader", "log:sys"),
                Tuple::new("user:carol", "assignee", "role:engineer"),
            ],
        )
        .await;

        assert!(store
            .check("acme", "user:carol", "reader", "log:sys", &[])
            .await
            .unwrap());
        assert!(!store
            .check("acme", "user:dave", "reader", "log:sys", &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn role_recursion_follows_parent_edges() {
        // GIVEN: role:senior's parent is role:engineer; erin is a senior
        let store = store_with(
            "acme",
            &[
                Tuple::new("role:senior", "parent", "role:engineer"),
                Tuple::new("user:erin", "assignee", "role:senior"),
                Tuple::new("role:engineer#assignee", "writer", "log:deploy"),
            ],
        )
        .await;

        // THEN: erin reaches log:deploy through two levels of indirection
        assert!(store
            .check("acme", "user:erin", "assignee", "role:engineer", &[])
            .await
            .unwrap());
        assert!(store
            .check("acme", "user:erin", "writer", "log:deploy", &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn cyclic_role_graph_terminates() {
        // GIVEN: a two-role parent cycle
        let store = store_with(
            "acme",
            &[
                Tuple::new("role:a", "parent", "role:b"),
                Tuple::new("role:b", "parent", "role:a"),
            ],
        )
        .await;

        // THEN: evaluation terminates with a denial rather than recursing
        assert!(!store
            .check("acme", "user:zed", "assignee", "role:a", &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn contextual_tuples_apply_without_persisting() {
        let store = store_with("acme", &[]).await;
        let context = vec![Tuple::new("user:frank", "reader", "log:sys")];

        // WHEN: the check carries a contextual tuple
        assert!(store
            .check("acme", "user:frank", "reader", "log:sys", &context)
            .await
            .unwrap());

        // THEN: nothing was persisted
        assert!(!store
            .check("acme", "user:frank", "reader", "log:sys", &[])
            .await
            .unwrap());
        assert!(store.read("acme", &TupleFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn tenants_are_disjoint() {
        // GIVEN: an admin grant in acme only
        let store = store_with(
            "acme",
            &[Tuple::new("user:alice", "admin", "tenant:acme")],
        )
        .await;

        // THEN: the same check under another tenant scope is false
        assert!(!store
            .check("globex", "user:alice", "admin", "tenant:acme", &[])
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn schema_violations_are_rejected() {
        let store = MemoryTupleStore::new();

        // Unknown relation on a known type
        let err = store
            .write_tuples("acme", &[Tuple::new("user:x", "assignee", "log:sys")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendRejected(_)));

        // Untyped parent edge: a log may not take a user parent
        let err = store
            .write_tuples("acme", &[Tuple::new("log:sys", "parent", "user:alice")])
            .await
            .unwrap_err();
        assert!(matches!(err, Error::BackendRejected(_)));
    }

    #[tokio::test]
    async fn writes_and_deletes_are_idempotent() {
        let store = MemoryTupleStore::new();
        let tuple = Tuple::new("user:alice", "member", "tenant:acme");

        store.write_tuples("acme", &[tuple.clone()]).await.unwrap();
        store.write_tuples("acme", &[tuple.clone()]).await.unwrap();
        assert_eq!(store.read("acme", &TupleFilter::default()).await.unwrap().len(), 1);

        store.delete_tuples("acme", &[tuple.clone()]).await.unwrap();
        store.delete_tuples("acme", &[tuple]).await.unwrap();
        assert!(store.read("acme", &TupleFilter::default()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn purge_removes_the_whole_scope() {
        let store = store_with(
            "acme",
            &[
                Tuple::new("user:alice", "admin", "tenant:acme"),
                Tuple::new("user:bob", "member", "tenant:acme"),
            ],
        )
        .await;

        let removed = store.purge_tenant("acme").await.unwrap();
        assert_eq!(removed, 2);
        assert!(!store
            .check("acme", "user:alice", "admin", "tenant:acme", &[])
            .await
            .unwrap());
    }
}
