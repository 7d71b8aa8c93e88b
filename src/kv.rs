//! Key-value store abstraction.
//!
//! Everything the service owns outside the tuple store — KEK versions and
//! blobs, API keys, public keys, recovery sessions — lives in a key-value
//! namespace with tenant-prefixed keys (see the persistence layout in the
//! README). The [`KvStore`] trait keeps the backend pluggable; the shipped
//! implementation is [`MemoryKvStore`], which also backs the test suite.
//!
//! Values are JSON-serialized records stored as strings. Alongside plain
//! keys, the trait exposes string sets, used for the `…:versions:…`,
//! `…:blobs:…`, and `…:byUser:…` secondary indices.

use std::collections::BTreeSet;

use dashmap::DashMap;

use crate::Result;

/// Trait abstracting the key-value backend.
///
/// Implementations must be `Send + Sync`; the store is shared across request
/// handlers. Backend failures map to [`crate::Error::BackendUnavailable`].
#[async_trait::async_trait]
pub trait KvStore: Send + Sync + 'static {
    /// Read the value at `key`.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write `value` at `key`, overwriting any existing value.
    async fn put(&self, key: &str, value: String) -> Result<()>;

    /// Delete `key`, whether it holds a value or a set. Deleting an absent
    /// key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Add `member` to the set at `key`.
    async fn set_add(&self, key: &str, member: &str) -> Result<()>;

    /// Remove `member` from the set at `key`.
    async fn set_remove(&self, key: &str, member: &str) -> Result<()>;

    /// All members of the set at `key`, in lexicographic order.
    async fn set_members(&self, key: &str) -> Result<Vec<String>>;

    /// Keys of every set whose key starts with `prefix`. Backed by a keyspace
    /// scan; used only on administrative paths (tenant deletion).
    async fn set_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Delete every key and set whose key starts with `prefix`.
    ///
    /// Used by tenant deletion to cascade through the tenant's namespace.
    /// Returns the number of entries removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

/// In-memory key-value store backed by `DashMap`.
///
/// Plain values and sets live in separate maps so a set and a value may not
/// collide on the same key, matching the semantics of the usual external
/// backends.
#[derive(Default)]
pub struct MemoryKvStore {
    values: DashMap<String, String>,
    sets: DashMap<String, BTreeSet<String>>,
}

impl MemoryKvStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }

    async fn put(&self, key: &str, value: String) -> Result<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.values.remove(key);
        self.sets.remove(key);
        Ok(())
    }

    async fn set_add(&self, key: &str, member: &str) -> Result<()> {
        self.sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> Result<()> {
        if let Some(mut set) = self.sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> Result<Vec<String>> {
        Ok(self
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn set_keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .sets
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        keys.sort();
        Ok(keys)
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let value_keys: Vec<String> = self
            .values
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();
        let set_keys: Vec<String> = self
            .sets
            .iter()
            .filter(|e| e.key().starts_with(prefix))
            .map(|e| e.key().clone())
            .collect();

        let count = value_keys.len() + set_keys.len();
        for key in value_keys {
            self.values.remove(&key);
        }
        for key in set_keys {
            self.sets.remove(&key);
        }
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn put_get_delete_roundtrip() {
        // GIVEN: an empty store
        let kv = MemoryKvStore::new();

        // WHEN: we write, read, delete, read
        kv.put("kek:active:acme", "v1".to_string()).await.unwrap();
        let read = kv.get("kek:active:acme").await.unwrap();
        kv.delete("kek:active:acme").await.unwrap();
        let gone = kv.get("kek:active:acme").await.unwrap();

        // THEN: the value round-trips and delete removes it
        assert_eq!(read.as_deref(), Some("v1"));
        assert_eq!(gone, None);
    }

    #[tokio::test]
    async fn sets_are_ordered_and_deduplicated() {
        let kv = MemoryKvStore::new();

        kv.set_add("kek:versions:acme", "v2").await.unwrap();
        kv.set_add("kek:versions:acme", "v1").await.unwrap();
        kv.set_add("kek:versions:acme", "v2").await.unwrap();

        let members = kv.set_members("kek:versions:acme").await.unwrap();
        assert_eq!(members, vec!["v1", "v2"]);

        kv.set_remove("kek:versions:acme", "v1").await.unwrap();
        let members = kv.set_members("kek:versions:acme").await.unwrap();
        assert_eq!(members, vec!["v2"]);
    }

    #[tokio::test]
    async fn delete_prefix_cascades_through_namespace() {
        // GIVEN: keys and sets for two tenants
        let kv = MemoryKvStore::new();
        kv.put("kek:version:acme:v1", "{}".to_string()).await.unwrap();
        kv.put("kek:version:globex:v1", "{}".to_string()).await.unwrap();
        kv.set_add("kek:versions:acme", "v1").await.unwrap();

        // WHEN: we delete the acme version namespace
        let removed = kv.delete_prefix("kek:version").await.unwrap();

        // THEN: both tenants' version keys and the index set are gone
        assert_eq!(removed, 3);
        assert_eq!(kv.get("kek:version:acme:v1").await.unwrap(), None);
        assert!(kv.set_members("kek:versions:acme").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn set_keys_scan_by_prefix() {
        let kv = MemoryKvStore::new();
        kv.set_add("apikey:byUser:acme:user:alice", "k1").await.unwrap();
        kv.set_add("apikey:byUser:acme:user:bob", "k2").await.unwrap();
        kv.set_add("apikey:byUser:globex:user:carol", "k3").await.unwrap();

        let keys = kv.set_keys_with_prefix("apikey:byUser:acme:").await.unwrap();
        assert_eq!(
            keys,
            vec!["apikey:byUser:acme:user:alice", "apikey:byUser:acme:user:bob"]
        );
    }

    #[tokio::test]
    async fn missing_set_reads_as_empty() {
        let kv = MemoryKvStore::new();
        assert!(kv.set_members("nope").await.unwrap().is_empty());
        // Removing from a missing set is a no-op, not an error
        kv.set_remove("nope", "x").await.unwrap();
    }
}
