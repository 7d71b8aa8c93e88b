//! HTTP tuple-store backend.
//!
//! Speaks the store-API dialect of the external relationship store: stores
//! are created by name, an authorization model is installed per store, and
//! tuples are written/read/checked against `stores/{id}` endpoints.
//!
//! Two operating modes share this implementation:
//!
//! - **Local**: every tenant shares one backend address and one store.
//!   Isolation is logical — tenant-owned object ids are namespaced as
//!   `<type>:<tenant>/<id>` before they reach the wire, and stripped again
//!   on the way back. Global types (`user`, `tenant`, `system`) are never
//!   prefixed.
//! - **Per-tenant**: the backend address is derived from a namespace
//!   template (`http://tenant-{tenant}…`), and each tenant gets its own
//!   store and model. No prefixing; isolation is physical.
//!
//! Resolved `(store_id, model_id)` pairs are kept in a process-local map
//! and persisted to the KV store, so `ensure_store` / `ensure_model` cost
//! one KV read on warm paths instead of a backend round-trip.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::schema;
use super::{Tuple, TupleFilter, TupleStore, sorted_for_write};
use crate::config::TupleStoreConfig;
use crate::kv::KvStore;
use crate::{Error, Result};

/// Object types that are global and never namespaced in local mode.
const GLOBAL_TYPES: &[&str] = &["user", "tenant", "system"];

/// Scope key under which local mode caches its single shared store.
const LOCAL_SCOPE: &str = "__local";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Routing {
    Local,
    PerTenant,
}

#[derive(Debug, Clone, Default)]
struct StoreIds {
    store_id: String,
    model_id: String,
}

/// HTTP tuple-store adapter; see the module docs for the two modes.
pub struct HttpTupleStore {
    client: reqwest::Client,
    routing: Routing,
    base_url: String,
    namespace_template: String,
    store_name: String,
    kv: Arc<dyn KvStore>,
    ids: DashMap<String, StoreIds>,
}

#[derive(Debug, Deserialize)]
struct StoreRecord {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct ListStoresResponse {
    #[serde(default)]
    stores: Vec<StoreRecord>,
}

#[derive(Debug, Deserialize)]
struct CreateStoreResponse {
    id: String,
}

#[derive(Debug, Deserialize)]
struct WriteModelResponse {
    authorization_model_id: String,
}

#[derive(Debug, Deserialize)]
struct CheckResponse {
    #[serde(default)]
    allowed: bool,
}

#[derive(Debug, Deserialize)]
struct WireTupleKey {
    user: String,
    relation: String,
    object: String,
}

#[derive(Debug, Deserialize)]
struct WireTuple {
    key: WireTupleKey,
}

#[derive(Debug, Deserialize)]
struct ReadResponse {
    #[serde(default)]
    tuples: Vec<WireTuple>,
    #[serde(default)]
    continuation_token: String,
}

impl HttpTupleStore {
    /// Local-mode adapter: one shared backend, one store.
    pub fn local(config: &TupleStoreConfig, kv: Arc<dyn KvStore>) -> Result<Self> {
        Self::build(config, kv, Routing::Local)
    }

    /// Per-tenant adapter: backend address derived per tenant.
    pub fn per_tenant(config: &TupleStoreConfig, kv: Arc<dyn KvStore>) -> Result<Self> {
        Self::build(config, kv, Routing::PerTenant)
    }

    fn build(config: &TupleStoreConfig, kv: Arc<dyn KvStore>, routing: Routing) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| Error::Config(format!("tuple store client: {e}")))?;

        Ok(Self {
            client,
            routing,
            base_url: config.url.trim_end_matches('/').to_string(),
            namespace_template: config.namespace_template.clone(),
            store_name: config.store_name.clone(),
            kv,
            ids: DashMap::new(),
        })
    }

    /// Cache key for a tenant's resolved ids. Local mode shares one store
    /// across tenants.
    fn scope_key(&self, tenant: &str) -> String {
        match self.routing {
            Routing::Local => LOCAL_SCOPE.to_string(),
            Routing::PerTenant => tenant.to_string(),
        }
    }

    /// Backend base URL for a tenant.
    fn base_url_for(&self, tenant: &str) -> String {
        match self.routing {
            Routing::Local => self.base_url.clone(),
            Routing::PerTenant => self
                .namespace_template
                .trim_end_matches('/')
                .replace("{tenant}", tenant),
        }
    }

    /// Namespace an object or userset reference for the wire (local mode).
    fn scoped(&self, tenant: &str, reference: &str) -> String {
        if self.routing == Routing::PerTenant || tenant == "system" {
            return reference.to_string();
        }
        let Some((type_tag, rest)) = reference.split_once(':') else {
            return reference.to_string();
        };
        if GLOBAL_TYPES.contains(&type_tag) {
            return reference.to_string();
        }
        format!("{type_tag}:{tenant}/{rest}")
    }

    /// Strip the tenant namespace from a reference read back off the wire.
    fn unscoped(&self, tenant: &str, reference: &str) -> String {
        if self.routing == Routing::PerTenant {
            return reference.to_string();
        }
        let Some((type_tag, rest)) = reference.split_once(':') else {
            return reference.to_string();
        };
        let prefix = format!("{tenant}/");
        rest.strip_prefix(&prefix)
            .map_or_else(|| reference.to_string(), |id| format!("{type_tag}:{id}"))
    }

    /// `true` if this wire reference belongs to `tenant` in local mode.
    fn in_scope(&self, tenant: &str, reference: &str) -> bool {
        match self.routing {
            Routing::PerTenant => true,
            Routing::Local => {
                let Some((type_tag, rest)) = reference.split_once(':') else {
                    return false;
                };
                GLOBAL_TYPES.contains(&type_tag) || rest.starts_with(&format!("{tenant}/"))
            }
        }
    }

    fn wire_tuple(&self, tenant: &str, tuple: &Tuple) -> Value {
        json!({
            "user": self.scoped(tenant, &tuple.user),
            "relation": tuple.relation,
            "object": self.scoped(tenant, &tuple.object),
        })
    }

    /// Resolved `(store_id, model_id)`, loading from the KV store on a cold
    /// process and falling back to `ensure_*` round-trips.
    async fn resolved_ids(&self, tenant: &str) -> Result<StoreIds> {
        let scope = self.scope_key(tenant);
        if let Some(ids) = self.ids.get(&scope) {
            if !ids.store_id.is_empty() && !ids.model_id.is_empty() {
                return Ok(ids.clone());
            }
        }

        let store_id = self.kv.get(&format!("tuple:store:{scope}")).await?;
        let model_id = self.kv.get(&format!("tuple:model:{scope}")).await?;
        if let (Some(store_id), Some(model_id)) = (store_id, model_id) {
            let ids = StoreIds { store_id, model_id };
            self.ids.insert(scope, ids.clone());
            return Ok(ids);
        }

        self.ensure_store(tenant).await?;
        self.ensure_model(tenant).await?;
        self.ids
            .get(&self.scope_key(tenant))
            .map(|ids| ids.clone())
            .ok_or_else(|| Error::Internal("store ids missing after ensure".to_string()))
    }

    async fn post(&self, url: &str, body: &Value) -> Result<reqwest::Response> {
        let response = self.client.post(url).json(body).send().await?;
        Ok(response)
    }

    /// Map a non-success backend response to the adapter's error kinds.
    async fn reject(response: reqwest::Response) -> Error {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            Error::BackendUnavailable(format!("tuple store returned {status}"))
        } else {
            Error::BackendRejected(format!("tuple store returned {status}: {body}"))
        }
    }
}

/// `true` if a write rejection is a duplicate-tuple or missing-tuple
/// condition, which the adapter treats as success to keep grant/revoke
/// idempotent.
fn is_idempotent_write_conflict(body: &str) -> bool {
    let lower = body.to_ascii_lowercase();
    lower.contains("already exists")
        || lower.contains("duplicate")
        || lower.contains("does not exist")
        || lower.contains("not found")
}

#[async_trait::async_trait]
impl TupleStore for HttpTupleStore {
    async fn write_tuples(&self, tenant: &str, tuples: &[Tuple]) -> Result<()> {
        if tuples.is_empty() {
            return Ok(());
        }
        let ids = self.resolved_ids(tenant).await?;
        let url = format!("{}/stores/{}/write", self.base_url_for(tenant), ids.store_id);

        let keys: Vec<Value> = sorted_for_write(tuples)
            .iter()
            .map(|t| self.wire_tuple(tenant, t))
            .collect();
        let body = json!({
            "writes": { "tuple_keys": keys },
            "authorization_model_id": ids.model_id,
        });

        let response = self.post(&url, &body).await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status().is_client_error() {
            let text = response.text().await.unwrap_or_default();
            if is_idempotent_write_conflict(&text) {
                debug!(tenant = %tenant, "Duplicate tuple write treated as success");
                return Ok(());
            }
            return Err(Error::BackendRejected(text));
        }
        Err(Error::BackendUnavailable(format!(
            "tuple store write failed for tenant {tenant}"
        )))
    }

    async fn delete_tuples(&self, tenant: &str, tuples: &[Tuple]) -> Result<()> {
        if tuples.is_empty() {
            return Ok(());
        }
        let ids = self.resolved_ids(tenant).await?;
        let url = format!("{}/stores/{}/write", self.base_url_for(tenant), ids.store_id);

        let keys: Vec<Value> = sorted_for_write(tuples)
            .iter()
            .map(|t| self.wire_tuple(tenant, t))
            .collect();
        let body = json!({
            "deletes": { "tuple_keys": keys },
            "authorization_model_id": ids.model_id,
        });

        let response = self.post(&url, &body).await?;
        if response.status().is_success() {
            return Ok(());
        }
        if response.status().is_client_error() {
            let text = response.text().await.unwrap_or_default();
            if is_idempotent_write_conflict(&text) {
                debug!(tenant = %tenant, "Missing tuple delete treated as success");
                return Ok(());
            }
            return Err(Error::BackendRejected(text));
        }
        Err(Error::BackendUnavailable(format!(
            "tuple store delete failed for tenant {tenant}"
        )))
    }

    async fn check(
        &self,
        tenant: &str,
        user: &str,
        relation: &str,
        object: &str,
        contextual: &[Tuple],
    ) -> Result<bool> {
        let ids = self.resolved_ids(tenant).await?;
        let url = format!("{}/stores/{}/check", self.base_url_for(tenant), ids.store_id);

        let mut body = json!({
            "tuple_key": {
                "user": self.scoped(tenant, user),
                "relation": relation,
                "object": self.scoped(tenant, object),
            },
            "authorization_model_id": ids.model_id,
        });
        if !contextual.is_empty() {
            let keys: Vec<Value> = contextual
                .iter()
                .map(|t| self.wire_tuple(tenant, t))
                .collect();
            body["contextual_tuples"] = json!({ "tuple_keys": keys });
        }

        let response = self.post(&url, &body).await?;
        if !response.status().is_success() {
            return Err(Self::reject(response).await);
        }
        let check: CheckResponse = response
            .json()
            .await
            .map_err(|e| Error::BackendRejected(format!("malformed check response: {e}")))?;
        Ok(check.allowed)
    }

    async fn read(&self, tenant: &str, filter: &TupleFilter) -> Result<Vec<Tuple>> {
        let ids = self.resolved_ids(tenant).await?;
        let url = format!("{}/stores/{}/read", self.base_url_for(tenant), ids.store_id);

        let mut tuple_key = serde_json::Map::new();
        if let Some(ref user) = filter.user {
            tuple_key.insert("user".to_string(), json!(self.scoped(tenant, user)));
        }
        if let Some(ref relation) = filter.relation {
            tuple_key.insert("relation".to_string(), json!(relation));
        }
        if let Some(ref object) = filter.object {
            // Prefix filters ("log:") pass through as a type filter; exact
            // references are namespaced.
            let wire = if object.ends_with(':') {
                object.clone()
            } else {
                self.scoped(tenant, object)
            };
            tuple_key.insert("object".to_string(), json!(wire));
        }

        let mut out = Vec::new();
        let mut continuation = String::new();
        loop {
            let mut body = json!({ "tuple_key": Value::Object(tuple_key.clone()) });
            if !continuation.is_empty() {
                body["continuation_token"] = json!(continuation);
            }

            let response = self.post(&url, &body).await?;
            if !response.status().is_success() {
                return Err(Self::reject(response).await);
            }
            let page: ReadResponse = response
                .json()
                .await
                .map_err(|e| Error::BackendRejected(format!("malformed read response: {e}")))?;

            for wire in page.tuples {
                if !self.in_scope(tenant, &wire.key.object) {
                    continue;
                }
                let tuple = Tuple {
                    user: self.unscoped(tenant, &wire.key.user),
                    relation: wire.key.relation,
                    object: self.unscoped(tenant, &wire.key.object),
                };
                if filter.matches(&tuple) {
                    out.push(tuple);
                }
            }

            if page.continuation_token.is_empty() {
                break;
            }
            continuation = page.continuation_token;
        }
        Ok(out)
    }

    async fn ensure_store(&self, tenant: &str) -> Result<()> {
        let scope = self.scope_key(tenant);
        if self
            .ids
            .get(&scope)
            .is_some_and(|ids| !ids.store_id.is_empty())
        {
            return Ok(());
        }

        let base = self.base_url_for(tenant);
        let name = &self.store_name;

        // Store creation is idempotent: reuse an existing store by name.
        let list_url = format!("{base}/stores?name={name}&page_size=50");
        let response = self.client.get(&list_url).send().await?;
        if !response.status().is_success() {
            return Err(Self::reject(response).await);
        }
        let listing: ListStoresResponse = response
            .json()
            .await
            .map_err(|e| Error::BackendRejected(format!("malformed store listing: {e}")))?;

        let store_id = if let Some(existing) = listing.stores.iter().find(|s| &s.name == name) {
            debug!(tenant = %tenant, store_id = %existing.id, "Reusing existing tuple store");
            existing.id.clone()
        } else {
            let response = self
                .post(&format!("{base}/stores"), &json!({ "name": name }))
                .await?;
            if !response.status().is_success() {
                return Err(Self::reject(response).await);
            }
            let created: CreateStoreResponse = response
                .json()
                .await
                .map_err(|e| Error::BackendRejected(format!("malformed create response: {e}")))?;
            info!(tenant = %tenant, store_id = %created.id, "Created tuple store");
            created.id
        };

        self.kv
            .put(&format!("tuple:store:{scope}"), store_id.clone())
            .await?;
        self.ids.entry(scope).or_default().store_id = store_id;
        Ok(())
    }

    async fn ensure_model(&self, tenant: &str) -> Result<()> {
        let scope = self.scope_key(tenant);
        if self
            .ids
            .get(&scope)
            .is_some_and(|ids| !ids.model_id.is_empty())
        {
            return Ok(());
        }

        let store_id = self
            .ids
            .get(&scope)
            .map(|ids| ids.store_id.clone())
            .filter(|id| !id.is_empty())
            .ok_or_else(|| Error::Internal("ensure_model called before ensure_store".to_string()))?;

        // Model upgrades install a new version; existing tuples survive.
        let url = format!(
            "{}/stores/{store_id}/authorization-models",
            self.base_url_for(tenant)
        );
        let response = self.post(&url, &schema::model_document()).await?;
        if !response.status().is_success() {
            return Err(Self::reject(response).await);
        }
        let written: WriteModelResponse = response
            .json()
            .await
            .map_err(|e| Error::BackendRejected(format!("malformed model response: {e}")))?;

        info!(tenant = %tenant, model_id = %written.authorization_model_id, "Installed authorization model");
        self.kv
            .put(&format!("tuple:model:{scope}"), written.authorization_model_id.clone())
            .await?;
        self.ids.entry(scope).or_default().model_id = written.authorization_model_id;
        Ok(())
    }

    async fn purge_tenant(&self, tenant: &str) -> Result<usize> {
        // Collect the tenant's tuples type by type. Per-tenant mode owns
        // its whole store; local mode shares one, so global object types
        // must be read exactly — a `tenant:` prefix would sweep up other
        // tenants' membership tuples.
        let mut doomed = Vec::new();
        for type_def in schema::SCHEMA {
            let object = if self.routing == Routing::Local && GLOBAL_TYPES.contains(&type_def.name)
            {
                match type_def.name {
                    "tenant" => format!("tenant:{tenant}"),
                    // user/system objects carry no tenant-owned tuples
                    _ => continue,
                }
            } else {
                format!("{}:", type_def.name)
            };
            let filter = TupleFilter {
                object: Some(object),
                ..TupleFilter::default()
            };
            let mut tuples = self.read(tenant, &filter).await?;
            doomed.append(&mut tuples);
        }

        let count = doomed.len();
        for chunk in doomed.chunks(50) {
            self.delete_tuples(tenant, chunk).await?;
        }
        Ok(count)
    }
}
