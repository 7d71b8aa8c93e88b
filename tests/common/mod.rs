//! Shared fixture: the full service stack assembled in-process against the
//! embedded backends.

use std::sync::Arc;

use tessera::config::{Config, TupleStoreMode};
use tessera::http::AppState;
use tessera::server::Server;

/// Build the full application state on the in-memory tuple and KV
/// backends. No network anywhere.
pub fn test_state() -> Arc<AppState> {
    let mut config = Config::default();
    config.tuple_store.mode = TupleStoreMode::Memory;
    config.tokens.session_secret = "integration-test-secret".to_string();
    config.tokens.resource_ttl_secs = 300;
    config.default_tenant = "default".to_string();
    config.rate_limit.enabled = false;

    Server::build_state(&config).expect("state assembly")
}

/// Bootstrap tenant `acme` with admin `user:alice` the way the tenants
/// handler does: registration plus the first KEK version.
#[allow(dead_code)]
pub async fn bootstrap_acme(state: &AppState) {
    state
        .authz
        .create_tenant("acme", "user:alice")
        .await
        .expect("tenant bootstrap");
    state
        .kek_registry
        .create_with_id("acme", "v1", "user:alice", "tenant bootstrap")
        .await
        .expect("initial KEK version");
}
