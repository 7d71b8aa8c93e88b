//! KEK lifecycle tests: rotation, the status state machine, the
//! single-active invariant, and blob provisioning rules.

mod common;

use common::{bootstrap_acme, test_state};
use tessera::Error;
use tessera::kek::KekStatus;

const BLOB: &str = "d3JhcHBlZC1rZWstbWF0ZXJpYWw="; // base64("wrapped-kek-material")

/// Quarterly rotation: the new version goes active, the old one drops to
/// decrypt-only, and re-activation is refused.
#[tokio::test]
async fn rotation_demotes_and_never_reactivates() {
    let state = test_state();
    bootstrap_acme(&state).await;

    let v2 = state
        .kek_registry
        .create_with_id("acme", "v2", "user:alice", "quarterly")
        .await
        .unwrap();
    assert_eq!(v2.status, KekStatus::Active);

    assert_eq!(state.kek_registry.get_active("acme").await.unwrap().id, "v2");
    assert_eq!(
        state.kek_registry.get("acme", "v1").await.unwrap().status,
        KekStatus::DecryptOnly
    );

    let err = state
        .kek_registry
        .update_status("acme", "v1", KekStatus::Active)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidTransition(_)));
    assert_eq!(err.status(), 409);
}

/// Single-active invariant holds across a burst of concurrent creations.
#[tokio::test]
async fn at_most_one_active_version() {
    let state = test_state();
    bootstrap_acme(&state).await;

    let mut handles = Vec::new();
    for i in 2..10 {
        let registry = std::sync::Arc::clone(&state.kek_registry);
        handles.push(tokio::spawn(async move {
            registry
                .create_with_id("acme", &format!("v{i}"), "user:alice", "race")
                .await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let versions = state.kek_registry.list("acme").await.unwrap();
    let active_count = versions
        .iter()
        .filter(|v| v.status == KekStatus::Active)
        .count();
    assert_eq!(versions.len(), 9);
    assert_eq!(active_count, 1);
}

/// Deprecation is monotonic: once deprecated, every further transition is
/// refused.
#[tokio::test]
async fn deprecated_is_forever() {
    let state = test_state();
    bootstrap_acme(&state).await;

    state
        .kek_registry
        .create_with_id("acme", "v2", "user:alice", "rotate")
        .await
        .unwrap();
    state
        .kek_registry
        .update_status("acme", "v1", KekStatus::Deprecated)
        .await
        .unwrap();

    for target in [KekStatus::Active, KekStatus::DecryptOnly, KekStatus::Deprecated] {
        let err = state
            .kek_registry
            .update_status("acme", "v1", target)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }
    assert_eq!(
        state.kek_registry.get("acme", "v1").await.unwrap().status,
        KekStatus::Deprecated
    );
}

/// Rotation with removed users: the deny-list blocks provisioning for the
/// removed user on the new version only.
#[tokio::test]
async fn removed_user_cannot_be_provisioned() {
    let state = test_state();
    bootstrap_acme(&state).await;

    let v3 = state
        .kek_registry
        .rotate(
            "acme",
            "user:alice",
            "remove mallory",
            &["user:mallory".to_string()],
        )
        .await
        .unwrap();

    let err = state
        .kek_blobs
        .set("acme", "user:mallory", &v3.id, BLOB)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AccessDenied(_)));
    assert_eq!(err.status(), 403);

    // Everyone else provisions fine, and mallory can still be provisioned
    // under the old decrypt-only version for data they already hold.
    state.kek_blobs.set("acme", "user:bob", &v3.id, BLOB).await.unwrap();
    state
        .kek_blobs
        .set("acme", "user:mallory", "v1", BLOB)
        .await
        .unwrap();
}

/// Blob CRUD honours version rules and uniqueness per
/// (tenant, user, version).
#[tokio::test]
async fn blob_lifecycle() {
    let state = test_state();
    bootstrap_acme(&state).await;

    // Unknown version: 404
    let err = state
        .kek_blobs
        .set("acme", "user:bob", "v9", BLOB)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));

    // Provision, replace, fetch
    state.kek_blobs.set("acme", "user:bob", "v1", BLOB).await.unwrap();
    let replacement = "bmV3LXdyYXBwZWQta2Vr"; // base64("new-wrapped-kek")
    state
        .kek_blobs
        .set("acme", "user:bob", "v1", replacement)
        .await
        .unwrap();

    let blob = state.kek_blobs.get("acme", "user:bob", "v1").await.unwrap();
    assert_eq!(blob.encrypted_blob, replacement);
    assert_eq!(state.kek_blobs.list_for_user("acme", "user:bob").await.unwrap().len(), 1);

    // Deprecate the version: reads still work, writes are refused
    state
        .kek_registry
        .create_with_id("acme", "v2", "user:alice", "rotate")
        .await
        .unwrap();
    state
        .kek_registry
        .update_status("acme", "v1", KekStatus::Deprecated)
        .await
        .unwrap();

    assert!(state.kek_blobs.get("acme", "user:bob", "v1").await.is_ok());
    let err = state
        .kek_blobs
        .set("acme", "user:carol", "v1", BLOB)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Validation(_)));

    // Delete, then the blob is gone
    state.kek_blobs.delete("acme", "user:bob", "v1").await.unwrap();
    assert!(state.kek_blobs.get("acme", "user:bob", "v1").await.is_err());
}

/// Versions and blobs are tenant-scoped.
#[tokio::test]
async fn kek_state_is_tenant_scoped() {
    let state = test_state();
    bootstrap_acme(&state).await;

    state
        .authz
        .create_tenant("globex", "user:hank")
        .await
        .unwrap();
    state
        .kek_registry
        .create_with_id("globex", "g1", "user:hank", "bootstrap")
        .await
        .unwrap();

    // acme's versions are invisible to globex and vice versa
    assert!(state.kek_registry.get("globex", "v1").await.is_err());
    assert!(state.kek_registry.get("acme", "g1").await.is_err());

    state.kek_blobs.set("acme", "user:bob", "v1", BLOB).await.unwrap();
    assert!(state.kek_blobs.get("globex", "user:bob", "v1").await.is_err());
}

/// The tenant cascade wipes versions, blobs, and the active pointer.
#[tokio::test]
async fn tenant_delete_cascades_kek_state() {
    let state = test_state();
    bootstrap_acme(&state).await;
    state.kek_blobs.set("acme", "user:bob", "v1", BLOB).await.unwrap();

    state.authz.delete_tenant("acme", "user:alice").await.unwrap();
    state.kek_blobs.purge_tenant("acme").await.unwrap();
    state.kek_registry.purge_tenant("acme").await.unwrap();

    assert!(state.kek_registry.list("acme").await.unwrap().is_empty());
    assert!(state.kek_registry.get_active("acme").await.is_err());
    assert!(state.kek_blobs.get("acme", "user:bob", "v1").await.is_err());
}
