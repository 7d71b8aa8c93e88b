//! Threshold KEK recovery sessions.
//!
//! Recovery reconstructs a lost KEK from shares held by tenant admins,
//! Shamir-style, without the server ever combining anything: every share
//! arrives as ciphertext encrypted for the initiator, the server only
//! counts distinct submitters against the threshold, and the recovered KEK
//! comes back from the initiator as ciphertext too.
//!
//! Session lifecycle:
//!
//! ```text
//!               create
//!    ∅ ─────────────────────► pending
//!    share submissions        pending   (shares grow)
//!    expiresAt reached        expired
//!    initiator cancels        cancelled
//!    complete, #shares ≥ t    completed (new KEK version activated)
//! ```
//!
//! Expiry is enforced lazily on every read and eagerly by the sweeper.
//! Reads never disclose share ciphertext, only submitter ids and
//! timestamps.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::version::{KekRegistry, KekStatus, KekVersion};
use crate::kv::KvStore;
use crate::{Error, Result};

/// Recovery session status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecoveryStatus {
    /// Collecting shares.
    Pending,
    /// Threshold met and a new KEK version activated.
    Completed,
    /// Deadline passed before completion.
    Expired,
    /// Withdrawn by the initiator.
    Cancelled,
}

/// One submitted share. The ciphertext never leaves the record through the
/// read API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmittedShare {
    /// Submitting user.
    pub submitter_user_id: String,
    /// User the share ciphertext is encrypted for (normally the initiator).
    pub encrypted_for: String,
    /// The share, encrypted client-side. Opaque.
    pub ciphertext: String,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
}

/// A recovery session record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoverySession {
    /// Session id.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// KEK version being recovered.
    pub version_id: String,
    /// Initiating admin.
    pub initiated_by: String,
    /// Distinct submitters required before `complete` may succeed.
    pub threshold: usize,
    /// Operator-supplied reason.
    pub reason: String,
    /// Lifecycle status.
    pub status: RecoveryStatus,
    /// Collected shares.
    pub shares: Vec<SubmittedShare>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Deadline.
    pub expires_at: DateTime<Utc>,
    /// Version created by completion, once completed.
    pub new_version_id: Option<String>,
    /// Recovered KEK ciphertext recorded at completion; encrypted for the
    /// initiator, never returned on reads.
    pub recovered_kek: Option<String>,
}

/// What reads return: submitter ids and timestamps, no ciphertext.
#[derive(Debug, Clone, Serialize)]
pub struct RecoverySessionView {
    /// Session id.
    pub id: String,
    /// Owning tenant.
    pub tenant_id: String,
    /// KEK version being recovered.
    pub version_id: String,
    /// Initiating admin.
    pub initiated_by: String,
    /// Threshold.
    pub threshold: usize,
    /// Reason.
    pub reason: String,
    /// Status.
    pub status: RecoveryStatus,
    /// Who submitted, and when.
    pub submissions: Vec<SubmissionView>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Deadline.
    pub expires_at: DateTime<Utc>,
    /// Version created by completion.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_version_id: Option<String>,
}

/// One submission in a session view.
#[derive(Debug, Clone, Serialize)]
pub struct SubmissionView {
    /// Submitting user.
    pub submitter_user_id: String,
    /// Submission time.
    pub submitted_at: DateTime<Utc>,
}

impl From<&RecoverySession> for RecoverySessionView {
    fn from(session: &RecoverySession) -> Self {
        Self {
            id: session.id.clone(),
            tenant_id: session.tenant_id.clone(),
            version_id: session.version_id.clone(),
            initiated_by: session.initiated_by.clone(),
            threshold: session.threshold,
            reason: session.reason.clone(),
            status: session.status,
            submissions: session
                .shares
                .iter()
                .map(|s| SubmissionView {
                    submitter_user_id: s.submitter_user_id.clone(),
                    submitted_at: s.submitted_at,
                })
                .collect(),
            created_at: session.created_at,
            expires_at: session.expires_at,
            new_version_id: session.new_version_id.clone(),
        }
    }
}

/// Recovery-session service over the KV store and the version registry.
pub struct RecoveryService {
    kv: Arc<dyn KvStore>,
    registry: Arc<KekRegistry>,
    /// Per-session serialization of state transitions.
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl RecoveryService {
    /// Create the service.
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, registry: Arc<KekRegistry>) -> Self {
        Self {
            kv,
            registry,
            locks: DashMap::new(),
        }
    }

    fn session_key(tenant: &str, id: &str) -> String {
        format!("recovery:{tenant}:{id}")
    }

    fn index_key(tenant: &str) -> String {
        format!("recovery:byTenant:{tenant}")
    }

    fn session_lock(&self, tenant: &str, id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(format!("{tenant}/{id}"))
            .or_default()
            .clone()
    }

    async fn persist(&self, session: &RecoverySession) -> Result<()> {
        let json = serde_json::to_string(session)
            .map_err(|e| Error::Internal(format!("session serialization: {e}")))?;
        self.kv
            .put(&Self::session_key(&session.tenant_id, &session.id), json)
            .await
    }

    async fn load(&self, tenant: &str, id: &str) -> Result<RecoverySession> {
        match self.kv.get(&Self::session_key(tenant, id)).await? {
            Some(json) => serde_json::from_str(&json)
                .map_err(|e| Error::Internal(format!("session deserialization: {e}"))),
            None => Err(Error::NotFound(format!("recovery session '{id}'"))),
        }
    }

    /// Apply lazy expiry: a pending session past its deadline flips to
    /// expired and is persisted before anything else looks at it.
    async fn load_current(&self, tenant: &str, id: &str) -> Result<RecoverySession> {
        let mut session = self.load(tenant, id).await?;
        if session.status == RecoveryStatus::Pending && Utc::now() >= session.expires_at {
            session.status = RecoveryStatus::Expired;
            self.persist(&session).await?;
            info!(tenant = %tenant, session = %id, audit = true, "Recovery session expired");
        }
        Ok(session)
    }

    /// Start a recovery session for a non-active version.
    ///
    /// The caller's tenant-admin standing is checked by the handler; this
    /// enforces the version rules and parameter bounds.
    pub async fn initiate(
        &self,
        tenant: &str,
        initiator: &str,
        version_id: &str,
        threshold: usize,
        reason: &str,
        ttl: Duration,
    ) -> Result<RecoverySession> {
        if threshold == 0 || threshold > 64 {
            return Err(Error::Validation(
                "threshold must be between 1 and 64".to_string(),
            ));
        }
        if ttl.is_zero() {
            return Err(Error::Validation("expiresIn must be positive".to_string()));
        }

        let version = self.registry.get(tenant, version_id).await?;
        if version.status == KekStatus::Active {
            return Err(Error::Validation(format!(
                "version '{version_id}' is active; only decrypt-only or deprecated versions are recoverable"
            )));
        }

        let initiator = crate::principal::tag_user(initiator);
        let now = Utc::now();
        let session = RecoverySession {
            id: uuid::Uuid::new_v4().to_string(),
            tenant_id: tenant.to_string(),
            version_id: version_id.to_string(),
            initiated_by: initiator.clone(),
            threshold,
            reason: reason.to_string(),
            status: RecoveryStatus::Pending,
            shares: Vec::new(),
            created_at: now,
            expires_at: now + chrono::Duration::seconds(ttl.as_secs() as i64),
            new_version_id: None,
            recovered_kek: None,
        };

        self.persist(&session).await?;
        self.kv.set_add(&Self::index_key(tenant), &session.id).await?;
        info!(
            tenant = %tenant,
            session = %session.id,
            version = %version_id,
            threshold,
            audit = true,
            "Recovery session initiated"
        );
        Ok(session)
    }

    /// Submit a share. Each submitter may contribute once; the session must
    /// be pending and unexpired.
    pub async fn submit_share(
        &self,
        tenant: &str,
        session_id: &str,
        submitter: &str,
        encrypted_for: &str,
        ciphertext: &str,
    ) -> Result<RecoverySessionView> {
        super::require_base64("share", ciphertext)?;
        let submitter = crate::principal::tag_user(submitter);
        let encrypted_for = crate::principal::tag_user(encrypted_for);

        let lock = self.session_lock(tenant, session_id);
        let _guard = lock.lock().await;

        let mut session = self.load_current(tenant, session_id).await?;
        if session.status != RecoveryStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "recovery session is {:?}, not accepting shares",
                session.status
            )));
        }
        if session
            .shares
            .iter()
            .any(|s| s.submitter_user_id == submitter)
        {
            return Err(Error::Conflict(format!(
                "{submitter} already submitted a share"
            )));
        }

        session.shares.push(SubmittedShare {
            submitter_user_id: submitter.clone(),
            encrypted_for,
            ciphertext: ciphertext.to_string(),
            submitted_at: Utc::now(),
        });
        self.persist(&session).await?;

        info!(
            tenant = %tenant,
            session = %session_id,
            submitter = %submitter,
            shares = session.shares.len(),
            threshold = session.threshold,
            audit = true,
            "Recovery share submitted"
        );
        Ok(RecoverySessionView::from(&session))
    }

    /// Complete the session: only the initiator, only while pending, and
    /// only with the threshold met. Activates a new KEK version and records
    /// the association atomically with the status flip.
    pub async fn complete(
        &self,
        tenant: &str,
        session_id: &str,
        caller: &str,
        recovered_kek_ciphertext: &str,
        new_version_id: &str,
        new_version_reason: &str,
    ) -> Result<(RecoverySessionView, KekVersion)> {
        super::require_base64("recoveredKEK", recovered_kek_ciphertext)?;
        let caller = crate::principal::tag_user(caller);

        let lock = self.session_lock(tenant, session_id);
        let _guard = lock.lock().await;

        let mut session = self.load_current(tenant, session_id).await?;
        if session.initiated_by != caller {
            return Err(Error::AccessDenied(
                "only the initiator may complete a recovery session".to_string(),
            ));
        }
        if session.status != RecoveryStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "recovery session is {:?}, cannot complete",
                session.status
            )));
        }

        let distinct_submitters = session.shares.len();
        if distinct_submitters < session.threshold {
            return Err(Error::Conflict(format!(
                "threshold not met: {distinct_submitters} of {} shares submitted",
                session.threshold
            )));
        }

        let version = self
            .registry
            .create_with_id(tenant, new_version_id, &caller, new_version_reason)
            .await?;

        session.status = RecoveryStatus::Completed;
        session.new_version_id = Some(version.id.clone());
        session.recovered_kek = Some(recovered_kek_ciphertext.to_string());
        self.persist(&session).await?;

        info!(
            tenant = %tenant,
            session = %session_id,
            new_version = %version.id,
            audit = true,
            "Recovery session completed"
        );
        Ok((RecoverySessionView::from(&session), version))
    }

    /// Cancel a pending session. Only the initiator may cancel.
    pub async fn cancel(
        &self,
        tenant: &str,
        session_id: &str,
        caller: &str,
    ) -> Result<RecoverySessionView> {
        let caller = crate::principal::tag_user(caller);
        let lock = self.session_lock(tenant, session_id);
        let _guard = lock.lock().await;

        let mut session = self.load_current(tenant, session_id).await?;
        if session.initiated_by != caller {
            return Err(Error::AccessDenied(
                "only the initiator may cancel a recovery session".to_string(),
            ));
        }
        if session.status != RecoveryStatus::Pending {
            return Err(Error::InvalidTransition(format!(
                "recovery session is {:?}, cannot cancel",
                session.status
            )));
        }

        session.status = RecoveryStatus::Cancelled;
        self.persist(&session).await?;
        info!(tenant = %tenant, session = %session_id, audit = true, "Recovery session cancelled");
        Ok(RecoverySessionView::from(&session))
    }

    /// Read a session. Never discloses ciphertext.
    pub async fn get_session(&self, tenant: &str, session_id: &str) -> Result<RecoverySessionView> {
        let session = self.load_current(tenant, session_id).await?;
        Ok(RecoverySessionView::from(&session))
    }

    /// Expire overdue pending sessions across all tenants. Called by the
    /// background sweeper; lazy expiry on read covers anything it misses.
    pub async fn sweep(&self) -> Result<usize> {
        let mut expired = 0;
        for index in self.kv.set_keys_with_prefix("recovery:byTenant:").await? {
            let Some(tenant) = index.strip_prefix("recovery:byTenant:") else {
                continue;
            };
            let tenant = tenant.to_string();
            for id in self.kv.set_members(&index).await? {
                let before = self.load(&tenant, &id).await?;
                if before.status != RecoveryStatus::Pending {
                    continue;
                }
                let after = self.load_current(&tenant, &id).await?;
                if after.status == RecoveryStatus::Expired {
                    expired += 1;
                }
            }
        }
        Ok(expired)
    }

    /// Drop every session for a tenant. Part of the tenant-deletion
    /// cascade.
    pub async fn purge_tenant(&self, tenant: &str) -> Result<usize> {
        let removed = self.kv.delete_prefix(&format!("recovery:{tenant}:")).await?;
        self.kv.delete(&Self::index_key(tenant)).await?;
        Ok(removed)
    }
}

/// Spawn the recovery-session sweeper.
pub fn spawn_sweeper(
    recovery: Arc<RecoveryService>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match recovery.sweep().await {
                        Ok(count) if count > 0 => {
                            debug!(count, "Expired overdue recovery sessions");
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(error = %e, "Recovery sweep failed");
                        }
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Recovery sweeper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryKvStore;

    const SHARE: &str = "c2hhcmUtY2lwaGVydGV4dA=="; // base64("share-ciphertext")
    const RECOVERED: &str = "cmVjb3ZlcmVkLWtlaw=="; // base64("recovered-kek")

    /// Registry with v1 demoted to decrypt-only (v2 active), the usual
    /// starting point for a recovery.
    async fn fixtures() -> (RecoveryService, Arc<KekRegistry>) {
        let kv: Arc<dyn KvStore> = Arc::new(MemoryKvStore::new());
        let registry = Arc::new(KekRegistry::new(Arc::clone(&kv)));
        registry
            .create_with_id("acme", "v1", "user:alice", "bootstrap")
            .await
            .unwrap();
        registry
            .create_with_id("acme", "v2", "user:alice", "rotate")
            .await
            .unwrap();
        (RecoveryService::new(kv, Arc::clone(&registry)), registry)
    }

    async fn pending_session(service: &RecoveryService, threshold: usize) -> RecoverySession {
        service
            .initiate(
                "acme",
                "user:alice",
                "v1",
                threshold,
                "lost KEK",
                Duration::from_secs(3600),
            )
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn initiation_requires_a_non_active_version() {
        let (service, _) = fixtures().await;

        // v2 is active: not recoverable
        let err = service
            .initiate("acme", "user:alice", "v2", 3, "r", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        // v1 is decrypt-only: recoverable
        let session = pending_session(&service, 3).await;
        assert_eq!(session.status, RecoveryStatus::Pending);

        // Unknown version: 404
        let err = service
            .initiate("acme", "user:alice", "v9", 3, "r", Duration::from_secs(60))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NotFound(_)));
    }

    #[tokio::test]
    async fn threshold_recovery_end_to_end() {
        // GIVEN: a session with threshold 3
        let (service, registry) = fixtures().await;
        let session = pending_session(&service, 3).await;

        // WHEN: two distinct admins submit
        for submitter in ["user:bob", "user:carol"] {
            service
                .submit_share("acme", &session.id, submitter, "user:alice", SHARE)
                .await
                .unwrap();
        }

        // THEN: completion is refused below the threshold
        let err = service
            .complete("acme", &session.id, "user:alice", RECOVERED, "v4", "recovered")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));

        // WHEN: a third admin submits and the initiator completes
        service
            .submit_share("acme", &session.id, "user:dave", "user:alice", SHARE)
            .await
            .unwrap();
        let (view, version) = service
            .complete("acme", &session.id, "user:alice", RECOVERED, "v4", "recovered")
            .await
            .unwrap();

        // THEN: the session is completed, v4 is active, prior active demoted
        assert_eq!(view.status, RecoveryStatus::Completed);
        assert_eq!(view.new_version_id.as_deref(), Some("v4"));
        assert_eq!(version.status, KekStatus::Active);
        assert_eq!(registry.get_active("acme").await.unwrap().id, "v4");
        assert_eq!(
            registry.get("acme", "v2").await.unwrap().status,
            KekStatus::DecryptOnly
        );

        // AND: further submissions are rejected
        let err = service
            .submit_share("acme", &session.id, "user:erin", "user:alice", SHARE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn each_submitter_contributes_once() {
        let (service, _) = fixtures().await;
        let session = pending_session(&service, 3).await;

        service
            .submit_share("acme", &session.id, "user:bob", "user:alice", SHARE)
            .await
            .unwrap();
        let err = service
            .submit_share("acme", &session.id, "user:bob", "user:alice", SHARE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn only_the_initiator_completes_or_cancels() {
        let (service, _) = fixtures().await;
        let session = pending_session(&service, 1).await;
        service
            .submit_share("acme", &session.id, "user:bob", "user:alice", SHARE)
            .await
            .unwrap();

        let err = service
            .complete("acme", &session.id, "user:bob", RECOVERED, "v4", "r")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));

        let err = service
            .cancel("acme", &session.id, "user:bob")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AccessDenied(_)));

        let view = service
            .cancel("acme", &session.id, "user:alice")
            .await
            .unwrap();
        assert_eq!(view.status, RecoveryStatus::Cancelled);

        // A cancelled session cannot complete
        let err = service
            .complete("acme", &session.id, "user:alice", RECOVERED, "v4", "r")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn expiry_is_lazy_and_blocks_everything() {
        let (service, _) = fixtures().await;
        let session = service
            .initiate(
                "acme",
                "user:alice",
                "v1",
                2,
                "lost KEK",
                Duration::from_secs(1),
            )
            .await
            .unwrap();

        // Force the deadline into the past
        let mut stored = service.load("acme", &session.id).await.unwrap();
        stored.expires_at = Utc::now() - chrono::Duration::seconds(5);
        service.persist(&stored).await.unwrap();

        let view = service.get_session("acme", &session.id).await.unwrap();
        assert_eq!(view.status, RecoveryStatus::Expired);

        let err = service
            .submit_share("acme", &session.id, "user:bob", "user:alice", SHARE)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn reads_never_disclose_ciphertext() {
        let (service, _) = fixtures().await;
        let session = pending_session(&service, 2).await;
        service
            .submit_share("acme", &session.id, "user:bob", "user:alice", SHARE)
            .await
            .unwrap();

        let view = service.get_session("acme", &session.id).await.unwrap();
        assert_eq!(view.submissions.len(), 1);
        assert_eq!(view.submissions[0].submitter_user_id, "user:bob");

        let json = serde_json::to_string(&view).unwrap();
        assert!(!json.contains(SHARE));
        assert!(!json.contains("ciphertext"));
    }

    #[tokio::test]
    async fn sweeper_expires_overdue_sessions() {
        let (service, _) = fixtures().await;
        let session = pending_session(&service, 2).await;

        let mut stored = service.load("acme", &session.id).await.unwrap();
        stored.expires_at = Utc::now() - chrono::Duration::seconds(5);
        service.persist(&stored).await.unwrap();

        let expired = service.sweep().await.unwrap();
        assert_eq!(expired, 1);
        assert_eq!(
            service.get_session("acme", &session.id).await.unwrap().status,
            RecoveryStatus::Expired
        );
    }
}
