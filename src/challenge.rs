//! In-memory challenge nonces for API-key challenge/response login.
//!
//! A challenge is a random nonce with a five-minute expiry, held only in
//! process memory. Consumption is single-use: the nonce is removed the
//! moment a response verifies against it, so a replayed response fails
//! with "unknown challenge". Expired nonces are rejected lazily on lookup
//! and reaped by a periodic sweeper.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rand::RngExt;
use tracing::debug;

use crate::{Error, Result};

/// Issued challenges, nonce → expiry.
pub struct ChallengeMap {
    entries: DashMap<String, Instant>,
    ttl: Duration,
}

impl ChallengeMap {
    /// Create an empty map with the given nonce TTL.
    #[must_use]
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Nonce lifetime in seconds, for the issuance response.
    #[must_use]
    pub fn ttl_secs(&self) -> u64 {
        self.ttl.as_secs()
    }

    /// Issue a fresh nonce (256 bits, base64url).
    #[must_use]
    pub fn issue(&self) -> String {
        let random_bytes: [u8; 32] = rand::rng().random();
        let nonce = base64::Engine::encode(
            &base64::engine::general_purpose::URL_SAFE_NO_PAD,
            random_bytes,
        );
        self.entries.insert(nonce.clone(), Instant::now() + self.ttl);
        nonce
    }

    /// Check that `nonce` is outstanding and unexpired, without consuming
    /// it. Expired entries are evicted on access.
    pub fn peek(&self, nonce: &str) -> Result<()> {
        let expired = match self.entries.get(nonce) {
            Some(expiry) if Instant::now() < *expiry => return Ok(()),
            Some(_) => true,
            None => false,
        };
        // The read guard is released before the eviction below.
        if expired {
            self.entries.remove(nonce);
            Err(Error::Validation("challenge expired".to_string()))
        } else {
            Err(Error::Validation("unknown or consumed challenge".to_string()))
        }
    }

    /// Consume `nonce` after a successful verification.
    pub fn consume(&self, nonce: &str) {
        self.entries.remove(nonce);
    }

    /// Remove expired nonces. Called by the background sweeper.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let doomed: Vec<String> = self
            .entries
            .iter()
            .filter(|e| now >= *e.value())
            .map(|e| e.key().clone())
            .collect();

        let count = doomed.len();
        for nonce in doomed {
            self.entries.remove(&nonce);
        }
        count
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Spawn the challenge sweeper.
pub fn spawn_sweeper(
    challenges: Arc<ChallengeMap>,
    interval: Duration,
    mut shutdown: tokio::sync::broadcast::Receiver<()>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let swept = challenges.sweep();
                    if swept > 0 {
                        debug!(count = swept, "Swept expired challenges");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Challenge sweeper shutting down");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issued_nonce_verifies_until_consumed() {
        // GIVEN: an issued challenge
        let challenges = ChallengeMap::new(Duration::from_secs(300));
        let nonce = challenges.issue();

        // THEN: it peeks fine, repeatedly
        challenges.peek(&nonce).unwrap();
        challenges.peek(&nonce).unwrap();

        // WHEN: it is consumed
        challenges.consume(&nonce);

        // THEN: a replay is rejected
        let err = challenges.peek(&nonce).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn expired_nonce_is_rejected_and_evicted() {
        let challenges = ChallengeMap::new(Duration::from_millis(1));
        let nonce = challenges.issue();

        std::thread::sleep(Duration::from_millis(5));

        assert!(challenges.peek(&nonce).is_err());
        assert_eq!(challenges.len(), 0);
    }

    #[test]
    fn nonces_are_unique_and_opaque() {
        let challenges = ChallengeMap::new(Duration::from_secs(300));
        let a = challenges.issue();
        let b = challenges.issue();

        assert_ne!(a, b);
        assert!(a.len() >= 43); // 256 bits base64url
    }

    #[test]
    fn sweep_reaps_only_expired() {
        let challenges = ChallengeMap::new(Duration::from_millis(1));
        challenges.issue();
        challenges.issue();
        std::thread::sleep(Duration::from_millis(5));

        let fresh = ChallengeMap::new(Duration::from_secs(300));
        fresh.issue();

        assert_eq!(challenges.sweep(), 2);
        assert_eq!(fresh.sweep(), 0);
        assert_eq!(fresh.len(), 1);
    }
}
