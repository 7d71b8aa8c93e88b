//! Key-custody subsystems: the KEK version registry, the per-user blob
//! store, the public-key registry, and threshold recovery.
//!
//! Everything in here is zero-knowledge with respect to key material: the
//! server moves ciphertext between clients and storage and never holds a
//! plaintext KEK, share, or private key. The only cryptographic judgement
//! it makes is "is this base64".

pub mod blob;
pub mod pubkey;
pub mod recovery;
pub mod version;

pub use blob::{KekBlob, KekBlobStore};
pub use pubkey::{PURPOSE_ADMIN_PROMOTION, PublicKeyRecord, PublicKeyRegistry};
pub use recovery::{RecoveryService, RecoverySession, RecoverySessionView, RecoveryStatus};
pub use version::{KekRegistry, KekStatus, KekVersion};

use crate::{Error, Result};

/// Require `value` to be non-empty base64 (standard or url-safe).
pub(crate) fn require_base64(field: &str, value: &str) -> Result<()> {
    if value.is_empty() {
        return Err(Error::Validation(format!("{field} must not be empty")));
    }
    let standard = base64::Engine::decode(&base64::engine::general_purpose::STANDARD, value);
    let url_safe =
        base64::Engine::decode(&base64::engine::general_purpose::URL_SAFE_NO_PAD, value);
    if standard.is_err() && url_safe.is_err() {
        return Err(Error::Validation(format!("{field} must be base64")));
    }
    Ok(())
}
