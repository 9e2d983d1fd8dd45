//! Credential verification.
//!
//! Two pure predicates used by the SSH engine during authentication:
//! a password check against a shadow-style store and a public-key check
//! against the user's authorized keys. Neither touches session state.

mod authorized_keys;
mod shadow;

use std::path::PathBuf;

use russh::keys::ssh_key::HashAlg;
use russh::keys::PublicKey;
use thiserror::Error;

pub use authorized_keys::AuthorizedKeysStore;
pub use shadow::ShadowStore;

/// Errors from credential verification.
#[derive(Debug, Error)]
pub enum AuthError {
    /// The credential store has no entry for this user.
    #[error("user not found")]
    UserNotFound,

    /// The credential store could not be read.
    #[error("credential store unavailable: {0}")]
    StoreUnavailable(String),

    /// The supplied secret does not match the stored hash.
    #[error("credential mismatch")]
    Mismatch,

    /// The user's authorized keys file could not be read.
    #[error("authorized keys unavailable: {0}")]
    AuthorizedKeysUnavailable(String),

    /// The stored hash uses an algorithm we cannot verify.
    #[error("unsupported password hash: {0}")]
    UnsupportedHash(String),
}

/// Password and public-key checks for incoming connections.
#[derive(Debug, Clone)]
pub struct CredentialVerifier {
    shadow: ShadowStore,
    authorized_keys: AuthorizedKeysStore,
}

impl CredentialVerifier {
    pub fn new(
        shadow_path: impl Into<PathBuf>,
        authorized_keys_template: impl Into<String>,
    ) -> Self {
        Self {
            shadow: ShadowStore::new(shadow_path),
            authorized_keys: AuthorizedKeysStore::new(authorized_keys_template),
        }
    }

    /// Check `secret` against the stored hash for `user`.
    ///
    /// Blocking: reads the store and runs the hash. Call it from a
    /// blocking context.
    pub fn verify_password(&self, user: &str, secret: &str) -> Result<(), AuthError> {
        self.shadow.verify(user, secret)
    }

    /// Whether `candidate` is in the authorized keys of `user`.
    ///
    /// A key that is not listed is `Ok(false)`, not an error.
    pub fn verify_public_key(&self, user: &str, candidate: &PublicKey) -> Result<bool, AuthError> {
        self.authorized_keys.contains(user, candidate)
    }
}

/// OpenSSH-style SHA-256 fingerprint, e.g. `SHA256:abc...`.
pub fn fingerprint(key: &PublicKey) -> String {
    key.fingerprint(HashAlg::Sha256).to_string()
}
