//! Shadow-file password verification.
//!
//! Entries look like `name:$6$[rounds=N$]salt$hash:...`. Only SHA-512
//! crypt (`$6$`) is supported. The hash comparison itself is constant
//! time.

use std::path::{Path, PathBuf};

use sha_crypt::CheckError;

use super::AuthError;

const SHA512_PREFIX: &str = "$6$";

/// Verified against when the user is missing or locked, so those paths
/// cost about as much as a real check.
const DUMMY_HASH: &str = "$6$peershelldummy$\
    AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA";

/// A shadow-style credential file.
#[derive(Debug, Clone)]
pub struct ShadowStore {
    path: PathBuf,
}

impl ShadowStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn verify(&self, user: &str, secret: &str) -> Result<(), AuthError> {
        let content = std::fs::read_to_string(&self.path).map_err(|e| {
            tracing::warn!(path = %self.path.display(), error = %e, "Cannot read credential store");
            AuthError::StoreUnavailable(e.to_string())
        })?;

        let Some(stored) = lookup(&content, user) else {
            burn(secret);
            return Err(AuthError::UserNotFound);
        };

        // Locked or password-less accounts never match.
        if stored.is_empty() || stored.starts_with('!') || stored.starts_with('*') {
            burn(secret);
            return Err(AuthError::Mismatch);
        }
        if !stored.starts_with(SHA512_PREFIX) {
            let scheme = stored.split('$').nth(1).unwrap_or_default();
            return Err(AuthError::UnsupportedHash(format!("${}$", scheme)));
        }

        match sha_crypt::sha512_check(secret, stored) {
            Ok(()) => Ok(()),
            Err(CheckError::HashMismatch) => Err(AuthError::Mismatch),
            Err(e) => Err(AuthError::UnsupportedHash(format!("{:?}", e))),
        }
    }
}

/// The hash field for `user`, matching the name field exactly.
fn lookup<'a>(content: &'a str, user: &str) -> Option<&'a str> {
    content.lines().find_map(|line| {
        let mut fields = line.split(':');
        let name = fields.next()?;
        if name == user && !user.is_empty() {
            fields.next()
        } else {
            None
        }
    })
}

fn burn(secret: &str) {
    let _ = sha_crypt::sha512_check(secret, DUMMY_HASH);
}
