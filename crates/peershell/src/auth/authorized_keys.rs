//! Per-user authorized keys lists.

use std::path::PathBuf;

use russh::keys::PublicKey;

use super::AuthError;
use crate::session::pty::USER_PLACEHOLDER;

/// Key type prefixes, used to find the key in a line that starts with
/// options such as `no-pty,from="..."`.
const KEY_TYPE_PREFIXES: &[&str] = &["ssh-", "ecdsa-sha2-", "sk-ssh-", "sk-ecdsa-"];

/// Authorized keys files located through a path template such as
/// `/home/{user}/.ssh/authorized_keys`.
#[derive(Debug, Clone)]
pub struct AuthorizedKeysStore {
    template: String,
}

impl AuthorizedKeysStore {
    pub fn new(template: impl Into<String>) -> Self {
        Self {
            template: template.into(),
        }
    }

    /// The file holding `user`'s keys.
    pub fn path_for(&self, user: &str) -> PathBuf {
        PathBuf::from(self.template.replace(USER_PLACEHOLDER, user))
    }

    /// Whether `candidate` is listed for `user`, compared by key material.
    pub fn contains(&self, user: &str, candidate: &PublicKey) -> Result<bool, AuthError> {
        let path = self.path_for(user);
        let content = std::fs::read_to_string(&path).map_err(|e| {
            tracing::warn!(path = %path.display(), error = %e, "Cannot read authorized keys");
            AuthError::AuthorizedKeysUnavailable(e.to_string())
        })?;

        Ok(parse_authorized_keys(&content)
            .iter()
            .any(|key| key.key_data() == candidate.key_data()))
    }
}

/// Parse authorized_keys content. Malformed lines are logged and skipped.
pub(crate) fn parse_authorized_keys(content: &str) -> Vec<PublicKey> {
    let mut keys = Vec::new();

    for (line_num, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        match parse_line(line) {
            Some(key) => keys.push(key),
            None => {
                tracing::warn!(line = line_num + 1, "Skipping malformed authorized_keys line");
            }
        }
    }

    keys
}

fn parse_line(line: &str) -> Option<PublicKey> {
    if let Ok(key) = PublicKey::from_openssh(line) {
        return Some(key);
    }
    // Skip a leading options field.
    let start = line.char_indices().find_map(|(i, _)| {
        let rest = &line[i..];
        let at_word = i == 0 || line[..i].ends_with(char::is_whitespace);
        (at_word && KEY_TYPE_PREFIXES.iter().any(|p| rest.starts_with(p))).then_some(i)
    })?;
    PublicKey::from_openssh(&line[start..]).ok()
}
