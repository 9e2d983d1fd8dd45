//! Persistent keys: the iroh node identity and the SSH host key.

use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use iroh::SecretKey;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::PrivateKey;
use tracing::info;
use zeroize::Zeroizing;

/// File name of the node key inside the data directory.
pub const NODE_KEY_FILE: &str = "node.key";

/// File name of the default host key inside the data directory.
pub const HOST_KEY_FILE: &str = "ssh_host_ed25519_key";

/// Loads the node key from `path`, generating and saving one if missing.
pub fn load_or_generate_node_key(path: &Path) -> Result<SecretKey> {
    if path.exists() {
        let bytes = Zeroizing::new(
            std::fs::read(path)
                .with_context(|| format!("Failed to read node key: {}", path.display()))?,
        );
        if bytes.len() != 32 {
            anyhow::bail!("Invalid node key file: expected 32 bytes, got {}", bytes.len());
        }
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&bytes);
        Ok(SecretKey::from_bytes(&key))
    } else {
        let key = SecretKey::generate(rand::rngs::OsRng);
        write_private(path, &key.to_bytes())?;
        info!("Generated new node key and saved to {:?}", path);
        Ok(key)
    }
}

/// Loads the OpenSSH host key from `path`, generating an Ed25519 key if
/// missing.
pub fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey> {
    if path.exists() {
        info!("Loading host key from {}", path.display());
        russh::keys::load_secret_key(path, None)
            .with_context(|| format!("Failed to load host key from {}", path.display()))
    } else {
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .context("Failed to generate host key")?;
        let encoded = key
            .to_openssh(LineEnding::LF)
            .context("Failed to encode host key")?;
        write_private(path, encoded.as_bytes())?;
        info!("Generated new host key and saved to {}", path.display());
        Ok(key)
    }
}

/// Write `contents` to a new file readable only by the owner.
fn write_private(path: &Path, contents: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
    }

    let mut options = std::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options
        .open(path)
        .with_context(|| format!("Failed to create key file: {}", path.display()))?;
    file.write_all(contents)
        .with_context(|| format!("Failed to write key file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_node_key_generation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("keys").join(NODE_KEY_FILE);

        // First call generates, second call loads the same key
        let first = load_or_generate_node_key(&path).unwrap();
        assert!(path.exists());
        let second = load_or_generate_node_key(&path).unwrap();
        assert_eq!(first.public(), second.public());
    }

    #[test]
    fn test_node_key_wrong_length() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(NODE_KEY_FILE);
        std::fs::write(&path, [0u8; 16]).unwrap();

        let err = load_or_generate_node_key(&path).unwrap_err();
        assert!(err.to_string().contains("expected 32 bytes"));
    }

    #[cfg(unix)]
    #[test]
    fn test_key_files_are_private() {
        use std::os::unix::fs::PermissionsExt;

        let temp_dir = TempDir::new().unwrap();
        let node = temp_dir.path().join(NODE_KEY_FILE);
        let host = temp_dir.path().join(HOST_KEY_FILE);
        load_or_generate_node_key(&node).unwrap();
        load_or_generate_host_key(&host).unwrap();

        for path in [node, host] {
            let mode = std::fs::metadata(&path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600, "{} is not private", path.display());
        }
    }

    #[test]
    fn test_host_key_generation() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(HOST_KEY_FILE);

        let first = load_or_generate_host_key(&path).unwrap();
        let second = load_or_generate_host_key(&path).unwrap();
        assert_eq!(first.algorithm(), Algorithm::Ed25519);
        assert_eq!(
            first.public_key().key_data(),
            second.public_key().key_data()
        );
    }
}
