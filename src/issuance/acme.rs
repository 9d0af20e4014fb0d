use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use log::info;
use sha2::{Digest, Sha256};

/// The process-wide ACME account credential.
///
/// Loaded or generated once at startup and passed by reference into every
/// component that needs it; never rotated mid-process. The thumbprint is the
/// base64url SHA-256 digest of the public key (SubjectPublicKeyInfo DER) and
/// is what key authorizations bind the challenge token to.
pub struct AccountKey {
    pem: String,
    thumbprint: String,
}

impl AccountKey {
    /// Generates a fresh ECDSA P-256 account key.
    pub fn generate() -> Result<Self> {
        let key = rcgen::KeyPair::generate()?;
        Self::from_key_pair(key)
    }

    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = rcgen::KeyPair::from_pem(pem)
            .map_err(|e| anyhow!("failed to parse account key PEM: {e}"))?;
        Self::from_key_pair(key)
    }

    /// Startup lifecycle: reuse the key at `path` if present, otherwise
    /// generate one and persist it for the next run.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let pem = fs::read_to_string(path)
                .with_context(|| format!("failed to read account key at {}", path.display()))?;
            let key = Self::from_pem(&pem)?;
            info!("[acme] loaded account key from {}", path.display());
            return Ok(key);
        }

        let key = Self::generate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, key.pem())
            .with_context(|| format!("failed to write account key to {}", path.display()))?;
        Self::restrict_permissions(path)?;
        info!("[acme] generated new account key at {}", path.display());
        Ok(key)
    }

    pub fn pem(&self) -> &str {
        &self.pem
    }

    pub fn thumbprint(&self) -> &str {
        &self.thumbprint
    }

    fn from_key_pair(key: rcgen::KeyPair) -> Result<Self> {
        let digest = Sha256::digest(key.public_key_der());
        Ok(Self {
            pem: key.serialize_pem(),
            thumbprint: URL_SAFE_NO_PAD.encode(digest),
        })
    }

    #[cfg(unix)]
    fn restrict_permissions(path: &Path) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
        Ok(())
    }

    #[cfg(not(unix))]
    fn restrict_permissions(_path: &Path) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thumbprint_is_base64url_sha256() {
        let key = AccountKey::generate().unwrap();
        // 32 digest bytes encode to 43 base64url characters, no padding.
        assert_eq!(key.thumbprint().len(), 43);
        assert!(!key.thumbprint().contains('+'));
        assert!(!key.thumbprint().contains('/'));
        assert!(!key.thumbprint().contains('='));
    }

    #[test]
    fn thumbprint_is_stable_across_pem_round_trip() {
        let key = AccountKey::generate().unwrap();
        let reloaded = AccountKey::from_pem(key.pem()).unwrap();
        assert_eq!(key.thumbprint(), reloaded.thumbprint());
    }

    #[test]
    fn distinct_keys_have_distinct_thumbprints() {
        let a = AccountKey::generate().unwrap();
        let b = AccountKey::generate().unwrap();
        assert_ne!(a.thumbprint(), b.thumbprint());
    }

    #[test]
    fn from_pem_rejects_garbage() {
        assert!(AccountKey::from_pem("not a pem").is_err());
    }

    #[test]
    fn load_or_generate_round_trips_through_disk() {
        let dir = std::env::temp_dir().join(format!("certflow-test-{}", uuid::Uuid::new_v4()));
        let path = dir.join("account.pem");

        let first = AccountKey::load_or_generate(&path).unwrap();
        let second = AccountKey::load_or_generate(&path).unwrap();
        assert_eq!(first.thumbprint(), second.thumbprint());

        std::fs::remove_dir_all(&dir).ok();
    }
}
