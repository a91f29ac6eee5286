//! Local participant keypair.
//!
//! The identity is a secp256k1 key used both for BIP-340 Schnorr event
//! signatures and for ECDH key wrapping. Public keys travel as 32-byte
//! x-only hex strings.

use aes_gcm::aead::OsRng;
use anyhow::Context;
use k256::schnorr::{Signature, SigningKey};
use k256::{NonZeroScalar, SecretKey};
use std::fmt;
use std::path::Path;

/// A loaded local keypair.
#[derive(Clone)]
pub struct Identity {
    signing_key: SigningKey,
    pubkey_hex: String,
}

impl Identity {
    /// Wrap an existing BIP-340 signing key.
    pub fn from_signing_key(signing_key: SigningKey) -> Self {
        let pubkey_hex = hex::encode(signing_key.verifying_key().to_bytes());
        Self {
            signing_key,
            pubkey_hex,
        }
    }

    /// Parse a 64-char hex secret key.
    pub fn from_secret_hex(secret_hex: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(secret_hex.trim()).context("secret key is not valid hex")?;
        if bytes.len() != 32 {
            anyhow::bail!("secret key must be 32 bytes, got {}", bytes.len());
        }
        let signing_key = SigningKey::from_bytes(&bytes)
            .map_err(|e| anyhow::anyhow!("invalid secret key: {e}"))?;
        Ok(Self::from_signing_key(signing_key))
    }

    /// Generate a fresh random identity.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::random(&mut OsRng))
    }

    /// Load the secret key from `path`, creating a new one if it doesn't exist.
    pub fn load_or_generate(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read key file {}", path.display()))?;
            return Self::from_secret_hex(&contents)
                .with_context(|| format!("invalid key file {}", path.display()));
        }

        let identity = Self::generate();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        std::fs::write(path, identity.secret_hex())
            .with_context(|| format!("failed to write key file {}", path.display()))?;
        restrict_permissions(path)?;

        tracing::info!(
            pubkey = %identity.pubkey_hex,
            path = %path.display(),
            "Generated new identity"
        );
        Ok(identity)
    }

    /// Hex x-only public key.
    pub fn pubkey_hex(&self) -> &str {
        &self.pubkey_hex
    }

    /// Hex secret key, for persistence only.
    pub fn secret_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Schnorr-sign a 32-byte digest (the event id).
    pub fn sign_digest(&self, digest: &[u8]) -> Result<Signature, k256::schnorr::Error> {
        let mut aux_rand = [0u8; 32];
        aes_gcm::aead::rand_core::RngCore::fill_bytes(&mut OsRng, &mut aux_rand);
        self.signing_key.sign_raw(digest, &aux_rand)
    }

    /// Secret scalar used for ECDH.
    pub(crate) fn ecdh_scalar(&self) -> Result<NonZeroScalar, k256::elliptic_curve::Error> {
        let secret = SecretKey::from_slice(&self.signing_key.to_bytes())?;
        Ok(secret.to_nonzero_scalar())
    }
}

impl fmt::Debug for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Identity")
            .field("pubkey", &self.pubkey_hex)
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> anyhow::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .with_context(|| format!("failed to restrict permissions on {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> anyhow::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn secret_hex_roundtrip() {
        let id = Identity::generate();
        let restored = Identity::from_secret_hex(&id.secret_hex()).unwrap();
        assert_eq!(id.pubkey_hex(), restored.pubkey_hex());
        assert_eq!(id.pubkey_hex().len(), 64);
    }

    #[test]
    fn rejects_bad_secrets() {
        assert!(Identity::from_secret_hex("not hex").is_err());
        assert!(Identity::from_secret_hex("abcd").is_err());
        assert!(Identity::from_secret_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn debug_hides_secret() {
        let id = Identity::generate();
        let dbg = format!("{id:?}");
        assert!(dbg.contains(id.pubkey_hex()));
        assert!(!dbg.contains(&id.secret_hex()));
    }

    #[test]
    fn load_or_generate_persists_key() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("keys").join("identity.key");

        let first = Identity::load_or_generate(&path).unwrap();
        assert!(path.exists());
        let second = Identity::load_or_generate(&path).unwrap();
        assert_eq!(first.pubkey_hex(), second.pubkey_hex());
    }

    #[test]
    fn load_rejects_corrupt_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("identity.key");
        std::fs::write(&path, "garbage").unwrap();
        assert!(Identity::load_or_generate(&path).is_err());
    }
}
