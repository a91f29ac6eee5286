//! Session cryptography.
//!
//! - AEAD: ChaCha20-Poly1305 (preferred) or AES-256-GCM, 12-byte random nonces
//! - Key wrapping for `KEY_DM`: secp256k1 ECDH → HKDF-SHA256 → AEAD
//! - Session keys: 32 random bytes generated by the leader

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::Aes256Gcm;
use base64::Engine;
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use k256::ecdh::diffie_hellman;
use k256::PublicKey;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

use crate::identity::Identity;

/// AEAD nonce size for both suites (96 bits).
pub const NONCE_SIZE: usize = 12;

/// Symmetric key size for both suites (256 bits).
pub const KEY_SIZE: usize = 32;

/// HKDF info string binding derived keys to the key-distribution step.
const KEY_DM_INFO: &[u8] = b"relaychat/key-dm/v1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("invalid secret key")]
    InvalidSecretKey,

    #[error("key derivation failed")]
    KeyDerivation,

    #[error("{0} encryption failed")]
    Encrypt(Cipher),

    #[error("{0} decryption failed")]
    Decrypt(Cipher),

    #[error("invalid nonce length: {0}")]
    InvalidNonce(usize),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("unknown cipher '{0}'")]
    UnknownCipher(String),

    #[error("no usable AEAD cipher: {0}")]
    Unavailable(String),
}

/// Supported AEAD suites, identified on the wire by their `enc` name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Cipher {
    #[serde(rename = "chacha20poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "aes256gcm")]
    Aes256Gcm,
}

impl Cipher {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ChaCha20Poly1305 => "chacha20poly1305",
            Self::Aes256Gcm => "aes256gcm",
        }
    }

    /// The other supported suite.
    pub fn fallback(self) -> Self {
        match self {
            Self::ChaCha20Poly1305 => Self::Aes256Gcm,
            Self::Aes256Gcm => Self::ChaCha20Poly1305,
        }
    }

    pub fn encrypt(
        self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CryptoError::Encrypt(self))?
                .encrypt(chacha20poly1305::Nonce::from_slice(nonce), plaintext)
                .map_err(|_| CryptoError::Encrypt(self)),
            Self::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::Encrypt(self))?
                .encrypt(aes_gcm::Nonce::from_slice(nonce), plaintext)
                .map_err(|_| CryptoError::Encrypt(self)),
        }
    }

    pub fn decrypt(
        self,
        key: &[u8; KEY_SIZE],
        nonce: &[u8; NONCE_SIZE],
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        match self {
            Self::ChaCha20Poly1305 => ChaCha20Poly1305::new_from_slice(key)
                .map_err(|_| CryptoError::Decrypt(self))?
                .decrypt(chacha20poly1305::Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CryptoError::Decrypt(self)),
            Self::Aes256Gcm => Aes256Gcm::new_from_slice(key)
                .map_err(|_| CryptoError::Decrypt(self))?
                .decrypt(aes_gcm::Nonce::from_slice(nonce), ciphertext)
                .map_err(|_| CryptoError::Decrypt(self)),
        }
    }

    /// Encrypt under a fresh random nonce.
    pub fn seal(self, key: &[u8; KEY_SIZE], plaintext: &[u8]) -> Result<Sealed, CryptoError> {
        let nonce = random_nonce();
        let ciphertext = self.encrypt(key, &nonce, plaintext)?;
        Ok(Sealed {
            cipher: self,
            nonce,
            ciphertext,
        })
    }
}

impl fmt::Display for Cipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Cipher {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "chacha20poly1305" => Ok(Self::ChaCha20Poly1305),
            "aes256gcm" => Ok(Self::Aes256Gcm),
            other => Err(CryptoError::UnknownCipher(other.to_string())),
        }
    }
}

/// Output of an AEAD encryption, with the suite recorded alongside.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Sealed {
    pub cipher: Cipher,
    pub nonce: [u8; NONCE_SIZE],
    pub ciphertext: Vec<u8>,
}

impl Sealed {
    pub fn nonce_b64(&self) -> String {
        b64_encode(&self.nonce)
    }

    pub fn ciphertext_b64(&self) -> String {
        b64_encode(&self.ciphertext)
    }

    /// Rebuild from wire fields (`enc`, base64 nonce, base64 ciphertext).
    pub fn from_wire(enc: &str, nonce_b64: &str, ciphertext_b64: &str) -> Result<Self, CryptoError> {
        let cipher = enc.parse::<Cipher>()?;
        let nonce_bytes = b64_decode(nonce_b64)?;
        let nonce: [u8; NONCE_SIZE] = nonce_bytes
            .as_slice()
            .try_into()
            .map_err(|_| CryptoError::InvalidNonce(nonce_bytes.len()))?;
        Ok(Self {
            cipher,
            nonce,
            ciphertext: b64_decode(ciphertext_b64)?,
        })
    }

    pub fn open(&self, key: &[u8; KEY_SIZE]) -> Result<Vec<u8>, CryptoError> {
        self.cipher.decrypt(key, &self.nonce, &self.ciphertext)
    }
}

/// Symmetric key shared by all session members in enc mode.
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; KEY_SIZE]);

impl SessionKey {
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        bytes.try_into().ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

pub fn random_nonce() -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);
    nonce
}

pub fn b64_encode(bytes: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(bytes)
}

pub fn b64_decode(encoded: &str) -> Result<Vec<u8>, CryptoError> {
    Ok(base64::engine::general_purpose::STANDARD.decode(encoded)?)
}

/// Lift an x-only hex pubkey to the even-Y curve point.
fn lift_x_only(pubkey_hex: &str) -> Result<PublicKey, CryptoError> {
    let x = hex::decode(pubkey_hex).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
    if x.len() != 32 {
        return Err(CryptoError::InvalidPublicKey(format!(
            "expected 32 bytes, got {}",
            x.len()
        )));
    }
    let mut sec1 = [0u8; 33];
    sec1[0] = 0x02;
    sec1[1..].copy_from_slice(&x);
    PublicKey::from_sec1_bytes(&sec1).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
}

/// Derive the pairwise wrapping key between `local` and `peer_pubkey_hex`.
///
/// Symmetric: both sides derive the same key from their own secret and the
/// other's public key.
pub fn derive_wrap_key(
    local: &Identity,
    peer_pubkey_hex: &str,
    session_id: &str,
) -> Result<[u8; KEY_SIZE], CryptoError> {
    let peer = lift_x_only(peer_pubkey_hex)?;
    let scalar = local
        .ecdh_scalar()
        .map_err(|_| CryptoError::InvalidSecretKey)?;
    let shared = diffie_hellman(scalar, peer.as_affine());

    let hk = Hkdf::<Sha256>::new(Some(session_id.as_bytes()), shared.raw_secret_bytes());
    let mut okm = [0u8; KEY_SIZE];
    hk.expand(KEY_DM_INFO, &mut okm)
        .map_err(|_| CryptoError::KeyDerivation)?;
    Ok(okm)
}

/// Encrypt the session key for one recipient.
pub fn wrap_session_key(
    local: &Identity,
    recipient_pubkey_hex: &str,
    session_id: &str,
    session_key: &SessionKey,
    cipher: Cipher,
) -> Result<Sealed, CryptoError> {
    let wrap_key = derive_wrap_key(local, recipient_pubkey_hex, session_id)?;
    cipher.seal(&wrap_key, session_key.as_bytes())
}

/// Decrypt a session key sent by `sender_pubkey_hex`.
pub fn unwrap_session_key(
    local: &Identity,
    sender_pubkey_hex: &str,
    session_id: &str,
    sealed: &Sealed,
) -> Result<SessionKey, CryptoError> {
    let wrap_key = derive_wrap_key(local, sender_pubkey_hex, session_id)?;
    let raw = sealed.open(&wrap_key)?;
    SessionKey::from_bytes(&raw).ok_or(CryptoError::Decrypt(sealed.cipher))
}

fn self_test(cipher: Cipher) -> Result<(), CryptoError> {
    let key = SessionKey::generate();
    let sample = b"relaychat self-test";
    let sealed = cipher.seal(key.as_bytes(), sample)?;
    if sealed.open(key.as_bytes())? == sample {
        Ok(())
    } else {
        Err(CryptoError::Decrypt(cipher))
    }
}

/// Pick the AEAD suite to use for outgoing data.
///
/// Runs a round-trip self-test on `preferred`, falling back to the other
/// suite if it fails. Errors only when neither suite works.
pub fn select_cipher(preferred: Cipher) -> Result<Cipher, CryptoError> {
    match self_test(preferred) {
        Ok(()) => Ok(preferred),
        Err(first) => {
            let fallback = preferred.fallback();
            tracing::warn!(
                preferred = %preferred,
                fallback = %fallback,
                error = %first,
                "Preferred AEAD unavailable, falling back"
            );
            self_test(fallback)
                .map(|()| fallback)
                .map_err(|second| CryptoError::Unavailable(format!("{first}; {second}")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Cipher; 2] = [Cipher::ChaCha20Poly1305, Cipher::Aes256Gcm];

    #[test]
    fn roundtrip_edge_lengths_for_both_suites() {
        let key = SessionKey::generate();
        for cipher in ALL {
            for len in [0usize, 1, 2048] {
                let plaintext = vec![0x5a; len];
                let sealed = cipher.seal(key.as_bytes(), &plaintext).unwrap();
                assert_eq!(sealed.cipher, cipher);
                assert_eq!(sealed.open(key.as_bytes()).unwrap(), plaintext);
            }
        }
    }

    #[test]
    fn wrong_key_fails() {
        let k1 = SessionKey::generate();
        let k2 = SessionKey::generate();
        for cipher in ALL {
            let sealed = cipher.seal(k1.as_bytes(), b"secret").unwrap();
            assert!(sealed.open(k2.as_bytes()).is_err());
        }
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let key = SessionKey::generate();
        let mut sealed = Cipher::ChaCha20Poly1305
            .seal(key.as_bytes(), b"secret")
            .unwrap();
        sealed.ciphertext[0] ^= 0x01;
        assert!(sealed.open(key.as_bytes()).is_err());
    }

    #[test]
    fn wire_roundtrip() {
        let key = SessionKey::generate();
        let sealed = Cipher::Aes256Gcm.seal(key.as_bytes(), b"hi").unwrap();
        let parsed =
            Sealed::from_wire("aes256gcm", &sealed.nonce_b64(), &sealed.ciphertext_b64()).unwrap();
        assert_eq!(parsed, sealed);
        assert_eq!(parsed.open(key.as_bytes()).unwrap(), b"hi");
    }

    #[test]
    fn from_wire_rejects_bad_fields() {
        assert!(matches!(
            Sealed::from_wire("rot13", "AAAA", "AAAA"),
            Err(CryptoError::UnknownCipher(_))
        ));
        assert!(matches!(
            Sealed::from_wire("aes256gcm", "AAAA", "AAAA"),
            Err(CryptoError::InvalidNonce(3))
        ));
        assert!(Sealed::from_wire("aes256gcm", "!!!", "AAAA").is_err());
    }

    #[test]
    fn wrap_key_is_symmetric() {
        let leader = Identity::generate();
        let member = Identity::generate();
        let a = derive_wrap_key(&leader, member.pubkey_hex(), "s1").unwrap();
        let b = derive_wrap_key(&member, leader.pubkey_hex(), "s1").unwrap();
        assert_eq!(a, b);

        let other_session = derive_wrap_key(&leader, member.pubkey_hex(), "s2").unwrap();
        assert_ne!(a, other_session);
    }

    #[test]
    fn session_key_wrap_roundtrip() {
        let leader = Identity::generate();
        let member = Identity::generate();
        let key = SessionKey::generate();

        for cipher in ALL {
            let sealed =
                wrap_session_key(&leader, member.pubkey_hex(), "s1", &key, cipher).unwrap();
            let recovered =
                unwrap_session_key(&member, leader.pubkey_hex(), "s1", &sealed).unwrap();
            assert_eq!(recovered, key);
        }
    }

    #[test]
    fn session_key_unwrap_by_outsider_fails() {
        let leader = Identity::generate();
        let member = Identity::generate();
        let outsider = Identity::generate();
        let key = SessionKey::generate();

        let sealed = wrap_session_key(
            &leader,
            member.pubkey_hex(),
            "s1",
            &key,
            Cipher::ChaCha20Poly1305,
        )
        .unwrap();
        assert!(unwrap_session_key(&outsider, leader.pubkey_hex(), "s1", &sealed).is_err());
    }

    #[test]
    fn invalid_peer_key_rejected() {
        let local = Identity::generate();
        assert!(derive_wrap_key(&local, "zz", "s1").is_err());
        assert!(derive_wrap_key(&local, &"ff".repeat(32), "s1").is_err());
    }

    #[test]
    fn select_cipher_keeps_working_preference() {
        assert_eq!(
            select_cipher(Cipher::Aes256Gcm).unwrap(),
            Cipher::Aes256Gcm
        );
        assert_eq!(
            select_cipher(Cipher::ChaCha20Poly1305).unwrap(),
            Cipher::ChaCha20Poly1305
        );
    }

    #[test]
    fn cipher_names_parse() {
        for cipher in ALL {
            assert_eq!(cipher.as_str().parse::<Cipher>().unwrap(), cipher);
            assert_eq!(cipher.fallback().fallback(), cipher);
        }
    }
}
