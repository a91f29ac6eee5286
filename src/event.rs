//! Signed, hash-identified protocol events.
//!
//! Implements the relay network's canonical event format:
//! - `id` is the SHA-256 of `[0, pubkey, created_at, kind, tags, content]`
//!   serialized as compact JSON with non-ASCII characters `\u`-escaped
//! - `sig` is a BIP-340 Schnorr signature over the 32-byte `id`
//!
//! The canonical serialization is a compatibility contract with every relay
//! and peer on the network, so it must stay bit-exact.

use k256::schnorr::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_json::ser::Formatter;
use sha2::{Digest, Sha256};
use std::io;
use thiserror::Error;

use crate::identity::Identity;

/// Kind carrying control payloads and plain-mode messages.
pub const KIND_PUBLIC: u16 = 24242;

/// Kind carrying chat messages (encrypted wrapper in enc mode).
pub const KIND_ENCRYPTED: u16 = 24243;

/// Tag keys used for routing.
pub const TAG_CHANNEL: &str = "c";
pub const TAG_SESSION: &str = "sid";
pub const TAG_RECIPIENT: &str = "p";
pub const TAG_VERSION: &str = "v";

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    u64::try_from(chrono::Utc::now().timestamp()).unwrap_or_default()
}

/// Errors raised while building an event.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("signing error: {0}")]
    Signing(String),
}

/// A signed protocol event, exactly as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Lowercase hex SHA-256 of the canonical serialization (64 chars).
    pub id: String,
    /// Lowercase hex x-only public key of the author (64 chars).
    pub pubkey: String,
    /// Unix timestamp in seconds.
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    /// Lowercase hex Schnorr signature (128 chars).
    pub sig: String,
}

impl Event {
    /// First value of the first tag named `key`.
    pub fn tag_value(&self, key: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|tag| tag.first().map(String::as_str) == Some(key))
            .and_then(|tag| tag.get(1))
            .map(String::as_str)
    }

    /// True if any tag named `key` carries `value`.
    pub fn has_tag(&self, key: &str, value: &str) -> bool {
        self.tags.iter().any(|tag| {
            tag.first().map(String::as_str) == Some(key)
                && tag.get(1).map(String::as_str) == Some(value)
        })
    }
}

/// Compact JSON formatter that escapes every character outside printable
/// ASCII (`' '..='~'`) as `\uXXXX` (UTF-16 code units, lowercase hex).
struct AsciiFormatter;

impl Formatter for AsciiFormatter {
    fn write_string_fragment<W>(&mut self, writer: &mut W, fragment: &str) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        let mut units = [0u16; 2];
        for ch in fragment.chars() {
            if matches!(ch, ' '..='~') {
                writer.write_all(&[ch as u8])?;
            } else {
                for unit in ch.encode_utf16(&mut units) {
                    write!(writer, "\\u{unit:04x}")?;
                }
            }
        }
        Ok(())
    }
}

/// Canonical JSON array hashed into the event id.
pub fn serialize_for_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String, CodecError> {
    let mut out = Vec::with_capacity(128 + content.len());
    let mut ser = serde_json::Serializer::with_formatter(&mut out, AsciiFormatter);
    (0, pubkey, created_at, kind, tags, content).serialize(&mut ser)?;
    // every byte written is ASCII
    Ok(String::from_utf8_lossy(&out).into_owned())
}

/// Compute the hex event id for the given fields.
pub fn compute_id(
    pubkey: &str,
    created_at: u64,
    kind: u16,
    tags: &[Vec<String>],
    content: &str,
) -> Result<String, CodecError> {
    let serialized = serialize_for_id(pubkey, created_at, kind, tags, content)?;
    Ok(hex::encode(Sha256::digest(serialized.as_bytes())))
}

/// Build and sign a complete event authored by `identity`.
pub fn build_event(
    identity: &Identity,
    created_at: u64,
    kind: u16,
    tags: Vec<Vec<String>>,
    content: String,
) -> Result<Event, CodecError> {
    let pubkey = identity.pubkey_hex().to_string();
    let id = compute_id(&pubkey, created_at, kind, &tags, &content)?;
    let digest = hex::decode(&id).map_err(|e| CodecError::Signing(e.to_string()))?;
    let sig = identity
        .sign_digest(&digest)
        .map_err(|e| CodecError::Signing(e.to_string()))?;

    Ok(Event {
        id,
        pubkey,
        created_at,
        kind,
        tags,
        content,
        sig: hex::encode(sig.to_bytes()),
    })
}

fn is_lower_hex(value: &str, len: usize) -> bool {
    value.len() == len && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Verify an event's structure, id and signature.
///
/// Never fails loudly: any malformed field simply yields `false`.
pub fn verify_event(event: &Event) -> bool {
    if !is_lower_hex(&event.id, 64)
        || !is_lower_hex(&event.pubkey, 64)
        || !is_lower_hex(&event.sig, 128)
    {
        return false;
    }

    let computed = match compute_id(
        &event.pubkey,
        event.created_at,
        event.kind,
        &event.tags,
        &event.content,
    ) {
        Ok(id) => id,
        Err(_) => return false,
    };
    if computed != event.id {
        return false;
    }

    let (Ok(id_bytes), Ok(pubkey_bytes), Ok(sig_bytes)) = (
        hex::decode(&event.id),
        hex::decode(&event.pubkey),
        hex::decode(&event.sig),
    ) else {
        return false;
    };

    let Ok(key) = VerifyingKey::from_bytes(&pubkey_bytes) else {
        return false;
    };
    let Ok(sig) = Signature::try_from(sig_bytes.as_slice()) else {
        return false;
    };

    key.verify_raw(&id_bytes, &sig).is_ok()
}

/// Parse an untrusted JSON value into an event; `None` on any type mismatch.
pub fn event_from_value(value: serde_json::Value) -> Option<Event> {
    serde_json::from_value(value).ok()
}
