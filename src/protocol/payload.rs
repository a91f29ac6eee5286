//! Typed chat payloads carried in event `content`.
//!
//! Every payload shares the `v`/`sid`/`chan` header and is discriminated by
//! `type`. Parsing happens once at the event boundary; the rest of the crate
//! only sees [`Payload`] values that already passed [`Payload::validate`].

use serde::{Deserialize, Serialize};
use std::fmt;

use super::Rejection;

/// Protocol version carried in every payload.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum size of an event `content` string, in bytes.
pub const MAX_CONTENT_BYTES: usize = 8192;

/// Maximum size of a chat message text, in bytes.
pub const MAX_TEXT_BYTES: usize = 2048;

/// Session operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Plain,
    Enc,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Plain => "plain",
            Self::Enc => "enc",
        })
    }
}

impl std::str::FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "plain" => Ok(Self::Plain),
            "enc" => Ok(Self::Enc),
            other => Err(format!("unknown mode '{other}' (expected plain or enc)")),
        }
    }
}

/// A chat message body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    pub text: String,
}

/// Payload variants, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Body {
    Hello {
        agent: String,
        mode: Mode,
    },
    Leader {
        agent: String,
        mode: Mode,
    },
    KeyOffer {
        agent: String,
        mode: Mode,
    },
    KeyAck {
        agent: String,
        mode: Mode,
    },
    KeyDm {
        from: String,
        enc: String,
        nonce: String,
        ciphertext: String,
    },
    Notice {
        agent: String,
        #[serde(default)]
        text: String,
    },
    Msg {
        from: String,
        msg_id: String,
        reply_to: Option<String>,
        body: MessageBody,
    },
}

impl Body {
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Hello { .. } => "HELLO",
            Self::Leader { .. } => "LEADER",
            Self::KeyOffer { .. } => "KEY_OFFER",
            Self::KeyAck { .. } => "KEY_ACK",
            Self::KeyDm { .. } => "KEY_DM",
            Self::Notice { .. } => "NOTICE",
            Self::Msg { .. } => "MSG",
        }
    }

    /// Control types travel on the public kind; `MSG` on the encrypted kind.
    pub fn is_control(&self) -> bool {
        !matches!(self, Self::Msg { .. })
    }
}

/// Full payload: shared header plus the typed body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payload {
    pub v: u32,
    pub sid: String,
    pub chan: String,
    #[serde(flatten)]
    pub body: Body,
}

impl Payload {
    pub fn new(session_id: &str, channel: &str, body: Body) -> Self {
        Self {
            v: PROTOCOL_VERSION,
            sid: session_id.to_string(),
            chan: channel.to_string(),
            body,
        }
    }

    /// Parse untrusted JSON. Missing or mistyped fields are rejected here.
    pub fn parse(json: &[u8]) -> Result<Self, Rejection> {
        serde_json::from_slice(json).map_err(|e| Rejection::Schema(e.to_string()))
    }

    /// Check version and session routing against the local session.
    pub fn validate(&self, session_id: &str, channel: &str) -> Result<(), Rejection> {
        if self.v != PROTOCOL_VERSION {
            return Err(Rejection::Version(self.v));
        }
        if self.sid != session_id || self.chan != channel {
            return Err(Rejection::SessionMismatch);
        }
        Ok(())
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Encrypted-kind wrapper around a serialized `MSG` payload in enc mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedWrapper {
    pub v: u32,
    pub enc: String,
    pub sid: String,
    pub nonce: String,
    pub ciphertext: String,
}

impl EncryptedWrapper {
    pub fn parse(json: &str) -> Result<Self, Rejection> {
        serde_json::from_str(json).map_err(|e| Rejection::Schema(e.to_string()))
    }

    pub fn validate(&self, session_id: &str) -> Result<(), Rejection> {
        if self.v != PROTOCOL_VERSION {
            return Err(Rejection::Version(self.v));
        }
        if self.sid != session_id {
            return Err(Rejection::SessionMismatch);
        }
        Ok(())
    }
}

/// Truncate `text` to at most `max_bytes` without splitting a UTF-8 character.
pub fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
