//! Chat session protocol: payload schema and the per-participant state machine.

pub mod engine;
pub mod payload;

pub use engine::{ChatLine, Effect, EngineState, ProtocolEngine, SessionConfig};
pub use payload::{Body, EncryptedWrapper, Mode, Payload, MAX_CONTENT_BYTES, MAX_TEXT_BYTES};

use thiserror::Error;

/// Why an inbound event was dropped. Logged at debug level, never surfaced.
#[derive(Debug, Error)]
pub enum Rejection {
    #[error("event authored by self")]
    OwnEvent,

    #[error("sender not in allowlist")]
    NotAllowlisted,

    #[error("channel/session tags do not match")]
    TagMismatch,

    #[error("content too large ({0} bytes)")]
    Oversized(usize),

    #[error("unsupported event kind {0}")]
    UnknownKind(u16),

    #[error("schema violation: {0}")]
    Schema(String),

    #[error("unsupported protocol version {0}")]
    Version(u32),

    #[error("payload session/channel does not match")]
    SessionMismatch,

    #[error("{0} not allowed on this kind")]
    WrongKind(&'static str),

    #[error("key exchange not addressed to us")]
    NotAddressed,

    #[error("key exchange from non-leader")]
    NotLeader,

    #[error("no session key yet")]
    NoSessionKey,

    #[error("not applicable in this mode or role")]
    NotApplicable,

    #[error("decryption failed: {0}")]
    Decrypt(String),
}
