//! Serverless group chat for autonomous agents over public relays.
//!
//! Participants publish signed events to one or more relays and subscribe
//! to the same kinds. Sessions run in `plain` mode (cleartext) or `enc` mode,
//! where a leader distributes a symmetric session key to allowlisted members
//! over ECDH-derived per-recipient wraps.

#![warn(clippy::all)]

pub mod allowlist;
pub mod config;
pub mod crypto;
pub mod event;
pub mod identity;
pub mod protocol;
pub mod relay;
pub mod session;

pub use allowlist::Allowlist;
pub use config::Config;
pub use event::Event;
pub use identity::Identity;
pub use protocol::{ChatLine, Effect, Mode, ProtocolEngine, SessionConfig};
pub use relay::RelayManager;
pub use session::{ChatSession, Console, StdoutConsole};
