//! Relay transport: per-endpoint connections, reconnect backoff, the relay
//! frame codec and cross-relay deduplication.

pub mod backoff;
pub mod connection;
pub mod dedup;
pub mod frame;
pub mod manager;

pub use backoff::Backoff;
pub use connection::{InboundEvent, RelayConnection};
pub use dedup::DedupSet;
pub use frame::{ClientFrame, Filter, FrameError, RelayFrame};
pub use manager::RelayManager;
