//! Real-time matching and message-delivery core.
//!
//! - [`presence`]: who is connected, TTL'd keys in the KV store
//! - [`matching`]: FIFO waiting lines per (age group, gender preference) and
//!   the background pairing loop
//! - [`buffer`]: write-back buffer batching chat messages into bulk inserts
//! - [`lifecycle`]: room join/leave/teardown state machine
//! - [`names`]: short-TTL display-name cache for the send path
//!
//! Shared state lives in the KV store ([`tandem_kv::KvStore`]) and the
//! persistent store ([`store::ChatStore`]); nothing here keeps authoritative
//! state in process memory.

pub mod buffer;
pub mod error;
pub mod fanout;
pub mod lifecycle;
pub mod matching;
pub mod names;
pub mod presence;
pub mod store;

#[cfg(test)]
mod testing;

pub use buffer::{BufferConfig, FlushReport, MessageBuffer};
pub use error::{ChatError, ErrorKind};
pub use fanout::EventSink;
pub use lifecycle::{JoinResult, LeaveResult, RoomLifecycle};
pub use matching::{EnqueueOutcome, MatchingConfig, MatchingQueue, PairingReport};
pub use names::NameCache;
pub use presence::{PresenceConfig, PresenceTracker};
pub use store::{ChatStore, MessageSink, SqliteStore};
