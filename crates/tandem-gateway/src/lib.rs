//! Realtime gateway: WebSocket connections, per-process delivery and
//! cross-process fan-out over the KV store's pub/sub.

pub mod connection;
pub mod dispatcher;
pub mod fanout;
pub mod handlers;

pub use dispatcher::Dispatcher;
pub use fanout::{FANOUT_CHANNEL, Fanout, FanoutSubscriber};
pub use handlers::{ChatContext, Session};
