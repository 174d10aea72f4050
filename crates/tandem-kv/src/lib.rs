//! # Key-value store
//!
//! Shared external state for the chat core: matching queues and the message
//! buffer are Redis lists, presence is TTL'd string keys, and cross-process
//! fan-out rides on Redis pub/sub.
//!
//! Every operation is a single atomic command on the server. Nothing here
//! offers cross-command transactions except [`KvStore::drain_front`], which
//! reads and truncates the head of a list in one `MULTI`.

mod error;
mod memory;
mod redis_store;

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

pub use error::KvError;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;

pub type KvResult<T> = Result<T, KvError>;

#[async_trait]
pub trait KvStore: Send + Sync + 'static {
    // -- Lists --

    /// Append to the tail. Returns the new length.
    async fn rpush(&self, key: &str, value: &str) -> KvResult<usize>;

    /// Prepend to the head. Returns the new length.
    async fn lpush(&self, key: &str, value: &str) -> KvResult<usize>;

    /// Pop up to `count` items from the head. Empty when the list is empty.
    async fn lpop(&self, key: &str, count: usize) -> KvResult<Vec<String>>;

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>>;

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> KvResult<()>;

    async fn llen(&self, key: &str) -> KvResult<usize>;

    /// Remove the first occurrence of `value`. Returns how many were removed.
    async fn lrem(&self, key: &str, value: &str) -> KvResult<usize>;

    /// Atomically read and remove up to `max` items from the head.
    async fn drain_front(&self, key: &str, max: usize) -> KvResult<Vec<String>>;

    // -- Strings --

    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> KvResult<()>;

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;

    /// Returns true if the key existed.
    async fn del(&self, key: &str) -> KvResult<bool>;

    /// One round trip for many keys. Result order matches `keys`.
    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>>;

    /// All keys matching a glob pattern (`*` and `?`).
    async fn scan(&self, pattern: &str) -> KvResult<Vec<String>>;

    // -- Pub/sub --

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()>;

    /// Payloads published on `channel` from any process, including this one.
    async fn subscribe(&self, channel: &str) -> KvResult<mpsc::UnboundedReceiver<String>>;
}
