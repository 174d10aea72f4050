use thiserror::Error;

/// Failures of the key-value/list store. All of them are transient from the
/// caller's point of view.
#[derive(Error, Debug)]
pub enum KvError {
    #[error("redis failure: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("subscription closed")]
    SubscriptionClosed,
}
