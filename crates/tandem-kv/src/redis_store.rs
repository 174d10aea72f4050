use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use redis::{Client, aio::ConnectionManager};
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::{KvResult, KvStore};

const SCAN_BATCH: usize = 200;

/// Redis-backed store. The connection manager reconnects on its own and is
/// cheap to clone, so every call works on its own clone.
#[derive(Clone)]
pub struct RedisStore {
    client: Client,
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(redis_url: &str) -> KvResult<Self> {
        let client = Client::open(redis_url)?;
        let conn = client.get_connection_manager().await?;

        info!("Connected to Redis at {}", redis_url);
        Ok(Self { client, conn })
    }

    /// Round-trip check used at startup.
    pub async fn ping(&self) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn rpush(&self, key: &str, value: &str) -> KvResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("RPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LPUSH")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(len)
    }

    async fn lpop(&self, key: &str, count: usize) -> KvResult<Vec<String>> {
        if count == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        let popped: Option<Vec<String>> = redis::cmd("LPOP")
            .arg(key)
            .arg(count)
            .query_async(&mut conn)
            .await?;
        Ok(popped.unwrap_or_default())
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let items: Vec<String> = redis::cmd("LRANGE")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("LTRIM")
            .arg(key)
            .arg(start)
            .arg(stop)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn llen(&self, key: &str) -> KvResult<usize> {
        let mut conn = self.conn.clone();
        let len: usize = redis::cmd("LLEN").arg(key).query_async(&mut conn).await?;
        Ok(len)
    }

    async fn lrem(&self, key: &str, value: &str) -> KvResult<usize> {
        let mut conn = self.conn.clone();
        let removed: usize = redis::cmd("LREM")
            .arg(key)
            .arg(1)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(removed)
    }

    async fn drain_front(&self, key: &str, max: usize) -> KvResult<Vec<String>> {
        if max == 0 {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        let (items,): (Vec<String>,) = redis::pipe()
            .atomic()
            .cmd("LRANGE")
            .arg(key)
            .arg(0)
            .arg(max as isize - 1)
            .cmd("LTRIM")
            .arg(key)
            .arg(max)
            .arg(-1)
            .ignore()
            .query_async(&mut conn)
            .await?;
        Ok(items)
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("SETEX")
            .arg(key)
            .arg(ttl.as_secs().max(1))
            .arg(value)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        let mut conn = self.conn.clone();
        let removed: usize = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(removed > 0)
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(vec![]);
        }
        let mut conn = self.conn.clone();
        let values: Vec<Option<String>> = redis::cmd("MGET")
            .arg(keys)
            .query_async(&mut conn)
            .await?;
        Ok(values)
    }

    async fn scan(&self, pattern: &str) -> KvResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut keys = Vec::new();
        let mut cursor: u64 = 0;

        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may return a key more than once across iterations
        keys.sort();
        keys.dedup();
        Ok(keys)
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()> {
        let mut conn = self.conn.clone();
        let _: usize = redis::cmd("PUBLISH")
            .arg(channel)
            .arg(payload)
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> KvResult<mpsc::UnboundedReceiver<String>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(channel).await?;

        let (tx, rx) = mpsc::unbounded_channel();
        let channel = channel.to_string();
        tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            while let Some(msg) = messages.next().await {
                match msg.get_payload::<String>() {
                    Ok(payload) => {
                        if tx.send(payload).is_err() {
                            break;
                        }
                    }
                    Err(e) => warn!("Dropping undecodable payload on {}: {}", channel, e),
                }
            }
            warn!("Redis subscription to {} ended", channel);
        });

        Ok(rx)
    }
}
