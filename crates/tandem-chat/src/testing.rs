//! Doubles shared by the unit tests of this crate.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use uuid::Uuid;

use tandem_db::Database;
use tandem_db::models::InsertReport;
use tandem_kv::{KvError, KvResult, KvStore};
use tandem_types::events::{GatewayEvent, Topic};
use tandem_types::models::{AgeGroup, ChatMessage, Gender, UserProfile};

use crate::fanout::EventSink;
use crate::store::{MessageSink, SqliteStore};

pub fn sqlite() -> (Arc<Database>, Arc<SqliteStore>) {
    let db = Arc::new(Database::open_in_memory().unwrap());
    let store = Arc::new(SqliteStore::new(db.clone()));
    (db, store)
}

pub fn add_user(db: &Database, name: &str, gender: Gender) -> Uuid {
    let user = UserProfile {
        id: Uuid::new_v4(),
        display_name: name.to_string(),
        gender,
        age_group: AgeGroup::Adult,
    };
    db.create_user(&user).unwrap();
    user.id
}

/// Collects every emitted event.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(Topic, GatewayEvent)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(Topic, GatewayEvent)> {
        self.events.lock().unwrap().clone()
    }

    pub fn to_user(&self, user_id: Uuid) -> Vec<GatewayEvent> {
        self.events()
            .into_iter()
            .filter(|(topic, _)| *topic == Topic::User(user_id))
            .map(|(_, event)| event)
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn emit(&self, topic: Topic, event: GatewayEvent) {
        self.events.lock().unwrap().push((topic, event));
    }
}

/// Message sink that records each bulk insert before handing it to SQLite.
pub struct CountingSink {
    db: Arc<Database>,
    batches: Mutex<Vec<usize>>,
    fail: AtomicBool,
}

impl CountingSink {
    pub fn new(db: Arc<Database>) -> Self {
        Self {
            db,
            batches: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
        }
    }

    /// Sizes of the batches inserted so far, in call order.
    pub fn batches(&self) -> Vec<usize> {
        self.batches.lock().unwrap().clone()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl MessageSink for CountingSink {
    async fn insert_messages(&self, messages: Vec<ChatMessage>) -> Result<InsertReport> {
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("database is locked");
        }
        self.batches.lock().unwrap().push(messages.len());
        self.db.insert_messages(&messages)
    }
}

/// Wraps a store, counting reads and optionally failing list appends.
pub struct CountingKv<K> {
    inner: K,
    gets: AtomicUsize,
    mgets: AtomicUsize,
    fail_rpush: AtomicBool,
}

impl<K: KvStore> CountingKv<K> {
    pub fn new(inner: K) -> Self {
        Self {
            inner,
            gets: AtomicUsize::new(0),
            mgets: AtomicUsize::new(0),
            fail_rpush: AtomicBool::new(false),
        }
    }

    pub fn get_calls(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }

    pub fn mget_calls(&self) -> usize {
        self.mgets.load(Ordering::SeqCst)
    }

    pub fn set_rpush_failing(&self, fail: bool) {
        self.fail_rpush.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl<K: KvStore> KvStore for CountingKv<K> {
    async fn rpush(&self, key: &str, value: &str) -> KvResult<usize> {
        if self.fail_rpush.load(Ordering::SeqCst) {
            return Err(KvError::Unavailable("connection refused".into()));
        }
        self.inner.rpush(key, value).await
    }

    async fn lpush(&self, key: &str, value: &str) -> KvResult<usize> {
        self.inner.lpush(key, value).await
    }

    async fn lpop(&self, key: &str, count: usize) -> KvResult<Vec<String>> {
        self.inner.lpop(key, count).await
    }

    async fn lrange(&self, key: &str, start: isize, stop: isize) -> KvResult<Vec<String>> {
        self.inner.lrange(key, start, stop).await
    }

    async fn ltrim(&self, key: &str, start: isize, stop: isize) -> KvResult<()> {
        self.inner.ltrim(key, start, stop).await
    }

    async fn llen(&self, key: &str) -> KvResult<usize> {
        self.inner.llen(key).await
    }

    async fn lrem(&self, key: &str, value: &str) -> KvResult<usize> {
        self.inner.lrem(key, value).await
    }

    async fn drain_front(&self, key: &str, max: usize) -> KvResult<Vec<String>> {
        self.inner.drain_front(key, max).await
    }

    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        self.inner.get(key).await
    }

    async fn set(&self, key: &str, value: &str) -> KvResult<()> {
        self.inner.set(key, value).await
    }

    async fn set_ex(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        self.inner.set_ex(key, value, ttl).await
    }

    async fn del(&self, key: &str) -> KvResult<bool> {
        self.inner.del(key).await
    }

    async fn mget(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        self.mgets.fetch_add(1, Ordering::SeqCst);
        self.inner.mget(keys).await
    }

    async fn scan(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.inner.scan(pattern).await
    }

    async fn publish(&self, channel: &str, payload: &str) -> KvResult<()> {
        self.inner.publish(channel, payload).await
    }

    async fn subscribe(&self, channel: &str) -> KvResult<mpsc::UnboundedReceiver<String>> {
        self.inner.subscribe(channel).await
    }
}
