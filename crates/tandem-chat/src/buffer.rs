use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tandem_kv::KvStore;
use tandem_types::models::ChatMessage;

use crate::error::{ChatError, ChatResult};
use crate::store::MessageSink;

const TOMBSTONE_PREFIX: &str = "chat:deleted:";
const TOMBSTONE_TTL: Duration = Duration::from_secs(600);

#[derive(Debug, Clone)]
pub struct BufferConfig {
    /// List holding messages not yet persisted.
    pub key: String,
    /// Buffer length that triggers an immediate flush.
    pub batch_size: usize,
    pub flush_interval: Duration,
    /// Entries drained (and inserted) per page during a flush.
    pub page_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            key: "chat:message-buffer".to_string(),
            batch_size: 100,
            flush_interval: Duration::from_secs(2),
            page_size: 500,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub drained: usize,
    pub inserted: usize,
    /// Entries that could not be parsed or that the store rejected.
    pub skipped: usize,
    pub batches: usize,
}

/// Write-back buffer between the realtime send path and the database.
///
/// Messages are appended to a shared KV list and persisted in bulk, either
/// when the list reaches `batch_size` or on the flush interval. Cloning is
/// cheap; clones share the same flush state.
#[derive(Clone)]
pub struct MessageBuffer {
    inner: Arc<Inner>,
}

struct Inner {
    kv: Arc<dyn KvStore>,
    sink: Arc<dyn MessageSink>,
    config: BufferConfig,
    /// Serializes flushes within this process.
    flush_lock: Mutex<()>,
    flush_scheduled: AtomicBool,
}

fn tombstone_key(message_id: Uuid) -> String {
    format!("{TOMBSTONE_PREFIX}{message_id}")
}

impl MessageBuffer {
    pub fn new(kv: Arc<dyn KvStore>, sink: Arc<dyn MessageSink>, config: BufferConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                kv,
                sink,
                config,
                flush_lock: Mutex::new(()),
                flush_scheduled: AtomicBool::new(false),
            }),
        }
    }

    /// Queue a message for persistence. Returns once the append succeeded;
    /// if the KV store is down the message is written straight to the
    /// database instead.
    pub async fn add_message(&self, message: ChatMessage) -> ChatResult<()> {
        let raw = serde_json::to_string(&message).map_err(|e| ChatError::Store(e.into()))?;

        match self.inner.kv.rpush(&self.inner.config.key, &raw).await {
            Ok(len) => {
                if len >= self.inner.config.batch_size {
                    self.schedule_flush();
                }
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Buffer append failed for message {}, persisting directly: {}",
                    message.id, e
                );
                let report = self.inner.sink.insert_messages(vec![message]).await?;
                if report.inserted == 1 {
                    Ok(())
                } else {
                    Err(ChatError::Store(anyhow::anyhow!(
                        "direct persist rejected the message"
                    )))
                }
            }
        }
    }

    /// Start a background flush unless one is already pending.
    fn schedule_flush(&self) {
        if self.inner.flush_scheduled.swap(true, Ordering::AcqRel) {
            return;
        }
        let buffer = self.clone();
        tokio::spawn(async move {
            if let Err(e) = buffer.flush().await {
                error!("Threshold flush failed: {}", e);
            }
        });
    }

    /// Drain the buffer page by page, one bulk insert per page. An empty
    /// buffer issues no insert. If the insert itself fails the drained page
    /// is pushed back to the head of the list in its original order.
    pub async fn flush(&self) -> ChatResult<FlushReport> {
        let _guard = self.inner.flush_lock.lock().await;
        self.inner.flush_scheduled.store(false, Ordering::Release);

        let config = &self.inner.config;
        let mut report = FlushReport::default();

        loop {
            let page = self.inner.kv.drain_front(&config.key, config.page_size).await?;
            if page.is_empty() {
                break;
            }
            report.drained += page.len();

            let mut messages = Vec::with_capacity(page.len());
            for raw in &page {
                match serde_json::from_str::<ChatMessage>(raw) {
                    Ok(message) => messages.push(message),
                    Err(e) => {
                        warn!("Dropping malformed buffer entry: {}", e);
                        report.skipped += 1;
                    }
                }
            }
            self.apply_tombstones(&mut messages).await;

            if !messages.is_empty() {
                match self.inner.sink.insert_messages(messages).await {
                    Ok(inserted) => {
                        report.inserted += inserted.inserted;
                        report.skipped += inserted.failed;
                        report.batches += 1;
                    }
                    Err(e) => {
                        self.restore(&page).await;
                        return Err(e.into());
                    }
                }
            }

            if page.len() < config.page_size {
                break;
            }
        }

        if report.drained > 0 {
            debug!(
                "Flushed {} buffered messages ({} inserted, {} skipped)",
                report.drained, report.inserted, report.skipped
            );
        }
        Ok(report)
    }

    async fn restore(&self, page: &[String]) {
        for raw in page.iter().rev() {
            if let Err(e) = self.inner.kv.lpush(&self.inner.config.key, raw).await {
                error!("Failed to restore buffer entry after insert failure: {}", e);
            }
        }
    }

    /// Mark messages deleted if a tombstone was recorded while they waited.
    async fn apply_tombstones(&self, messages: &mut [ChatMessage]) {
        if messages.is_empty() {
            return;
        }
        let keys: Vec<String> = messages.iter().map(|m| tombstone_key(m.id)).collect();
        match self.inner.kv.mget(&keys).await {
            Ok(values) => {
                for (message, tombstone) in messages.iter_mut().zip(values) {
                    if tombstone.is_some() {
                        message.is_deleted = true;
                    }
                }
            }
            Err(e) => warn!("Could not read delete tombstones: {}", e),
        }
    }

    /// Record a delete for a message that is still waiting in the buffer.
    /// Returns false if no buffered message with this id was sent by `sender_id`.
    pub async fn tombstone_pending(&self, message_id: Uuid, sender_id: Uuid) -> ChatResult<bool> {
        let entries = self.inner.kv.lrange(&self.inner.config.key, 0, -1).await?;
        let owned = entries
            .iter()
            .filter_map(|raw| serde_json::from_str::<ChatMessage>(raw).ok())
            .any(|m| m.id == message_id && m.sender_id == Some(sender_id));
        if !owned {
            return Ok(false);
        }
        self.inner
            .kv
            .set_ex(&tombstone_key(message_id), "1", TOMBSTONE_TTL)
            .await?;
        Ok(true)
    }

    /// Interval flush loop. On cancellation it runs one final flush so
    /// nothing accepted before shutdown stays unpersisted.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.inner.config.flush_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(
            "Message buffer flushing every {:?} (batch {})",
            self.inner.config.flush_interval, self.inner.config.batch_size
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.flush().await {
                        error!("Interval flush failed: {}", e);
                    }
                }
            }
        }

        match self.flush().await {
            Ok(report) => info!("Final flush persisted {} messages", report.inserted),
            Err(e) => error!("Final flush failed: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::RoomLifecycle;
    use crate::store::SqliteStore;
    use crate::testing::{CountingKv, CountingSink};
    use tandem_db::Database;
    use tandem_kv::MemoryStore;
    use tandem_types::models::{AgeGroup, GenderPreference, MatchPreferences, MessageBody};

    fn text(room: Uuid, sender: Uuid, body: &str) -> ChatMessage {
        ChatMessage::from_user(room, sender, MessageBody::Plaintext { text: body.into() })
    }

    fn setup(batch_size: usize) -> (Arc<Database>, Arc<CountingKv<MemoryStore>>, Arc<CountingSink>, MessageBuffer) {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let kv = Arc::new(CountingKv::new(MemoryStore::new()));
        let sink = Arc::new(CountingSink::new(db.clone()));
        let buffer = MessageBuffer::new(
            kv.clone(),
            sink.clone(),
            BufferConfig {
                batch_size,
                ..BufferConfig::default()
            },
        );
        (db, kv, sink, buffer)
    }

    #[tokio::test]
    async fn flushing_an_empty_buffer_issues_no_insert() {
        let (_db, _kv, sink, buffer) = setup(100);
        let report = buffer.flush().await.unwrap();
        assert_eq!(report, FlushReport::default());
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn kv_outage_falls_back_to_direct_persist() {
        let (db, kv, sink, buffer) = setup(100);
        kv.set_rpush_failing(true);
        let msg = text(Uuid::new_v4(), Uuid::new_v4(), "still here");

        buffer.add_message(msg.clone()).await.unwrap();

        assert_eq!(sink.batches(), vec![1]);
        assert_eq!(db.get_message(msg.id).unwrap(), Some(msg));
    }

    #[tokio::test]
    async fn threshold_triggers_flushes_and_keeps_room_order() {
        let (db, _kv, sink, buffer) = setup(100);
        let (room, sender) = (Uuid::new_v4(), Uuid::new_v4());

        let mut sent = Vec::new();
        for i in 0..150 {
            let msg = text(room, sender, &format!("message {i}"));
            sent.push(msg.id);
            buffer.add_message(msg).await.unwrap();
            tokio::task::yield_now().await;
        }
        buffer.flush().await.unwrap();

        let batches = sink.batches();
        assert!(batches.len() >= 2, "expected at least two inserts, got {batches:?}");
        assert_eq!(batches.iter().sum::<usize>(), 150);

        let stored: Vec<Uuid> = db.get_messages(room, 500).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(stored, sent);
    }

    #[tokio::test]
    async fn malformed_entries_do_not_abort_the_batch() {
        let (db, kv, _sink, buffer) = setup(100);
        let room = Uuid::new_v4();
        let good = text(room, Uuid::new_v4(), "fine");
        kv.rpush("chat:message-buffer", "{not json").await.unwrap();
        buffer.add_message(good.clone()).await.unwrap();

        let report = buffer.flush().await.unwrap();
        assert_eq!(report.drained, 2);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 1);
        assert!(db.get_message(good.id).unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_insert_keeps_messages_buffered() {
        let (db, kv, sink, buffer) = setup(100);
        let room = Uuid::new_v4();
        let first = text(room, Uuid::new_v4(), "a");
        let second = text(room, Uuid::new_v4(), "b");
        buffer.add_message(first.clone()).await.unwrap();
        buffer.add_message(second.clone()).await.unwrap();

        sink.set_failing(true);
        assert!(buffer.flush().await.is_err());
        assert_eq!(kv.llen("chat:message-buffer").await.unwrap(), 2);

        sink.set_failing(false);
        buffer.flush().await.unwrap();
        let stored: Vec<Uuid> = db.get_messages(room, 10).unwrap().iter().map(|m| m.id).collect();
        assert_eq!(stored, vec![first.id, second.id]);
    }

    #[tokio::test]
    async fn tombstoned_messages_land_deleted() {
        let (db, _kv, _sink, buffer) = setup(100);
        let (room, sender) = (Uuid::new_v4(), Uuid::new_v4());
        let msg = text(room, sender, "regret");
        buffer.add_message(msg.clone()).await.unwrap();

        assert!(!buffer.tombstone_pending(msg.id, Uuid::new_v4()).await.unwrap());
        assert!(buffer.tombstone_pending(msg.id, sender).await.unwrap());
        buffer.flush().await.unwrap();

        assert!(db.get_message(msg.id).unwrap().unwrap().is_deleted);
    }

    #[tokio::test]
    async fn messages_flushed_after_teardown_stay_hidden() {
        let (db, _kv, _sink, buffer) = setup(100);
        let lifecycle = RoomLifecycle::new(Arc::new(SqliteStore::new(db.clone())));
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        let room = lifecycle
            .create_random_room(
                a,
                MatchPreferences {
                    age_group: AgeGroup::Adult,
                    gender_preference: GenderPreference::Any,
                    capacity: 2,
                },
            )
            .await
            .unwrap();
        lifecycle.join(room.id, b).await.unwrap();

        let msg = text(room.id, a, "sent just before leaving");
        buffer.add_message(msg.clone()).await.unwrap();
        lifecycle.leave(room.id, a).await.unwrap();
        assert!(lifecycle.leave(room.id, b).await.unwrap().torn_down.is_some());

        buffer.flush().await.unwrap();
        assert!(db.get_message(msg.id).unwrap().unwrap().is_deleted);
        assert!(db.get_messages(room.id, 50).unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelled_loop_runs_final_flush() {
        let (db, _kv, _sink, buffer) = setup(100);
        let msg = text(Uuid::new_v4(), Uuid::new_v4(), "last words");
        buffer.add_message(msg.clone()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        buffer.clone().run(cancel).await;

        assert!(db.get_message(msg.id).unwrap().is_some());
    }
}
