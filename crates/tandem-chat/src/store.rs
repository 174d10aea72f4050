use std::collections::BTreeSet;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use tandem_db::Database;
use tandem_db::models::{AddParticipant, InsertReport, LeaveRoom};
use tandem_types::models::{ChatMessage, ChatRoom, ChatRoomHistory, UserProfile};

/// Destination of flushed message batches.
#[async_trait]
pub trait MessageSink: Send + Sync + 'static {
    /// One bulk insert. Rows that fail individually are counted, not fatal.
    async fn insert_messages(&self, messages: Vec<ChatMessage>) -> Result<InsertReport>;
}

/// Durable state the chat core reads and writes: users and blocks, rooms,
/// exits, history, messages and read markers.
#[async_trait]
pub trait ChatStore: MessageSink {
    async fn user_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>>;
    async fn display_name(&self, user_id: Uuid) -> Result<Option<String>>;
    async fn blocked_ids(&self, user_id: Uuid) -> Result<BTreeSet<Uuid>>;
    /// Whether `user_id` blocked any of `others` or any of them blocked `user_id`.
    async fn any_block_between(&self, user_id: Uuid, others: Vec<Uuid>) -> Result<bool>;
    async fn block_user(&self, user_id: Uuid, blocked_user_id: Uuid) -> Result<()>;

    async fn insert_room(&self, room: ChatRoom) -> Result<()>;
    async fn get_room(&self, room_id: Uuid) -> Result<Option<ChatRoom>>;
    async fn add_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<AddParticipant>;
    async fn activate_if_full(&self, room_id: Uuid) -> Result<bool>;
    async fn activate_room(&self, room_id: Uuid) -> Result<bool>;
    async fn present_participants(&self, room_id: Uuid) -> Result<Vec<Uuid>>;
    async fn has_exited(&self, room_id: Uuid, user_id: Uuid) -> Result<bool>;
    /// Record the exit, free or keep the slot by the room's current phase,
    /// and archive the room when that leave completes it. One transaction.
    async fn leave_room(&self, room_id: Uuid, user_id: Uuid) -> Result<LeaveRoom>;
    async fn room_history(&self, original_room_id: Uuid) -> Result<Option<ChatRoomHistory>>;

    async fn get_message(&self, message_id: Uuid) -> Result<Option<ChatMessage>>;
    async fn get_messages(&self, room_id: Uuid, limit: u32) -> Result<Vec<ChatMessage>>;
    async fn soft_delete_message(&self, message_id: Uuid, sender_id: Uuid) -> Result<bool>;
    async fn mark_read(&self, room_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> Result<()>;
    async fn unread_count(&self, room_id: Uuid, user_id: Uuid) -> Result<u64>;
}

/// [`ChatStore`] over the SQLite [`Database`]. Every call runs on the
/// blocking pool so the single connection never stalls a runtime worker.
#[derive(Clone)]
pub struct SqliteStore {
    db: Arc<Database>,
}

impl SqliteStore {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    async fn blocking<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let db = self.db.clone();
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(|e| anyhow!("Database task failed: {}", e))?
    }
}

#[async_trait]
impl MessageSink for SqliteStore {
    async fn insert_messages(&self, messages: Vec<ChatMessage>) -> Result<InsertReport> {
        self.blocking(move |db| db.insert_messages(&messages)).await
    }
}

#[async_trait]
impl ChatStore for SqliteStore {
    async fn user_profile(&self, user_id: Uuid) -> Result<Option<UserProfile>> {
        self.blocking(move |db| db.get_user(user_id)).await
    }

    async fn display_name(&self, user_id: Uuid) -> Result<Option<String>> {
        self.blocking(move |db| db.get_display_name(user_id)).await
    }

    async fn blocked_ids(&self, user_id: Uuid) -> Result<BTreeSet<Uuid>> {
        self.blocking(move |db| db.get_blocked_ids(user_id)).await
    }

    async fn any_block_between(&self, user_id: Uuid, others: Vec<Uuid>) -> Result<bool> {
        self.blocking(move |db| db.any_block_between(user_id, &others))
            .await
    }

    async fn block_user(&self, user_id: Uuid, blocked_user_id: Uuid) -> Result<()> {
        self.blocking(move |db| db.block_user(user_id, blocked_user_id))
            .await
    }

    async fn insert_room(&self, room: ChatRoom) -> Result<()> {
        self.blocking(move |db| db.insert_room(&room)).await
    }

    async fn get_room(&self, room_id: Uuid) -> Result<Option<ChatRoom>> {
        self.blocking(move |db| db.get_room(room_id)).await
    }

    async fn add_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<AddParticipant> {
        self.blocking(move |db| db.add_participant(room_id, user_id))
            .await
    }

    async fn activate_if_full(&self, room_id: Uuid) -> Result<bool> {
        self.blocking(move |db| db.activate_if_full(room_id)).await
    }

    async fn activate_room(&self, room_id: Uuid) -> Result<bool> {
        self.blocking(move |db| db.activate_room(room_id)).await
    }

    async fn present_participants(&self, room_id: Uuid) -> Result<Vec<Uuid>> {
        self.blocking(move |db| db.present_participants(room_id))
            .await
    }

    async fn has_exited(&self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.blocking(move |db| db.has_exited(room_id, user_id)).await
    }

    async fn leave_room(&self, room_id: Uuid, user_id: Uuid) -> Result<LeaveRoom> {
        self.blocking(move |db| db.leave_room(room_id, user_id)).await
    }

    async fn room_history(&self, original_room_id: Uuid) -> Result<Option<ChatRoomHistory>> {
        self.blocking(move |db| db.get_room_history(original_room_id))
            .await
    }

    async fn get_message(&self, message_id: Uuid) -> Result<Option<ChatMessage>> {
        self.blocking(move |db| db.get_message(message_id)).await
    }

    async fn get_messages(&self, room_id: Uuid, limit: u32) -> Result<Vec<ChatMessage>> {
        self.blocking(move |db| db.get_messages(room_id, limit)).await
    }

    async fn soft_delete_message(&self, message_id: Uuid, sender_id: Uuid) -> Result<bool> {
        self.blocking(move |db| db.soft_delete_message(message_id, sender_id))
            .await
    }

    async fn mark_read(&self, room_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.blocking(move |db| db.mark_read(room_id, user_id, at))
            .await
    }

    async fn unread_count(&self, room_id: Uuid, user_id: Uuid) -> Result<u64> {
        self.blocking(move |db| db.unread_count(room_id, user_id))
            .await
    }
}
