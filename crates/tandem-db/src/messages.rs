use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::warn;
use uuid::Uuid;

use tandem_types::models::{ChatMessage, MessageBody};

use crate::Database;
use crate::models::{InsertReport, MessageRow, ts};

const MESSAGE_COLUMNS: &str = "id, room_id, sender_id, is_encrypted, text, ciphertext, iv, tag, sent_at, is_deleted, is_system";

impl Database {
    // -- Messages --

    /// Bulk insert in one transaction, continuing past rows that fail
    /// (duplicate id, constraint violation). Failed rows are logged and counted.
    /// Rows for a room that has already been archived land soft-deleted.
    pub fn insert_messages(&self, messages: &[ChatMessage]) -> Result<InsertReport> {
        if messages.is_empty() {
            return Ok(InsertReport::default());
        }

        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut report = InsertReport::default();
            {
                let mut stmt = tx.prepare(
                    "INSERT INTO chat_messages (id, room_id, sender_id, is_encrypted, text, ciphertext, iv, tag, sent_at, is_deleted, is_system)
                     SELECT ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9,
                            ?10 OR EXISTS (SELECT 1 FROM chat_room_history WHERE original_room_id = ?2),
                            ?11",
                )?;
                for message in messages {
                    let (text, ciphertext, iv, tag) = match &message.body {
                        MessageBody::Plaintext { text } => (Some(text.as_str()), None, None, None),
                        MessageBody::Encrypted(sealed) => (
                            None,
                            Some(sealed.ciphertext.as_str()),
                            Some(sealed.iv.as_str()),
                            Some(sealed.tag.as_str()),
                        ),
                    };
                    let result = stmt.execute(rusqlite::params![
                        message.id.to_string(),
                        message.room_id.to_string(),
                        message.sender_id.map(|id| id.to_string()),
                        message.body.is_encrypted(),
                        text,
                        ciphertext,
                        iv,
                        tag,
                        ts(&message.sent_at),
                        message.is_deleted,
                        message.is_system,
                    ]);
                    match result {
                        Ok(_) => report.inserted += 1,
                        Err(e) => {
                            warn!("Skipping message {} in bulk insert: {}", message.id, e);
                            report.failed += 1;
                        }
                    }
                }
            }
            tx.commit()?;
            Ok(report)
        })
    }

    pub fn get_message(&self, id: Uuid) -> Result<Option<ChatMessage>> {
        let row = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE id = ?1"),
                    [id.to_string()],
                    map_message_row,
                )
                .optional()?;
            Ok(row)
        })?;
        row.map(MessageRow::into_message).transpose()
    }

    /// Latest `limit` non-deleted messages of a room, oldest first.
    pub fn get_messages(&self, room_id: Uuid, limit: u32) -> Result<Vec<ChatMessage>> {
        let rows = self.with_conn(|conn| query_messages(conn, room_id, limit))?;
        rows.into_iter().rev().map(MessageRow::into_message).collect()
    }

    /// Soft-delete a message its sender owns. Returns false if no such live
    /// message exists (wrong sender, already deleted, or not yet flushed).
    pub fn soft_delete_message(&self, id: Uuid, sender_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE chat_messages SET is_deleted = 1
                 WHERE id = ?1 AND sender_id = ?2 AND is_deleted = 0",
                [id.to_string(), sender_id.to_string()],
            )?;
            Ok(changed == 1)
        })
    }

    // -- Read state --

    pub fn mark_read(&self, room_id: Uuid, user_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO room_reads (room_id, user_id, last_read_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT (room_id, user_id) DO UPDATE SET
                     last_read_at = MAX(room_reads.last_read_at, excluded.last_read_at)",
                [room_id.to_string(), user_id.to_string(), ts(&at)],
            )?;
            Ok(())
        })
    }

    /// Live, non-system messages from others newer than the user's read marker.
    pub fn unread_count(&self, room_id: Uuid, user_id: Uuid) -> Result<u64> {
        self.with_conn(|conn| {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM chat_messages m
                 WHERE m.room_id = ?1
                   AND m.is_deleted = 0
                   AND m.is_system = 0
                   AND (m.sender_id IS NULL OR m.sender_id != ?2)
                   AND m.sent_at > COALESCE(
                       (SELECT last_read_at FROM room_reads WHERE room_id = ?1 AND user_id = ?2),
                       ''
                   )",
                [room_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(count as u64)
        })
    }
}

fn map_message_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRow> {
    Ok(MessageRow {
        id: row.get(0)?,
        room_id: row.get(1)?,
        sender_id: row.get(2)?,
        is_encrypted: row.get(3)?,
        text: row.get(4)?,
        ciphertext: row.get(5)?,
        iv: row.get(6)?,
        tag: row.get(7)?,
        sent_at: row.get(8)?,
        is_deleted: row.get(9)?,
        is_system: row.get(10)?,
    })
}

fn query_messages(conn: &Connection, room_id: Uuid, limit: u32) -> Result<Vec<MessageRow>> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {MESSAGE_COLUMNS} FROM chat_messages
         WHERE room_id = ?1 AND is_deleted = 0
         ORDER BY sent_at DESC, seq DESC
         LIMIT ?2"
    ))?;

    let rows = stmt
        .query_map(rusqlite::params![room_id.to_string(), limit], map_message_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;

    Ok(rows)
}
