/// Database row types, mapped directly from SQLite rows.
/// Conversion into tandem-types models happens outside the rusqlite row
/// closures so parse failures surface as ordinary errors.
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use uuid::Uuid;

use tandem_types::models::{
    AgeGroup, ChatMessage, ChatRoom, ChatRoomExit, ChatRoomHistory, GenderPreference,
    MessageBody, RoomKind, RoomPhase, SealedText,
};

pub struct RoomRow {
    pub id: String,
    pub capacity: i64,
    pub kind: String,
    pub gender_preference: Option<String>,
    pub age_group: Option<String>,
    pub status: String,
    pub is_active: bool,
    pub created_at: String,
}

pub struct MessageRow {
    pub id: String,
    pub room_id: String,
    pub sender_id: Option<String>,
    pub is_encrypted: bool,
    pub text: Option<String>,
    pub ciphertext: Option<String>,
    pub iv: Option<String>,
    pub tag: Option<String>,
    pub sent_at: String,
    pub is_deleted: bool,
    pub is_system: bool,
}

/// Outcome of a bulk insert that keeps going past individual failures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: usize,
    pub failed: usize,
}

/// Outcome of the conditioned participant insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddParticipant {
    Added { count: usize },
    AlreadyPresent,
    Full,
    Exited,
    RoomMissing,
}

/// Outcome of the transactional leave.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveRoom {
    /// `history` is set when this leave archived the room.
    Left {
        exit: ChatRoomExit,
        history: Option<ChatRoomHistory>,
    },
    NotParticipant,
    RoomMissing,
}

/// Timestamps are stored as fixed-width RFC 3339 so they sort as text.
pub fn ts(at: &DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    Ok(DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("corrupt timestamp '{}'", raw))?
        .with_timezone(&Utc))
}

pub fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt id '{}'", raw))
}

impl RoomRow {
    pub fn into_room(self, participant_ids: Vec<Uuid>) -> Result<ChatRoom> {
        Ok(ChatRoom {
            id: parse_id(&self.id)?,
            participant_ids,
            capacity: u32::try_from(self.capacity).context("negative capacity")?,
            kind: self.kind.parse::<RoomKind>()?,
            gender_preference: self
                .gender_preference
                .as_deref()
                .map(str::parse::<GenderPreference>)
                .transpose()?,
            age_group: self
                .age_group
                .as_deref()
                .map(str::parse::<AgeGroup>)
                .transpose()?,
            status: self.status.parse::<RoomPhase>()?,
            is_active: self.is_active,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

impl MessageRow {
    pub fn into_message(self) -> Result<ChatMessage> {
        let body = if self.is_encrypted {
            MessageBody::Encrypted(SealedText {
                ciphertext: self.ciphertext.context("encrypted message without ciphertext")?,
                iv: self.iv.context("encrypted message without iv")?,
                tag: self.tag.context("encrypted message without tag")?,
            })
        } else {
            MessageBody::Plaintext {
                text: self.text.context("plaintext message without text")?,
            }
        };

        Ok(ChatMessage {
            id: parse_id(&self.id)?,
            room_id: parse_id(&self.room_id)?,
            sender_id: self.sender_id.as_deref().map(parse_id).transpose()?,
            body,
            sent_at: parse_ts(&self.sent_at)?,
            is_deleted: self.is_deleted,
            is_system: self.is_system,
        })
    }
}
