use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Error returned when a stored or wire string does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownVariant {
    pub kind: &'static str,
    pub value: String,
}

impl fmt::Display for UnknownVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown {} '{}'", self.kind, self.value)
    }
}

impl std::error::Error for UnknownVariant {}

/// Declares `as_str`, `Display` and `FromStr` for a fieldless enum whose
/// serde representation is its lowercase name.
macro_rules! string_enum {
    ($ty:ident, $kind:literal, { $($variant:ident => $s:literal),+ $(,)? }) => {
        impl $ty {
            pub const ALL: &'static [$ty] = &[$($ty::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $s),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = UnknownVariant;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($s => Ok($ty::$variant),)+
                    other => Err(UnknownVariant { kind: $kind, value: other.to_string() }),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Gender {
    Male,
    Female,
}

string_enum!(Gender, "gender", { Male => "male", Female => "female" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgeGroup {
    Adult,
    Minor,
}

string_enum!(AgeGroup, "age group", { Adult => "adult", Minor => "minor" });

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GenderPreference {
    Any,
    Opposite,
    Same,
}

string_enum!(GenderPreference, "gender preference", {
    Any => "any",
    Opposite => "opposite",
    Same => "same",
});

impl GenderPreference {
    /// Whether a peer of `other` gender satisfies this preference held by a
    /// user of `own` gender.
    pub fn accepts(&self, own: Gender, other: Gender) -> bool {
        match self {
            GenderPreference::Any => true,
            GenderPreference::Opposite => own != other,
            GenderPreference::Same => own == other,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomKind {
    Friend,
    Random,
}

string_enum!(RoomKind, "room kind", { Friend => "friend", Random => "random" });

/// Lifecycle status of a live room. Also recorded on exits as the phase the
/// user left in; an exit phase only ever moves from `Waiting` to `Active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RoomPhase {
    Waiting,
    Active,
}

string_enum!(RoomPhase, "room phase", { Waiting => "waiting", Active => "active" });

/// What a user asks for when entering the matching queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchPreferences {
    pub age_group: AgeGroup,
    pub gender_preference: GenderPreference,
    pub capacity: u32,
}

/// Descriptor stored in a matching queue while a user waits for a partner.
/// The blocklist is a snapshot taken at enqueue time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaitingCandidate {
    pub user_id: Uuid,
    pub gender: Gender,
    pub blocked_user_ids: BTreeSet<Uuid>,
    pub age_group: AgeGroup,
    pub gender_preference: GenderPreference,
    pub capacity: u32,
    pub enqueued_at: DateTime<Utc>,
}

/// Current time at microsecond precision, the resolution the stores keep.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

impl WaitingCandidate {
    pub fn blocks(&self, other: &Uuid) -> bool {
        self.blocked_user_ids.contains(other)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoom {
    pub id: Uuid,
    pub participant_ids: Vec<Uuid>,
    pub capacity: u32,
    pub kind: RoomKind,
    pub gender_preference: Option<GenderPreference>,
    pub age_group: Option<AgeGroup>,
    pub status: RoomPhase,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

impl ChatRoom {
    pub fn is_full(&self) -> bool {
        self.participant_ids.len() as u32 >= self.capacity
    }

    pub fn has_participant(&self, user_id: &Uuid) -> bool {
        self.participant_ids.contains(user_id)
    }
}

/// Append-only record of a participant leaving a room.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoomExit {
    pub room_id: Uuid,
    pub user_id: Uuid,
    pub left_at: DateTime<Utc>,
    pub phase: RoomPhase,
}

/// Sealed form of a message body: AES-GCM ciphertext, nonce and tag, all
/// base64 encoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealedText {
    pub ciphertext: String,
    pub iv: String,
    pub tag: String,
}

/// Message payload, discriminated explicitly rather than by which fields
/// happen to be present.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum MessageBody {
    Plaintext { text: String },
    Encrypted(SealedText),
}

impl MessageBody {
    pub fn is_encrypted(&self) -> bool {
        matches!(self, MessageBody::Encrypted(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub room_id: Uuid,
    /// `None` for system messages.
    pub sender_id: Option<Uuid>,
    pub body: MessageBody,
    pub sent_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub is_system: bool,
}

impl ChatMessage {
    /// A user message with its identity assigned up front, before it is
    /// durable, so broadcasts can carry a stable id.
    pub fn from_user(room_id: Uuid, sender_id: Uuid, body: MessageBody) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            sender_id: Some(sender_id),
            body,
            sent_at: now(),
            is_deleted: false,
            is_system: false,
        }
    }

    pub fn system(room_id: Uuid, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            room_id,
            sender_id: None,
            body: MessageBody::Plaintext { text: text.into() },
            sent_at: now(),
            is_deleted: false,
            is_system: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomHistoryMeta {
    pub participant_ids: Vec<Uuid>,
    pub capacity: u32,
    pub kind: RoomKind,
    pub gender_preference: Option<GenderPreference>,
    pub age_group: Option<AgeGroup>,
    pub created_at: DateTime<Utc>,
}

/// Archival snapshot written once, when a room is torn down.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRoomHistory {
    pub original_room_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub meta: RoomHistoryMeta,
}

impl ChatRoomHistory {
    pub fn snapshot(room: &ChatRoom) -> Self {
        Self {
            original_room_id: room.id,
            timestamp: now(),
            meta: RoomHistoryMeta {
                participant_ids: room.participant_ids.clone(),
                capacity: room.capacity,
                kind: room.kind,
                gender_preference: room.gender_preference,
                age_group: room.age_group,
                created_at: room.created_at,
            },
        }
    }
}

/// Value stored under a user's presence key. Absence of the key means offline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PresenceRecord {
    pub connection_id: Uuid,
    pub last_seen: DateTime<Utc>,
    pub online: bool,
}

/// The parts of a user profile the chat core reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub display_name: String,
    pub gender: Gender,
    pub age_group: AgeGroup,
}
