use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{RoomKind, RoomPhase};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum GatewayEvent {
    /// Caller joined (or was placed into) a random room
    RoomJoined {
        room_id: Uuid,
        participant_ids: Vec<Uuid>,
    },

    /// Caller attached to a friend room
    FriendRoomJoined {
        room_id: Uuid,
        participant_ids: Vec<Uuid>,
    },

    /// A chat message, delivered on the room channel
    ReceiveMessage {
        id: Uuid,
        room_id: Uuid,
        sender_id: Uuid,
        sender_name: String,
        text: String,
        sent_at: DateTime<Utc>,
    },

    /// Personal notification for participants not necessarily viewing the room
    ChatNotification {
        room_id: Uuid,
        message_id: Uuid,
        sender_id: Uuid,
        sender_name: String,
        preview: String,
    },

    /// Badge counter bump for one room
    UnreadCountUpdated { room_id: Uuid, increment: u64 },

    /// A user came online or went offline
    UserStatusChanged { user_id: Uuid, online: bool },

    /// Server-authored message in a room (joins, leaves, matches)
    SystemMessage {
        id: Uuid,
        room_id: Uuid,
        text: String,
        sent_at: DateTime<Utc>,
    },

    /// A message was soft-deleted by its sender
    MessageDeleted { room_id: Uuid, message_id: Uuid },

    /// The matching queue paired the caller into a room
    MatchingSuccess {
        room_id: Uuid,
        participant_ids: Vec<Uuid>,
    },

    /// The caller waited longer than the matching timeout and was dropped
    MatchingTimeout,

    /// Heartbeat reply
    Pong,

    /// Reply to every client command, success or not
    Ack(Ack),
}

impl GatewayEvent {
    /// Returns the room this event belongs to, if it is room-scoped.
    pub fn room_id(&self) -> Option<Uuid> {
        match self {
            Self::RoomJoined { room_id, .. }
            | Self::FriendRoomJoined { room_id, .. }
            | Self::ReceiveMessage { room_id, .. }
            | Self::ChatNotification { room_id, .. }
            | Self::UnreadCountUpdated { room_id, .. }
            | Self::SystemMessage { room_id, .. }
            | Self::MessageDeleted { room_id, .. }
            | Self::MatchingSuccess { room_id, .. } => Some(*room_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AckError {
    pub code: String,
    pub message: String,
}

/// Structured acknowledgement. `message_id` is set for `sendMessage`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub room_id: Option<Uuid>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
}

impl Ack {
    pub fn ok(command: &str) -> Self {
        Self {
            command: command.to_string(),
            request_id: None,
            room_id: None,
            success: true,
            message_id: None,
            error: None,
        }
    }

    pub fn failed(command: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(AckError {
                code: code.to_string(),
                message: message.into(),
            }),
            ..Self::ok(command)
        }
    }

    pub fn with_room(mut self, room_id: Uuid) -> Self {
        self.room_id = Some(room_id);
        self
    }

    pub fn with_request(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn with_message(mut self, message_id: Uuid) -> Self {
        self.message_id = Some(message_id);
        self
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "camelCase")]
pub enum GatewayCommand {
    /// Bind this connection to the user's personal channel
    Register { user_id: Uuid },

    /// Attach this connection to a room's channel (and join the room if needed)
    JoinRoom { room_id: Uuid, room_kind: RoomKind },

    /// Open a room view: marks it read and records the entry
    EnterRoom { room_id: Uuid },

    SendMessage {
        room_id: Uuid,
        text: String,
        #[serde(default)]
        request_id: Option<String>,
    },

    /// Leave a room. The phase is a client hint; the room's own status decides.
    LeaveRoom {
        room_id: Uuid,
        #[serde(default)]
        phase: Option<RoomPhase>,
    },

    MarkAsRead { room_id: Uuid },

    DeleteMessage { room_id: Uuid, message_id: Uuid },

    Ping,
}

impl GatewayCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Register { .. } => "register",
            Self::JoinRoom { .. } => "joinRoom",
            Self::EnterRoom { .. } => "enterRoom",
            Self::SendMessage { .. } => "sendMessage",
            Self::LeaveRoom { .. } => "leaveRoom",
            Self::MarkAsRead { .. } => "markAsRead",
            Self::DeleteMessage { .. } => "deleteMessage",
            Self::Ping => "ping",
        }
    }
}

/// Delivery address for an event across all gateway processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "scope", content = "id", rename_all = "lowercase")]
pub enum Topic {
    Room(Uuid),
    User(Uuid),
    Global,
}

/// What travels over the shared pub/sub backbone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FanoutEnvelope {
    pub topic: Topic,
    pub event: GatewayEvent,
}
