use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::models::{ChatRoom, MatchPreferences, RoomPhase};

// -- JWT Claims --

/// JWT claims shared by the HTTP middleware and the gateway upgrade check.
/// Tokens are minted by the account service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: Uuid,
    pub exp: usize,
}

// -- Structured results --

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: String,
    pub message: String,
}

/// `{success, error, data}` envelope returned by every HTTP handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResult<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T> ApiResult<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            error: None,
            data: Some(data),
        }
    }
}

impl ApiResult<()> {
    pub fn err(code: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(ErrorBody {
                code: code.to_string(),
                message: message.into(),
            }),
            data: None,
        }
    }
}

// -- Matching --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnqueueRequest {
    pub preferences: Option<MatchPreferences>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QueuePositionResponse {
    pub queue: String,
    pub position: usize,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub removed: bool,
}

// -- Rooms --

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FriendRoomRequest {
    pub invitee_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RoomResponse {
    pub room: ChatRoom,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LeaveResponse {
    pub phase: RoomPhase,
    pub torn_down: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub id: Uuid,
    pub room_id: Uuid,
    pub sender_id: Option<Uuid>,
    pub text: String,
    pub is_system: bool,
    pub sent_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UnreadResponse {
    pub room_id: Uuid,
    pub count: u64,
}

// -- Presence --

#[derive(Debug, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user_id: Uuid,
    pub online: bool,
}
