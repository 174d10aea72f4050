use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use uuid::Uuid;

use tandem_chat::ChatError;
use tandem_crypto::MessageCipher;
use tandem_gateway::handlers::announce_member;
use tandem_types::api::{
    ApiResult, Claims, FriendRoomRequest, LeaveResponse, MessageResponse, RoomResponse,
    UnreadResponse,
};
use tandem_types::models::{ChatMessage, ChatRoom, MatchPreferences, MessageBody};

use crate::error::AppResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct MessageQuery {
    #[serde(default = "default_limit")]
    pub limit: u32,
}

fn default_limit() -> u32 {
    50
}

/// Open a random room the caller waits in until others fill it.
pub async fn create_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(preferences): Json<MatchPreferences>,
) -> AppResult<impl IntoResponse> {
    let room = state
        .chat
        .lifecycle
        .create_random_room(claims.sub, preferences)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResult::ok(RoomResponse { room }))))
}

pub async fn join_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> AppResult<impl IntoResponse> {
    let joined = state.chat.lifecycle.join(room_id, claims.sub).await?;
    if joined.newly_joined {
        announce_member(&state.chat, room_id, claims.sub, "joined").await;
    }
    Ok(Json(ApiResult::ok(RoomResponse { room: joined.room })))
}

pub async fn leave_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> AppResult<impl IntoResponse> {
    let left = state.chat.lifecycle.leave(room_id, claims.sub).await?;
    state.chat.dispatcher.detach_user(claims.sub, room_id).await;
    if left.torn_down.is_none() {
        announce_member(&state.chat, room_id, claims.sub, "left").await;
    }
    Ok(Json(ApiResult::ok(LeaveResponse {
        phase: left.phase(),
        torn_down: left.torn_down.is_some(),
    })))
}

pub async fn create_friend_room(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<FriendRoomRequest>,
) -> AppResult<impl IntoResponse> {
    let room = state
        .chat
        .lifecycle
        .create_friend_room(claims.sub, req.invitee_id)
        .await?;
    Ok((StatusCode::CREATED, Json(ApiResult::ok(RoomResponse { room }))))
}

pub async fn accept_friend_room(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> AppResult<impl IntoResponse> {
    let room = state
        .chat
        .lifecycle
        .accept_friend_room(room_id, claims.sub)
        .await?;
    Ok(Json(ApiResult::ok(RoomResponse { room })))
}

/// Rooms are readable by anyone on the roster, including members who left.
async fn readable_room(state: &AppState, room_id: Uuid, user_id: Uuid) -> AppResult<ChatRoom> {
    let room = state.chat.lifecycle.room(room_id).await?;
    if !room.has_participant(&user_id) {
        return Err(ChatError::NotParticipant.into());
    }
    Ok(room)
}

fn message_text(cipher: Option<&MessageCipher>, body: &MessageBody) -> Result<String, ChatError> {
    match (cipher, body) {
        (Some(cipher), body) => Ok(cipher.read_body(body)?),
        (None, MessageBody::Plaintext { text }) => Ok(text.clone()),
        (None, MessageBody::Encrypted(_)) => Err(ChatError::Store(anyhow::anyhow!(
            "encrypted message but no message key configured"
        ))),
    }
}

fn to_response(cipher: Option<&MessageCipher>, message: ChatMessage) -> Result<MessageResponse, ChatError> {
    Ok(MessageResponse {
        text: message_text(cipher, &message.body)?,
        id: message.id,
        room_id: message.room_id,
        sender_id: message.sender_id,
        is_system: message.is_system,
        sent_at: message.sent_at,
    })
}

/// Persisted history, oldest first. Messages still in the write-back buffer
/// show up once flushed.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Query(query): Query<MessageQuery>,
    Extension(claims): Extension<Claims>,
) -> AppResult<impl IntoResponse> {
    readable_room(&state, room_id, claims.sub).await?;

    let messages = state
        .chat
        .store
        .get_messages(room_id, query.limit.min(200))
        .await?;
    let cipher = state.chat.cipher.as_ref();
    let response = messages
        .into_iter()
        .map(|m| to_response(cipher, m))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Json(ApiResult::ok(response)))
}

pub async fn unread_count(
    State(state): State<AppState>,
    Path(room_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> AppResult<impl IntoResponse> {
    readable_room(&state, room_id, claims.sub).await?;
    let count = state.chat.store.unread_count(room_id, claims.sub).await?;
    Ok(Json(ApiResult::ok(UnreadResponse { room_id, count })))
}
