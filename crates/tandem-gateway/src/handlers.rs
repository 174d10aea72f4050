use std::sync::Arc;

use tracing::{debug, info, warn};
use uuid::Uuid;

use tandem_chat::{
    ChatError, ChatStore, ErrorKind, EventSink, MessageBuffer, NameCache, PresenceTracker,
    RoomLifecycle,
};
use tandem_crypto::MessageCipher;
use tandem_types::events::{Ack, GatewayCommand, GatewayEvent, Topic};
use tandem_types::models::{ChatMessage, MessageBody, RoomKind, RoomPhase, now};

use crate::dispatcher::Dispatcher;

const MAX_MESSAGE_CHARS: usize = 2000;
const PREVIEW_CHARS: usize = 80;

/// Shared services every connection handler works against.
#[derive(Clone)]
pub struct ChatContext {
    pub store: Arc<dyn ChatStore>,
    pub lifecycle: RoomLifecycle,
    pub buffer: MessageBuffer,
    pub presence: Arc<PresenceTracker>,
    pub names: Arc<NameCache>,
    pub events: Arc<dyn EventSink>,
    pub dispatcher: Dispatcher,
    /// Encrypts stored message bodies when configured.
    pub cipher: Option<MessageCipher>,
}

/// Per-connection state.
#[derive(Debug, Clone, Copy)]
pub struct Session {
    pub conn_id: Uuid,
    /// Authenticated at the upgrade.
    pub user_id: Uuid,
    pub registered: bool,
}

impl Session {
    pub fn new(conn_id: Uuid, user_id: Uuid) -> Self {
        Self {
            conn_id,
            user_id,
            registered: false,
        }
    }
}

fn failure(command: &str, room_id: Option<Uuid>, err: &ChatError) -> Ack {
    if err.kind() == ErrorKind::Transient {
        warn!("{} failed: {}", command, err);
    } else {
        debug!("{} rejected: {}", command, err);
    }
    let ack = Ack::failed(command, err.code(), err.to_string());
    match room_id {
        Some(room_id) => ack.with_room(room_id),
        None => ack,
    }
}

/// Run one client command. Every command gets exactly one reply: `Pong` for
/// `ping`, an [`Ack`] for everything else.
pub async fn handle_command(
    ctx: &ChatContext,
    session: &mut Session,
    cmd: GatewayCommand,
) -> GatewayEvent {
    let name = cmd.name();
    let ack = match cmd {
        GatewayCommand::Ping => {
            if let Err(e) = ctx.presence.refresh(session.user_id, session.conn_id).await {
                warn!("Presence refresh failed for {}: {}", session.user_id, e);
            }
            return GatewayEvent::Pong;
        }

        GatewayCommand::Register { user_id } => match register(ctx, session, user_id).await {
            Ok(()) => Ack::ok(name),
            Err(e) => failure(name, None, &e),
        },

        GatewayCommand::JoinRoom { room_id, room_kind } => {
            match join_room(ctx, session, room_id, room_kind).await {
                Ok(()) => Ack::ok(name).with_room(room_id),
                Err(e) => failure(name, Some(room_id), &e),
            }
        }

        GatewayCommand::EnterRoom { room_id } => match enter_room(ctx, session, room_id).await {
            Ok(()) => Ack::ok(name).with_room(room_id),
            Err(e) => failure(name, Some(room_id), &e),
        },

        GatewayCommand::SendMessage {
            room_id,
            text,
            request_id,
        } => match send_message(ctx, session, room_id, text).await {
            Ok(message_id) => Ack::ok(name)
                .with_room(room_id)
                .with_message(message_id)
                .with_request(request_id),
            Err(e) => failure(name, Some(room_id), &e).with_request(request_id),
        },

        GatewayCommand::LeaveRoom { room_id, phase } => {
            match leave_room(ctx, session, room_id).await {
                Ok(actual) => {
                    if phase.is_some_and(|hint| hint != actual) {
                        debug!(
                            "Client said {:?} but room {} was {}",
                            phase, room_id, actual
                        );
                    }
                    Ack::ok(name).with_room(room_id)
                }
                Err(e) => failure(name, Some(room_id), &e),
            }
        }

        GatewayCommand::MarkAsRead { room_id } => {
            match ctx.store.mark_read(room_id, session.user_id, now()).await {
                Ok(()) => Ack::ok(name).with_room(room_id),
                Err(e) => failure(name, Some(room_id), &ChatError::from(e)),
            }
        }

        GatewayCommand::DeleteMessage {
            room_id,
            message_id,
        } => match delete_message(ctx, session, room_id, message_id).await {
            Ok(()) => Ack::ok(name).with_room(room_id).with_message(message_id),
            Err(e) => failure(name, Some(room_id), &e),
        },
    };
    GatewayEvent::Ack(ack)
}

async fn register(ctx: &ChatContext, session: &mut Session, user_id: Uuid) -> Result<(), ChatError> {
    if user_id != session.user_id {
        return Err(ChatError::Validation(
            "register must use the authenticated user id".into(),
        ));
    }
    ctx.presence.set_online(user_id, session.conn_id).await?;
    session.registered = true;
    ctx.events
        .emit(
            Topic::Global,
            GatewayEvent::UserStatusChanged {
                user_id,
                online: true,
            },
        )
        .await;
    info!("User {} registered on connection {}", user_id, session.conn_id);
    Ok(())
}

async fn join_room(
    ctx: &ChatContext,
    session: &Session,
    room_id: Uuid,
    room_kind: RoomKind,
) -> Result<(), ChatError> {
    let room = ctx.lifecycle.room(room_id).await?;
    if room.kind != room_kind {
        return Err(ChatError::Validation(format!(
            "room {} is a {} room",
            room_id, room.kind
        )));
    }

    let joined = ctx.lifecycle.join(room_id, session.user_id).await?;
    ctx.dispatcher.attach_room(session.conn_id, room_id).await;

    if joined.newly_joined {
        announce_member(ctx, room_id, session.user_id, "joined").await;
    }

    let participant_ids = joined.room.participant_ids.clone();
    let event = match room_kind {
        RoomKind::Random => GatewayEvent::RoomJoined {
            room_id,
            participant_ids,
        },
        RoomKind::Friend => GatewayEvent::FriendRoomJoined {
            room_id,
            participant_ids,
        },
    };
    ctx.dispatcher.send_to_connection(session.conn_id, event).await;
    Ok(())
}

async fn enter_room(ctx: &ChatContext, session: &Session, room_id: Uuid) -> Result<(), ChatError> {
    let room = ctx.lifecycle.room(room_id).await?;
    if !room.has_participant(&session.user_id) {
        return Err(ChatError::NotParticipant);
    }
    ctx.dispatcher.attach_room(session.conn_id, room_id).await;
    ctx.store.mark_read(room_id, session.user_id, now()).await?;
    Ok(())
}

/// Buffer the message, broadcast it on the room channel, then notify every
/// other present participant on their personal channel.
async fn send_message(
    ctx: &ChatContext,
    session: &Session,
    room_id: Uuid,
    text: String,
) -> Result<Uuid, ChatError> {
    let text = text.trim().to_string();
    if text.is_empty() {
        return Err(ChatError::Validation("message text is empty".into()));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ChatError::Validation(format!(
            "message longer than {MAX_MESSAGE_CHARS} characters"
        )));
    }

    let present = ctx.lifecycle.present_participants(room_id).await?;
    if !present.contains(&session.user_id) {
        return Err(ChatError::NotParticipant);
    }

    let sender_name = ctx.names.display_name(session.user_id).await?;
    let body = match &ctx.cipher {
        Some(cipher) => cipher.seal_body(&text)?,
        None => MessageBody::Plaintext { text: text.clone() },
    };
    let message = ChatMessage::from_user(room_id, session.user_id, body);
    let (message_id, sent_at) = (message.id, message.sent_at);

    ctx.buffer.add_message(message).await?;

    ctx.events
        .emit(
            Topic::Room(room_id),
            GatewayEvent::ReceiveMessage {
                id: message_id,
                room_id,
                sender_id: session.user_id,
                sender_name: sender_name.clone(),
                text: text.clone(),
                sent_at,
            },
        )
        .await;

    let preview: String = text.chars().take(PREVIEW_CHARS).collect();
    for recipient in present.into_iter().filter(|id| *id != session.user_id) {
        ctx.events
            .emit(
                Topic::User(recipient),
                GatewayEvent::ChatNotification {
                    room_id,
                    message_id,
                    sender_id: session.user_id,
                    sender_name: sender_name.clone(),
                    preview: preview.clone(),
                },
            )
            .await;
        ctx.events
            .emit(
                Topic::User(recipient),
                GatewayEvent::UnreadCountUpdated {
                    room_id,
                    increment: 1,
                },
            )
            .await;
    }

    Ok(message_id)
}

async fn leave_room(
    ctx: &ChatContext,
    session: &Session,
    room_id: Uuid,
) -> Result<RoomPhase, ChatError> {
    let left = ctx.lifecycle.leave(room_id, session.user_id).await?;
    ctx.dispatcher.detach_user(session.user_id, room_id).await;

    if left.torn_down.is_none() {
        announce_member(ctx, room_id, session.user_id, "left").await;
    }
    Ok(left.phase())
}

async fn delete_message(
    ctx: &ChatContext,
    session: &Session,
    room_id: Uuid,
    message_id: Uuid,
) -> Result<(), ChatError> {
    if let Some(stored) = ctx.store.get_message(message_id).await? {
        if stored.room_id != room_id {
            return Err(ChatError::NotFound("message"));
        }
    }

    let mut deleted = ctx
        .store
        .soft_delete_message(message_id, session.user_id)
        .await?;
    if !deleted && ctx.buffer.tombstone_pending(message_id, session.user_id).await? {
        // The entry may have been flushed between the two checks.
        ctx.store
            .soft_delete_message(message_id, session.user_id)
            .await?;
        deleted = true;
    }
    if !deleted {
        return Err(ChatError::NotFound("message"));
    }

    ctx.events
        .emit(
            Topic::Room(room_id),
            GatewayEvent::MessageDeleted {
                room_id,
                message_id,
            },
        )
        .await;
    Ok(())
}

/// Tell the room that `user_id` joined or left. Runs after the transition
/// is committed, so a failed name lookup only costs the announcement.
pub async fn announce_member(ctx: &ChatContext, room_id: Uuid, user_id: Uuid, action: &str) {
    let name = match ctx.names.display_name(user_id).await {
        Ok(name) => name,
        Err(e) => {
            warn!(
                "Skipping {} announcement for {} in room {}: {}",
                action, user_id, room_id, e
            );
            return;
        }
    };
    post_system(ctx, room_id, format!("{name} {action} the chat")).await;
}

/// Server-authored message: buffered like any other, announced on the room.
pub async fn post_system(ctx: &ChatContext, room_id: Uuid, text: String) {
    let message = ChatMessage::system(room_id, text.clone());
    let event = GatewayEvent::SystemMessage {
        id: message.id,
        room_id,
        text,
        sent_at: message.sent_at,
    };
    if let Err(e) = ctx.buffer.add_message(message).await {
        warn!("Could not store system message for room {}: {}", room_id, e);
    }
    ctx.events.emit(Topic::Room(room_id), event).await;
}

/// Connection teardown: presence goes offline once the user's last local
/// connection is gone.
pub async fn disconnect(ctx: &ChatContext, session: &Session) {
    let Some((user_id, last)) = ctx.dispatcher.unregister_connection(session.conn_id).await else {
        return;
    };
    if !last || !session.registered {
        return;
    }
    if let Err(e) = ctx.presence.set_offline(user_id).await {
        warn!("Failed to clear presence for {}: {}", user_id, e);
    }
    ctx.events
        .emit(
            Topic::Global,
            GatewayEvent::UserStatusChanged {
                user_id,
                online: false,
            },
        )
        .await;
}
