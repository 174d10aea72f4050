use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use tandem_db::models::{AddParticipant, LeaveRoom};
use tandem_types::models::{
    ChatRoom, ChatRoomExit, ChatRoomHistory, MatchPreferences, RoomKind, RoomPhase,
    WaitingCandidate, now,
};

use crate::error::{ChatError, ChatResult};
use crate::store::ChatStore;

/// Matching only ever pairs two users.
pub const MATCHED_ROOM_CAPACITY: u32 = 2;

/// Outcome of a successful join.
#[derive(Debug, Clone)]
pub struct JoinResult {
    pub room: ChatRoom,
    /// False when the user was already on the roster.
    pub newly_joined: bool,
    /// True when this join filled a random room and flipped it to active.
    pub activated: bool,
}

/// Outcome of a leave.
#[derive(Debug, Clone)]
pub struct LeaveResult {
    pub exit: ChatRoomExit,
    /// Set when this leave tore the room down.
    pub torn_down: Option<ChatRoomHistory>,
}

impl LeaveResult {
    pub fn phase(&self) -> RoomPhase {
        self.exit.phase
    }
}

/// Room state machine: `waiting` → `active` → torn down.
///
/// Every transition is a single conditioned write in the store, so joins and
/// leaves racing on the same room from different tasks or processes cannot
/// lose updates or tear a room down twice.
#[derive(Clone)]
pub struct RoomLifecycle {
    store: Arc<dyn ChatStore>,
}

impl RoomLifecycle {
    pub fn new(store: Arc<dyn ChatStore>) -> Self {
        Self { store }
    }

    /// Persist the room for a freshly paired couple. It starts active.
    pub async fn open_matched_room(
        &self,
        first: &WaitingCandidate,
        second: &WaitingCandidate,
    ) -> ChatResult<ChatRoom> {
        let room = ChatRoom {
            id: Uuid::new_v4(),
            participant_ids: vec![first.user_id, second.user_id],
            capacity: MATCHED_ROOM_CAPACITY,
            kind: RoomKind::Random,
            gender_preference: Some(first.gender_preference),
            age_group: Some(first.age_group),
            status: RoomPhase::Active,
            is_active: true,
            created_at: now(),
        };
        self.store.insert_room(room.clone()).await?;
        info!(
            "Matched {} and {} into room {}",
            first.user_id, second.user_id, room.id
        );
        Ok(room)
    }

    /// Open a waiting random room with the creator as its first participant.
    /// Others fill it through [`join`](Self::join).
    pub async fn create_random_room(
        &self,
        creator_id: Uuid,
        preferences: MatchPreferences,
    ) -> ChatResult<ChatRoom> {
        if preferences.capacity < 2 {
            return Err(ChatError::Validation(format!(
                "capacity must be at least 2, got {}",
                preferences.capacity
            )));
        }
        let room = ChatRoom {
            id: Uuid::new_v4(),
            participant_ids: vec![creator_id],
            capacity: preferences.capacity,
            kind: RoomKind::Random,
            gender_preference: Some(preferences.gender_preference),
            age_group: Some(preferences.age_group),
            status: RoomPhase::Waiting,
            is_active: false,
            created_at: now(),
        };
        self.store.insert_room(room.clone()).await?;
        debug!("User {} opened random room {}", creator_id, room.id);
        Ok(room)
    }

    /// Invite a friend into a waiting two-person room.
    pub async fn create_friend_room(&self, inviter_id: Uuid, invitee_id: Uuid) -> ChatResult<ChatRoom> {
        if inviter_id == invitee_id {
            return Err(ChatError::Validation("cannot invite yourself".into()));
        }
        if self.store.user_profile(invitee_id).await?.is_none() {
            return Err(ChatError::NotFound("user"));
        }
        if self
            .store
            .any_block_between(inviter_id, vec![invitee_id])
            .await?
        {
            return Err(ChatError::Blocked);
        }

        let room = ChatRoom {
            id: Uuid::new_v4(),
            participant_ids: vec![inviter_id],
            capacity: 2,
            kind: RoomKind::Friend,
            gender_preference: None,
            age_group: None,
            status: RoomPhase::Waiting,
            is_active: false,
            created_at: now(),
        };
        self.store.insert_room(room.clone()).await?;
        info!("User {} invited {} into friend room {}", inviter_id, invitee_id, room.id);
        Ok(room)
    }

    /// Explicitly activate a friend room. Only a participant may accept, and
    /// only once the invitee has joined. Accepting an active room is a no-op.
    pub async fn accept_friend_room(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<ChatRoom> {
        let room = self.room(room_id).await?;
        if room.kind != RoomKind::Friend {
            return Err(ChatError::Validation("only friend rooms are accepted".into()));
        }
        if !room.has_participant(&user_id) {
            return Err(ChatError::NotParticipant);
        }
        if !self.store.activate_room(room_id).await? {
            let room = self.room(room_id).await?;
            if room.status != RoomPhase::Active {
                return Err(ChatError::Validation(
                    "friend room is still waiting for the invitee".into(),
                ));
            }
            return Ok(room);
        }
        info!("Friend room {} accepted by {}", room_id, user_id);
        self.room(room_id).await
    }

    pub async fn join(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<JoinResult> {
        let room = self.room(room_id).await?;

        if self.store.has_exited(room_id, user_id).await? {
            return Err(ChatError::ReentryForbidden);
        }
        if room.has_participant(&user_id) {
            return Ok(JoinResult {
                room,
                newly_joined: false,
                activated: false,
            });
        }
        if self
            .store
            .any_block_between(user_id, room.participant_ids.clone())
            .await?
        {
            return Err(ChatError::Blocked);
        }

        // The store re-checks existence, exits and capacity in the same
        // transaction as the insert.
        match self.store.add_participant(room_id, user_id).await? {
            AddParticipant::Added { count } => {
                debug!("User {} joined room {} ({}/{})", user_id, room_id, count, room.capacity);
            }
            AddParticipant::AlreadyPresent => {}
            AddParticipant::Full => return Err(ChatError::RoomFull),
            AddParticipant::Exited => return Err(ChatError::ReentryForbidden),
            AddParticipant::RoomMissing => return Err(ChatError::NotFound("room")),
        }

        let activated = room.kind == RoomKind::Random && self.store.activate_if_full(room_id).await?;
        if activated {
            info!("Room {} is full and now active", room_id);
        }

        Ok(JoinResult {
            room: self.room(room_id).await?,
            newly_joined: true,
            activated,
        })
    }

    /// Leave a room. The phase is decided by the store against the room as
    /// it is when the exit is written, so a join that activates the room
    /// concurrently is never missed.
    pub async fn leave(&self, room_id: Uuid, user_id: Uuid) -> ChatResult<LeaveResult> {
        let (exit, torn_down) = match self.store.leave_room(room_id, user_id).await? {
            LeaveRoom::Left { exit, history } => (exit, history),
            LeaveRoom::NotParticipant => return Err(ChatError::NotParticipant),
            LeaveRoom::RoomMissing => return Err(ChatError::NotFound("room")),
        };

        debug!(
            "User {} left room {} during {} phase (torn down: {})",
            user_id,
            room_id,
            exit.phase,
            torn_down.is_some()
        );
        Ok(LeaveResult { exit, torn_down })
    }

    /// Roster members that have not left.
    pub async fn present_participants(&self, room_id: Uuid) -> ChatResult<Vec<Uuid>> {
        Ok(self.store.present_participants(room_id).await?)
    }

    pub async fn room(&self, room_id: Uuid) -> ChatResult<ChatRoom> {
        self.store
            .get_room(room_id)
            .await?
            .ok_or(ChatError::NotFound("room"))
    }
}
