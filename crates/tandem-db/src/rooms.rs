use anyhow::{Context, Result};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info};
use uuid::Uuid;

use tandem_types::models::{ChatRoom, ChatRoomExit, ChatRoomHistory, RoomPhase, now};

use crate::Database;
use crate::models::{AddParticipant, LeaveRoom, RoomRow, parse_id, parse_ts, ts};

impl Database {
    // -- Rooms --

    /// Insert a room together with its initial roster, in roster order.
    pub fn insert_room(&self, room: &ChatRoom) -> Result<()> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            tx.execute(
                "INSERT INTO chat_rooms (id, capacity, kind, gender_preference, age_group, status, is_active, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    room.id.to_string(),
                    room.capacity,
                    room.kind.as_str(),
                    room.gender_preference.map(|p| p.as_str()),
                    room.age_group.map(|a| a.as_str()),
                    room.status.as_str(),
                    room.is_active,
                    ts(&room.created_at),
                ],
            )?;
            for (position, user_id) in room.participant_ids.iter().enumerate() {
                tx.execute(
                    "INSERT INTO room_participants (room_id, user_id, position) VALUES (?1, ?2, ?3)",
                    rusqlite::params![room.id.to_string(), user_id.to_string(), position as i64],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
    }

    pub fn get_room(&self, room_id: Uuid) -> Result<Option<ChatRoom>> {
        let found = self.with_conn(|conn| {
            let Some(row) = query_room_row(conn, room_id)? else {
                return Ok(None);
            };
            let participants = query_participants(conn, room_id)?;
            Ok(Some((row, participants)))
        })?;

        match found {
            Some((row, participants)) => Ok(Some(row.into_room(participants)?)),
            None => Ok(None),
        }
    }

    /// Append `user_id` to the roster if the room exists, has a free slot,
    /// and the user never left it. Checks and insert share one transaction.
    pub fn add_participant(&self, room_id: Uuid, user_id: Uuid) -> Result<AddParticipant> {
        self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let rid = room_id.to_string();
            let uid = user_id.to_string();

            let capacity: Option<i64> = tx
                .query_row("SELECT capacity FROM chat_rooms WHERE id = ?1", [&rid], |row| {
                    row.get(0)
                })
                .optional()?;
            let Some(capacity) = capacity else {
                return Ok(AddParticipant::RoomMissing);
            };

            let exited: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM chat_room_exits WHERE room_id = ?1 AND user_id = ?2)",
                [&rid, &uid],
                |row| row.get(0),
            )?;
            if exited {
                return Ok(AddParticipant::Exited);
            }

            let present: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM room_participants WHERE room_id = ?1 AND user_id = ?2)",
                [&rid, &uid],
                |row| row.get(0),
            )?;
            if present {
                return Ok(AddParticipant::AlreadyPresent);
            }

            let (count, next_position): (i64, i64) = tx.query_row(
                "SELECT COUNT(*), COALESCE(MAX(position) + 1, 0) FROM room_participants WHERE room_id = ?1",
                [&rid],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            if count >= capacity {
                return Ok(AddParticipant::Full);
            }

            tx.execute(
                "INSERT INTO room_participants (room_id, user_id, position) VALUES (?1, ?2, ?3)",
                rusqlite::params![rid, uid, next_position],
            )?;
            tx.commit()?;

            Ok(AddParticipant::Added {
                count: count as usize + 1,
            })
        })
    }

    /// Flip a full random room from waiting to active. No-op (false) unless
    /// the roster count equals capacity at the moment of the update.
    pub fn activate_if_full(&self, room_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE chat_rooms SET status = 'active', is_active = 1
                 WHERE id = ?1
                   AND kind = 'random'
                   AND status = 'waiting'
                   AND capacity = (SELECT COUNT(*) FROM room_participants WHERE room_id = ?1)",
                [room_id.to_string()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Accept a waiting friend room. No-op (false) until the invitee is on
    /// the roster, so the inviter alone cannot open it.
    pub fn activate_room(&self, room_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE chat_rooms SET status = 'active', is_active = 1
                 WHERE id = ?1
                   AND kind = 'friend'
                   AND status = 'waiting'
                   AND capacity = (SELECT COUNT(*) FROM room_participants WHERE room_id = ?1)",
                [room_id.to_string()],
            )?;
            Ok(changed == 1)
        })
    }

    /// Ids of participants who have not left, in roster order.
    pub fn present_participants(&self, room_id: Uuid) -> Result<Vec<Uuid>> {
        let raw: Vec<String> = self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT p.user_id FROM room_participants p
                 WHERE p.room_id = ?1
                   AND NOT EXISTS (
                       SELECT 1 FROM chat_room_exits e
                       WHERE e.room_id = p.room_id AND e.user_id = p.user_id
                   )
                 ORDER BY p.position",
            )?;
            let ids = stmt
                .query_map([room_id.to_string()], |row| row.get(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })?;
        raw.iter().map(|id| parse_id(id)).collect()
    }

    // -- Exits --

    pub fn has_exited(&self, room_id: Uuid, user_id: Uuid) -> Result<bool> {
        self.with_conn(|conn| {
            let exited = conn.query_row(
                "SELECT EXISTS (SELECT 1 FROM chat_room_exits WHERE room_id = ?1 AND user_id = ?2)",
                [room_id.to_string(), user_id.to_string()],
                |row| row.get(0),
            )?;
            Ok(exited)
        })
    }

    /// Upsert the exit record for (room, user). The stored phase only ever
    /// escalates from waiting to active. Returns the record as now stored.
    pub fn record_exit(&self, room_id: Uuid, user_id: Uuid, phase: RoomPhase) -> Result<ChatRoomExit> {
        self.with_conn(|conn| upsert_exit(conn, room_id, user_id, phase))
    }

    pub fn count_exits(&self, room_id: Uuid, phase: RoomPhase) -> Result<usize> {
        self.with_conn(|conn| count_exits_in(conn, &room_id.to_string(), phase))
    }

    /// Leave a room in one transaction. The exit phase is the room's status
    /// as stored at that moment, not as the caller last saw it. A waiting
    /// leave frees the slot and archives the room once nobody remains; an
    /// active leave keeps the roster and archives once `capacity` exits are
    /// recorded.
    pub fn leave_room(&self, room_id: Uuid, user_id: Uuid) -> Result<LeaveRoom> {
        let outcome = self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let rid = room_id.to_string();
            let uid = user_id.to_string();

            let room: Option<(i64, String)> = tx
                .query_row(
                    "SELECT capacity, status FROM chat_rooms WHERE id = ?1",
                    [&rid],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((capacity, status)) = room else {
                return Ok(LeaveRoom::RoomMissing);
            };
            let phase = status.parse::<RoomPhase>()?;

            let present: bool = tx.query_row(
                "SELECT EXISTS (SELECT 1 FROM room_participants WHERE room_id = ?1 AND user_id = ?2)",
                [&rid, &uid],
                |row| row.get(0),
            )?;
            if !present {
                return Ok(LeaveRoom::NotParticipant);
            }

            let exit = upsert_exit(&tx, room_id, user_id, phase)?;
            let teardown_due = match phase {
                RoomPhase::Waiting => {
                    tx.execute(
                        "DELETE FROM room_participants WHERE room_id = ?1 AND user_id = ?2",
                        [&rid, &uid],
                    )?;
                    let remaining: i64 = tx.query_row(
                        "SELECT COUNT(*) FROM room_participants WHERE room_id = ?1",
                        [&rid],
                        |row| row.get(0),
                    )?;
                    remaining == 0
                }
                RoomPhase::Active => {
                    count_exits_in(&tx, &rid, RoomPhase::Active)? >= capacity as usize
                }
            };

            let history = if teardown_due {
                archive_room(&tx, room_id)?
            } else {
                None
            };
            tx.commit()?;
            Ok(LeaveRoom::Left { exit, history })
        })?;

        if let LeaveRoom::Left { history: Some(_), .. } = &outcome {
            info!("Room {} torn down and archived", room_id);
        }
        Ok(outcome)
    }

    // -- Teardown --

    /// Archive and remove a room in one transaction: write the history
    /// snapshot, soft-delete its messages, drop the live room, its roster,
    /// exits and read markers. Returns `None` if the room was already gone,
    /// so racing callers tear down at most once.
    pub fn teardown_room(&self, room_id: Uuid) -> Result<Option<ChatRoomHistory>> {
        let history = self.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let history = archive_room(&tx, room_id)?;
            tx.commit()?;
            Ok(history)
        })?;
        if history.is_some() {
            info!("Room {} torn down and archived", room_id);
        }
        Ok(history)
    }

    pub fn get_room_history(&self, original_room_id: Uuid) -> Result<Option<ChatRoomHistory>> {
        let row: Option<(String, String)> = self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT timestamp, meta FROM chat_room_history WHERE original_room_id = ?1",
                    [original_room_id.to_string()],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            Ok(row)
        })?;

        let Some((timestamp, meta)) = row else {
            return Ok(None);
        };
        Ok(Some(ChatRoomHistory {
            original_room_id,
            timestamp: parse_ts(&timestamp)?,
            meta: serde_json::from_str(&meta).context("corrupt room history meta")?,
        }))
    }
}

/// The stored phase only ever escalates from waiting to active.
fn upsert_exit(conn: &Connection, room_id: Uuid, user_id: Uuid, phase: RoomPhase) -> Result<ChatRoomExit> {
    let rid = room_id.to_string();
    let uid = user_id.to_string();
    conn.execute(
        "INSERT INTO chat_room_exits (room_id, user_id, phase, left_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT (room_id, user_id) DO UPDATE SET
             phase = CASE WHEN chat_room_exits.phase = 'active' THEN 'active' ELSE excluded.phase END,
             left_at = excluded.left_at",
        rusqlite::params![rid, uid, phase.as_str(), ts(&now())],
    )?;
    let (stored_phase, left_at): (String, String) = conn.query_row(
        "SELECT phase, left_at FROM chat_room_exits WHERE room_id = ?1 AND user_id = ?2",
        [&rid, &uid],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(ChatRoomExit {
        room_id,
        user_id,
        left_at: parse_ts(&left_at)?,
        phase: stored_phase.parse::<RoomPhase>()?,
    })
}

fn count_exits_in(conn: &Connection, rid: &str, phase: RoomPhase) -> Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM chat_room_exits WHERE room_id = ?1 AND phase = ?2",
        [rid, phase.as_str()],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

/// Write the history snapshot, soft-delete the room's messages, drop the
/// live room with its roster, exits and read markers. Runs inside the
/// caller's transaction. `None` if the room was already gone, so racing
/// callers archive at most once.
fn archive_room(conn: &Connection, room_id: Uuid) -> Result<Option<ChatRoomHistory>> {
    let Some(row) = query_room_row(conn, room_id)? else {
        return Ok(None);
    };
    let participants = query_participants(conn, room_id)?;
    let room = row.into_room(participants)?;
    let history = ChatRoomHistory::snapshot(&room);
    let rid = room_id.to_string();

    conn.execute(
        "INSERT INTO chat_room_history (original_room_id, timestamp, meta) VALUES (?1, ?2, ?3)",
        rusqlite::params![
            rid,
            ts(&history.timestamp),
            serde_json::to_string(&history.meta)?,
        ],
    )?;
    let soft_deleted = conn.execute(
        "UPDATE chat_messages SET is_deleted = 1 WHERE room_id = ?1 AND is_deleted = 0",
        [&rid],
    )?;
    conn.execute("DELETE FROM room_participants WHERE room_id = ?1", [&rid])?;
    conn.execute("DELETE FROM chat_rooms WHERE id = ?1", [&rid])?;
    conn.execute("DELETE FROM chat_room_exits WHERE room_id = ?1", [&rid])?;
    conn.execute("DELETE FROM room_reads WHERE room_id = ?1", [&rid])?;

    debug!("Soft-deleted {} messages of room {}", soft_deleted, room_id);
    Ok(Some(history))
}

fn query_room_row(conn: &Connection, room_id: Uuid) -> Result<Option<RoomRow>> {
    let row = conn
        .query_row(
            "SELECT id, capacity, kind, gender_preference, age_group, status, is_active, created_at
             FROM chat_rooms WHERE id = ?1",
            [room_id.to_string()],
            |row| {
                Ok(RoomRow {
                    id: row.get(0)?,
                    capacity: row.get(1)?,
                    kind: row.get(2)?,
                    gender_preference: row.get(3)?,
                    age_group: row.get(4)?,
                    status: row.get(5)?,
                    is_active: row.get(6)?,
                    created_at: row.get(7)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

fn query_participants(conn: &Connection, room_id: Uuid) -> Result<Vec<Uuid>> {
    let mut stmt = conn.prepare(
        "SELECT user_id FROM room_participants WHERE room_id = ?1 ORDER BY position",
    )?;
    let raw = stmt
        .query_map([room_id.to_string()], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    raw.iter().map(|id| parse_id(id)).collect()
}
