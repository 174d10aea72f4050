use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id              TEXT PRIMARY KEY,
            display_name    TEXT NOT NULL,
            gender          TEXT NOT NULL,
            age_group       TEXT NOT NULL,
            created_at      TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS user_blocks (
            user_id         TEXT NOT NULL,
            blocked_user_id TEXT NOT NULL,
            created_at      TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (user_id, blocked_user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_user_blocks_blocked
            ON user_blocks(blocked_user_id);

        CREATE TABLE IF NOT EXISTS chat_rooms (
            id                  TEXT PRIMARY KEY,
            capacity            INTEGER NOT NULL CHECK (capacity >= 2),
            kind                TEXT NOT NULL,
            gender_preference   TEXT,
            age_group           TEXT,
            status              TEXT NOT NULL,
            is_active           INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            CHECK (kind != 'random' OR age_group IS NOT NULL)
        );

        CREATE TABLE IF NOT EXISTS room_participants (
            room_id     TEXT NOT NULL REFERENCES chat_rooms(id) ON DELETE CASCADE,
            user_id     TEXT NOT NULL,
            position    INTEGER NOT NULL,
            PRIMARY KEY (room_id, user_id)
        );

        -- Rows are removed together with their room at teardown.
        CREATE TABLE IF NOT EXISTS chat_room_exits (
            room_id     TEXT NOT NULL,
            user_id     TEXT NOT NULL,
            phase       TEXT NOT NULL,
            left_at     TEXT NOT NULL,
            PRIMARY KEY (room_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS chat_messages (
            seq             INTEGER PRIMARY KEY AUTOINCREMENT,
            id              TEXT NOT NULL UNIQUE,
            room_id         TEXT NOT NULL,
            sender_id       TEXT,
            is_encrypted    INTEGER NOT NULL,
            text            TEXT,
            ciphertext      TEXT,
            iv              TEXT,
            tag             TEXT,
            sent_at         TEXT NOT NULL,
            is_deleted      INTEGER NOT NULL DEFAULT 0,
            is_system       INTEGER NOT NULL DEFAULT 0,
            CHECK (
                (is_encrypted = 0 AND text IS NOT NULL)
                OR (is_encrypted = 1 AND ciphertext IS NOT NULL AND iv IS NOT NULL AND tag IS NOT NULL)
            )
        );

        CREATE INDEX IF NOT EXISTS idx_chat_messages_room
            ON chat_messages(room_id, sent_at);

        CREATE TABLE IF NOT EXISTS room_reads (
            room_id         TEXT NOT NULL,
            user_id         TEXT NOT NULL,
            last_read_at    TEXT NOT NULL,
            PRIMARY KEY (room_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS chat_room_history (
            id                  INTEGER PRIMARY KEY AUTOINCREMENT,
            original_room_id    TEXT NOT NULL UNIQUE,
            timestamp           TEXT NOT NULL,
            meta                TEXT NOT NULL
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
