use anyhow::Result;
use rusqlite::Connection;
use tracing::info;

pub fn run(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id          TEXT PRIMARY KEY,
            email       TEXT NOT NULL UNIQUE COLLATE NOCASE,
            password    TEXT NOT NULL,
            name        TEXT NOT NULL,
            avatar      TEXT,
            status      TEXT NOT NULL DEFAULT 'offline',
            last_seen   TEXT NOT NULL,
            created_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sessions (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL REFERENCES users(id),
            created_at  TEXT NOT NULL,
            expires_at  TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_sessions_user
            ON sessions(user_id);

        -- pair_key is the canonical unordered participant pair: one row per pair.
        -- message_seq is the last assigned message seq and never decreases.
        CREATE TABLE IF NOT EXISTS conversations (
            id                  TEXT PRIMARY KEY,
            pair_key            TEXT NOT NULL UNIQUE,
            participant_a       TEXT NOT NULL REFERENCES users(id),
            participant_b       TEXT NOT NULL REFERENCES users(id),
            name_a              TEXT NOT NULL,
            name_b              TEXT NOT NULL,
            last_message        TEXT,
            last_message_time   TEXT,
            last_message_sender TEXT,
            message_seq         INTEGER NOT NULL DEFAULT 0,
            created_at          TEXT NOT NULL,
            updated_at          TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_a
            ON conversations(participant_a, updated_at);

        CREATE INDEX IF NOT EXISTS idx_conversations_b
            ON conversations(participant_b, updated_at);

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            chat_id         TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            seq             INTEGER NOT NULL,
            sender_id       TEXT NOT NULL REFERENCES users(id),
            sender_name     TEXT NOT NULL,
            sender_avatar   TEXT,
            text            TEXT NOT NULL,
            created_at      TEXT NOT NULL,
            updated_at      TEXT,
            is_edited       INTEGER NOT NULL DEFAULT 0,
            UNIQUE(chat_id, seq)
        );
        ",
    )?;

    info!("Database migrations complete");
    Ok(())
}
