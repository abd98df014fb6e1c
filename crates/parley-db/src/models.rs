//! Database row types. These map directly to SQLite rows and are converted
//! into `parley-types` models at the edge of this crate.

use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use rusqlite::Row;
use uuid::Uuid;

use parley_types::models::{Conversation, Message, PresenceStatus, User};

/// Current time at the precision the database stores.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

/// Fixed-width RFC 3339 with microseconds, so text order is time order.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_ts(raw: &str) -> Result<DateTime<Utc>> {
    let ts = DateTime::parse_from_rfc3339(raw)
        .with_context(|| format!("corrupt timestamp '{}'", raw))?;
    Ok(ts.with_timezone(&Utc))
}

fn parse_id(raw: &str) -> Result<Uuid> {
    raw.parse().with_context(|| format!("corrupt id '{}'", raw))
}

#[derive(Debug)]
pub struct UserRow {
    pub id: String,
    pub email: String,
    pub password: String,
    pub name: String,
    pub avatar: Option<String>,
    pub status: String,
    pub last_seen: String,
    pub created_at: String,
}

impl UserRow {
    pub const COLUMNS: &'static str =
        "id, email, password, name, avatar, status, last_seen, created_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            email: row.get(1)?,
            password: row.get(2)?,
            name: row.get(3)?,
            avatar: row.get(4)?,
            status: row.get(5)?,
            last_seen: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    pub fn into_user(self) -> Result<User> {
        Ok(User {
            id: parse_id(&self.id)?,
            status: PresenceStatus::parse(&self.status).unwrap_or(PresenceStatus::Offline),
            last_seen: parse_ts(&self.last_seen)?,
            created_at: parse_ts(&self.created_at)?,
            email: self.email,
            name: self.name,
            avatar: self.avatar,
        })
    }
}

pub struct SessionRow {
    pub id: String,
    pub user_id: String,
    pub created_at: String,
    pub expires_at: String,
}

#[derive(Debug)]
pub struct ConversationRow {
    pub id: String,
    pub participant_a: String,
    pub participant_b: String,
    pub name_a: String,
    pub name_b: String,
    pub last_message: Option<String>,
    pub last_message_time: Option<String>,
    pub last_message_sender: Option<String>,
    pub message_seq: i64,
    pub created_at: String,
    pub updated_at: String,
}

impl ConversationRow {
    pub const COLUMNS: &'static str = "id, participant_a, participant_b, name_a, name_b, \
         last_message, last_message_time, last_message_sender, message_seq, created_at, updated_at";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            participant_a: row.get(1)?,
            participant_b: row.get(2)?,
            name_a: row.get(3)?,
            name_b: row.get(4)?,
            last_message: row.get(5)?,
            last_message_time: row.get(6)?,
            last_message_sender: row.get(7)?,
            message_seq: row.get(8)?,
            created_at: row.get(9)?,
            updated_at: row.get(10)?,
        })
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participant_a == user_id || self.participant_b == user_id
    }

    pub fn into_conversation(self) -> Result<Conversation> {
        Ok(Conversation {
            id: parse_id(&self.id)?,
            participants: [parse_id(&self.participant_a)?, parse_id(&self.participant_b)?],
            participant_names: [self.name_a, self.name_b],
            last_message: self.last_message,
            last_message_time: self.last_message_time.as_deref().map(parse_ts).transpose()?,
            last_message_sender: self.last_message_sender.as_deref().map(parse_id).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
        })
    }
}

#[derive(Debug)]
pub struct MessageRow {
    pub id: String,
    pub chat_id: String,
    pub seq: i64,
    pub sender_id: String,
    pub sender_name: String,
    pub sender_avatar: Option<String>,
    pub text: String,
    pub created_at: String,
    pub updated_at: Option<String>,
    pub is_edited: bool,
}

impl MessageRow {
    pub const COLUMNS: &'static str = "id, chat_id, seq, sender_id, sender_name, sender_avatar, \
         text, created_at, updated_at, is_edited";

    pub fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            chat_id: row.get(1)?,
            seq: row.get(2)?,
            sender_id: row.get(3)?,
            sender_name: row.get(4)?,
            sender_avatar: row.get(5)?,
            text: row.get(6)?,
            created_at: row.get(7)?,
            updated_at: row.get(8)?,
            is_edited: row.get(9)?,
        })
    }

    pub fn into_message(self) -> Result<Message> {
        Ok(Message {
            id: parse_id(&self.id)?,
            chat_id: parse_id(&self.chat_id)?,
            seq: self.seq,
            sender_id: parse_id(&self.sender_id)?,
            sender_name: self.sender_name,
            sender_avatar: self.sender_avatar,
            text: self.text,
            created_at: parse_ts(&self.created_at)?,
            updated_at: self.updated_at.as_deref().map(parse_ts).transpose()?,
            is_edited: self.is_edited,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamps_sort_as_text() {
        let earlier = parse_ts("2026-01-01T00:00:00.000001Z").unwrap();
        let later = parse_ts("2026-01-01T00:00:00.000010Z").unwrap();
        assert!(format_ts(earlier) < format_ts(later));
        assert_eq!(format_ts(earlier), "2026-01-01T00:00:00.000001Z");
    }

    #[test]
    fn now_round_trips_exactly() {
        let ts = now();
        assert_eq!(parse_ts(&format_ts(ts)).unwrap(), ts);
    }

    #[test]
    fn corrupt_timestamp_is_an_error() {
        assert!(parse_ts("2026-01-01 00:00:00").is_err());
    }
}
