use anyhow::Result;
use chrono::{DateTime, TimeDelta, Utc};
use rusqlite::{Connection, OptionalExtension};

use parley_types::ChatError;

use crate::Database;
use crate::conversations::query_conversation;
use crate::models::{ConversationRow, MessageRow, format_ts, parse_ts};

/// Longest `last_message` kept on a conversation, in characters.
pub const SNIPPET_MAX_CHARS: usize = 120;

pub struct NewMessage<'a> {
    pub id: &'a str,
    pub chat_id: &'a str,
    pub sender_id: &'a str,
    pub text: &'a str,
    pub now: DateTime<Utc>,
}

/// A window over one conversation's log.
///
/// With `after`, the page starts right after that seq. Otherwise it is the
/// newest page below `before` (or the newest page overall). Rows always come
/// back in ascending seq order.
#[derive(Debug, Clone, Copy)]
pub struct MessageRange {
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub limit: u32,
}

pub fn snippet(text: &str) -> String {
    let mut chars = text.chars();
    let head: String = chars.by_ref().take(SNIPPET_MAX_CHARS).collect();
    if chars.next().is_some() {
        format!("{}…", head)
    } else {
        head
    }
}

/// `now`, or one microsecond past `prev` if the clock has not moved beyond it.
fn strictly_after(now: DateTime<Utc>, prev: DateTime<Utc>) -> DateTime<Utc> {
    if now > prev {
        now
    } else {
        prev + TimeDelta::microseconds(1)
    }
}

impl Database {
    /// Append a message and update the conversation summary in one
    /// transaction. Assigns the next seq and a `created_at` strictly later
    /// than anything already in the conversation.
    pub fn append_message(&self, new: &NewMessage<'_>) -> Result<(MessageRow, ConversationRow)> {
        self.with_tx(|tx| {
            let conv = participant_conversation(tx, new.chat_id, new.sender_id)?;

            let (sender_name, sender_avatar): (String, Option<String>) = tx
                .query_row(
                    "SELECT name, avatar FROM users WHERE id = ?1",
                    [new.sender_id],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?
                .ok_or_else(|| ChatError::NotFound(format!("user {}", new.sender_id)))?;

            let created_at = format_ts(strictly_after(new.now, parse_ts(&conv.updated_at)?));
            let seq = conv.message_seq + 1;

            tx.execute(
                "INSERT INTO messages
                    (id, chat_id, seq, sender_id, sender_name, sender_avatar, text, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                rusqlite::params![
                    new.id,
                    new.chat_id,
                    seq,
                    new.sender_id,
                    sender_name,
                    sender_avatar,
                    new.text,
                    created_at
                ],
            )?;

            tx.execute(
                "UPDATE conversations
                 SET last_message = ?2, last_message_time = ?3, last_message_sender = ?4,
                     message_seq = ?5, updated_at = ?3
                 WHERE id = ?1",
                rusqlite::params![new.chat_id, snippet(new.text), created_at, new.sender_id, seq],
            )?;

            let message = query_message(tx, new.chat_id, new.id)?
                .ok_or_else(|| anyhow::anyhow!("message {} vanished after insert", new.id))?;
            let conv = query_conversation(tx, new.chat_id)?
                .ok_or_else(|| anyhow::anyhow!("conversation {} vanished", new.chat_id))?;
            Ok((message, conv))
        })
    }

    pub fn get_message(&self, chat_id: &str, message_id: &str) -> Result<Option<MessageRow>> {
        self.with_conn(|conn| query_message(conn, chat_id, message_id))
    }

    pub fn list_messages(&self, chat_id: &str, range: MessageRange) -> Result<Vec<MessageRow>> {
        self.with_conn(|conn| {
            let upper = range.before.unwrap_or(i64::MAX);

            let rows = if let Some(after) = range.after {
                let sql = format!(
                    "SELECT {} FROM messages
                     WHERE chat_id = ?1 AND seq > ?2 AND seq < ?3
                     ORDER BY seq ASC LIMIT ?4",
                    MessageRow::COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                stmt.query_map(
                    rusqlite::params![chat_id, after, upper, range.limit],
                    MessageRow::from_row,
                )?
                .collect::<std::result::Result<Vec<_>, _>>()?
            } else {
                let sql = format!(
                    "SELECT {} FROM messages
                     WHERE chat_id = ?1 AND seq < ?2
                     ORDER BY seq DESC LIMIT ?3",
                    MessageRow::COLUMNS
                );
                let mut stmt = conn.prepare(&sql)?;
                let mut rows = stmt
                    .query_map(rusqlite::params![chat_id, upper, range.limit], MessageRow::from_row)?
                    .collect::<std::result::Result<Vec<_>, _>>()?;
                rows.reverse();
                rows
            };

            Ok(rows)
        })
    }

    /// Replace a message's text. Only its sender may do this. If it is the
    /// newest message the conversation snippet follows; the returned
    /// conversation is `Some` only in that case.
    pub fn edit_message(
        &self,
        chat_id: &str,
        message_id: &str,
        editor_id: &str,
        text: &str,
        now: DateTime<Utc>,
    ) -> Result<(MessageRow, Option<ConversationRow>)> {
        self.with_tx(|tx| {
            let conv = participant_conversation(tx, chat_id, editor_id)?;
            let message = owned_message(tx, chat_id, message_id, editor_id)?;

            let edited_at = format_ts(strictly_after(now, parse_ts(&message.created_at)?));
            tx.execute(
                "UPDATE messages SET text = ?3, updated_at = ?4, is_edited = 1
                 WHERE chat_id = ?1 AND id = ?2",
                (chat_id, message_id, text, &edited_at),
            )?;

            let summary = if message.seq == newest_seq(tx, chat_id)?.unwrap_or(0) {
                let bumped = format_ts(strictly_after(now, parse_ts(&conv.updated_at)?));
                tx.execute(
                    "UPDATE conversations SET last_message = ?2, updated_at = ?3 WHERE id = ?1",
                    (chat_id, snippet(text), bumped),
                )?;
                query_conversation(tx, chat_id)?
            } else {
                None
            };

            let message = query_message(tx, chat_id, message_id)?
                .ok_or_else(|| anyhow::anyhow!("message {} vanished during edit", message_id))?;
            Ok((message, summary))
        })
    }

    /// Delete a message. Only its sender may do this. Deleting the newest
    /// message rebuilds the summary from the one before it (or clears it);
    /// the returned conversation is `Some` only in that case.
    pub fn delete_message(
        &self,
        chat_id: &str,
        message_id: &str,
        requester_id: &str,
        now: DateTime<Utc>,
    ) -> Result<(MessageRow, Option<ConversationRow>)> {
        self.with_tx(|tx| {
            let conv = participant_conversation(tx, chat_id, requester_id)?;
            let message = owned_message(tx, chat_id, message_id, requester_id)?;
            let was_newest = message.seq == newest_seq(tx, chat_id)?.unwrap_or(0);

            tx.execute(
                "DELETE FROM messages WHERE chat_id = ?1 AND id = ?2",
                (chat_id, message_id),
            )?;

            if !was_newest {
                return Ok((message, None));
            }

            let bumped = format_ts(strictly_after(now, parse_ts(&conv.updated_at)?));
            let sql = format!(
                "SELECT {} FROM messages WHERE chat_id = ?1 ORDER BY seq DESC LIMIT 1",
                MessageRow::COLUMNS
            );
            let previous = tx.query_row(&sql, [chat_id], MessageRow::from_row).optional()?;

            match previous {
                Some(prev) => tx.execute(
                    "UPDATE conversations
                     SET last_message = ?2, last_message_time = ?3, last_message_sender = ?4,
                         updated_at = ?5
                     WHERE id = ?1",
                    rusqlite::params![
                        chat_id,
                        snippet(&prev.text),
                        prev.created_at,
                        prev.sender_id,
                        bumped
                    ],
                )?,
                None => tx.execute(
                    "UPDATE conversations
                     SET last_message = NULL, last_message_time = NULL, last_message_sender = NULL,
                         updated_at = ?2
                     WHERE id = ?1",
                    (chat_id, bumped),
                )?,
            };

            Ok((message, query_conversation(tx, chat_id)?))
        })
    }
}

/// Load a conversation and require `user_id` to take part in it.
fn participant_conversation(
    conn: &Connection,
    chat_id: &str,
    user_id: &str,
) -> Result<ConversationRow> {
    let conv = query_conversation(conn, chat_id)?
        .ok_or_else(|| ChatError::NotFound(format!("conversation {}", chat_id)))?;
    if !conv.has_participant(user_id) {
        return Err(ChatError::Forbidden("not a participant".to_string()).into());
    }
    Ok(conv)
}

/// Load a message and require `user_id` to be its sender.
fn owned_message(
    conn: &Connection,
    chat_id: &str,
    message_id: &str,
    user_id: &str,
) -> Result<MessageRow> {
    let message = query_message(conn, chat_id, message_id)?
        .ok_or_else(|| ChatError::NotFound(format!("message {}", message_id)))?;
    if message.sender_id != user_id {
        return Err(ChatError::Forbidden("only the sender may change a message".to_string()).into());
    }
    Ok(message)
}

fn query_message(conn: &Connection, chat_id: &str, message_id: &str) -> Result<Option<MessageRow>> {
    let sql = format!(
        "SELECT {} FROM messages WHERE chat_id = ?1 AND id = ?2",
        MessageRow::COLUMNS
    );
    Ok(conn
        .query_row(&sql, (chat_id, message_id), MessageRow::from_row)
        .optional()?)
}

fn newest_seq(conn: &Connection, chat_id: &str) -> Result<Option<i64>> {
    let seq = conn.query_row(
        "SELECT MAX(seq) FROM messages WHERE chat_id = ?1",
        [chat_id],
        |row| row.get::<_, Option<i64>>(0),
    )?;
    Ok(seq)
}
