use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use parley_types::ChatError;

use crate::Database;
use crate::models::{ConversationRow, format_ts};

pub struct NewConversation<'a> {
    pub id: &'a str,
    pub pair_key: &'a str,
    pub creator_id: &'a str,
    pub creator_name: &'a str,
    pub other_id: &'a str,
    pub other_name: &'a str,
    pub now: DateTime<Utc>,
}

impl Database {
    /// Insert a conversation unless one already exists for the pair key.
    /// Returns the stored row and whether this call created it.
    pub fn find_or_create_conversation(
        &self,
        new: &NewConversation<'_>,
    ) -> Result<(ConversationRow, bool)> {
        self.with_tx(|tx| {
            let now = format_ts(new.now);
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO conversations
                    (id, pair_key, participant_a, participant_b, name_a, name_b, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                (
                    new.id,
                    new.pair_key,
                    new.creator_id,
                    new.other_id,
                    new.creator_name,
                    new.other_name,
                    &now,
                ),
            )?;

            let sql = format!(
                "SELECT {} FROM conversations WHERE pair_key = ?1",
                ConversationRow::COLUMNS
            );
            let row = tx.query_row(&sql, [new.pair_key], ConversationRow::from_row)?;
            Ok((row, inserted == 1))
        })
    }

    pub fn get_conversation(&self, id: &str) -> Result<Option<ConversationRow>> {
        self.with_conn(|conn| query_conversation(conn, id))
    }

    /// Conversations the user takes part in, most recently updated first.
    pub fn list_conversations_for(&self, user_id: &str) -> Result<Vec<ConversationRow>> {
        self.with_conn(|conn| query_conversations_for(conn, user_id))
    }

    /// Delete a conversation and, through the foreign key, its messages.
    pub fn delete_conversation(&self, id: &str, requester_id: &str) -> Result<ConversationRow> {
        self.with_tx(|tx| {
            let row = query_conversation(tx, id)?
                .ok_or_else(|| ChatError::NotFound(format!("conversation {}", id)))?;
            if !row.has_participant(requester_id) {
                return Err(ChatError::Forbidden("not a participant".to_string()).into());
            }

            tx.execute("DELETE FROM conversations WHERE id = ?1", [id])?;
            Ok(row)
        })
    }

    /// Ids of everyone who shares a conversation with `user_id`.
    pub fn conversation_partners(&self, user_id: &str) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT participant_b FROM conversations WHERE participant_a = ?1
                 UNION
                 SELECT participant_a FROM conversations WHERE participant_b = ?1",
            )?;
            let ids = stmt
                .query_map([user_id], |row| row.get::<_, String>(0))?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }
}

pub(crate) fn query_conversation(conn: &Connection, id: &str) -> Result<Option<ConversationRow>> {
    let sql = format!("SELECT {} FROM conversations WHERE id = ?1", ConversationRow::COLUMNS);
    Ok(conn.query_row(&sql, [id], ConversationRow::from_row).optional()?)
}

pub(crate) fn query_conversations_for(
    conn: &Connection,
    user_id: &str,
) -> Result<Vec<ConversationRow>> {
    let sql = format!(
        "SELECT {} FROM conversations
         WHERE participant_a = ?1 OR participant_b = ?1
         ORDER BY updated_at DESC, created_at DESC, id",
        ConversationRow::COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map([user_id], ConversationRow::from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}
