use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::OptionalExtension;

use crate::Database;
use crate::models::{SessionRow, format_ts};

impl Database {
    pub fn create_session(
        &self,
        id: &str,
        user_id: &str,
        created_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO sessions (id, user_id, created_at, expires_at) VALUES (?1, ?2, ?3, ?4)",
                (id, user_id, format_ts(created_at), format_ts(expires_at)),
            )?;
            Ok(())
        })
    }

    /// Returns the session if it exists, belongs to `user_id` and has not expired.
    pub fn get_active_session(
        &self,
        id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<SessionRow>> {
        self.with_conn(|conn| {
            let row = conn
                .query_row(
                    "SELECT id, user_id, created_at, expires_at FROM sessions
                     WHERE id = ?1 AND user_id = ?2 AND expires_at > ?3",
                    (id, user_id, format_ts(now)),
                    |row| {
                        Ok(SessionRow {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            created_at: row.get(2)?,
                            expires_at: row.get(3)?,
                        })
                    },
                )
                .optional()?;
            Ok(row)
        })
    }

    /// Returns false if the session was already gone.
    pub fn delete_session(&self, id: &str) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
            Ok(deleted == 1)
        })
    }

    pub fn purge_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let purged = conn.execute(
                "DELETE FROM sessions WHERE expires_at <= ?1",
                [format_ts(now)],
            )?;
            Ok(purged)
        })
    }
}
