use anyhow::Result;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension};

use parley_types::ChatError;
use parley_types::models::PresenceStatus;

use crate::Database;
use crate::error::is_unique_violation;
use crate::models::{ConversationRow, UserRow, format_ts};

pub struct NewUser<'a> {
    pub id: &'a str,
    pub email: &'a str,
    pub password_hash: &'a str,
    pub name: &'a str,
    pub status: PresenceStatus,
    pub now: DateTime<Utc>,
}

impl Database {
    /// Insert a user. A case-insensitive email clash yields `DuplicateEmail`.
    pub fn create_user(&self, user: &NewUser<'_>) -> Result<UserRow> {
        self.with_conn(|conn| {
            let now = format_ts(user.now);
            let inserted = conn.execute(
                "INSERT INTO users (id, email, password, name, status, last_seen, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)",
                (user.id, user.email, user.password_hash, user.name, user.status.as_str(), &now),
            );

            match inserted {
                Ok(_) => {}
                Err(e) if is_unique_violation(&e) => return Err(ChatError::DuplicateEmail.into()),
                Err(e) => return Err(e.into()),
            }

            query_user_by_id(conn, user.id)?
                .ok_or_else(|| anyhow::anyhow!("user {} vanished after insert", user.id))
        })
    }

    pub fn get_user_by_email(&self, email: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM users WHERE email = ?1", UserRow::COLUMNS);
            Ok(conn.query_row(&sql, [email], UserRow::from_row).optional()?)
        })
    }

    pub fn get_user_by_id(&self, id: &str) -> Result<Option<UserRow>> {
        self.with_conn(|conn| query_user_by_id(conn, id))
    }

    /// Returns false if no such user exists.
    pub fn set_user_status(
        &self,
        id: &str,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    ) -> Result<bool> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET status = ?2, last_seen = ?3 WHERE id = ?1",
                (id, status.as_str(), format_ts(last_seen)),
            )?;
            Ok(changed == 1)
        })
    }

    /// Rename a user and refresh the cached participant names of every
    /// conversation they are in. `avatar: None` keeps the current avatar.
    pub fn update_profile(
        &self,
        id: &str,
        name: &str,
        avatar: Option<&str>,
    ) -> Result<Option<(UserRow, Vec<ConversationRow>)>> {
        self.with_tx(|tx| {
            let changed = match avatar {
                Some(avatar) => tx.execute(
                    "UPDATE users SET name = ?2, avatar = ?3 WHERE id = ?1",
                    (id, name, avatar),
                )?,
                None => tx.execute("UPDATE users SET name = ?2 WHERE id = ?1", (id, name))?,
            };
            if changed == 0 {
                return Ok(None);
            }

            tx.execute(
                "UPDATE conversations SET name_a = ?2 WHERE participant_a = ?1",
                (id, name),
            )?;
            tx.execute(
                "UPDATE conversations SET name_b = ?2 WHERE participant_b = ?1",
                (id, name),
            )?;

            let user = query_user_by_id(tx, id)?
                .ok_or_else(|| anyhow::anyhow!("user {} vanished during update", id))?;
            let conversations = crate::conversations::query_conversations_for(tx, id)?;
            Ok(Some((user, conversations)))
        })
    }

    /// Nobody is connected right after startup, whatever the table says.
    pub fn mark_all_offline(&self, now: DateTime<Utc>) -> Result<usize> {
        self.with_conn(|conn| {
            let changed = conn.execute(
                "UPDATE users SET status = 'offline', last_seen = ?1 WHERE status != 'offline'",
                [format_ts(now)],
            )?;
            Ok(changed)
        })
    }

    /// Case-insensitive substring match on name or email, excluding `exclude_id`.
    pub fn search_users(&self, query: &str, exclude_id: &str, limit: u32) -> Result<Vec<UserRow>> {
        self.with_conn(|conn| {
            let sql = format!(
                "SELECT {} FROM users
                 WHERE id != ?2
                   AND (instr(lower(name), lower(?1)) > 0 OR instr(lower(email), lower(?1)) > 0)
                 ORDER BY name COLLATE NOCASE, id
                 LIMIT ?3",
                UserRow::COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(rusqlite::params![query, exclude_id, limit], UserRow::from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(rows)
        })
    }
}

fn query_user_by_id(conn: &Connection, id: &str) -> Result<Option<UserRow>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?1", UserRow::COLUMNS);
    Ok(conn.query_row(&sql, [id], UserRow::from_row).optional()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::now;

    fn insert(db: &Database, id: &str, email: &str, name: &str) -> Result<UserRow> {
        db.create_user(&NewUser {
            id,
            email,
            password_hash: "hash",
            name,
            status: PresenceStatus::Online,
            now: now(),
        })
    }

    #[test]
    fn duplicate_email_is_case_insensitive() {
        let db = Database::open_in_memory().unwrap();
        insert(&db, "u1", "Ann@Example.com", "Ann").unwrap();

        let err = insert(&db, "u2", "ann@example.COM", "Other").unwrap_err();
        assert_eq!(crate::classify(err), ChatError::DuplicateEmail);

        let found = db.get_user_by_email("ANN@example.com").unwrap().unwrap();
        assert_eq!(found.id, "u1");
    }

    #[test]
    fn search_matches_name_or_email_and_excludes_caller() {
        let db = Database::open_in_memory().unwrap();
        insert(&db, "u1", "ann@example.com", "Ann Lee").unwrap();
        insert(&db, "u2", "bob@example.com", "Bob Annex").unwrap();
        insert(&db, "u3", "carol@elsewhere.org", "Carol").unwrap();

        let hits = db.search_users("ANN", "u1", 50).unwrap();
        let ids: Vec<_> = hits.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u2"]);

        let hits = db.search_users("example", "u3", 50).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn update_profile_keeps_avatar_when_omitted() {
        let db = Database::open_in_memory().unwrap();
        insert(&db, "u1", "ann@example.com", "Ann").unwrap();

        let (user, _) = db.update_profile("u1", "Ann", Some("a.png")).unwrap().unwrap();
        assert_eq!(user.avatar.as_deref(), Some("a.png"));

        let (user, _) = db.update_profile("u1", "Annie", None).unwrap().unwrap();
        assert_eq!(user.name, "Annie");
        assert_eq!(user.avatar.as_deref(), Some("a.png"));

        assert!(db.update_profile("missing", "X", None).unwrap().is_none());
    }

    #[test]
    fn mark_all_offline_resets_stale_status() {
        let db = Database::open_in_memory().unwrap();
        insert(&db, "u1", "ann@example.com", "Ann").unwrap();
        insert(&db, "u2", "bob@example.com", "Bob").unwrap();

        assert_eq!(db.mark_all_offline(now()).unwrap(), 2);
        assert_eq!(db.get_user_by_id("u1").unwrap().unwrap().status, "offline");
        assert_eq!(db.mark_all_offline(now()).unwrap(), 0);
    }
}
