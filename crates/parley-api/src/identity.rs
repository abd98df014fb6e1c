use std::sync::Arc;

use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use tracing::{error, info};
use uuid::Uuid;

use parley_db::Store;
use parley_db::models::now;
use parley_db::users::NewUser;
use parley_gateway::{ConversationLocks, SessionManager};
use parley_types::ChatError;
use parley_types::api::{AuthResponse, Claims};
use parley_types::models::{PresenceStatus, User};

use crate::conversations::{into_conversation, publish_summary};

pub const MIN_NAME_CHARS: usize = 2;
pub const MAX_NAME_CHARS: usize = 64;
pub const MIN_PASSWORD_CHARS: usize = 6;
pub const SEARCH_LIMIT: u32 = 20;

/// Accounts, credentials, sessions and profile data.
pub struct IdentityStore {
    store: Store,
    sessions: SessionManager,
    locks: Arc<ConversationLocks>,
}

impl IdentityStore {
    pub fn new(store: Store, sessions: SessionManager, locks: Arc<ConversationLocks>) -> Self {
        Self { store, sessions, locks }
    }

    /// Create an account and sign it in. The new user starts online.
    pub async fn register(&self, email: &str, password: &str, name: &str) -> Result<AuthResponse, ChatError> {
        let email = validate_email(email)?;
        let name = validate_name(name)?;
        if password.chars().count() < MIN_PASSWORD_CHARS {
            return Err(ChatError::InvalidArgument(format!(
                "password must be at least {} characters",
                MIN_PASSWORD_CHARS
            )));
        }

        let password_hash = hash_password(password.to_string()).await?;
        let id = Uuid::new_v4().to_string();

        let row = self
            .store
            .write(move |db| {
                db.create_user(&NewUser {
                    id: &id,
                    email: &email,
                    password_hash: &password_hash,
                    name: &name,
                    status: PresenceStatus::Online,
                    now: now(),
                })
            })
            .await?;
        let user = row.into_user().map_err(internal)?;

        info!("Registered {} ({})", user.name, user.id);

        let token = self.open_session(user.id).await?;
        Ok(AuthResponse { user, token })
    }

    /// Check credentials, open a session and mark the user online.
    pub async fn authenticate(&self, email: &str, password: &str) -> Result<AuthResponse, ChatError> {
        let email = email.trim().to_string();
        let row = self
            .store
            .read(move |db| db.get_user_by_email(&email))
            .await?
            .ok_or(ChatError::InvalidCredentials)?;

        if !verify_password(password.to_string(), row.password.clone()).await? {
            return Err(ChatError::InvalidCredentials);
        }

        let user = row.into_user().map_err(internal)?;
        let token = self.open_session(user.id).await?;
        let user = self
            .sessions
            .set_presence(user.id, PresenceStatus::Online)
            .await?
            .unwrap_or(user);

        info!("{} ({}) logged in", user.name, user.id);
        Ok(AuthResponse { user, token })
    }

    /// Revoke the session behind `claims`. Its sockets are closed and, if
    /// nothing else keeps the user connected, the user goes offline.
    pub async fn logout(&self, claims: &Claims) -> Result<(), ChatError> {
        let sid = claims.sid.to_string();
        self.store.write(move |db| db.delete_session(&sid)).await?;
        self.sessions.end_session(claims.sub, claims.sid).await?;
        info!("{} logged out of session {}", claims.sub, claims.sid);
        Ok(())
    }

    pub async fn get(&self, user_id: Uuid) -> Result<User, ChatError> {
        let id = user_id.to_string();
        self.store
            .read(move |db| db.get_user_by_id(&id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("user {}", user_id)))?
            .into_user()
            .map_err(internal)
    }

    /// Change name and, when given, avatar. Conversations cache participant
    /// names, so each one the user is in is refreshed and re-announced.
    pub async fn update_profile(
        &self,
        user_id: Uuid,
        name: &str,
        avatar: Option<String>,
    ) -> Result<User, ChatError> {
        let name = validate_name(name)?;
        let avatar = avatar.map(|a| a.trim().to_string());
        let id = user_id.to_string();

        let (row, conversations) = self
            .store
            .write(move |db| db.update_profile(&id, &name, avatar.as_deref()))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("user {}", user_id)))?;
        let user = row.into_user().map_err(internal)?;

        for conversation in conversations {
            let Ok(chat_id) = conversation.id.parse::<Uuid>() else {
                continue;
            };
            // Re-read under the lock so the announced summary is never older
            // than one already delivered.
            let _guard = self.locks.acquire(chat_id).await?;
            let id = conversation.id.clone();
            let Some(fresh) = self.store.read(move |db| db.get_conversation(&id)).await? else {
                continue;
            };
            publish_summary(self.sessions.dispatcher(), into_conversation(fresh)?).await;
        }

        Ok(user)
    }

    pub async fn set_status(&self, user_id: Uuid, status: PresenceStatus) -> Result<(), ChatError> {
        self.sessions
            .set_presence(user_id, status)
            .await?
            .map(|_| ())
            .ok_or_else(|| ChatError::NotFound(format!("user {}", user_id)))
    }

    /// Case-insensitive substring search on name or email. A blank query
    /// matches nobody.
    pub async fn search(&self, requester: Uuid, query: &str) -> Result<Vec<User>, ChatError> {
        let query = query.trim().to_string();
        if query.is_empty() {
            return Ok(Vec::new());
        }

        let exclude = requester.to_string();
        let rows = self
            .store
            .read(move |db| db.search_users(&query, &exclude, SEARCH_LIMIT))
            .await?;

        rows.into_iter()
            .map(|row| row.into_user().map_err(internal))
            .collect()
    }

    async fn open_session(&self, user_id: Uuid) -> Result<String, ChatError> {
        let session_id = Uuid::new_v4();
        let issued_at = now();
        let (token, expires_at) = self
            .sessions
            .tokens()
            .issue(user_id, session_id, issued_at)
            .map_err(|e| ChatError::Internal(format!("token signing failed: {}", e)))?;

        let (sid, uid) = (session_id.to_string(), user_id.to_string());
        self.store
            .write(move |db| db.create_session(&sid, &uid, issued_at, expires_at))
            .await?;
        Ok(token)
    }
}

fn internal(e: anyhow::Error) -> ChatError {
    ChatError::Internal(format!("{:#}", e))
}

fn validate_name(name: &str) -> Result<String, ChatError> {
    let name = name.trim();
    let len = name.chars().count();
    if len < MIN_NAME_CHARS || len > MAX_NAME_CHARS {
        return Err(ChatError::InvalidArgument(format!(
            "name must be {} to {} characters",
            MIN_NAME_CHARS, MAX_NAME_CHARS
        )));
    }
    Ok(name.to_string())
}

/// Accepts `local@domain.tld`: one `@`, no whitespace, a dot inside the
/// domain with something on both sides.
fn validate_email(email: &str) -> Result<String, ChatError> {
    let email = email.trim();
    let invalid = || ChatError::InvalidArgument("invalid email address".to_string());

    if email.chars().any(char::is_whitespace) {
        return Err(invalid());
    }
    let (local, domain) = email.split_once('@').ok_or_else(invalid)?;
    if local.is_empty() || domain.contains('@') {
        return Err(invalid());
    }
    let (host, tld) = domain.rsplit_once('.').ok_or_else(invalid)?;
    if host.is_empty() || tld.is_empty() {
        return Err(invalid());
    }
    Ok(email.to_string())
}

async fn hash_password(password: String) -> Result<String, ChatError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ChatError::Internal(format!("hashing task failed: {}", e))
    })?
    .map_err(|e| ChatError::Internal(format!("password hashing failed: {}", e)))
}

async fn verify_password(password: String, stored: String) -> Result<bool, ChatError> {
    tokio::task::spawn_blocking(move || -> Result<bool, ChatError> {
        let parsed = PasswordHash::new(&stored)
            .map_err(|e| ChatError::Internal(format!("stored hash unreadable: {}", e)))?;
        Ok(Argon2::default()
            .verify_password(password.as_bytes(), &parsed)
            .is_ok())
    })
    .await
    .map_err(|e| {
        error!("spawn_blocking join error: {}", e);
        ChatError::Internal(format!("hashing task failed: {}", e))
    })?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_shape() {
        assert_eq!(validate_email("  ann@example.com ").unwrap(), "ann@example.com");
        for bad in ["ann", "ann@", "@example.com", "ann@example", "ann@.com", "ann@example.", "a b@x.io", "a@b@c.io"] {
            assert!(validate_email(bad).is_err(), "{} should be rejected", bad);
        }
    }

    #[test]
    fn name_is_trimmed_before_length_check() {
        assert!(validate_name(" A ").is_err());
        assert_eq!(validate_name("  Al ").unwrap(), "Al");
        assert!(validate_name(&"x".repeat(MAX_NAME_CHARS + 1)).is_err());
    }

    #[tokio::test]
    async fn password_hash_verifies() {
        let hash = hash_password("hunter22".into()).await.unwrap();
        assert!(verify_password("hunter22".into(), hash.clone()).await.unwrap());
        assert!(!verify_password("hunter23".into(), hash).await.unwrap());
    }
}
