use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use parley_db::Store;
use parley_db::models::now;
use parley_types::ChatError;
use parley_types::api::Claims;
use parley_types::events::GatewayEvent;
use parley_types::models::{PresenceStatus, User};

use crate::dispatcher::{ConnId, ConnectionHandle, Dispatcher, Targets};
use crate::locks::ConversationLocks;
use crate::tokens::TokenAuthority;

/// Tracks which identity owns which live connection, authorizes
/// conversation subscriptions and drives presence.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    store: Store,
    dispatcher: Dispatcher,
    tokens: TokenAuthority,
    locks: Arc<ConversationLocks>,
    grace: Duration,
    presence: Mutex<HashMap<Uuid, Presence>>,
}

#[derive(Default)]
struct Presence {
    live: usize,
    /// Bumped on every connect/disconnect; a pending offline transition only
    /// fires if nothing happened since it was scheduled.
    epoch: u64,
}

impl SessionManager {
    /// `locks` is shared with every writer of conversations, so a
    /// subscription cannot interleave with a delete of the same conversation.
    pub fn new(
        store: Store,
        dispatcher: Dispatcher,
        tokens: TokenAuthority,
        locks: Arc<ConversationLocks>,
        grace: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                store,
                dispatcher,
                tokens,
                locks,
                grace,
                presence: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn tokens(&self) -> &TokenAuthority {
        &self.inner.tokens
    }

    pub fn locks(&self) -> &Arc<ConversationLocks> {
        &self.inner.locks
    }

    /// Check the token signature and that its session was not revoked.
    pub async fn authenticate(&self, token: &str) -> Result<Claims, ChatError> {
        let claims = self.inner.tokens.verify(token)?;
        let (sid, sub) = (claims.sid.to_string(), claims.sub.to_string());

        let session = self
            .inner
            .store
            .read(move |db| db.get_active_session(&sid, &sub, now()))
            .await?;

        match session {
            Some(_) => Ok(claims),
            None => Err(ChatError::Unauthenticated("session expired or revoked".to_string())),
        }
    }

    /// Attach a new live connection for an authenticated identity and mark it
    /// online.
    pub async fn connect(&self, claims: &Claims) -> Result<(ConnectionHandle, User), ChatError> {
        let id = claims.sub.to_string();
        let row = self
            .inner
            .store
            .read(move |db| db.get_user_by_id(&id))
            .await?
            .ok_or_else(|| ChatError::Unauthenticated("unknown user".to_string()))?;
        let mut user = row.into_user().map_err(|e| ChatError::Internal(format!("{:#}", e)))?;

        let handle = self.inner.dispatcher.register(user.id, claims.sid).await;

        let first = {
            let mut presence = self.presence();
            let entry = presence.entry(user.id).or_default();
            entry.live += 1;
            entry.epoch += 1;
            entry.live == 1
        };

        info!("{} ({}) connected, conn {}", user.name, user.id, handle.conn_id);

        if first || user.status != PresenceStatus::Online {
            match self.set_presence(user.id, PresenceStatus::Online).await {
                Ok(Some(updated)) => user = updated,
                Ok(None) => {}
                Err(e) => warn!("Failed to mark {} online: {}", user.id, e),
            }
        }

        Ok((handle, user))
    }

    /// Release a connection. When it was the identity's last one, the
    /// identity goes offline after the grace period unless it reconnects.
    pub async fn disconnect(&self, conn_id: ConnId, user_id: Uuid) {
        self.inner.dispatcher.unregister(conn_id).await;

        let pending = {
            let mut presence = self.presence();
            let entry = presence.entry(user_id).or_default();
            entry.live = entry.live.saturating_sub(1);
            entry.epoch += 1;
            (entry.live == 0).then_some(entry.epoch)
        };

        info!("{} disconnected, conn {}", user_id, conn_id);

        let Some(epoch) = pending else {
            return;
        };

        let manager = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(manager.inner.grace).await;

            let still_gone = {
                let mut presence = manager.presence();
                match presence.get(&user_id) {
                    Some(p) if p.live == 0 && p.epoch == epoch => {
                        presence.remove(&user_id);
                        true
                    }
                    _ => false,
                }
            };

            if still_gone {
                if let Err(e) = manager.set_presence(user_id, PresenceStatus::Offline).await {
                    warn!("Failed to mark {} offline: {}", user_id, e);
                }
            }
        });
    }

    /// Close every connection opened with a revoked session. If the identity
    /// has no other live connection it goes offline immediately.
    pub async fn end_session(&self, user_id: Uuid, session_id: Uuid) -> Result<(), ChatError> {
        let closed = self.inner.dispatcher.close_session(session_id).await;
        debug!("Closed {} connection(s) for session {}", closed, session_id);

        if self.inner.dispatcher.connection_count(user_id).await == 0 {
            // Invalidate any pending grace transition; it would be redundant.
            if let Some(entry) = self.presence().get_mut(&user_id) {
                entry.epoch += 1;
            }
            self.set_presence(user_id, PresenceStatus::Offline).await?;
        }
        Ok(())
    }

    /// Persist a status change and push it to the inboxes of everyone who
    /// shares a conversation with the user. Returns the updated user, or
    /// `None` if the user no longer exists.
    pub async fn set_presence(
        &self,
        user_id: Uuid,
        status: PresenceStatus,
    ) -> Result<Option<User>, ChatError> {
        let id = user_id.to_string();
        let (row, partners) = self
            .inner
            .store
            .write(move |db| {
                if !db.set_user_status(&id, status, now())? {
                    return Ok((None, Vec::new()));
                }
                let row = db.get_user_by_id(&id)?;
                let partners = db.conversation_partners(&id)?;
                Ok((row, partners))
            })
            .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let user = row.into_user().map_err(|e| ChatError::Internal(format!("{:#}", e)))?;

        let partners: Vec<Uuid> = partners.iter().filter_map(|p| p.parse().ok()).collect();
        self.inner
            .dispatcher
            .publish(
                Targets::inboxes(&partners),
                GatewayEvent::PresenceUpdate {
                    user_id,
                    status,
                    last_seen: user.last_seen,
                },
            )
            .await;

        debug!("{} is now {}", user_id, status.as_str());
        Ok(Some(user))
    }

    /// Listen to a conversation. Only its participants may. Returns false
    /// if the connection was already subscribed. The check and the
    /// registration happen under the conversation's lock.
    pub async fn subscribe(
        &self,
        conn_id: ConnId,
        user_id: Uuid,
        chat_id: Uuid,
    ) -> Result<bool, ChatError> {
        let _guard = self.inner.locks.acquire(chat_id).await?;

        let id = chat_id.to_string();
        let conversation = self
            .inner
            .store
            .read(move |db| db.get_conversation(&id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", chat_id)))?;

        if !conversation.has_participant(&user_id.to_string()) {
            return Err(ChatError::Forbidden("not a participant".to_string()));
        }

        let added = self.inner.dispatcher.subscribe(conn_id, chat_id).await;
        if added {
            info!("{} subscribed to {} on conn {}", user_id, chat_id, conn_id);
        }
        Ok(added)
    }

    pub async fn unsubscribe(&self, conn_id: ConnId, chat_id: Uuid) -> bool {
        self.inner.dispatcher.unsubscribe(conn_id, chat_id).await
    }

    pub async fn subscribe_inbox(&self, conn_id: ConnId) -> bool {
        self.inner.dispatcher.subscribe_inbox(conn_id).await
    }

    pub async fn unsubscribe_inbox(&self, conn_id: ConnId) -> bool {
        self.inner.dispatcher.unsubscribe_inbox(conn_id).await
    }

    fn presence(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Presence>> {
        self.inner.presence.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
