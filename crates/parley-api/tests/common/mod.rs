#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use chrono::TimeDelta;
use uuid::Uuid;

use parley_api::{AppState, AppStateInner};
use parley_db::{Database, Store, StoreConfig};
use parley_gateway::dispatcher::ConnectionHandle;
use parley_gateway::{ConversationLocks, Dispatcher, SessionManager, TokenAuthority};
use parley_types::api::{AuthResponse, Claims};
use parley_types::events::GatewayEvent;

pub fn app() -> AppState {
    app_on(Store::new(Database::open_in_memory().unwrap(), StoreConfig::default()))
}

/// The service wired around a caller-built store.
pub fn app_on(store: Store) -> AppState {
    let sessions = SessionManager::new(
        store.clone(),
        Dispatcher::new(),
        TokenAuthority::new("test-secret", TimeDelta::hours(1)),
        Arc::new(ConversationLocks::new(Duration::from_secs(2))),
        Duration::from_millis(50),
    );
    AppStateInner::new(store, sessions)
}

pub struct Member {
    pub id: Uuid,
    pub token: String,
    pub claims: Claims,
}

pub async fn register(app: &AppState, name: &str) -> Member {
    let AuthResponse { user, token } = app
        .identity
        .register(&format!("{}@example.com", name.to_lowercase()), "secret-pw", name)
        .await
        .unwrap();
    let claims = app.sessions.authenticate(&token).await.unwrap();
    Member { id: user.id, token, claims }
}

pub async fn connect(app: &AppState, member: &Member) -> ConnectionHandle {
    app.sessions.connect(&member.claims).await.unwrap().0
}

/// Next event on a fake connection, skipping presence noise.
pub async fn next_event(conn: &mut ConnectionHandle) -> Arc<GatewayEvent> {
    loop {
        let event = tokio::time::timeout(Duration::from_secs(2), conn.events.recv())
            .await
            .expect("timed out waiting for an event")
            .expect("connection queue closed");
        if !matches!(*event, GatewayEvent::PresenceUpdate { .. }) {
            return event;
        }
    }
}

/// Drain everything queued right now, presence included.
pub fn drain(conn: &mut ConnectionHandle) -> Vec<Arc<GatewayEvent>> {
    let mut out = Vec::new();
    while let Ok(event) = conn.events.try_recv() {
        out.push(event);
    }
    out
}
