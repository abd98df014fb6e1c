mod config;

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use parley_api::AppStateInner;
use parley_db::models::now;
use parley_db::{Database, Store, StoreConfig};
use parley_gateway::{ConversationLocks, Dispatcher, SessionManager, TokenAuthority};

use crate::config::ServerConfig;

/// How often expired sessions are swept out of the database.
const SESSION_PURGE_INTERVAL: Duration = Duration::from_secs(3600);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;

    // Init database
    let db = Database::open(&config.db_path)?;
    let reset = db.mark_all_offline(now())?;
    if reset > 0 {
        info!("Reset {} stale online status(es)", reset);
    }

    let store = Store::new(
        db,
        StoreConfig {
            op_timeout: config.store_timeout,
            write_attempts: config.write_attempts.max(1),
            ..StoreConfig::default()
        },
    );

    // Shared state
    let sessions = SessionManager::new(
        store.clone(),
        Dispatcher::with_queue_capacity(config.subscriber_queue),
        TokenAuthority::new(&config.jwt_secret, config.token_ttl),
        Arc::new(ConversationLocks::new(config.lock_timeout)),
        config.presence_grace,
    );
    let app_state = AppStateInner::new(store.clone(), sessions);

    // Background session purge (runs every hour)
    tokio::spawn(run_session_purge(store));

    let app = parley_api::router(app_state);

    info!("Parley server listening on {}", config.addr);
    let listener = tokio::net::TcpListener::bind(config.addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn run_session_purge(store: Store) {
    let mut interval = tokio::time::interval(SESSION_PURGE_INTERVAL);

    loop {
        interval.tick().await;

        match store.write(|db| db.purge_expired_sessions(now())).await {
            Ok(0) => {}
            Ok(n) => info!("Purged {} expired session(s)", n),
            Err(e) => error!("Session purge failed: {}", e),
        }
    }
}
