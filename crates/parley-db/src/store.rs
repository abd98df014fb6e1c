use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, warn};

use parley_types::ChatError;

use crate::{Admission, Database};
use crate::error::{classify, is_busy};

#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// How long a storage call may wait for the connection. A call that got
    /// it in time always runs to completion.
    pub op_timeout: Duration,
    /// Total attempts for a write that keeps hitting a busy database.
    pub write_attempts: u32,
    /// Delay before the first retry; doubles on each further retry.
    pub retry_backoff: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            op_timeout: Duration::from_secs(5),
            write_attempts: 3,
            retry_backoff: Duration::from_millis(25),
        }
    }
}

/// Async handle to the database. Every call runs on the blocking pool and
/// comes back as a `ChatError`. A call still queued for the connection when
/// `op_timeout` expires is withdrawn and never touches data; a call already
/// running is awaited, so a reported failure never hides a commit.
#[derive(Clone)]
pub struct Store {
    db: Arc<Database>,
    config: StoreConfig,
}

struct Failure {
    error: ChatError,
    /// The statement was rejected before touching data, so running it again is safe.
    /// A withdrawn call is not retried either: its deadline is already spent.
    retryable: bool,
}

impl Store {
    pub fn new(db: Database, config: StoreConfig) -> Self {
        Self {
            db: Arc::new(db),
            config,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub async fn read<F, T>(&self, f: F) -> Result<T, ChatError>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        self.run_once(f).await.map_err(|failure| failure.error)
    }

    /// Run a write, retrying with exponential backoff while SQLite reports
    /// BUSY/LOCKED.
    pub async fn write<F, T>(&self, f: F) -> Result<T, ChatError>
    where
        F: Fn(&Database) -> anyhow::Result<T> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let mut backoff = self.config.retry_backoff;
        let mut attempt = 1;

        loop {
            let f = f.clone();
            match self.run_once(move |db| f(db)).await {
                Ok(value) => return Ok(value),
                Err(failure) if failure.retryable && attempt < self.config.write_attempts => {
                    warn!(
                        "Storage busy (attempt {}/{}), retrying in {:?}",
                        attempt, self.config.write_attempts, backoff
                    );
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                    attempt += 1;
                }
                Err(failure) => return Err(failure.error),
            }
        }
    }

    async fn run_once<F, T>(&self, f: F) -> Result<T, Failure>
    where
        F: FnOnce(&Database) -> anyhow::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let admission = Arc::new(Admission::default());
        let db = self.db.admitted(admission.clone());
        let mut task = tokio::task::spawn_blocking(move || f(&db));

        let joined = match tokio::time::timeout(self.config.op_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) if admission.abandon() => {
                return Err(Failure {
                    error: ChatError::Transient("storage operation timed out".to_string()),
                    retryable: false,
                });
            }
            Err(_) => {
                debug!("Storage call outlived its deadline after starting, waiting for it");
                task.await
            }
        };

        match joined {
            Err(e) => {
                error!("spawn_blocking join error: {}", e);
                Err(Failure {
                    error: ChatError::Internal(format!("storage task failed: {}", e)),
                    retryable: false,
                })
            }
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                let retryable = e.downcast_ref::<rusqlite::Error>().is_some_and(is_busy);
                let error = classify(e);
                if let ChatError::Internal(detail) = &error {
                    error!("Storage error: {}", detail);
                }
                Err(Failure { error, retryable })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn busy() -> anyhow::Error {
        rusqlite::Error::SqliteFailure(rusqlite::ffi::Error::new(rusqlite::ffi::SQLITE_BUSY), None)
            .into()
    }

    fn store(attempts: u32) -> Store {
        Store::new(
            Database::open_in_memory().unwrap(),
            StoreConfig {
                op_timeout: Duration::from_secs(5),
                write_attempts: attempts,
                retry_backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn write_retries_busy_then_succeeds() {
        let store = store(3);
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        let value = store
            .write(move |_db| {
                if seen.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(busy())
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn write_gives_up_as_transient() {
        let store = store(2);
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        let err = store
            .write(move |_db| -> anyhow::Result<()> {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(busy())
            })
            .await
            .unwrap_err();

        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    fn store_with_timeout(op_timeout: Duration) -> Store {
        Store::new(
            Database::open_in_memory().unwrap(),
            StoreConfig {
                op_timeout,
                ..StoreConfig::default()
            },
        )
    }

    /// Hold the connection on another thread for `hold`.
    fn stall(store: &Store, hold: Duration) -> std::thread::JoinHandle<()> {
        let store = store.clone();
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let handle = std::thread::spawn(move || {
            store
                .database()
                .with_conn(|_| {
                    held_tx.send(()).unwrap();
                    std::thread::sleep(hold);
                    Ok(())
                })
                .unwrap();
        });
        held_rx.recv().unwrap();
        handle
    }

    #[tokio::test]
    async fn write_queued_past_deadline_never_runs() {
        let store = store_with_timeout(Duration::from_millis(100));
        let stalled = stall(&store, Duration::from_millis(400));
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        let err = store
            .write(move |db| {
                db.with_conn(|conn| {
                    seen.fetch_add(1, Ordering::SeqCst);
                    conn.execute(
                        "INSERT INTO users (id, email, password, name, last_seen, created_at)
                         VALUES ('u1', 'ann@example.com', 'hash', 'Ann', 'now', 'now')",
                        [],
                    )?;
                    Ok(())
                })
            })
            .await
            .unwrap_err();
        assert!(err.is_transient());

        stalled.join().unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(store.database().get_user_by_id("u1").unwrap().is_none());
    }

    #[tokio::test]
    async fn started_write_is_awaited_past_deadline() {
        let store = store_with_timeout(Duration::from_millis(50));

        let value = store
            .write(|db| {
                db.with_conn(|_| {
                    std::thread::sleep(Duration::from_millis(200));
                    Ok(7)
                })
            })
            .await
            .unwrap();

        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn domain_errors_are_not_retried() {
        let store = store(3);
        let calls = Arc::new(AtomicU32::new(0));
        let seen = calls.clone();

        let err = store
            .write(move |_db| -> anyhow::Result<()> {
                seen.fetch_add(1, Ordering::SeqCst);
                Err(ChatError::Forbidden("nope".into()).into())
            })
            .await
            .unwrap_err();

        assert_eq!(err, ChatError::Forbidden("nope".into()));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
