pub mod conversations;
pub mod error;
pub mod messages;
pub mod migrations;
pub mod models;
pub mod sessions;
pub mod store;
pub mod users;

use anyhow::Result;
use rusqlite::{Connection, Transaction};
use std::path::Path;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

use parley_types::ChatError;

pub use error::classify;
pub use store::{Store, StoreConfig};

/// How long SQLite itself waits on a locked database before reporting BUSY.
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

const WAITING: u8 = 0;
const STARTED: u8 = 1;
const ABANDONED: u8 = 2;

/// Whether one storage call got the connection before its caller gave up.
/// Exactly one of `start` and `abandon` wins.
#[derive(Default)]
pub(crate) struct Admission(AtomicU8);

impl Admission {
    /// Called with the connection held. False if the caller already left.
    fn start(&self) -> bool {
        match self.0.compare_exchange(WAITING, STARTED, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => true,
            Err(state) => state == STARTED,
        }
    }

    /// False if the call already started and must be waited for.
    pub(crate) fn abandon(&self) -> bool {
        self.0
            .compare_exchange(WAITING, ABANDONED, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

pub struct Database {
    conn: Arc<Mutex<Connection>>,
    admission: Option<Arc<Admission>>,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;

        // WAL mode for concurrent reads
        conn.pragma_update(None, "journal_mode", "WAL")?;

        let db = Self::init(conn)?;
        info!("Database opened at {}", path.display());
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        migrations::run(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            admission: None,
        })
    }

    /// A handle on the same connection whose first use claims `admission`.
    pub(crate) fn admitted(&self, admission: Arc<Admission>) -> Self {
        Self {
            conn: self.conn.clone(),
            admission: Some(admission),
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        let conn = self.conn.lock().map_err(|e| anyhow::anyhow!("DB lock poisoned: {}", e))?;
        if let Some(admission) = &self.admission {
            if !admission.start() {
                return Err(ChatError::Transient("storage operation timed out".to_string()).into());
            }
        }
        Ok(conn)
    }

    pub fn with_conn<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Connection) -> Result<T>,
    {
        let conn = self.lock()?;
        f(&conn)
    }

    /// Run `f` inside a transaction. Commits on `Ok`, rolls back on `Err`.
    pub fn with_tx<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }
}
