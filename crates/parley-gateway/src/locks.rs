use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OwnedMutexGuard;
use uuid::Uuid;

use parley_types::ChatError;

/// Prune idle entries once the table grows past this many.
const PRUNE_THRESHOLD: usize = 1024;

/// One exclusive section per conversation. Every mutation of a
/// conversation's log or summary runs while holding its guard, and so does
/// the fan-out enqueue that follows, which keeps delivery order equal to
/// commit order. Subscribing takes it too, so a listener is never added to a
/// conversation that is being deleted.
pub struct ConversationLocks {
    timeout: Duration,
    locks: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl ConversationLocks {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn acquire(&self, chat_id: Uuid) -> Result<OwnedMutexGuard<()>, ChatError> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            if locks.len() > PRUNE_THRESHOLD {
                // Only the table holds an idle entry.
                locks.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            locks.entry(chat_id).or_default().clone()
        };

        tokio::time::timeout(self.timeout, lock.lock_owned())
            .await
            .map_err(|_| ChatError::Transient(format!("conversation {} is busy", chat_id)))
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_holder_times_out() {
        let locks = ConversationLocks::new(Duration::from_millis(20));
        let chat_id = Uuid::new_v4();

        let _held = locks.acquire(chat_id).await.unwrap();
        let err = locks.acquire(chat_id).await.unwrap_err();
        assert!(err.is_transient());

        // Other conversations are unaffected.
        locks.acquire(Uuid::new_v4()).await.unwrap();
    }

    #[tokio::test]
    async fn released_lock_can_be_taken_again() {
        let locks = ConversationLocks::new(Duration::from_millis(20));
        let chat_id = Uuid::new_v4();

        drop(locks.acquire(chat_id).await.unwrap());
        locks.acquire(chat_id).await.unwrap();
    }

    #[tokio::test]
    async fn idle_entries_are_pruned() {
        let locks = ConversationLocks::new(Duration::from_millis(20));
        for _ in 0..=PRUNE_THRESHOLD {
            drop(locks.acquire(Uuid::new_v4()).await.unwrap());
        }
        let _held = locks.acquire(Uuid::new_v4()).await.unwrap();
        assert_eq!(locks.len(), 1);
    }
}
