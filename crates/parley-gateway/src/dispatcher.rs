use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Notify, RwLock, mpsc};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};
use uuid::Uuid;

use parley_types::events::GatewayEvent;

pub type ConnId = Uuid;

/// Default per-connection outbound queue length.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Where an event should go: the live listeners of one conversation and/or
/// the inbox listeners of some users.
#[derive(Debug, Clone, Copy, Default)]
pub struct Targets<'a> {
    pub chat: Option<Uuid>,
    pub inboxes: &'a [Uuid],
}

impl<'a> Targets<'a> {
    pub fn chat(chat_id: Uuid) -> Self {
        Self { chat: Some(chat_id), inboxes: &[] }
    }

    pub fn inboxes(user_ids: &'a [Uuid]) -> Self {
        Self { chat: None, inboxes: user_ids }
    }

    pub fn chat_and_inboxes(chat_id: Uuid, user_ids: &'a [Uuid]) -> Self {
        Self { chat: Some(chat_id), inboxes: user_ids }
    }
}

/// Lost subscriptions waiting to be reported. `None` is the inbox.
#[derive(Default)]
struct LostNotices {
    pending: Mutex<Vec<Option<Uuid>>>,
    wake: Notify,
}

impl LostNotices {
    fn push(&self, lost: Vec<Option<Uuid>>) {
        if lost.is_empty() {
            return;
        }
        self.pending.lock().unwrap_or_else(PoisonError::into_inner).extend(lost);
        self.wake.notify_one();
    }

    fn take(&self) -> Vec<Option<Uuid>> {
        std::mem::take(&mut *self.pending.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Receiving side of one live connection.
pub struct ConnectionHandle {
    pub conn_id: ConnId,
    pub user_id: Uuid,
    pub events: mpsc::Receiver<Arc<GatewayEvent>>,
    pub lost: LostSubscriptions,
}

/// Subscriptions a connection lost by falling behind.
pub struct LostSubscriptions(Arc<LostNotices>);

impl LostSubscriptions {
    pub fn take(&self) -> Vec<Option<Uuid>> {
        self.0.take()
    }

    /// Wait until at least one subscription was lost, then drain them.
    pub async fn wait(&self) -> Vec<Option<Uuid>> {
        loop {
            let lost = self.0.take();
            if !lost.is_empty() {
                return lost;
            }
            self.0.wake.notified().await;
        }
    }
}

/// Fans gateway events out to the connections listening for them.
///
/// Each connection owns a bounded queue drained by its own socket task, so
/// publishing never waits on a subscriber. A connection whose queue is full
/// loses the subscription the event was for; one whose queue is closed is
/// removed entirely. Neither is reported back to the publisher.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    queue_capacity: usize,
    registry: RwLock<Registry>,
}

#[derive(Default)]
struct Registry {
    connections: HashMap<ConnId, Listener>,
    /// chat_id -> connections subscribed to that conversation
    conversations: HashMap<Uuid, HashSet<ConnId>>,
    /// user_id -> connections subscribed to that user's conversation list
    inboxes: HashMap<Uuid, HashSet<ConnId>>,
}

struct Listener {
    user_id: Uuid,
    session_id: Uuid,
    tx: mpsc::Sender<Arc<GatewayEvent>>,
    chats: HashSet<Uuid>,
    inbox: bool,
    lost: Arc<LostNotices>,
}

enum Undelivered {
    Full(ConnId),
    Closed(ConnId),
}

impl Registry {
    fn unsubscribe(&mut self, conn_id: ConnId, chat_id: Uuid) -> bool {
        let Some(listener) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if !listener.chats.remove(&chat_id) {
            return false;
        }
        if let Some(set) = self.conversations.get_mut(&chat_id) {
            set.remove(&conn_id);
            if set.is_empty() {
                self.conversations.remove(&chat_id);
            }
        }
        true
    }

    fn unsubscribe_inbox(&mut self, conn_id: ConnId) -> bool {
        let Some(listener) = self.connections.get_mut(&conn_id) else {
            return false;
        };
        if !std::mem::replace(&mut listener.inbox, false) {
            return false;
        }
        let user_id = listener.user_id;
        if let Some(set) = self.inboxes.get_mut(&user_id) {
            set.remove(&conn_id);
            if set.is_empty() {
                self.inboxes.remove(&user_id);
            }
        }
        true
    }

    fn remove(&mut self, conn_id: ConnId) -> Option<Listener> {
        let chats: Vec<Uuid> = self.connections.get(&conn_id)?.chats.iter().copied().collect();
        for chat_id in chats {
            self.unsubscribe(conn_id, chat_id);
        }
        self.unsubscribe_inbox(conn_id);
        self.connections.remove(&conn_id)
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::with_queue_capacity(DEFAULT_QUEUE_CAPACITY)
    }

    pub fn with_queue_capacity(queue_capacity: usize) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                queue_capacity: queue_capacity.max(1),
                registry: RwLock::new(Registry::default()),
            }),
        }
    }

    /// Register a live connection for `user_id` authenticated by `session_id`.
    pub async fn register(&self, user_id: Uuid, session_id: Uuid) -> ConnectionHandle {
        let conn_id = Uuid::new_v4();
        let (tx, rx) = mpsc::channel(self.inner.queue_capacity);
        let lost = Arc::new(LostNotices::default());

        self.inner.registry.write().await.connections.insert(
            conn_id,
            Listener {
                user_id,
                session_id,
                tx,
                chats: HashSet::new(),
                inbox: false,
                lost: lost.clone(),
            },
        );

        ConnectionHandle {
            conn_id,
            user_id,
            events: rx,
            lost: LostSubscriptions(lost),
        }
    }

    /// Drop a connection and every subscription it holds. Anything still
    /// queued for it is discarded with the queue.
    pub async fn unregister(&self, conn_id: ConnId) {
        self.inner.registry.write().await.remove(conn_id);
    }

    /// Drop every connection opened with `session_id`. Their queues close,
    /// which ends the socket tasks. Returns how many were dropped.
    pub async fn close_session(&self, session_id: Uuid) -> usize {
        let mut registry = self.inner.registry.write().await;
        let doomed: Vec<ConnId> = registry
            .connections
            .iter()
            .filter(|(_, l)| l.session_id == session_id)
            .map(|(id, _)| *id)
            .collect();
        for conn_id in &doomed {
            registry.remove(*conn_id);
        }
        doomed.len()
    }

    /// Number of live connections for a user.
    pub async fn connection_count(&self, user_id: Uuid) -> usize {
        self.inner
            .registry
            .read()
            .await
            .connections
            .values()
            .filter(|l| l.user_id == user_id)
            .count()
    }

    /// Add a conversation listener and queue the `Subscribed` ack in the same
    /// critical section, so the ack precedes every event for that
    /// conversation. Returns false if it was already subscribed (no ack is
    /// queued twice, and no duplicate listener is created) or if the ack did
    /// not fit in the queue; the latter is reported as `SubscriptionLost`.
    pub async fn subscribe(&self, conn_id: ConnId, chat_id: Uuid) -> bool {
        let mut registry = self.inner.registry.write().await;
        let Some(listener) = registry.connections.get_mut(&conn_id) else {
            debug!("subscribe on unknown connection {}", conn_id);
            return false;
        };
        if listener.chats.contains(&chat_id) {
            return false;
        }
        if !ack(listener, GatewayEvent::Subscribed { chat_id }, Some(chat_id)) {
            return false;
        }
        listener.chats.insert(chat_id);
        registry.conversations.entry(chat_id).or_default().insert(conn_id);
        true
    }

    pub async fn unsubscribe(&self, conn_id: ConnId, chat_id: Uuid) -> bool {
        let mut registry = self.inner.registry.write().await;
        let removed = registry.unsubscribe(conn_id, chat_id);
        if removed {
            if let Some(listener) = registry.connections.get(&conn_id) {
                let _ = listener.tx.try_send(Arc::new(GatewayEvent::Unsubscribed { chat_id }));
            }
        }
        removed
    }

    pub async fn subscribe_inbox(&self, conn_id: ConnId) -> bool {
        let mut registry = self.inner.registry.write().await;
        let Some(listener) = registry.connections.get_mut(&conn_id) else {
            return false;
        };
        if listener.inbox || !ack(listener, GatewayEvent::InboxSubscribed, None) {
            return false;
        }
        listener.inbox = true;
        let user_id = listener.user_id;
        registry.inboxes.entry(user_id).or_default().insert(conn_id);
        true
    }

    pub async fn unsubscribe_inbox(&self, conn_id: ConnId) -> bool {
        self.inner.registry.write().await.unsubscribe_inbox(conn_id)
    }

    /// Stop delivering anything for a conversation, e.g. after it is deleted.
    pub async fn forget_conversation(&self, chat_id: Uuid) {
        let mut registry = self.inner.registry.write().await;
        let listeners: Vec<ConnId> = registry
            .conversations
            .get(&chat_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();
        for conn_id in listeners {
            registry.unsubscribe(conn_id, chat_id);
        }
    }

    /// Send a reply to one connection only.
    pub async fn notify(&self, conn_id: ConnId, event: GatewayEvent) {
        let registry = self.inner.registry.read().await;
        if let Some(listener) = registry.connections.get(&conn_id) {
            if listener.tx.try_send(Arc::new(event)).is_err() {
                debug!("dropped direct reply to connection {}", conn_id);
            }
        }
    }

    /// Queue `event` once for every connection in `targets`. Returns the
    /// number of connections it was queued for.
    pub async fn publish(&self, targets: Targets<'_>, event: GatewayEvent) -> usize {
        let event = Arc::new(event);
        let mut delivered = 0;
        let mut undelivered = Vec::new();

        {
            let registry = self.inner.registry.read().await;
            let mut recipients: HashSet<ConnId> = HashSet::new();

            if let Some(chat_id) = targets.chat {
                if let Some(set) = registry.conversations.get(&chat_id) {
                    recipients.extend(set.iter().copied());
                }
            }
            for user_id in targets.inboxes {
                if let Some(set) = registry.inboxes.get(user_id) {
                    recipients.extend(set.iter().copied());
                }
            }

            for conn_id in recipients {
                let Some(listener) = registry.connections.get(&conn_id) else {
                    continue;
                };
                match listener.tx.try_send(event.clone()) {
                    Ok(()) => delivered += 1,
                    Err(TrySendError::Full(_)) => undelivered.push(Undelivered::Full(conn_id)),
                    Err(TrySendError::Closed(_)) => undelivered.push(Undelivered::Closed(conn_id)),
                }
            }
        }

        if !undelivered.is_empty() {
            self.drop_failed(targets, undelivered).await;
        }

        delivered
    }

    async fn drop_failed(&self, targets: Targets<'_>, undelivered: Vec<Undelivered>) {
        let mut registry = self.inner.registry.write().await;

        for failure in undelivered {
            match failure {
                Undelivered::Closed(conn_id) => {
                    warn!("Connection {} is gone, dropping its subscriptions", conn_id);
                    registry.remove(conn_id);
                }
                Undelivered::Full(conn_id) => {
                    let mut lost = Vec::new();
                    if let Some(chat_id) = targets.chat {
                        if registry.unsubscribe(conn_id, chat_id) {
                            lost.push(Some(chat_id));
                        }
                    }
                    let in_targeted_inbox = registry
                        .connections
                        .get(&conn_id)
                        .is_some_and(|l| l.inbox && targets.inboxes.contains(&l.user_id));
                    if in_targeted_inbox && registry.unsubscribe_inbox(conn_id) {
                        lost.push(None);
                    }

                    if let Some(listener) = registry.connections.get(&conn_id) {
                        warn!(
                            "Connection {} ({}) fell behind, dropped {} subscription(s)",
                            conn_id,
                            listener.user_id,
                            lost.len()
                        );
                        listener.lost.push(lost);
                    }
                }
            }
        }
    }
}

/// Queue a subscription ack. A full queue turns it into a lost notice so
/// the client asks again once it has caught up.
fn ack(listener: &Listener, event: GatewayEvent, target: Option<Uuid>) -> bool {
    match listener.tx.try_send(Arc::new(event)) {
        Ok(()) => true,
        Err(TrySendError::Full(_)) => {
            warn!("Queue full, refusing subscription for {}", listener.user_id);
            listener.lost.push(vec![target]);
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
