use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use parley_db::Store;
use parley_db::conversations::NewConversation;
use parley_db::models::{ConversationRow, now};
use parley_gateway::{ConversationLocks, Dispatcher, Targets};
use parley_types::ChatError;
use parley_types::events::GatewayEvent;
use parley_types::models::{Conversation, pair_key};


/// Two-party conversations, one per unordered pair of users.
pub struct ConversationStore {
    store: Store,
    dispatcher: Dispatcher,
    locks: Arc<ConversationLocks>,
}

impl ConversationStore {
    pub fn new(store: Store, dispatcher: Dispatcher, locks: Arc<ConversationLocks>) -> Self {
        Self { store, dispatcher, locks }
    }

    /// Return the conversation between `requester` and `other`, creating it
    /// if needed. Both orders of the pair land on the same record. The bool
    /// is true when this call created it.
    pub async fn find_or_create(
        &self,
        requester: Uuid,
        other: Uuid,
    ) -> Result<(Conversation, bool), ChatError> {
        if requester == other {
            return Err(ChatError::InvalidArgument(
                "cannot start a conversation with yourself".to_string(),
            ));
        }

        let id = Uuid::new_v4().to_string();
        let key = pair_key(requester, other);
        let (creator_id, other_id) = (requester.to_string(), other.to_string());

        let (row, created) = self
            .store
            .write(move |db| {
                let creator = db
                    .get_user_by_id(&creator_id)?
                    .ok_or_else(|| ChatError::Unauthenticated("unknown user".to_string()))?;
                let partner = db
                    .get_user_by_id(&other_id)?
                    .ok_or_else(|| ChatError::NotFound(format!("user {}", other_id)))?;

                db.find_or_create_conversation(&NewConversation {
                    id: &id,
                    pair_key: &key,
                    creator_id: &creator.id,
                    creator_name: &creator.name,
                    other_id: &partner.id,
                    other_name: &partner.name,
                    now: now(),
                })
            })
            .await?;

        let conversation = into_conversation(row)?;
        if created {
            info!("{} started conversation {} with {}", requester, conversation.id, other);
            self.announce(conversation.id).await?;
        }
        Ok((conversation, created))
    }

    /// Most recently updated first.
    pub async fn list_for(&self, user_id: Uuid) -> Result<Vec<Conversation>, ChatError> {
        let id = user_id.to_string();
        self.store
            .read(move |db| db.list_conversations_for(&id))
            .await?
            .into_iter()
            .map(into_conversation)
            .collect()
    }

    pub async fn get(&self, requester: Uuid, chat_id: Uuid) -> Result<Conversation, ChatError> {
        let id = chat_id.to_string();
        let row = self
            .store
            .read(move |db| db.get_conversation(&id))
            .await?
            .ok_or_else(|| ChatError::NotFound(format!("conversation {}", chat_id)))?;

        if !row.has_participant(&requester.to_string()) {
            return Err(ChatError::Forbidden("not a participant".to_string()));
        }
        into_conversation(row)
    }

    /// Delete a conversation with its whole message log. Live listeners and
    /// both participants' inboxes are told, then the listeners are dropped.
    pub async fn delete(&self, requester: Uuid, chat_id: Uuid) -> Result<(), ChatError> {
        let _guard = self.locks.acquire(chat_id).await?;

        let (id, requester_id) = (chat_id.to_string(), requester.to_string());
        let row = self
            .store
            .write(move |db| db.delete_conversation(&id, &requester_id))
            .await?;
        let conversation = into_conversation(row)?;

        self.dispatcher
            .publish(
                Targets::chat_and_inboxes(chat_id, &conversation.participants),
                GatewayEvent::ConversationDelete { chat_id },
            )
            .await;
        self.dispatcher.forget_conversation(chat_id).await;

        info!("{} deleted conversation {}", requester, chat_id);
        Ok(())
    }

    /// Push the current summary of a conversation to its listeners and to
    /// both participants' inboxes. Takes the conversation's lock so the
    /// snapshot cannot overtake a newer one.
    pub async fn announce(&self, chat_id: Uuid) -> Result<(), ChatError> {
        let _guard = self.locks.acquire(chat_id).await?;
        let id = chat_id.to_string();
        if let Some(row) = self.store.read(move |db| db.get_conversation(&id)).await? {
            publish_summary(&self.dispatcher, into_conversation(row)?).await;
        }
        Ok(())
    }
}

/// Queue a `ConversationUpdate`. Callers hold the conversation's lock.
pub(crate) async fn publish_summary(dispatcher: &Dispatcher, conversation: Conversation) {
    let participants = conversation.participants;
    dispatcher
        .publish(
            Targets::chat_and_inboxes(conversation.id, &participants),
            GatewayEvent::ConversationUpdate(conversation),
        )
        .await;
}

pub(crate) fn into_conversation(row: ConversationRow) -> Result<Conversation, ChatError> {
    row.into_conversation()
        .map_err(|e| ChatError::Internal(format!("{:#}", e)))
}
