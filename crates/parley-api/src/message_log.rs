use std::sync::Arc;

use tracing::debug;
use uuid::Uuid;

use parley_db::Store;
use parley_db::messages::{MessageRange, NewMessage};
use parley_db::models::{MessageRow, now};
use parley_gateway::{ConversationLocks, Dispatcher, Targets};
use parley_types::ChatError;
use parley_types::events::GatewayEvent;
use parley_types::models::Message;

use crate::conversations::{into_conversation, publish_summary};

pub const DEFAULT_PAGE: u32 = 50;
pub const MAX_PAGE: u32 = 200;
pub const MAX_MESSAGE_CHARS: usize = 4000;

/// Which slice of a conversation's log to read. Cursors are message `seq`s.
#[derive(Debug, Clone, Copy, Default)]
pub struct Page {
    pub after: Option<i64>,
    pub before: Option<i64>,
    pub limit: Option<u32>,
}

impl Page {
    fn range(self) -> MessageRange {
        MessageRange {
            after: self.after,
            before: self.before,
            limit: self.limit.unwrap_or(DEFAULT_PAGE).clamp(1, MAX_PAGE),
        }
    }
}

/// Per-conversation append-only log with edit and delete.
///
/// Every mutation holds the conversation's lock from the storage write
/// through the fan-out enqueue, so listeners see events in commit order.
/// Fan-out happens after commit and cannot fail the caller. Message events
/// go to the conversation's listeners; the summary that follows also goes
/// to both participants' inboxes.
pub struct MessageLog {
    store: Store,
    dispatcher: Dispatcher,
    locks: Arc<ConversationLocks>,
}

impl MessageLog {
    pub fn new(store: Store, dispatcher: Dispatcher, locks: Arc<ConversationLocks>) -> Self {
        Self { store, dispatcher, locks }
    }

    pub async fn append(&self, chat_id: Uuid, sender_id: Uuid, text: &str) -> Result<Message, ChatError> {
        let text = validate_text(text)?;
        let _guard = self.locks.acquire(chat_id).await?;

        let (id, chat, sender) = (Uuid::new_v4().to_string(), chat_id.to_string(), sender_id.to_string());
        let (row, conversation) = self
            .store
            .write(move |db| {
                db.append_message(&NewMessage {
                    id: &id,
                    chat_id: &chat,
                    sender_id: &sender,
                    text: &text,
                    now: now(),
                })
            })
            .await?;

        let message = into_message(row)?;
        let conversation = into_conversation(conversation)?;
        debug!("{} appended seq {} to {}", sender_id, message.seq, chat_id);

        self.dispatcher
            .publish(
                Targets::chat(chat_id),
                GatewayEvent::MessageCreate(message.clone()),
            )
            .await;
        publish_summary(&self.dispatcher, conversation).await;

        Ok(message)
    }

    /// Messages in ascending `seq` order. Only participants may read.
    pub async fn list(&self, requester: Uuid, chat_id: Uuid, page: Page) -> Result<Vec<Message>, ChatError> {
        let (chat, reader) = (chat_id.to_string(), requester.to_string());
        let range = page.range();

        let rows = self
            .store
            .read(move |db| {
                let conversation = db
                    .get_conversation(&chat)?
                    .ok_or_else(|| ChatError::NotFound(format!("conversation {}", chat)))?;
                if !conversation.has_participant(&reader) {
                    return Err(ChatError::Forbidden("not a participant".to_string()).into());
                }
                db.list_messages(&chat, range)
            })
            .await?;

        rows.into_iter().map(into_message).collect()
    }

    /// Replace the text of one of the editor's own messages.
    pub async fn edit(
        &self,
        chat_id: Uuid,
        message_id: Uuid,
        editor_id: Uuid,
        text: &str,
    ) -> Result<Message, ChatError> {
        let text = validate_text(text)?;
        let _guard = self.locks.acquire(chat_id).await?;

        let (chat, mid, editor) = (chat_id.to_string(), message_id.to_string(), editor_id.to_string());
        let (row, summary) = self
            .store
            .write(move |db| db.edit_message(&chat, &mid, &editor, &text, now()))
            .await?;

        let message = into_message(row)?;
        let conversation = summary.map(into_conversation).transpose()?;

        self.dispatcher
            .publish(
                Targets::chat(chat_id),
                GatewayEvent::MessageUpdate(message.clone()),
            )
            .await;
        if let Some(conversation) = conversation {
            publish_summary(&self.dispatcher, conversation).await;
        }

        Ok(message)
    }

    /// Remove one of the requester's own messages. Its `seq` is not reused.
    pub async fn delete(&self, chat_id: Uuid, message_id: Uuid, requester_id: Uuid) -> Result<(), ChatError> {
        let _guard = self.locks.acquire(chat_id).await?;

        let (chat, mid, requester) = (chat_id.to_string(), message_id.to_string(), requester_id.to_string());
        let (row, summary) = self
            .store
            .write(move |db| db.delete_message(&chat, &mid, &requester, now()))
            .await?;

        let conversation = summary.map(into_conversation).transpose()?;

        self.dispatcher
            .publish(
                Targets::chat(chat_id),
                GatewayEvent::MessageDelete {
                    chat_id,
                    message_id,
                    seq: row.seq,
                },
            )
            .await;
        if let Some(conversation) = conversation {
            publish_summary(&self.dispatcher, conversation).await;
        }

        Ok(())
    }
}

fn validate_text(text: &str) -> Result<String, ChatError> {
    let text = text.trim();
    if text.is_empty() {
        return Err(ChatError::InvalidArgument("message text is empty".to_string()));
    }
    if text.chars().count() > MAX_MESSAGE_CHARS {
        return Err(ChatError::InvalidArgument(format!(
            "message text exceeds {} characters",
            MAX_MESSAGE_CHARS
        )));
    }
    Ok(text.to_string())
}

fn into_message(row: MessageRow) -> Result<Message, ChatError> {
    row.into_message()
        .map_err(|e| ChatError::Internal(format!("{:#}", e)))
}
