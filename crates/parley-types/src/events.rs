use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::ErrorKind;
use crate::models::{Conversation, Message, PresenceStatus};

/// Events sent over the WebSocket gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayEvent {
    /// Server confirms successful authentication
    Ready { user_id: Uuid, name: String },

    /// The connection now receives live updates for this conversation
    Subscribed { chat_id: Uuid },

    Unsubscribed { chat_id: Uuid },

    /// The connection now receives conversation-list updates for its user
    InboxSubscribed,

    /// A message was appended to a conversation's log
    MessageCreate(Message),

    /// A message was edited
    MessageUpdate(Message),

    MessageDelete { chat_id: Uuid, message_id: Uuid, seq: i64 },

    /// Summary fields or participant names of a conversation changed
    ConversationUpdate(Conversation),

    ConversationDelete { chat_id: Uuid },

    /// A conversation partner came online or went offline
    PresenceUpdate {
        user_id: Uuid,
        status: PresenceStatus,
        last_seen: DateTime<Utc>,
    },

    /// Live delivery stopped because this connection fell behind.
    /// `chat_id: None` refers to the inbox. The client resubscribes and
    /// catches up from its last seen `seq`.
    SubscriptionLost { chat_id: Option<Uuid> },

    /// A command failed. The connection stays open.
    Error {
        kind: ErrorKind,
        message: String,
        chat_id: Option<Uuid>,
    },
}

impl GatewayEvent {
    /// Returns the conversation this event belongs to, if any.
    pub fn chat_id(&self) -> Option<Uuid> {
        match self {
            Self::Subscribed { chat_id }
            | Self::Unsubscribed { chat_id }
            | Self::MessageDelete { chat_id, .. }
            | Self::ConversationDelete { chat_id } => Some(*chat_id),
            Self::MessageCreate(message) | Self::MessageUpdate(message) => Some(message.chat_id),
            Self::ConversationUpdate(conversation) => Some(conversation.id),
            Self::SubscriptionLost { chat_id } | Self::Error { chat_id, .. } => *chat_id,
            Self::Ready { .. } | Self::InboxSubscribed | Self::PresenceUpdate { .. } => None,
        }
    }
}

/// Commands sent FROM client TO server over WebSocket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum GatewayCommand {
    /// Authenticate the WebSocket connection when no token was given at upgrade
    Identify { token: String },

    /// Receive live updates for one conversation. Repeating it is a no-op.
    Subscribe { chat_id: Uuid },

    Unsubscribe { chat_id: Uuid },

    /// Receive conversation-list updates (summaries, deletes, presence)
    SubscribeInbox,

    UnsubscribeInbox,
}
