pub mod auth;
pub mod chats;
pub mod conversations;
pub mod error;
pub mod identity;
pub mod message_log;
pub mod messages;
pub mod middleware;
pub mod routes;
pub mod users;

pub use auth::{AppState, AppStateInner};
pub use routes::router;
