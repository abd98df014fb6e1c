pub mod connection;
pub mod dispatcher;
pub mod locks;
pub mod session;
pub mod tokens;

pub use dispatcher::{Dispatcher, Targets};
pub use locks::ConversationLocks;
pub use session::SessionManager;
pub use tokens::TokenAuthority;
