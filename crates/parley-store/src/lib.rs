pub mod config;
pub mod conversations;

pub use config::StoreConfig;
pub use conversations::ConversationStore;
