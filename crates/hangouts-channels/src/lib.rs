//! # Hangouts Channels
//!
//! Outbound: `NotifierHub` fans a notification out to registered listeners.
//! Inbound: chat platform adapters (`CliChannel`, `DiscordChannel`) plus the
//! message validator and the conversation handler they share.

pub mod cli;
pub mod conversation;
pub mod discord;
pub mod notify;
pub mod validator;

pub use cli::CliChannel;
pub use conversation::ConversationHandler;
pub use discord::DiscordChannel;
pub use notify::{ChannelListener, ListenerId, NotifierHub};
pub use validator::MessageValidator;
