//! Seams to the external collaborators.

pub mod channel;
pub mod engine;
pub mod listener;
pub mod session;

pub use channel::Channel;
pub use engine::ConversationalEngine;
pub use listener::{Notifier, NotificationListener};
pub use session::{Session, SessionFactory};
