//! # Hangouts Core
//!
//! Shared vocabulary for every Hangouts crate: configuration, the error
//! taxonomy, the alarm data model and the traits behind which the external
//! collaborators (persistence, conversational engine, chat platforms) live.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::HangoutsConfig;
pub use error::{HangoutsError, Result};
