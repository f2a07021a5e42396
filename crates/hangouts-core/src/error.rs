//! Error taxonomy shared across the workspace.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HangoutsError>;

#[derive(Debug, Error)]
pub enum HangoutsError {
    /// Missing credential or unreadable config. Fatal at startup.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Rejected synchronously by `schedule()`; never enters the registry.
    #[error("Invalid schedule: {0}")]
    InvalidSchedule(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Engine error: {reason}")]
    Engine { reason: String, transient: bool },

    #[error("Delivery error: {0}")]
    Delivery(String),

    #[error("Channel error: {0}")]
    Channel(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl HangoutsError {
    pub fn engine_transient(reason: impl Into<String>) -> Self {
        Self::Engine { reason: reason.into(), transient: true }
    }

    pub fn engine_fatal(reason: impl Into<String>) -> Self {
        Self::Engine { reason: reason.into(), transient: false }
    }

    /// Whether retrying the same operation later can succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Persistence(_) | Self::Engine { transient: true, .. }
        )
    }
}
