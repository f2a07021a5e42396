//! Conversational engine trait.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{Intent, UserContext};

/// Turns an intent plus the owner's context into text for the user.
///
/// Failure modes: timeouts and rate limits surface as transient
/// `HangoutsError::Engine`, refusals and malformed output as non-transient.
#[async_trait]
pub trait ConversationalEngine: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, context: &UserContext, intent: Intent) -> Result<String>;
}
