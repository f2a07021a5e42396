//! Inbound message validation.

use hangouts_core::config::ValidatorConfig;
use hangouts_core::error::{HangoutsError, Result};

#[derive(Debug, Clone)]
pub struct MessageValidator {
    max_tokens: usize,
}

impl MessageValidator {
    pub fn new(config: &ValidatorConfig) -> Self {
        Self { max_tokens: config.max_tokens }
    }

    /// Rough token estimate: whitespace-separated words × 4/3, rounded up.
    pub fn approx_tokens(text: &str) -> usize {
        let words = text.split_whitespace().count();
        (words * 4).div_ceil(3)
    }

    pub fn validate(&self, text: &str) -> Result<()> {
        if text.trim().is_empty() {
            return Err(HangoutsError::Validation("message is empty".into()));
        }
        let tokens = Self::approx_tokens(text);
        if tokens > self.max_tokens {
            return Err(HangoutsError::Validation(format!(
                "message is too long (~{tokens} tokens, limit {})",
                self.max_tokens
            )));
        }
        Ok(())
    }
}
