//! # Hangouts Providers
//!
//! Conversational engines. One implementation: any OpenAI-compatible
//! chat completions endpoint (OpenAI, Groq, OpenRouter, Ollama, ...),
//! distinguished only by `llm.endpoint`, `llm.model` and the API key.

pub mod openai_compatible;
pub mod prompt;

pub use openai_compatible::OpenAiCompatibleEngine;

use std::sync::Arc;

use hangouts_core::config::LlmConfig;
use hangouts_core::error::Result;
use hangouts_core::traits::ConversationalEngine;

/// Create the configured conversational engine.
pub fn create_engine(config: &LlmConfig) -> Result<Arc<dyn ConversationalEngine>> {
    Ok(Arc::new(OpenAiCompatibleEngine::from_config(config)?))
}
