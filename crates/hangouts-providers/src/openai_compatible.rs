//! OpenAI-compatible chat completions engine.
//!
//! Timeouts, connection failures, 429 and 5xx are transient; any other
//! error status, a refusal, or a reply without text is not.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use hangouts_core::config::LlmConfig;
use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::traits::ConversationalEngine;
use hangouts_core::types::{Intent, UserContext};

use crate::prompt;

pub struct OpenAiCompatibleEngine {
    api_key: String,
    /// Base URL, e.g. "https://api.openai.com/v1".
    base_url: String,
    model: String,
    temperature: f32,
    max_tokens: u32,
    system_prompt: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleEngine {
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| HangoutsError::Config(format!("HTTP client: {e}")))?;
        Ok(Self {
            api_key: config.api_key.clone(),
            base_url: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            system_prompt: config.system_prompt.clone(),
            client,
        })
    }

    fn apply_auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        if self.api_key.is_empty() {
            req
        } else {
            req.header("Authorization", format!("Bearer {}", self.api_key))
        }
    }
}

/// Map a non-success HTTP status to an engine error.
pub fn status_error(status: u16, body: &str) -> HangoutsError {
    let reason = format!("API error {status}: {}", body.chars().take(300).collect::<String>());
    if status == 429 || status >= 500 {
        HangoutsError::engine_transient(reason)
    } else {
        HangoutsError::engine_fatal(reason)
    }
}

/// Extract the reply text from a chat completions response.
pub fn parse_reply(json: &Value) -> Result<String> {
    let choice = json["choices"]
        .get(0)
        .ok_or_else(|| HangoutsError::engine_fatal("No choices in response"))?;

    if let Some(refusal) = choice["message"]["refusal"].as_str() {
        return Err(HangoutsError::engine_fatal(format!("Model refused: {refusal}")));
    }
    if choice["finish_reason"].as_str() == Some("content_filter") {
        return Err(HangoutsError::engine_fatal("Reply blocked by content filter"));
    }

    let content = choice["message"]["content"]
        .as_str()
        .map(str::trim)
        .unwrap_or_default();
    if content.is_empty() {
        return Err(HangoutsError::engine_fatal("Empty reply"));
    }
    Ok(content.to_string())
}

#[async_trait]
impl ConversationalEngine for OpenAiCompatibleEngine {
    fn name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, context: &UserContext, intent: Intent) -> Result<String> {
        let messages = prompt::build_messages(&self.system_prompt, context, &intent);
        let body = json!({
            "model": self.model,
            "temperature": self.temperature,
            "max_tokens": self.max_tokens,
            "messages": messages,
        });

        let url = format!("{}/chat/completions", self.base_url);
        let req = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(&body);
        let req = self.apply_auth(req);

        let resp = req.send().await.map_err(|e| {
            HangoutsError::engine_transient(format!("{} request failed ({url}): {e}", self.model))
        })?;

        if !resp.status().is_success() {
            let status = resp.status().as_u16();
            let text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &text));
        }

        let json: Value = resp
            .json()
            .await
            .map_err(|e| HangoutsError::engine_fatal(format!("Malformed response: {e}")))?;
        let reply = parse_reply(&json)?;
        tracing::debug!(
            owner_id = %context.owner_id,
            "🧠 {} replied ({} chars)",
            self.model,
            reply.len()
        );
        Ok(reply)
    }
}
