//! Discord channel, REST only. Notifications go out as direct messages;
//! `serve` verifies the bot token and then idles until shutdown.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use hangouts_core::config::DiscordConfig;
use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::traits::Channel;

/// Discord rejects messages longer than this.
pub const MAX_MESSAGE_CHARS: usize = 2000;

#[derive(Debug, Deserialize)]
pub struct DiscordUser {
    pub id: String,
    pub username: String,
}

#[derive(Debug, Deserialize)]
struct DmChannel {
    id: String,
}

pub struct DiscordChannel {
    bot_token: String,
    api_base: String,
    client: reqwest::Client,
    /// owner id → DM channel id
    dm_channels: Mutex<HashMap<String, String>>,
}

impl DiscordChannel {
    pub fn from_config(config: &DiscordConfig) -> Result<Self> {
        Self::new(
            &config.bot_token,
            &config.api_base,
            Duration::from_secs(config.timeout_secs.max(1)),
        )
    }

    /// Every request, including DM delivery, gives up after `timeout`.
    pub fn new(bot_token: &str, api_base: &str, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| HangoutsError::Config(format!("Failed to build Discord client: {e}")))?;
        Ok(Self {
            bot_token: bot_token.to_string(),
            api_base: api_base.trim_end_matches('/').to_string(),
            client,
            dm_channels: Mutex::new(HashMap::new()),
        })
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}{}", self.api_base, path)
    }

    fn auth(&self, req: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        req.header("Authorization", format!("Bot {}", self.bot_token))
    }

    async fn check(resp: reqwest::Response, what: &str) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status();
        let text = resp.text().await.unwrap_or_default();
        Err(HangoutsError::Channel(format!("Discord {what} failed ({status}): {text}")))
    }

    /// The bot's own user; fails on an invalid token.
    pub async fn get_me(&self) -> Result<DiscordUser> {
        let resp = self
            .auth(self.client.get(self.api_url("/users/@me")))
            .send()
            .await
            .map_err(|e| HangoutsError::Channel(format!("Discord getMe failed: {e}")))?;
        Self::check(resp, "getMe")
            .await?
            .json()
            .await
            .map_err(|e| HangoutsError::Channel(format!("Invalid Discord user: {e}")))
    }

    async fn dm_channel(&self, owner_id: &str) -> Result<String> {
        if let Some(id) = self.dm_channels.lock().await.get(owner_id) {
            return Ok(id.clone());
        }
        let resp = self
            .auth(self.client.post(self.api_url("/users/@me/channels")))
            .json(&serde_json::json!({ "recipient_id": owner_id }))
            .send()
            .await
            .map_err(|e| HangoutsError::Channel(format!("Discord open DM failed: {e}")))?;
        let channel: DmChannel = Self::check(resp, "open DM")
            .await?
            .json()
            .await
            .map_err(|e| HangoutsError::Channel(format!("Invalid DM channel: {e}")))?;
        self.dm_channels
            .lock()
            .await
            .insert(owner_id.to_string(), channel.id.clone());
        Ok(channel.id)
    }

    pub async fn send_message(&self, channel_id: &str, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_CHARS) {
            let resp = self
                .auth(self.client.post(self.api_url(&format!("/channels/{channel_id}/messages"))))
                .json(&serde_json::json!({ "content": chunk }))
                .send()
                .await
                .map_err(|e| HangoutsError::Channel(format!("Discord send failed: {e}")))?;
            Self::check(resp, "send").await?;
        }
        Ok(())
    }
}

/// Split text into pieces of at most `max` characters, preferring line breaks.
pub fn split_message(text: &str, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut len = 0;
    for line in text.split_inclusive('\n') {
        let line_len = line.chars().count();
        if len + line_len > max && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
            len = 0;
        }
        if line_len > max {
            let chars: Vec<char> = line.chars().collect();
            for piece in chars.chunks(max) {
                chunks.push(piece.iter().collect());
            }
            continue;
        }
        current.push_str(line);
        len += line_len;
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

#[async_trait]
impl Channel for DiscordChannel {
    fn name(&self) -> &str {
        "discord"
    }

    async fn notify(&self, owner_id: &str, text: &str) -> Result<()> {
        if owner_id.is_empty() || !owner_id.chars().all(|c| c.is_ascii_digit()) {
            return Err(HangoutsError::Channel(format!("'{owner_id}' is not a Discord user id")));
        }
        let channel_id = self.dm_channel(owner_id).await?;
        self.send_message(&channel_id, text).await?;
        tracing::debug!(owner_id, "📤 Discord DM sent");
        Ok(())
    }

    async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        let me = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(()),
            me = self.get_me() => me?,
        };
        tracing::info!("🤖 Discord connected as {} ({})", me.username, me.id);
        cancel.cancelled().await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_split_message() {
        assert_eq!(split_message("hello", 2000), vec!["hello"]);
        assert_eq!(split_message("ab\ncd\nef", 5), vec!["ab\n", "cd\nef"]);
        assert_eq!(split_message("abcdefg", 3), vec!["abc", "def", "g"]);
        assert!(split_message("", 10).is_empty());
    }

    fn local(api_base: &str) -> DiscordChannel {
        DiscordChannel::new("t", api_base, Duration::from_secs(5)).unwrap()
    }

    #[test]
    fn test_api_url() {
        let d = local("http://localhost:9/api/");
        assert_eq!(d.api_url("/users/@me"), "http://localhost:9/api/users/@me");
    }

    #[test]
    fn test_from_config() {
        let config = DiscordConfig { api_base: "http://localhost:9/".into(), ..Default::default() };
        let d = DiscordChannel::from_config(&config).unwrap();
        assert_eq!(d.api_url("/x"), "http://localhost:9/x");
    }

    #[tokio::test]
    async fn test_non_discord_owner_is_rejected_without_network() {
        let d = local("http://127.0.0.1:9");
        let err = d.notify("console", "hi").await.unwrap_err();
        assert!(matches!(err, HangoutsError::Channel(_)));
    }

    #[tokio::test]
    async fn test_stalled_api_times_out() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let d = DiscordChannel::new("t", &format!("http://{addr}"), Duration::from_millis(200))
            .unwrap();
        let result = tokio::time::timeout(
            Duration::from_secs(5),
            d.notify("123456789012345678", "Reminder: stand-up"),
        )
        .await
        .expect("notify hung past the request timeout");
        assert!(matches!(result, Err(HangoutsError::Channel(_))));
        server.abort();
    }

    #[tokio::test]
    async fn test_serve_returns_on_cancel() {
        let d = local("http://127.0.0.1:9");
        let cancel = CancellationToken::new();
        cancel.cancel();
        d.serve(cancel).await.unwrap();
    }
}
