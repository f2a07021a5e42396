//! Inbound conversation: one user message in, one engine reply out.

use std::sync::Arc;

use hangouts_core::error::Result;
use hangouts_core::traits::{ConversationalEngine, SessionFactory};
use hangouts_core::types::{Intent, Interaction};

pub struct ConversationHandler {
    sessions: Arc<dyn SessionFactory>,
    engine: Arc<dyn ConversationalEngine>,
    history_limit: usize,
}

impl ConversationHandler {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        engine: Arc<dyn ConversationalEngine>,
        history_limit: usize,
    ) -> Self {
        Self { sessions, engine, history_limit }
    }

    /// Answer a message in the context of the owner's history and record the exchange.
    pub async fn respond(&self, owner_id: &str, text: &str) -> Result<String> {
        let mut session = self.sessions.open().await?;
        let context = session.load_context(owner_id, self.history_limit).await?;

        let intent = Intent::Message { text: text.to_string() };
        let reply = match self.engine.generate(&context, intent).await {
            Ok(reply) => reply.trim().to_string(),
            Err(e) => {
                let failed =
                    Interaction::for_message(owner_id, text, None).with_error(e.to_string());
                if let Err(record_err) = session.record_interaction(&failed).await {
                    tracing::debug!("Failed interaction not recorded: {record_err}");
                } else if let Err(commit_err) = session.commit().await {
                    tracing::debug!("Failed interaction not committed: {commit_err}");
                }
                return Err(e);
            }
        };

        session
            .record_interaction(&Interaction::for_message(owner_id, text, Some(reply.clone())))
            .await?;
        session.commit().await?;
        tracing::debug!(owner_id, "💬 Replied ({} chars)", reply.len());
        Ok(reply)
    }
}
