//! Outbound notification listeners.

use async_trait::async_trait;

use crate::error::Result;

/// Something that wants to hear about outbound notifications.
#[async_trait]
pub trait NotificationListener: Send + Sync {
    fn name(&self) -> &str;

    async fn on_notify(&self, owner_id: &str, text: &str) -> Result<()>;
}

/// Outbound delivery as seen by the event processor.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, owner_id: &str, text: &str) -> Result<()>;
}
