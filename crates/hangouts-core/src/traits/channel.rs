//! Integration adapter trait, one implementation per chat platform.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

#[async_trait]
pub trait Channel: Send + Sync {
    /// Channel name ("cli", "discord", ...).
    fn name(&self) -> &str;

    /// Deliver a notification to a user.
    async fn notify(&self, owner_id: &str, text: &str) -> Result<()>;

    /// Serve inbound traffic until `cancel` fires or the source is exhausted.
    async fn serve(&self, cancel: CancellationToken) -> Result<()>;
}
