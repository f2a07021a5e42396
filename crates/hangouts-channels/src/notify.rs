//! Notifier hub: fans one outbound notification out to every registered listener.
//!
//! Listeners are awaited one by one in registration order. A failing listener
//! is logged and skipped; `notify` succeeds when at least one accepted.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::traits::{Channel, NotificationListener, Notifier};

/// Handle returned by `register`, used to unregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

type Registered = (ListenerId, Arc<dyn NotificationListener>);

#[derive(Default)]
pub struct NotifierHub {
    listeners: RwLock<Vec<Registered>>,
    next_id: AtomicU64,
}

impl NotifierHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, listener: Arc<dyn NotificationListener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::SeqCst));
        tracing::debug!("Listener '{}' registered", listener.name());
        self.write().push((id, listener));
        id
    }

    /// Returns whether the listener was registered.
    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut listeners = self.write();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id);
        listeners.len() < before
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Registered> {
        self.listeners
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<Registered>> {
        self.listeners.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Notifier for NotifierHub {
    async fn notify(&self, owner_id: &str, text: &str) -> Result<()> {
        let listeners = self.snapshot();
        if listeners.is_empty() {
            return Err(HangoutsError::Delivery("no notification listeners registered".into()));
        }

        let mut accepted = 0;
        let mut errors = Vec::new();
        for (_, listener) in &listeners {
            match listener.on_notify(owner_id, text).await {
                Ok(()) => accepted += 1,
                Err(e) => {
                    tracing::warn!(owner_id, "⚠️ Listener '{}' failed: {e}", listener.name());
                    errors.push(format!("{}: {e}", listener.name()));
                }
            }
        }

        if accepted == 0 {
            return Err(HangoutsError::Delivery(format!(
                "no listener accepted the notification ({})",
                errors.join("; ")
            )));
        }
        Ok(())
    }
}

/// Delivers notifications through a chat platform adapter.
pub struct ChannelListener {
    channel: Arc<dyn Channel>,
}

impl ChannelListener {
    pub fn new(channel: Arc<dyn Channel>) -> Self {
        Self { channel }
    }
}

#[async_trait]
impl NotificationListener for ChannelListener {
    fn name(&self) -> &str {
        self.channel.name()
    }

    async fn on_notify(&self, owner_id: &str, text: &str) -> Result<()> {
        self.channel.notify(owner_id, text).await
    }
}
