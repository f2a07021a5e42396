//! Scoped persistence sessions.
//!
//! Every operation opens its own session; writes become visible only after
//! `commit`. Dropping an uncommitted session discards its writes.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::types::{Alarm, AlarmEvent, Interaction, UserContext};

#[async_trait]
pub trait SessionFactory: Send + Sync {
    /// Backend name ("sqlite", "memory").
    fn name(&self) -> &str;

    async fn open(&self) -> Result<Box<dyn Session>>;
}

#[async_trait]
pub trait Session: Send {
    /// All alarms that are not cancelled and not archived.
    async fn load_alarms(&mut self) -> Result<Vec<Alarm>>;

    /// Insert or replace an alarm.
    async fn save_alarm(&mut self, alarm: &Alarm) -> Result<()>;

    /// Persist the final state of a completed alarm and drop it from `load_alarms`.
    async fn archive_alarm(&mut self, alarm: &Alarm) -> Result<()>;

    /// Insert or replace an event by id.
    async fn save_event(&mut self, event: &AlarmEvent) -> Result<()>;

    /// Events that were queued but never reached a terminal status, oldest first.
    async fn load_unfinished_events(&mut self) -> Result<Vec<AlarmEvent>>;

    /// Whether an occurrence was already delivered.
    async fn event_delivered(&mut self, alarm_id: &str, fire_at: DateTime<Utc>) -> Result<bool>;

    /// Owner preferences plus the last `history_limit` conversation messages.
    async fn load_context(&mut self, owner_id: &str, history_limit: usize) -> Result<UserContext>;

    async fn record_interaction(&mut self, interaction: &Interaction) -> Result<()>;

    async fn commit(self: Box<Self>) -> Result<()>;
}
