//! Alarm data model and the conversation types the engine works with.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A scheduled, possibly recurring reminder owned by a user.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Alarm {
    /// Unique alarm ID.
    pub id: String,
    /// User the reminder belongs to (and is delivered to).
    pub owner_id: String,
    /// Next (or, once fired, the current) occurrence.
    pub trigger_at: DateTime<Utc>,
    /// How to re-arm after a firing completes. `None` = one-shot.
    pub recurrence: Option<Recurrence>,
    pub status: AlarmStatus,
    /// What the user asked to be reminded about.
    pub payload: String,
    pub created_at: DateTime<Utc>,
    pub last_fired_at: Option<DateTime<Utc>>,
    pub fire_count: u32,
}

/// Input to `schedule()`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmSpec {
    pub owner_id: String,
    pub trigger_at: DateTime<Utc>,
    pub recurrence: Option<Recurrence>,
    pub payload: String,
}

impl AlarmSpec {
    /// One-shot reminder.
    pub fn once(owner_id: &str, at: DateTime<Utc>, payload: &str) -> Self {
        Self {
            owner_id: owner_id.to_string(),
            trigger_at: at,
            recurrence: None,
            payload: payload.to_string(),
        }
    }

    /// Reminder repeating every `every_secs`, first firing at `at`.
    pub fn every(owner_id: &str, at: DateTime<Utc>, every_secs: u64, payload: &str) -> Self {
        Self {
            recurrence: Some(Recurrence::Interval { every_secs }),
            ..Self::once(owner_id, at, payload)
        }
    }

    /// Reminder following a 5-field cron expression (UTC).
    pub fn cron(owner_id: &str, at: DateTime<Utc>, expression: &str, payload: &str) -> Self {
        Self {
            recurrence: Some(Recurrence::Cron { expression: expression.to_string() }),
            ..Self::once(owner_id, at, payload)
        }
    }
}

/// Recurrence rule.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Recurrence {
    /// Every N seconds.
    Interval { every_secs: u64 },
    /// "MIN HOUR DOM MON DOW".
    Cron { expression: String },
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AlarmStatus {
    Pending,
    Fired,
    Cancelled,
}

impl AlarmStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Fired => "fired",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "fired" => Some(Self::Fired),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// The firing of one alarm occurrence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AlarmEvent {
    pub id: String,
    pub alarm_id: String,
    pub owner_id: String,
    pub payload: String,
    /// Trigger time of the occurrence. Together with `alarm_id` this is the
    /// idempotency key for delivery.
    pub fire_at: DateTime<Utc>,
    pub status: EventStatus,
}

impl AlarmEvent {
    /// New queued event for the alarm's current occurrence.
    pub fn for_alarm(alarm: &Alarm) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            alarm_id: alarm.id.clone(),
            owner_id: alarm.owner_id.clone(),
            payload: alarm.payload.clone(),
            fire_at: alarm.trigger_at,
            status: EventStatus::Queued,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Queued,
    Processing,
    Delivered,
    Failed,
}

impl EventStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Processing => "processing",
            Self::Delivered => "delivered",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(Self::Queued),
            "processing" => Some(Self::Processing),
            "delivered" => Some(Self::Delivered),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Failed)
    }
}

/// Terminal result of one event, reported back to the alarm service.
#[derive(Debug, Clone, PartialEq)]
pub struct DeliveryOutcome {
    pub alarm_id: String,
    pub event_id: String,
    pub fire_at: DateTime<Utc>,
    pub status: EventStatus,
}

/// Audit record of one engine round-trip.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interaction {
    pub id: String,
    pub owner_id: String,
    pub kind: InteractionKind,
    pub alarm_id: Option<String>,
    pub event_id: Option<String>,
    pub prompt: String,
    pub response: Option<String>,
    pub outcome: EventStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Interaction {
    /// Interaction produced by an alarm event.
    pub fn for_event(event: &AlarmEvent, response: Option<String>, outcome: EventStatus) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: event.owner_id.clone(),
            kind: InteractionKind::Alarm,
            alarm_id: Some(event.alarm_id.clone()),
            event_id: Some(event.id.clone()),
            prompt: event.payload.clone(),
            response,
            outcome,
            error: None,
            created_at: Utc::now(),
        }
    }

    /// Interaction produced by an inbound user message.
    pub fn for_message(owner_id: &str, text: &str, response: Option<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: owner_id.to_string(),
            kind: InteractionKind::Message,
            alarm_id: None,
            event_id: None,
            prompt: text.to_string(),
            outcome: if response.is_some() { EventStatus::Delivered } else { EventStatus::Failed },
            response,
            error: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InteractionKind {
    Alarm,
    Message,
}

impl InteractionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Alarm => "alarm",
            Self::Message => "message",
        }
    }
}

/// Conversation role.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// A chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: &str) -> Self {
        Self { role: Role::System, content: content.to_string() }
    }

    pub fn user(content: &str) -> Self {
        Self { role: Role::User, content: content.to_string() }
    }

    pub fn assistant(content: &str) -> Self {
        Self { role: Role::Assistant, content: content.to_string() }
    }
}

/// Everything the engine gets to know about the owner.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UserContext {
    pub owner_id: String,
    pub preferences: HashMap<String, String>,
    /// Oldest first.
    pub history: Vec<Message>,
}

impl UserContext {
    pub fn new(owner_id: &str) -> Self {
        Self { owner_id: owner_id.to_string(), ..Default::default() }
    }
}

/// What the engine is asked to do.
#[derive(Debug, Clone, PartialEq)]
pub enum Intent {
    /// An alarm fired; turn its payload into a notification.
    Alarm { payload: String, fire_at: DateTime<Utc> },
    /// The user said something.
    Message { text: String },
}
