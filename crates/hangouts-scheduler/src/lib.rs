//! # Hangouts Scheduler
//!
//! Alarm scheduling and event delivery pipeline.
//!
//! ## Architecture
//! ```text
//! AlarmService (registry + loop, sleeps until next due ≤ poll interval)
//!   ├── schedule / cancel / list  → registry (one mutex) + session write
//!   ├── due alarm → Fired + queued event persisted → EventQueue
//!   └── DeliveryOutcome ← processor  → re-arm (recurring) / archive
//!
//! AlarmEventProcessor
//!   └── event → session → idempotency check → context → engine
//!             → interaction + Delivered committed → Notifier
//! ```

pub mod processor;
pub mod queue;
pub mod recurrence;
pub mod registry;
pub mod retry;
pub mod service;

pub use processor::{AlarmEventProcessor, Disposition};
pub use queue::{EventReceiver, EventSender, InFlight};
pub use recurrence::CronSchedule;
pub use retry::RetryPolicy;
pub use service::{AlarmService, TickReport};
