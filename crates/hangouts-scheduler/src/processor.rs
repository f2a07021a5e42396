//! Alarm event processor: turns fired alarms into delivered notifications.
//!
//! For every event: open a session, skip if the occurrence was already
//! delivered, load the owner's context, ask the engine for the text, persist
//! the interaction and the Delivered status, then hand the text to the
//! notifier. Transient failures are retried with backoff. Every event is
//! acknowledged exactly once; terminal events also produce one outcome.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use hangouts_core::config::ProcessorConfig;
use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::traits::{ConversationalEngine, Notifier, SessionFactory};
use hangouts_core::types::{
    AlarmEvent, DeliveryOutcome, EventStatus, Intent, Interaction,
};

use crate::queue::{EventReceiver, InFlight};
use crate::retry::RetryPolicy;

/// How processing of one event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    /// Already delivered in an earlier run; not notified again.
    Duplicate,
    Failed,
    /// Interrupted by shutdown; left queued in storage for the next run.
    Requeued,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "delivered",
            Self::Duplicate => "duplicate",
            Self::Failed => "failed",
            Self::Requeued => "requeued",
        }
    }

    fn outcome_status(&self) -> Option<EventStatus> {
        match self {
            Self::Delivered | Self::Duplicate => Some(EventStatus::Delivered),
            Self::Failed => Some(EventStatus::Failed),
            Self::Requeued => None,
        }
    }
}

enum Step {
    Delivered,
    Duplicate,
    Interrupted,
}

pub struct AlarmEventProcessor {
    sessions: Arc<dyn SessionFactory>,
    engine: Arc<dyn ConversationalEngine>,
    notifier: Arc<dyn Notifier>,
    outcomes: mpsc::UnboundedSender<DeliveryOutcome>,
    retry: RetryPolicy,
    history_limit: usize,
}

impl AlarmEventProcessor {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        engine: Arc<dyn ConversationalEngine>,
        notifier: Arc<dyn Notifier>,
        outcomes: mpsc::UnboundedSender<DeliveryOutcome>,
        config: &ProcessorConfig,
    ) -> Self {
        Self {
            sessions,
            engine,
            notifier,
            outcomes,
            retry: RetryPolicy::from_config(config),
            history_limit: config.history_limit,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Consume events until cancellation or until the queue closes.
    pub async fn run(&self, mut events: EventReceiver, cancel: CancellationToken) -> Result<()> {
        tracing::info!(
            "📨 Alarm event processor started (engine: {}, max attempts: {})",
            self.engine.name(),
            self.retry.max_attempts
        );
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                next = events.recv() => match next {
                    Some(item) => {
                        self.handle(item, &cancel).await;
                    }
                    None => break,
                },
            }
        }
        tracing::info!("⏹️ Alarm event processor stopped");
        Ok(())
    }

    /// Process one dequeued event to a disposition and acknowledge it.
    pub async fn handle(&self, item: InFlight, cancel: &CancellationToken) -> Disposition {
        let mut event = item.event().clone();
        event.status = EventStatus::Processing;
        let span = tracing::info_span!(
            "alarm_event",
            alarm_id = %event.alarm_id,
            event_id = %event.id,
            owner_id = %event.owner_id,
        );

        let started = Instant::now();
        let (disposition, attempts) = self.process(&event, cancel).instrument(span).await;

        if let Some(status) = disposition.outcome_status() {
            let outcome = DeliveryOutcome {
                alarm_id: event.alarm_id.clone(),
                event_id: event.id.clone(),
                fire_at: event.fire_at,
                status,
            };
            if self.outcomes.send(outcome).is_err() {
                tracing::debug!(alarm_id = %event.alarm_id, "Alarm service gone, outcome dropped");
            }
        }

        tracing::info!(
            target: "hangouts::metrics",
            alarm_id = %event.alarm_id,
            event_id = %event.id,
            attempts,
            elapsed_ms = started.elapsed().as_millis() as u64,
            status = disposition.as_str(),
            "alarm_event_processed"
        );
        item.ack();
        disposition
    }

    async fn process(&self, event: &AlarmEvent, cancel: &CancellationToken) -> (Disposition, u32) {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let err = match self.attempt(event, cancel).await {
                Ok(Step::Delivered) => {
                    tracing::info!("✅ Reminder delivered");
                    return (Disposition::Delivered, attempt);
                }
                Ok(Step::Duplicate) => {
                    tracing::info!("⏭️ Occurrence already delivered, skipping notification");
                    return (Disposition::Duplicate, attempt);
                }
                Ok(Step::Interrupted) => return (Disposition::Requeued, attempt),
                Err(e) => e,
            };

            if err.is_transient() && self.retry.should_retry(attempt) {
                let delay = self.retry.delay_for(attempt);
                tracing::warn!(
                    "⚠️ Attempt {attempt}/{} failed, retrying in {}ms: {err}",
                    self.retry.max_attempts,
                    delay.as_millis()
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        tracing::debug!("Shutdown during backoff, event stays queued");
                        return (Disposition::Requeued, attempt);
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                continue;
            }

            tracing::error!("❌ Reminder failed after {attempt} attempt(s): {err}");
            self.record_failure(event, &err).await;
            return (Disposition::Failed, attempt);
        }
    }

    async fn attempt(&self, event: &AlarmEvent, cancel: &CancellationToken) -> Result<Step> {
        let mut session = self.sessions.open().await?;

        if session.event_delivered(&event.alarm_id, event.fire_at).await? {
            let done = AlarmEvent { status: EventStatus::Delivered, ..event.clone() };
            session.save_event(&done).await?;
            session.commit().await?;
            return Ok(Step::Duplicate);
        }

        let context = session.load_context(&event.owner_id, self.history_limit).await?;
        let intent = Intent::Alarm { payload: event.payload.clone(), fire_at: event.fire_at };

        let reply = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(Step::Interrupted),
            reply = self.engine.generate(&context, intent) => reply?,
        };
        let reply = reply.trim().to_string();
        if reply.is_empty() {
            return Err(HangoutsError::engine_fatal("engine returned an empty reply"));
        }

        session
            .record_interaction(&Interaction::for_event(
                event,
                Some(reply.clone()),
                EventStatus::Delivered,
            ))
            .await?;
        let done = AlarmEvent { status: EventStatus::Delivered, ..event.clone() };
        session.save_event(&done).await?;
        session.commit().await?;

        self.notifier.notify(&event.owner_id, &reply).await?;
        Ok(Step::Delivered)
    }

    /// Best effort: a failure record that cannot be written is only logged.
    async fn record_failure(&self, event: &AlarmEvent, err: &HangoutsError) {
        let write = async {
            let mut session = self.sessions.open().await?;
            let failed = AlarmEvent { status: EventStatus::Failed, ..event.clone() };
            session.save_event(&failed).await?;
            session
                .record_interaction(
                    &Interaction::for_event(event, None, EventStatus::Failed)
                        .with_error(err.to_string()),
                )
                .await?;
            session.commit().await
        };
        if let Err(e) = write.await {
            tracing::warn!("⚠️ Could not record failure: {e}");
        }
    }
}
