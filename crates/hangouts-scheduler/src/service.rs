//! Alarm service: owns the registry and runs the scheduling loop.
//!
//! The loop sleeps until the next due alarm (bounded by the poll interval),
//! and is woken early by `schedule`, by delivery outcomes, and by
//! cancellation. Every registry mutation happens under one mutex; the lock
//! is held across the persistence write so memory and storage move together.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio_util::sync::CancellationToken;

use hangouts_core::config::SchedulerConfig;
use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::traits::SessionFactory;
use hangouts_core::types::{
    Alarm, AlarmEvent, AlarmSpec, AlarmStatus, DeliveryOutcome, EventStatus,
};

use crate::queue::EventSender;
use crate::recurrence;
use crate::registry::{AlarmRegistry, PendingWrite};

/// Minimum pause after a wake in which some storage write failed.
const FAILURE_BACKOFF: Duration = Duration::from_secs(1);

pub struct AlarmService {
    registry: Mutex<AlarmRegistry>,
    sessions: Arc<dyn SessionFactory>,
    events: EventSender,
    outcomes_tx: mpsc::UnboundedSender<DeliveryOutcome>,
    outcomes_rx: Mutex<Option<mpsc::UnboundedReceiver<DeliveryOutcome>>>,
    wake: Notify,
    max_poll: Duration,
}

/// What one wake of the loop did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickReport {
    pub fired: usize,
    pub failed_writes: usize,
}

impl AlarmService {
    pub fn new(
        sessions: Arc<dyn SessionFactory>,
        events: EventSender,
        config: &SchedulerConfig,
    ) -> Self {
        let (outcomes_tx, outcomes_rx) = mpsc::unbounded_channel();
        Self {
            registry: Mutex::new(AlarmRegistry::new()),
            sessions,
            events,
            outcomes_tx,
            outcomes_rx: Mutex::new(Some(outcomes_rx)),
            wake: Notify::new(),
            max_poll: config.max_poll_interval(),
        }
    }

    /// Where the event processor reports terminal outcomes.
    pub fn outcome_sender(&self) -> mpsc::UnboundedSender<DeliveryOutcome> {
        self.outcomes_tx.clone()
    }

    /// Validate, persist and register a new alarm.
    pub async fn schedule(&self, spec: AlarmSpec) -> Result<Alarm> {
        let now = Utc::now();
        if spec.owner_id.trim().is_empty() {
            return Err(HangoutsError::InvalidSchedule("owner id is empty".into()));
        }
        if spec.payload.trim().is_empty() {
            return Err(HangoutsError::InvalidSchedule("reminder text is empty".into()));
        }

        let trigger_at = match &spec.recurrence {
            Some(rule) => {
                recurrence::validate(rule, now)?;
                recurrence::first_occurrence_from(rule, spec.trigger_at, now).ok_or_else(|| {
                    HangoutsError::InvalidSchedule("recurrence has no future occurrence".into())
                })?
            }
            None if spec.trigger_at < now => {
                return Err(HangoutsError::InvalidSchedule(format!(
                    "trigger time {} is in the past",
                    spec.trigger_at.to_rfc3339()
                )));
            }
            None => spec.trigger_at,
        };

        let alarm = Alarm {
            id: uuid::Uuid::new_v4().to_string(),
            owner_id: spec.owner_id,
            trigger_at,
            recurrence: spec.recurrence,
            status: AlarmStatus::Pending,
            payload: spec.payload,
            created_at: now,
            last_fired_at: None,
            fire_count: 0,
        };

        {
            let mut registry = self.registry.lock().await;
            self.persist(&PendingWrite::Save(alarm.clone())).await?;
            registry.insert(alarm.clone());
        }
        self.wake.notify_one();

        tracing::info!(
            alarm_id = %alarm.id,
            owner_id = %alarm.owner_id,
            "📅 Alarm scheduled for {}",
            alarm.trigger_at.to_rfc3339()
        );
        Ok(alarm)
    }

    /// Cancel an alarm. Returns whether anything changed; unknown, fired
    /// one-shot and already cancelled alarms are `Ok(false)`.
    pub async fn cancel(&self, alarm_id: &str) -> Result<bool> {
        let mut registry = self.registry.lock().await;
        let Some(write) = registry.cancel(alarm_id) else {
            return Ok(false);
        };
        match self.persist(&write).await {
            Ok(()) => registry.clear_pending(alarm_id),
            Err(e) => {
                tracing::warn!(alarm_id, "⚠️ Cancellation not persisted yet, will retry: {e}");
                registry.defer(write);
            }
        }
        tracing::info!(alarm_id, "🚫 Alarm cancelled");
        Ok(true)
    }

    /// Live alarms of one owner, soonest first.
    pub async fn list(&self, owner_id: &str) -> Vec<Alarm> {
        self.registry.lock().await.owned_by(owner_id)
    }

    pub async fn get(&self, alarm_id: &str) -> Option<Alarm> {
        self.registry.lock().await.get(alarm_id).cloned()
    }

    /// Number of live alarms.
    pub async fn alarm_count(&self) -> usize {
        self.registry.lock().await.len()
    }

    /// Flush deferred writes, then fire every alarm due at `now`.
    pub async fn tick(&self, now: DateTime<Utc>) -> TickReport {
        let mut report = TickReport::default();
        let mut registry = self.registry.lock().await;

        for write in registry.take_pending() {
            if let Err(e) = self.persist(&write).await {
                tracing::warn!(
                    alarm_id = %write.alarm().id,
                    "⚠️ Deferred alarm write failed again: {e}"
                );
                registry.defer(write);
                report.failed_writes += 1;
            }
        }

        for alarm_id in registry.due(now) {
            let Some(fired) = registry.fired(&alarm_id, now) else {
                continue;
            };
            let event = AlarmEvent::for_alarm(&fired);

            if let Err(e) = self.persist_firing(&fired, &event).await {
                tracing::warn!(
                    alarm_id = %alarm_id,
                    "⚠️ Alarm stays pending, firing not persisted: {e}"
                );
                report.failed_writes += 1;
                continue;
            }
            registry.clear_pending(&alarm_id);
            registry.insert(fired);

            tracing::info!(
                alarm_id = %alarm_id,
                event_id = %event.id,
                owner_id = %event.owner_id,
                "🔔 Alarm fired"
            );
            if let Err(e) = self.events.push(event) {
                tracing::warn!(alarm_id = %alarm_id, "⚠️ {e}");
            }
            report.fired += 1;
        }
        report
    }

    /// Re-arm or archive the alarm behind a terminal event.
    pub async fn apply_outcome(&self, outcome: DeliveryOutcome) {
        let mut registry = self.registry.lock().await;
        let Some(write) = registry.complete(&outcome) else {
            tracing::debug!(
                alarm_id = %outcome.alarm_id,
                event_id = %outcome.event_id,
                "Outcome for an inactive occurrence ignored"
            );
            return;
        };

        match &write {
            PendingWrite::Save(next) => tracing::info!(
                alarm_id = %next.id,
                "🔁 Alarm re-armed for {}",
                next.trigger_at.to_rfc3339()
            ),
            PendingWrite::Archive(done) => tracing::info!(
                alarm_id = %done.id,
                status = outcome.status.as_str(),
                "🗄️ Alarm completed"
            ),
        }

        match self.persist(&write).await {
            Ok(()) => registry.clear_pending(&outcome.alarm_id),
            Err(e) => {
                tracing::warn!(alarm_id = %outcome.alarm_id, "⚠️ Alarm update deferred: {e}");
                registry.defer(write);
            }
        }
    }

    /// Load alarms from storage and re-enqueue events that never reached a
    /// terminal status. Returns the number of re-enqueued events.
    pub async fn recover(&self) -> Result<usize> {
        let (alarms, unfinished) = {
            let mut session = self.sessions.open().await?;
            let alarms = session.load_alarms().await?;
            let unfinished = session.load_unfinished_events().await?;
            (alarms, unfinished)
        };

        let orphaned: Vec<DeliveryOutcome> = {
            let mut registry = self.registry.lock().await;
            for alarm in alarms {
                if alarm.status != AlarmStatus::Cancelled && registry.get(&alarm.id).is_none() {
                    registry.insert(alarm);
                }
            }
            // Fired alarms whose event already finished lost their outcome.
            registry
                .in_flight()
                .into_iter()
                .filter(|a| {
                    !unfinished
                        .iter()
                        .any(|e| e.alarm_id == a.id && e.fire_at == a.trigger_at)
                })
                .map(|a| DeliveryOutcome {
                    alarm_id: a.id,
                    event_id: String::new(),
                    fire_at: a.trigger_at,
                    status: EventStatus::Delivered,
                })
                .collect()
        };

        let mut requeued = 0;
        for mut event in unfinished {
            event.status = EventStatus::Queued;
            tracing::info!(
                alarm_id = %event.alarm_id,
                event_id = %event.id,
                "♻️ Re-enqueueing unfinished event"
            );
            if let Err(e) = self.events.push(event) {
                tracing::warn!("⚠️ {e}");
                continue;
            }
            requeued += 1;
        }

        for outcome in orphaned {
            self.apply_outcome(outcome).await;
        }
        Ok(requeued)
    }

    /// Run the scheduling loop until `cancel` fires. May be started once.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut outcomes = self
            .outcomes_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| HangoutsError::Channel("alarm service already started".into()))?;

        loop {
            match self.recover().await {
                Ok(n) => {
                    tracing::debug!("Recovered {n} unfinished event(s)");
                    break;
                }
                Err(e) => {
                    tracing::warn!("⚠️ Alarm recovery failed, retrying: {e}");
                    tokio::select! {
                        _ = cancel.cancelled() => return Ok(()),
                        _ = tokio::time::sleep(self.max_poll) => {}
                    }
                }
            }
        }

        tracing::info!(
            "⏰ Alarm service started ({} alarms, poll ≤ {}s)",
            self.alarm_count().await,
            self.max_poll.as_secs()
        );

        loop {
            let report = self.tick(Utc::now()).await;
            let mut sleep_for = self.sleep_duration(Utc::now()).await;
            if report.failed_writes > 0 {
                sleep_for = sleep_for.max(FAILURE_BACKOFF).min(self.max_poll);
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                Some(outcome) = outcomes.recv() => self.apply_outcome(outcome).await,
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }

        tracing::info!("⏹️ Alarm service stopped");
        Ok(())
    }

    async fn sleep_duration(&self, now: DateTime<Utc>) -> Duration {
        match self.registry.lock().await.next_due_at() {
            Some(due) => (due - now).to_std().unwrap_or(Duration::ZERO).min(self.max_poll),
            None => self.max_poll,
        }
    }

    async fn persist(&self, write: &PendingWrite) -> Result<()> {
        let mut session = self.sessions.open().await?;
        match write {
            PendingWrite::Save(alarm) => session.save_alarm(alarm).await?,
            PendingWrite::Archive(alarm) => session.archive_alarm(alarm).await?,
        }
        session.commit().await
    }

    async fn persist_firing(&self, alarm: &Alarm, event: &AlarmEvent) -> Result<()> {
        let mut session = self.sessions.open().await?;
        session.save_alarm(alarm).await?;
        session.save_event(event).await?;
        session.commit().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;
    use hangouts_memory::MemorySessionFactory;

    use crate::queue::{self, EventReceiver};

    fn service() -> (Arc<MemorySessionFactory>, AlarmService, EventReceiver) {
        let store = Arc::new(MemorySessionFactory::new());
        let (tx, rx) = queue::channel();
        let service = AlarmService::new(store.clone(), tx, &SchedulerConfig::default());
        (store, service, rx)
    }

    fn in_secs(secs: i64) -> DateTime<Utc> {
        Utc::now() + ChronoDuration::seconds(secs)
    }

    #[tokio::test]
    async fn test_schedule_persists_pending_alarm() {
        let (store, service, _rx) = service();
        let alarm = service
            .schedule(AlarmSpec::once("u1", in_secs(60), "Stand-up in 5"))
            .await
            .unwrap();

        assert_eq!(alarm.status, AlarmStatus::Pending);
        assert_eq!(store.stored_alarm(&alarm.id).unwrap().status, AlarmStatus::Pending);
        assert_eq!(service.list("u1").await.len(), 1);
        assert!(service.list("someone-else").await.is_empty());
    }

    #[tokio::test]
    async fn test_schedule_rejects_invalid_specs() {
        let (_store, service, _rx) = service();
        let past = service.schedule(AlarmSpec::once("u1", in_secs(-60), "late")).await;
        assert!(matches!(past, Err(HangoutsError::InvalidSchedule(_))));

        let zero = service.schedule(AlarmSpec::every("u1", in_secs(60), 0, "spin")).await;
        assert!(matches!(zero, Err(HangoutsError::InvalidSchedule(_))));

        let bad_cron = service
            .schedule(AlarmSpec::cron("u1", in_secs(60), "61 * * * *", "never"))
            .await;
        assert!(matches!(bad_cron, Err(HangoutsError::InvalidSchedule(_))));

        let empty = service.schedule(AlarmSpec::once("u1", in_secs(60), "  ")).await;
        assert!(matches!(empty, Err(HangoutsError::InvalidSchedule(_))));

        assert_eq!(service.alarm_count().await, 0);
    }

    #[tokio::test]
    async fn test_past_recurring_trigger_rolls_forward() {
        let (_store, service, _rx) = service();
        let now = Utc::now();
        let alarm = service
            .schedule(AlarmSpec::every("u1", now - ChronoDuration::seconds(90), 60, "water"))
            .await
            .unwrap();
        assert!(alarm.trigger_at >= now);
        assert!(alarm.trigger_at < now + ChronoDuration::seconds(61));
    }

    #[tokio::test]
    async fn test_future_cron_trigger_lands_on_the_pattern() {
        use chrono::Timelike;

        let (_store, service, _rx) = service();
        let anchor = in_secs(2 * 3600 + 17 * 60 + 5);
        let alarm = service
            .schedule(AlarmSpec::cron("u1", anchor, "0 * * * *", "hourly"))
            .await
            .unwrap();
        assert_eq!((alarm.trigger_at.minute(), alarm.trigger_at.second()), (0, 0));
        assert!(alarm.trigger_at >= anchor);
        assert!(alarm.trigger_at <= anchor + ChronoDuration::hours(1));
    }

    #[tokio::test]
    async fn test_schedule_persistence_failure_keeps_registry_clean() {
        let (store, service, _rx) = service();
        store.fail_next_opens(1);
        let res = service.schedule(AlarmSpec::once("u1", in_secs(60), "x")).await;
        assert!(matches!(res, Err(HangoutsError::Persistence(_))));
        assert_eq!(service.alarm_count().await, 0);
    }

    #[tokio::test]
    async fn test_tick_fires_due_alarm_once() {
        let (store, service, mut rx) = service();
        let alarm = service
            .schedule(AlarmSpec::once("u1", in_secs(1), "Stand-up in 5"))
            .await
            .unwrap();

        assert_eq!(service.tick(Utc::now()).await.fired, 0);
        let later = alarm.trigger_at + ChronoDuration::milliseconds(10);
        assert_eq!(service.tick(later).await.fired, 1);
        assert_eq!(service.tick(later).await.fired, 0, "no second event while in flight");

        let item = rx.recv().await.unwrap();
        assert_eq!(item.event().alarm_id, alarm.id);
        assert_eq!(item.event().fire_at, alarm.trigger_at);
        assert_eq!(store.stored_alarm(&alarm.id).unwrap().status, AlarmStatus::Fired);
        assert_eq!(store.events().len(), 1);
        item.ack();
    }

    #[tokio::test]
    async fn test_cancel_before_trigger_prevents_fire() {
        let (store, service, rx) = service();
        let alarm = service
            .schedule(AlarmSpec::once("u1", in_secs(1), "nope"))
            .await
            .unwrap();

        assert!(service.cancel(&alarm.id).await.unwrap());
        assert!(!service.cancel(&alarm.id).await.unwrap());
        assert!(!service.cancel("unknown").await.unwrap());

        let report = service.tick(alarm.trigger_at + ChronoDuration::seconds(5)).await;
        assert_eq!(report.fired, 0);
        assert_eq!(rx.in_flight(), 0);
        assert_eq!(store.stored_alarm(&alarm.id).unwrap().status, AlarmStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_failed_cancel_write_is_retried_on_next_tick() {
        let (store, service, _rx) = service();
        let alarm = service
            .schedule(AlarmSpec::once("u1", in_secs(60), "x"))
            .await
            .unwrap();

        store.fail_next_opens(1);
        assert!(service.cancel(&alarm.id).await.unwrap());
        assert_eq!(store.stored_alarm(&alarm.id).unwrap().status, AlarmStatus::Pending);

        let report = service.tick(Utc::now()).await;
        assert_eq!(report.failed_writes, 0);
        assert_eq!(store.stored_alarm(&alarm.id).unwrap().status, AlarmStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_fire_persistence_failure_leaves_alarm_pending() {
        let (store, service, rx) = service();
        let alarm = service
            .schedule(AlarmSpec::once("u1", in_secs(1), "x"))
            .await
            .unwrap();
        let later = alarm.trigger_at + ChronoDuration::seconds(1);

        store.fail_next_opens(1);
        let report = service.tick(later).await;
        assert_eq!(report.fired, 0);
        assert_eq!(report.failed_writes, 1);
        assert_eq!(rx.in_flight(), 0);
        assert_eq!(service.get(&alarm.id).await.unwrap().status, AlarmStatus::Pending);

        assert_eq!(service.tick(later).await.fired, 1);
    }

    #[tokio::test]
    async fn test_outcome_rearms_recurring_and_archives_one_shot() {
        let (store, service, mut rx) = service();
        let recurring = service
            .schedule(AlarmSpec::every("u1", in_secs(1), 60, "stretch"))
            .await
            .unwrap();
        let once = service
            .schedule(AlarmSpec::once("u1", in_secs(1), "call mum"))
            .await
            .unwrap();

        service.tick(in_secs(2)).await;
        for _ in 0..2 {
            let item = rx.recv().await.unwrap();
            let e = item.event().clone();
            service
                .apply_outcome(DeliveryOutcome {
                    alarm_id: e.alarm_id,
                    event_id: e.id,
                    fire_at: e.fire_at,
                    status: EventStatus::Delivered,
                })
                .await;
            item.ack();
        }

        let rearmed = service.get(&recurring.id).await.unwrap();
        assert_eq!(rearmed.status, AlarmStatus::Pending);
        assert_eq!(rearmed.trigger_at, recurring.trigger_at + ChronoDuration::seconds(60));
        assert_eq!(rearmed.fire_count, 1);

        assert!(service.get(&once.id).await.is_none());
        assert!(store.is_archived(&once.id));
    }

    #[tokio::test]
    async fn test_recover_requeues_unfinished_events() {
        let store = Arc::new(MemorySessionFactory::new());
        let alarm_id = {
            let (tx, mut rx) = queue::channel();
            let first = AlarmService::new(store.clone(), tx, &SchedulerConfig::default());
            let alarm = first
                .schedule(AlarmSpec::once("u1", in_secs(1), "survive restart"))
                .await
                .unwrap();
            first.tick(in_secs(2)).await;
            // Crash before the processor finishes.
            drop(rx.recv().await.unwrap());
            alarm.id
        };

        let (tx, mut rx) = queue::channel();
        let second = AlarmService::new(store.clone(), tx, &SchedulerConfig::default());
        assert_eq!(second.recover().await.unwrap(), 1);
        let item = rx.recv().await.unwrap();
        assert_eq!(item.event().alarm_id, alarm_id);
        assert_eq!(second.get(&alarm_id).await.unwrap().status, AlarmStatus::Fired);
        item.ack();
    }

    #[tokio::test]
    async fn test_start_twice_is_rejected() {
        let (_store, service, _rx) = service();
        let service = Arc::new(service);
        let cancel = CancellationToken::new();
        let handle = {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { service.start(cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(matches!(
            service.start(CancellationToken::new()).await,
            Err(HangoutsError::Channel(_))
        ));
        cancel.cancel();
        handle.await.unwrap().unwrap();
    }
}
