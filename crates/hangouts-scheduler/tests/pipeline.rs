//! Alarm service + event processor running together against the memory store.

mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hangouts_core::config::{ProcessorConfig, SchedulerConfig};
use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::types::{AlarmSpec, AlarmStatus, EventStatus};
use hangouts_memory::MemorySessionFactory;
use hangouts_scheduler::{AlarmEventProcessor, AlarmService, Disposition, RetryPolicy, queue};

use common::{RecordingNotifier, ScriptedEngine, eventually};

struct Pipeline {
    store: MemorySessionFactory,
    service: Arc<AlarmService>,
    notifier: Arc<RecordingNotifier>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<Result<()>>>,
}

impl Pipeline {
    fn start(engine: Arc<ScriptedEngine>) -> Self {
        let store = MemorySessionFactory::new();
        let notifier = Arc::new(RecordingNotifier::default());
        let (events_tx, events_rx) = queue::channel();
        let service = Arc::new(AlarmService::new(
            Arc::new(store.clone()),
            events_tx,
            &SchedulerConfig { max_poll_interval_secs: 1 },
        ));
        let processor = AlarmEventProcessor::new(
            Arc::new(store.clone()),
            engine,
            notifier.clone(),
            service.outcome_sender(),
            &ProcessorConfig::default(),
        )
        .with_retry(RetryPolicy::immediate(3));

        let cancel = CancellationToken::new();
        let service_task = {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { service.start(cancel).await })
        };
        let processor_task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { processor.run(events_rx, cancel).await })
        };

        Self { store, service, notifier, cancel, tasks: vec![service_task, processor_task] }
    }

    async fn stop(self) {
        self.cancel.cancel();
        for task in self.tasks {
            tokio::time::timeout(Duration::from_secs(2), task)
                .await
                .expect("task did not stop after cancellation")
                .unwrap()
                .unwrap();
        }
    }
}

fn in_secs(secs: i64) -> chrono::DateTime<Utc> {
    Utc::now() + ChronoDuration::seconds(secs)
}

#[tokio::test]
async fn test_stand_up_reminder_end_to_end() {
    let engine = ScriptedEngine::replying("Reminder: stand-up in 5 minutes");
    let pipeline = Pipeline::start(engine.clone());

    let alarm = pipeline
        .service
        .schedule(AlarmSpec::once("u42", in_secs(1), "Stand-up in 5"))
        .await
        .unwrap();

    let sent = pipeline.notifier.wait_for(1, Duration::from_secs(5)).await;
    let received = pipeline.notifier.received_at();
    assert_eq!(received.len(), 1);
    // Fires no earlier than the trigger and within one poll interval of it.
    assert!(received[0] >= alarm.trigger_at);
    assert!(
        received[0] < alarm.trigger_at + ChronoDuration::seconds(1),
        "delivered {} after the trigger",
        received[0] - alarm.trigger_at
    );
    assert_eq!(
        sent,
        vec![("u42".to_string(), "Reminder: stand-up in 5 minutes".to_string())]
    );

    let store = pipeline.store.clone();
    assert!(eventually(Duration::from_secs(2), || store.is_archived(&alarm.id)).await);
    assert_eq!(pipeline.service.alarm_count().await, 0);

    let events = store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].alarm_id, alarm.id);
    assert_eq!(events[0].fire_at, alarm.trigger_at);
    assert_eq!(events[0].status, EventStatus::Delivered);

    let interactions = store.interactions();
    assert_eq!(interactions.len(), 1);
    assert_eq!(interactions[0].response.as_deref(), Some("Reminder: stand-up in 5 minutes"));

    pipeline.stop().await;
    assert_eq!(engine.calls(), 1);
}

#[tokio::test]
async fn test_cancel_before_trigger_never_fires() {
    let pipeline = Pipeline::start(ScriptedEngine::replying("too late"));

    let alarm = pipeline
        .service
        .schedule(AlarmSpec::once("u1", in_secs(1), "call mom"))
        .await
        .unwrap();
    assert!(pipeline.service.cancel(&alarm.id).await.unwrap());

    tokio::time::sleep(Duration::from_millis(2_000)).await;
    assert!(pipeline.notifier.sent().is_empty());
    assert!(pipeline.store.events().is_empty());
    assert_eq!(
        pipeline.store.stored_alarm(&alarm.id).map(|a| a.status),
        Some(AlarmStatus::Cancelled)
    );

    pipeline.stop().await;
}

#[tokio::test]
async fn test_recurring_alarm_fires_each_occurrence_once() {
    let pipeline = Pipeline::start(ScriptedEngine::replying("Drink water"));

    let alarm = pipeline
        .service
        .schedule(AlarmSpec::every("u1", in_secs(1), 1, "water"))
        .await
        .unwrap();

    let sent = pipeline.notifier.wait_for(3, Duration::from_secs(10)).await;
    assert!(sent.len() >= 3, "only {} notifications", sent.len());
    let store = pipeline.store.clone();
    pipeline.stop().await;

    let fire_times: Vec<_> = store
        .events()
        .into_iter()
        .filter(|e| e.alarm_id == alarm.id)
        .map(|e| e.fire_at)
        .collect();
    assert!(fire_times.len() >= 3);
    assert_eq!(fire_times[0], alarm.trigger_at);
    for pair in fire_times.windows(2) {
        let gap = pair[1] - pair[0];
        assert_eq!(gap, ChronoDuration::seconds(1), "skipped or duplicated occurrence");
    }
}

#[tokio::test]
async fn test_persistence_outage_is_retried_and_delivered_once() {
    let store = MemorySessionFactory::new();
    let (events_tx, mut events_rx) = queue::channel();
    let service =
        AlarmService::new(Arc::new(store.clone()), events_tx, &SchedulerConfig::default());
    let engine = ScriptedEngine::replying("Reminder: stand-up in 5 minutes");
    let notifier = Arc::new(RecordingNotifier::default());
    let (outcomes_tx, mut outcomes_rx) = mpsc::unbounded_channel();
    let processor = AlarmEventProcessor::new(
        Arc::new(store.clone()),
        engine.clone(),
        notifier.clone(),
        outcomes_tx,
        &ProcessorConfig::default(),
    )
    .with_retry(RetryPolicy::immediate(3));

    let alarm = service
        .schedule(AlarmSpec::once("u1", in_secs(60), "Stand-up in 5"))
        .await
        .unwrap();

    // Storage down while firing: the alarm stays pending and fires on the next tick.
    store.fail_next_opens(1);
    let report = service.tick(alarm.trigger_at).await;
    assert_eq!((report.fired, report.failed_writes), (0, 1));
    assert_eq!(service.tick(alarm.trigger_at).await.fired, 1);

    // Storage down for one processor cycle: the attempt is retried.
    store.fail_next_commits(1);
    let item = events_rx.recv().await.unwrap();
    let disposition = processor.handle(item, &CancellationToken::new()).await;
    assert_eq!(disposition, Disposition::Delivered);
    assert_eq!(engine.calls(), 2);
    assert_eq!(notifier.sent().len(), 1);

    let outcome = outcomes_rx.recv().await.unwrap();
    assert_eq!(outcome.status, EventStatus::Delivered);
    service.apply_outcome(outcome).await;

    assert!(store.is_archived(&alarm.id));
    let events = store.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status, EventStatus::Delivered);
    assert_eq!(store.interactions().len(), 1);
    assert_eq!(events_rx.in_flight(), 0);
}

#[tokio::test]
async fn test_non_transient_failure_completes_the_alarm() {
    let store = MemorySessionFactory::new();
    let (events_tx, mut events_rx) = queue::channel();
    let service =
        AlarmService::new(Arc::new(store.clone()), events_tx, &SchedulerConfig::default());
    let engine =
        ScriptedEngine::scripted(vec![Err(HangoutsError::engine_fatal("refused"))], "unused");
    let notifier = Arc::new(RecordingNotifier::default());
    let (outcomes_tx, mut outcomes_rx) = mpsc::unbounded_channel();
    let processor = AlarmEventProcessor::new(
        Arc::new(store.clone()),
        engine.clone(),
        notifier.clone(),
        outcomes_tx,
        &ProcessorConfig::default(),
    )
    .with_retry(RetryPolicy::immediate(3));

    let alarm = service
        .schedule(AlarmSpec::once("u1", in_secs(60), "hello"))
        .await
        .unwrap();
    service.tick(alarm.trigger_at).await;

    let item = events_rx.recv().await.unwrap();
    assert_eq!(processor.handle(item, &CancellationToken::new()).await, Disposition::Failed);
    assert_eq!(engine.calls(), 1);
    assert!(notifier.sent().is_empty());

    service.apply_outcome(outcomes_rx.recv().await.unwrap()).await;
    assert!(store.is_archived(&alarm.id));
    assert_eq!(store.events()[0].status, EventStatus::Failed);
}
