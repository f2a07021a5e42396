//! Event queue: FIFO hand-off from the alarm service to the event processor.
//!
//! Unbounded: alarm volume is low and dropping an event would lose a
//! reminder. Every pushed event counts as in flight until the consumer
//! acknowledges it (or drops its guard), so shutdown code can see what is
//! still outstanding.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::sync::{Notify, mpsc};

use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::types::AlarmEvent;

#[derive(Default)]
struct Tracker {
    in_flight: AtomicUsize,
    idle: Notify,
}

impl Tracker {
    fn acquire(&self) {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    fn count(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.count() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Create a connected producer/consumer pair.
pub fn channel() -> (EventSender, EventReceiver) {
    let (tx, rx) = mpsc::unbounded_channel();
    let tracker = Arc::new(Tracker::default());
    (
        EventSender { tx, tracker: tracker.clone() },
        EventReceiver { rx, tracker },
    )
}

/// Producer half, held by the alarm service.
#[derive(Clone)]
pub struct EventSender {
    tx: mpsc::UnboundedSender<AlarmEvent>,
    tracker: Arc<Tracker>,
}

impl EventSender {
    /// Enqueue an event. Fails only when the consumer is gone.
    pub fn push(&self, event: AlarmEvent) -> Result<()> {
        self.tracker.acquire();
        self.tx.send(event).map_err(|e| {
            self.tracker.release();
            HangoutsError::Delivery(format!(
                "event queue closed, event {} for alarm {} not enqueued",
                e.0.id, e.0.alarm_id
            ))
        })
    }

    /// Events enqueued but not yet acknowledged.
    pub fn in_flight(&self) -> usize {
        self.tracker.count()
    }

    /// Resolve once every enqueued event has been acknowledged.
    pub async fn wait_idle(&self) {
        self.tracker.wait_idle().await
    }
}

/// Consumer half, held by the event processor.
pub struct EventReceiver {
    rx: mpsc::UnboundedReceiver<AlarmEvent>,
    tracker: Arc<Tracker>,
}

impl EventReceiver {
    /// Next event in enqueue order; `None` once all senders are dropped and
    /// the queue is empty.
    pub async fn recv(&mut self) -> Option<InFlight> {
        let event = self.rx.recv().await?;
        Some(InFlight { event, tracker: self.tracker.clone(), acked: false })
    }

    pub fn in_flight(&self) -> usize {
        self.tracker.count()
    }
}

/// A dequeued event that still counts as in flight.
pub struct InFlight {
    event: AlarmEvent,
    tracker: Arc<Tracker>,
    acked: bool,
}

impl InFlight {
    pub fn event(&self) -> &AlarmEvent {
        &self.event
    }

    /// Processing finished (delivered, failed, or left queued in storage).
    pub fn ack(mut self) {
        self.acked = true;
        self.tracker.release();
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.acked {
            self.tracker.release();
        }
    }
}
