//! In-memory backend. Same commit semantics as SQLite: a session buffers its
//! writes and applies them atomically on `commit`. Used with
//! `backend = "memory"` and by tests, which can inject failures.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::traits::{Session, SessionFactory};
use hangouts_core::types::{
    Alarm, AlarmEvent, AlarmStatus, EventStatus, Interaction, UserContext,
};

use crate::history;

#[derive(Default)]
struct State {
    alarms: HashMap<String, (Alarm, bool)>,
    events: HashMap<String, AlarmEvent>,
    interactions: Vec<Interaction>,
    preferences: HashMap<String, HashMap<String, String>>,
}

enum Write {
    Alarm(Alarm, bool),
    Event(AlarmEvent),
    Interaction(Interaction),
}

#[derive(Default)]
struct Faults {
    opens: AtomicUsize,
    commits: AtomicUsize,
}

impl Faults {
    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[derive(Default, Clone)]
pub struct MemorySessionFactory {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
}

impl MemorySessionFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` calls to `open` fail with a persistence error.
    pub fn fail_next_opens(&self, n: usize) {
        self.faults.opens.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` calls to `commit` fail, discarding their writes.
    pub fn fail_next_commits(&self, n: usize) {
        self.faults.commits.store(n, Ordering::SeqCst);
    }

    pub fn set_preference(&self, owner_id: &str, key: &str, value: &str) {
        lock(&self.state)
            .preferences
            .entry(owner_id.to_string())
            .or_default()
            .insert(key.to_string(), value.to_string());
    }

    /// Stored alarm by id, including cancelled and archived ones.
    pub fn stored_alarm(&self, id: &str) -> Option<Alarm> {
        lock(&self.state).alarms.get(id).map(|(a, _)| a.clone())
    }

    pub fn is_archived(&self, id: &str) -> bool {
        lock(&self.state).alarms.get(id).is_some_and(|(_, archived)| *archived)
    }

    pub fn event(&self, id: &str) -> Option<AlarmEvent> {
        lock(&self.state).events.get(id).cloned()
    }

    /// All stored events, by fire time.
    pub fn events(&self) -> Vec<AlarmEvent> {
        let mut events: Vec<AlarmEvent> = lock(&self.state).events.values().cloned().collect();
        events.sort_by(|a, b| (a.fire_at, &a.id).cmp(&(b.fire_at, &b.id)));
        events
    }

    /// All interactions in commit order.
    pub fn interactions(&self) -> Vec<Interaction> {
        lock(&self.state).interactions.clone()
    }
}

fn lock(state: &Mutex<State>) -> MutexGuard<'_, State> {
    // Poisoned state is still consistent: every write applies under one guard.
    state.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl SessionFactory for MemorySessionFactory {
    fn name(&self) -> &str {
        "memory"
    }

    async fn open(&self) -> Result<Box<dyn Session>> {
        if Faults::take(&self.faults.opens) {
            return Err(HangoutsError::Persistence("memory store unavailable".into()));
        }
        Ok(Box::new(MemorySession {
            state: self.state.clone(),
            faults: self.faults.clone(),
            writes: Vec::new(),
        }))
    }
}

struct MemorySession {
    state: Arc<Mutex<State>>,
    faults: Arc<Faults>,
    writes: Vec<Write>,
}

#[async_trait]
impl Session for MemorySession {
    async fn load_alarms(&mut self) -> Result<Vec<Alarm>> {
        let mut alarms: Vec<Alarm> = lock(&self.state)
            .alarms
            .values()
            .filter(|(a, archived)| !archived && a.status != AlarmStatus::Cancelled)
            .map(|(a, _)| a.clone())
            .collect();
        alarms.sort_by(|a, b| (a.trigger_at, &a.id).cmp(&(b.trigger_at, &b.id)));
        Ok(alarms)
    }

    async fn save_alarm(&mut self, alarm: &Alarm) -> Result<()> {
        self.writes.push(Write::Alarm(alarm.clone(), false));
        Ok(())
    }

    async fn archive_alarm(&mut self, alarm: &Alarm) -> Result<()> {
        self.writes.push(Write::Alarm(alarm.clone(), true));
        Ok(())
    }

    async fn save_event(&mut self, event: &AlarmEvent) -> Result<()> {
        self.writes.push(Write::Event(event.clone()));
        Ok(())
    }

    async fn load_unfinished_events(&mut self) -> Result<Vec<AlarmEvent>> {
        let mut events: Vec<AlarmEvent> = lock(&self.state)
            .events
            .values()
            .filter(|e| !e.status.is_terminal())
            .cloned()
            .collect();
        events.sort_by(|a, b| (a.fire_at, &a.id).cmp(&(b.fire_at, &b.id)));
        Ok(events)
    }

    async fn event_delivered(&mut self, alarm_id: &str, fire_at: DateTime<Utc>) -> Result<bool> {
        Ok(lock(&self.state).events.values().any(|e| {
            e.alarm_id == alarm_id
                && e.fire_at == fire_at
                && e.status == EventStatus::Delivered
        }))
    }

    async fn load_context(&mut self, owner_id: &str, history_limit: usize) -> Result<UserContext> {
        let state = lock(&self.state);
        let mut context = UserContext::new(owner_id);
        if let Some(prefs) = state.preferences.get(owner_id) {
            context.preferences = prefs.clone();
        }
        let owned: Vec<Interaction> = state
            .interactions
            .iter()
            .filter(|i| i.owner_id == owner_id)
            .cloned()
            .collect();
        context.history = history::to_messages(&owned, history_limit);
        Ok(context)
    }

    async fn record_interaction(&mut self, interaction: &Interaction) -> Result<()> {
        self.writes.push(Write::Interaction(interaction.clone()));
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        let Self { state, faults, writes } = *self;
        if Faults::take(&faults.commits) {
            return Err(HangoutsError::Persistence("memory commit failed".into()));
        }
        let mut state = lock(&state);
        for write in writes {
            match write {
                Write::Alarm(alarm, archived) => {
                    state.alarms.insert(alarm.id.clone(), (alarm, archived));
                }
                Write::Event(event) => {
                    state.events.insert(event.id.clone(), event);
                }
                Write::Interaction(interaction) => state.interactions.push(interaction),
            }
        }
        Ok(())
    }
}
