//! The live set of alarms, owned by the alarm service.
//!
//! Pure in-memory state; the service wraps it in a mutex and persists every
//! transition. Writes that could not be persisted are kept as pending and
//! retried on the next loop wake.

use std::collections::HashMap;

use chrono::{DateTime, Utc};

use hangouts_core::types::{Alarm, AlarmStatus, DeliveryOutcome};

use crate::recurrence;

/// A state change that still has to reach storage.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Save(Alarm),
    Archive(Alarm),
}

impl PendingWrite {
    pub fn alarm(&self) -> &Alarm {
        match self {
            Self::Save(a) | Self::Archive(a) => a,
        }
    }
}

#[derive(Debug, Default)]
pub struct AlarmRegistry {
    alarms: HashMap<String, Alarm>,
    pending_writes: HashMap<String, PendingWrite>,
}

impl AlarmRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, alarm: Alarm) {
        self.alarms.insert(alarm.id.clone(), alarm);
    }

    pub fn get(&self, id: &str) -> Option<&Alarm> {
        self.alarms.get(id)
    }

    pub fn len(&self) -> usize {
        self.alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.alarms.is_empty()
    }

    /// Live alarms of one owner, soonest first.
    pub fn owned_by(&self, owner_id: &str) -> Vec<Alarm> {
        let mut out: Vec<Alarm> = self
            .alarms
            .values()
            .filter(|a| a.owner_id == owner_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| (a.trigger_at, &a.id).cmp(&(b.trigger_at, &b.id)));
        out
    }

    /// Alarms in the fired state, i.e. with an event in flight.
    pub fn in_flight(&self) -> Vec<Alarm> {
        self.alarms
            .values()
            .filter(|a| a.status == AlarmStatus::Fired)
            .cloned()
            .collect()
    }

    /// Earliest trigger time among pending alarms.
    pub fn next_due_at(&self) -> Option<DateTime<Utc>> {
        self.alarms
            .values()
            .filter(|a| a.status == AlarmStatus::Pending)
            .map(|a| a.trigger_at)
            .min()
    }

    /// IDs of pending alarms due at `now`, ascending by trigger time then id.
    pub fn due(&self, now: DateTime<Utc>) -> Vec<String> {
        let mut due: Vec<&Alarm> = self
            .alarms
            .values()
            .filter(|a| a.status == AlarmStatus::Pending && a.trigger_at <= now)
            .collect();
        due.sort_by(|a, b| (a.trigger_at, &a.id).cmp(&(b.trigger_at, &b.id)));
        due.into_iter().map(|a| a.id.clone()).collect()
    }

    /// The fired version of a pending alarm, without applying it.
    pub fn fired(&self, id: &str, now: DateTime<Utc>) -> Option<Alarm> {
        let alarm = self.alarms.get(id)?;
        if alarm.status != AlarmStatus::Pending {
            return None;
        }
        let mut fired = alarm.clone();
        fired.status = AlarmStatus::Fired;
        fired.last_fired_at = Some(now);
        fired.fire_count += 1;
        Some(fired)
    }

    /// Cancel an alarm. Pending alarms and in-flight recurring alarms are
    /// cancelled (the latter stop re-arming); a fired one-shot, an already
    /// cancelled or an unknown alarm is a no-op and returns `None`.
    pub fn cancel(&mut self, id: &str) -> Option<PendingWrite> {
        let alarm = self.alarms.get(id)?;
        let cancellable = match alarm.status {
            AlarmStatus::Pending => true,
            AlarmStatus::Fired => alarm.recurrence.is_some(),
            AlarmStatus::Cancelled => false,
        };
        if !cancellable {
            return None;
        }
        let mut alarm = self.alarms.remove(id)?;
        alarm.status = AlarmStatus::Cancelled;
        Some(PendingWrite::Save(alarm))
    }

    /// Apply a delivery outcome. Recurring alarms re-arm to the occurrence
    /// after the one that fired; one-shots leave the registry for the archive.
    /// Outcomes for unknown, cancelled or stale occurrences are ignored.
    pub fn complete(&mut self, outcome: &DeliveryOutcome) -> Option<PendingWrite> {
        let alarm = self.alarms.get(&outcome.alarm_id)?;
        if alarm.status != AlarmStatus::Fired || alarm.trigger_at != outcome.fire_at {
            return None;
        }

        let next = alarm
            .recurrence
            .as_ref()
            .and_then(|rule| recurrence::next_occurrence(rule, alarm.trigger_at));
        match next {
            Some(next) => {
                let alarm = self.alarms.get_mut(&outcome.alarm_id)?;
                alarm.trigger_at = next;
                alarm.status = AlarmStatus::Pending;
                Some(PendingWrite::Save(alarm.clone()))
            }
            None => {
                let alarm = self.alarms.remove(&outcome.alarm_id)?;
                Some(PendingWrite::Archive(alarm))
            }
        }
    }

    /// Remember a write that failed; a newer write for the same alarm replaces it.
    pub fn defer(&mut self, write: PendingWrite) {
        self.pending_writes.insert(write.alarm().id.clone(), write);
    }

    /// A newer state for this alarm reached storage.
    pub fn clear_pending(&mut self, id: &str) {
        self.pending_writes.remove(id);
    }

    pub fn take_pending(&mut self) -> Vec<PendingWrite> {
        self.pending_writes.drain().map(|(_, w)| w).collect()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_writes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use hangouts_core::types::{EventStatus, Recurrence};

    fn alarm(id: &str, trigger_at: DateTime<Utc>, recurrence: Option<Recurrence>) -> Alarm {
        Alarm {
            id: id.into(),
            owner_id: "u1".into(),
            trigger_at,
            recurrence,
            status: AlarmStatus::Pending,
            payload: format!("payload {id}"),
            created_at: trigger_at,
            last_fired_at: None,
            fire_count: 0,
        }
    }

    fn fire(reg: &mut AlarmRegistry, id: &str, now: DateTime<Utc>) -> Alarm {
        let fired = reg.fired(id, now).unwrap();
        reg.insert(fired.clone());
        fired
    }

    fn outcome(alarm: &Alarm) -> DeliveryOutcome {
        DeliveryOutcome {
            alarm_id: alarm.id.clone(),
            event_id: "evt".into(),
            fire_at: alarm.trigger_at,
            status: EventStatus::Delivered,
        }
    }

    #[test]
    fn test_due_ordering_is_by_trigger_time_then_id() {
        let now = Utc::now();
        let mut reg = AlarmRegistry::new();
        reg.insert(alarm("b", now - Duration::seconds(5), None));
        reg.insert(alarm("a", now - Duration::seconds(5), None));
        reg.insert(alarm("c", now - Duration::seconds(10), None));
        reg.insert(alarm("later", now + Duration::seconds(10), None));

        assert_eq!(reg.due(now), vec!["c", "a", "b"]);
        assert_eq!(reg.next_due_at(), Some(now - Duration::seconds(10)));
    }

    #[test]
    fn test_fired_alarm_is_not_due_again() {
        let now = Utc::now();
        let mut reg = AlarmRegistry::new();
        reg.insert(alarm("a", now, None));
        fire(&mut reg, "a", now);
        assert!(reg.due(now + Duration::hours(1)).is_empty());
        assert!(reg.fired("a", now).is_none());
        assert_eq!(reg.in_flight().len(), 1);
    }

    #[test]
    fn test_cancel_semantics() {
        let now = Utc::now();
        let mut reg = AlarmRegistry::new();
        reg.insert(alarm("pending", now + Duration::minutes(1), None));
        reg.insert(alarm("oneshot", now, None));
        fire(&mut reg, "oneshot", now);

        let write = reg.cancel("pending").unwrap();
        assert_eq!(write.alarm().status, AlarmStatus::Cancelled);
        assert!(reg.get("pending").is_none());

        assert!(reg.cancel("pending").is_none(), "second cancel is a no-op");
        assert!(reg.cancel("oneshot").is_none(), "fired one-shot cannot be cancelled");
        assert!(reg.cancel("missing").is_none());
    }

    #[test]
    fn test_cancel_in_flight_recurring_stops_rearm() {
        let now = Utc::now();
        let mut reg = AlarmRegistry::new();
        reg.insert(alarm("r", now, Some(Recurrence::Interval { every_secs: 60 })));
        let fired = fire(&mut reg, "r", now);

        assert!(reg.cancel("r").is_some());
        assert!(reg.complete(&outcome(&fired)).is_none());
        assert!(reg.is_empty());
    }

    #[test]
    fn test_complete_rearms_recurring_to_next_occurrence() {
        let t0 = Utc::now();
        let mut reg = AlarmRegistry::new();
        reg.insert(alarm("r", t0, Some(Recurrence::Interval { every_secs: 60 })));
        let fired = fire(&mut reg, "r", t0);

        match reg.complete(&outcome(&fired)).unwrap() {
            PendingWrite::Save(a) => {
                assert_eq!(a.status, AlarmStatus::Pending);
                assert_eq!(a.trigger_at, t0 + Duration::seconds(60));
                assert_eq!(a.fire_count, 1);
            }
            other => panic!("expected re-arm, got {other:?}"),
        }
        // A duplicate outcome for the same occurrence is ignored.
        assert!(reg.complete(&outcome(&fired)).is_none());
    }

    #[test]
    fn test_complete_archives_one_shot() {
        let now = Utc::now();
        let mut reg = AlarmRegistry::new();
        reg.insert(alarm("a", now, None));
        let fired = fire(&mut reg, "a", now);
        assert!(matches!(reg.complete(&outcome(&fired)), Some(PendingWrite::Archive(_))));
        assert!(reg.get("a").is_none());
    }

    #[test]
    fn test_pending_writes_keep_latest() {
        let now = Utc::now();
        let mut reg = AlarmRegistry::new();
        let mut a = alarm("a", now, None);
        reg.defer(PendingWrite::Save(a.clone()));
        a.status = AlarmStatus::Cancelled;
        reg.defer(PendingWrite::Save(a.clone()));
        assert_eq!(reg.pending_count(), 1);
        let writes = reg.take_pending();
        assert_eq!(writes[0].alarm().status, AlarmStatus::Cancelled);
        assert_eq!(reg.pending_count(), 0);
    }
}
