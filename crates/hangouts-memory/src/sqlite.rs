//! SQLite backend. Every session is its own connection with an open
//! transaction; `commit` commits it and dropping the session rolls back.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, params};

use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::traits::{Session, SessionFactory};
use hangouts_core::types::{
    Alarm, AlarmEvent, AlarmStatus, EventStatus, Interaction, InteractionKind, Recurrence,
    UserContext,
};

use crate::history;

const BUSY_TIMEOUT_MS: u32 = 5_000;

fn db_err(context: &str, e: rusqlite::Error) -> HangoutsError {
    HangoutsError::Persistence(format!("{context}: {e}"))
}

/// Fixed-width UTC timestamp, so text order is time order and values round-trip exactly.
fn ts(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| text_conversion_err(0, e))
}

fn text_conversion_err<E>(column: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, Box::new(e))
}

fn conversion_err(what: &str, value: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("unknown {what} '{value}'").into(),
    )
}

pub struct SqliteSessionFactory {
    path: PathBuf,
}

impl SqliteSessionFactory {
    /// Open or create the database and run migrations.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let factory = Self { path: path.to_path_buf() };
        let conn = factory.connect()?;
        let mode: String = conn
            .pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))
            .map_err(|e| db_err("Journal mode", e))?;
        tracing::debug!("SQLite journal mode: {mode}");
        migrate(&conn)?;
        tracing::debug!("SQLite store ready at {}", path.display());
        Ok(factory)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn connect(&self) -> Result<Connection> {
        let conn = Connection::open(&self.path).map_err(|e| db_err("DB open", e))?;
        conn.busy_timeout(std::time::Duration::from_millis(BUSY_TIMEOUT_MS.into()))
            .map_err(|e| db_err("busy timeout", e))?;
        Ok(conn)
    }

    /// Store an owner preference (e.g. `name`), surfaced in the user context.
    pub fn set_preference(&self, owner_id: &str, key: &str, value: &str) -> Result<()> {
        self.connect()?
            .execute(
                "INSERT OR REPLACE INTO user_preferences (owner_id, key, value) VALUES (?1, ?2, ?3)",
                params![owner_id, key, value],
            )
            .map_err(|e| db_err("Save preference", e))?;
        Ok(())
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS alarms (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            trigger_at TEXT NOT NULL,
            recurrence TEXT,                  -- JSON: {kind: interval|cron, ...}
            status TEXT NOT NULL DEFAULT 'pending',
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL,
            last_fired_at TEXT,
            fire_count INTEGER NOT NULL DEFAULT 0,
            archived INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS alarm_events (
            id TEXT PRIMARY KEY,
            alarm_id TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            fire_at TEXT NOT NULL,
            status TEXT NOT NULL,             -- queued, delivered, failed
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_alarm_events_occurrence ON alarm_events (alarm_id, fire_at);

        CREATE TABLE IF NOT EXISTS interactions (
            id TEXT PRIMARY KEY,
            owner_id TEXT NOT NULL,
            kind TEXT NOT NULL,               -- alarm, message
            alarm_id TEXT,
            event_id TEXT,
            prompt TEXT NOT NULL,
            response TEXT,
            outcome TEXT NOT NULL,
            error TEXT,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_interactions_owner ON interactions (owner_id, created_at);

        CREATE TABLE IF NOT EXISTS user_preferences (
            owner_id TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (owner_id, key)
        );
        ",
    )
    .map_err(|e| db_err("Migration", e))
}

#[async_trait]
impl SessionFactory for SqliteSessionFactory {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn open(&self) -> Result<Box<dyn Session>> {
        let conn = self.connect()?;
        conn.execute_batch("BEGIN").map_err(|e| db_err("Begin", e))?;
        Ok(Box::new(SqliteSession { conn }))
    }
}

struct SqliteSession {
    conn: Connection,
}

impl SqliteSession {
    fn write_alarm(&self, alarm: &Alarm, archived: bool) -> Result<()> {
        let recurrence = alarm
            .recurrence
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn
            .execute(
                "INSERT OR REPLACE INTO alarms
                 (id, owner_id, trigger_at, recurrence, status, payload, created_at,
                  last_fired_at, fire_count, archived)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    alarm.id,
                    alarm.owner_id,
                    ts(alarm.trigger_at),
                    recurrence,
                    alarm.status.as_str(),
                    alarm.payload,
                    ts(alarm.created_at),
                    alarm.last_fired_at.map(ts),
                    alarm.fire_count,
                    archived as i32,
                ],
            )
            .map_err(|e| db_err("Save alarm", e))?;
        Ok(())
    }
}

fn alarm_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Alarm> {
    let recurrence: Option<String> = row.get(3)?;
    let recurrence = recurrence
        .map(|json| serde_json::from_str::<Recurrence>(&json))
        .transpose()
        .map_err(|e| text_conversion_err(3, e))?;
    let status: String = row.get(4)?;
    let last_fired_at: Option<String> = row.get(7)?;
    Ok(Alarm {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        trigger_at: parse_ts(&row.get::<_, String>(2)?)?,
        recurrence,
        status: AlarmStatus::parse(&status).ok_or_else(|| conversion_err("alarm status", &status))?,
        payload: row.get(5)?,
        created_at: parse_ts(&row.get::<_, String>(6)?)?,
        last_fired_at: last_fired_at.as_deref().map(parse_ts).transpose()?,
        fire_count: row.get(8)?,
    })
}

fn event_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<AlarmEvent> {
    let status: String = row.get(5)?;
    Ok(AlarmEvent {
        id: row.get(0)?,
        alarm_id: row.get(1)?,
        owner_id: row.get(2)?,
        payload: row.get(3)?,
        fire_at: parse_ts(&row.get::<_, String>(4)?)?,
        status: EventStatus::parse(&status).ok_or_else(|| conversion_err("event status", &status))?,
    })
}

fn interaction_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Interaction> {
    let kind: String = row.get(2)?;
    let outcome: String = row.get(7)?;
    Ok(Interaction {
        id: row.get(0)?,
        owner_id: row.get(1)?,
        kind: match kind.as_str() {
            "alarm" => InteractionKind::Alarm,
            "message" => InteractionKind::Message,
            other => return Err(conversion_err("interaction kind", other)),
        },
        alarm_id: row.get(3)?,
        event_id: row.get(4)?,
        prompt: row.get(5)?,
        response: row.get(6)?,
        outcome: EventStatus::parse(&outcome).ok_or_else(|| conversion_err("outcome", &outcome))?,
        error: row.get(8)?,
        created_at: parse_ts(&row.get::<_, String>(9)?)?,
    })
}

#[async_trait]
impl Session for SqliteSession {
    async fn load_alarms(&mut self) -> Result<Vec<Alarm>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner_id, trigger_at, recurrence, status, payload, created_at,
                        last_fired_at, fire_count
                 FROM alarms WHERE archived = 0 AND status != 'cancelled'
                 ORDER BY trigger_at, id",
            )
            .map_err(|e| db_err("Load alarms", e))?;
        let rows = stmt
            .query_map([], alarm_from_row)
            .map_err(|e| db_err("Load alarms", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Load alarms", e))
    }

    async fn save_alarm(&mut self, alarm: &Alarm) -> Result<()> {
        self.write_alarm(alarm, false)
    }

    async fn archive_alarm(&mut self, alarm: &Alarm) -> Result<()> {
        self.write_alarm(alarm, true)
    }

    async fn save_event(&mut self, event: &AlarmEvent) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO alarm_events
                 (id, alarm_id, owner_id, payload, fire_at, status, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    event.id,
                    event.alarm_id,
                    event.owner_id,
                    event.payload,
                    ts(event.fire_at),
                    event.status.as_str(),
                    ts(Utc::now()),
                ],
            )
            .map_err(|e| db_err("Save event", e))?;
        Ok(())
    }

    async fn load_unfinished_events(&mut self) -> Result<Vec<AlarmEvent>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, alarm_id, owner_id, payload, fire_at, status FROM alarm_events
                 WHERE status NOT IN ('delivered', 'failed')
                 ORDER BY fire_at, id",
            )
            .map_err(|e| db_err("Load events", e))?;
        let rows = stmt
            .query_map([], event_from_row)
            .map_err(|e| db_err("Load events", e))?;
        rows.collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Load events", e))
    }

    async fn event_delivered(&mut self, alarm_id: &str, fire_at: DateTime<Utc>) -> Result<bool> {
        let found: Option<i64> = self
            .conn
            .query_row(
                "SELECT 1 FROM alarm_events
                 WHERE alarm_id = ?1 AND fire_at = ?2 AND status = 'delivered' LIMIT 1",
                params![alarm_id, ts(fire_at)],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| db_err("Check delivery", e))?;
        Ok(found.is_some())
    }

    async fn load_context(&mut self, owner_id: &str, history_limit: usize) -> Result<UserContext> {
        let mut context = UserContext::new(owner_id);

        let mut stmt = self
            .conn
            .prepare("SELECT key, value FROM user_preferences WHERE owner_id = ?1")
            .map_err(|e| db_err("Load preferences", e))?;
        let prefs = stmt
            .query_map(params![owner_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .map_err(|e| db_err("Load preferences", e))?;
        for pref in prefs {
            let (key, value) = pref.map_err(|e| db_err("Load preferences", e))?;
            context.preferences.insert(key, value);
        }

        // Each interaction yields at most two messages.
        let mut stmt = self
            .conn
            .prepare(
                "SELECT id, owner_id, kind, alarm_id, event_id, prompt, response, outcome, error, created_at
                 FROM interactions WHERE owner_id = ?1 AND response IS NOT NULL
                 ORDER BY created_at DESC, id DESC LIMIT ?2",
            )
            .map_err(|e| db_err("Load history", e))?;
        let mut recent = stmt
            .query_map(params![owner_id, history_limit as i64], interaction_from_row)
            .map_err(|e| db_err("Load history", e))?
            .collect::<rusqlite::Result<Vec<_>>>()
            .map_err(|e| db_err("Load history", e))?;
        recent.reverse();
        context.history = history::to_messages(&recent, history_limit);
        Ok(context)
    }

    async fn record_interaction(&mut self, interaction: &Interaction) -> Result<()> {
        self.conn
            .execute(
                "INSERT OR REPLACE INTO interactions
                 (id, owner_id, kind, alarm_id, event_id, prompt, response, outcome, error, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    interaction.id,
                    interaction.owner_id,
                    interaction.kind.as_str(),
                    interaction.alarm_id,
                    interaction.event_id,
                    interaction.prompt,
                    interaction.response,
                    interaction.outcome.as_str(),
                    interaction.error,
                    ts(interaction.created_at),
                ],
            )
            .map_err(|e| db_err("Save interaction", e))?;
        Ok(())
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.conn.execute_batch("COMMIT").map_err(|e| db_err("Commit", e))
    }
}
