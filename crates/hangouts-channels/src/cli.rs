//! Console channel: stdin in, stdout out.
//!
//! Lines starting with `/` are commands; anything else is a message for the
//! assistant. Notifications for any owner are printed.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::traits::Channel;
use hangouts_core::types::AlarmSpec;
use hangouts_scheduler::AlarmService;

use crate::conversation::ConversationHandler;
use crate::validator::MessageValidator;

pub const HELP: &str = "\
Commands:
  /remind <delay> <text>      one-shot reminder, e.g. /remind 10m stretch
  /every <delay> <text>       repeating reminder, e.g. /every 1h drink water
  /cron \"<expr>\" <text>       cron reminder (UTC), e.g. /cron \"0 9 * * 1-5\" stand-up
  /alarms                     list your reminders
  /cancel <id>                cancel a reminder (id prefix is enough)
  /help                       this help
Delays: 30s, 10m, 2h, 1d or combinations like 1h30m; a bare number means minutes.";

/// A parsed console command.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Remind { delay: Duration, text: String },
    Every { delay: Duration, text: String },
    Cron { expression: String, text: String },
    Alarms,
    Cancel { id: String },
    Help,
}

/// Parse a delay such as `90s`, `10m`, `1h30m`, `2d` or a bare number of minutes.
pub fn parse_delay(input: &str) -> Option<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return None;
    }
    if let Ok(minutes) = input.parse::<i64>() {
        return (minutes > 0).then(|| Duration::try_minutes(minutes)).flatten();
    }

    let mut total = Duration::zero();
    let mut number = String::new();
    for c in input.chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let n: i64 = number.parse().ok()?;
        number.clear();
        let part = match c.to_ascii_lowercase() {
            's' => Duration::try_seconds(n)?,
            'm' => Duration::try_minutes(n)?,
            'h' => Duration::try_hours(n)?,
            'd' => Duration::try_days(n)?,
            _ => return None,
        };
        total = total.checked_add(&part)?;
    }
    if !number.is_empty() || total <= Duration::zero() {
        return None;
    }
    Some(total)
}

fn split_first(s: &str) -> (&str, &str) {
    let s = s.trim();
    match s.split_once(char::is_whitespace) {
        Some((head, rest)) => (head, rest.trim()),
        None => (s, ""),
    }
}

/// Parse a `/command` line. Returns `None` for lines that are not commands.
pub fn parse_command(line: &str) -> Option<std::result::Result<Command, String>> {
    let line = line.trim();
    let body = line.strip_prefix('/')?;
    let (name, rest) = split_first(body);

    let parsed = match name.to_ascii_lowercase().as_str() {
        "remind" | "every" => {
            let (delay, text) = split_first(rest);
            match (parse_delay(delay), text.is_empty()) {
                (Some(delay), false) if name.eq_ignore_ascii_case("remind") => {
                    Ok(Command::Remind { delay, text: text.to_string() })
                }
                (Some(delay), false) => Ok(Command::Every { delay, text: text.to_string() }),
                (None, _) => Err(format!("Invalid delay '{delay}'. Try 10m, 2h or 1h30m.")),
                (_, true) => Err(format!("Usage: /{name} <delay> <text>")),
            }
        }
        "cron" => {
            let parsed = rest
                .strip_prefix('"')
                .and_then(|r| r.split_once('"'))
                .map(|(expr, text)| (expr.trim(), text.trim()));
            match parsed {
                Some((expr, text)) if !expr.is_empty() && !text.is_empty() => {
                    Ok(Command::Cron { expression: expr.to_string(), text: text.to_string() })
                }
                _ => Err("Usage: /cron \"<min hour dom mon dow>\" <text>".to_string()),
            }
        }
        "alarms" | "list" => Ok(Command::Alarms),
        "cancel" if !rest.is_empty() => Ok(Command::Cancel { id: rest.to_string() }),
        "cancel" => Err("Usage: /cancel <id>".to_string()),
        "help" | "?" => Ok(Command::Help),
        other => Err(format!("Unknown command '/{other}'. Type /help.")),
    };
    Some(parsed)
}

pub struct CliChannel {
    owner_id: String,
    alarms: Arc<AlarmService>,
    conversation: Arc<ConversationHandler>,
    validator: MessageValidator,
}

impl CliChannel {
    pub fn new(
        owner_id: &str,
        alarms: Arc<AlarmService>,
        conversation: Arc<ConversationHandler>,
        validator: MessageValidator,
    ) -> Self {
        Self { owner_id: owner_id.to_string(), alarms, conversation, validator }
    }

    /// Handle one input line and return the text to show, if any.
    pub async fn handle_line(&self, line: &str) -> Option<String> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let reply = match parse_command(line) {
            Some(Ok(command)) => self.run_command(command).await,
            Some(Err(usage)) => Err(HangoutsError::Validation(usage)),
            None => self.chat(line).await,
        };
        Some(match reply {
            Ok(text) => text,
            Err(e) => format!("⚠️ {e}"),
        })
    }

    async fn chat(&self, line: &str) -> Result<String> {
        self.validator.validate(line)?;
        self.conversation.respond(&self.owner_id, line).await
    }

    async fn run_command(&self, command: Command) -> Result<String> {
        let now = Utc::now();
        match command {
            Command::Remind { delay, text } => {
                let spec = AlarmSpec::once(&self.owner_id, now + delay, &text);
                let alarm = self.alarms.schedule(spec).await?;
                Ok(format!(
                    "⏰ Reminder {} set for {} UTC",
                    short_id(&alarm.id),
                    alarm.trigger_at.format("%Y-%m-%d %H:%M:%S")
                ))
            }
            Command::Every { delay, text } => {
                let every_secs = u64::try_from(delay.num_seconds())
                    .map_err(|_| HangoutsError::InvalidSchedule("negative interval".into()))?;
                let spec = AlarmSpec::every(&self.owner_id, now + delay, every_secs, &text);
                let alarm = self.alarms.schedule(spec).await?;
                Ok(format!(
                    "🔁 Reminder {} every {}s, first at {} UTC",
                    short_id(&alarm.id),
                    every_secs,
                    alarm.trigger_at.format("%Y-%m-%d %H:%M:%S")
                ))
            }
            Command::Cron { expression, text } => {
                // The service rolls `now` forward to the first matching minute.
                let spec = AlarmSpec::cron(&self.owner_id, now, &expression, &text);
                let alarm = self.alarms.schedule(spec).await?;
                Ok(format!(
                    "📆 Reminder {} on '{}', next at {} UTC",
                    short_id(&alarm.id),
                    expression,
                    alarm.trigger_at.format("%Y-%m-%d %H:%M")
                ))
            }
            Command::Alarms => {
                let alarms = self.alarms.list(&self.owner_id).await;
                if alarms.is_empty() {
                    return Ok("No reminders.".into());
                }
                let lines: Vec<String> = alarms
                    .iter()
                    .map(|a| {
                        let repeat = if a.recurrence.is_some() { " 🔁" } else { "" };
                        format!(
                            "  {}  {} UTC  [{}]{repeat}  {}",
                            short_id(&a.id),
                            a.trigger_at.format("%Y-%m-%d %H:%M:%S"),
                            a.status.as_str(),
                            a.payload
                        )
                    })
                    .collect();
                Ok(format!("Your reminders:\n{}", lines.join("\n")))
            }
            Command::Cancel { id } => {
                let matches: Vec<String> = self
                    .alarms
                    .list(&self.owner_id)
                    .await
                    .into_iter()
                    .map(|a| a.id)
                    .filter(|full| full.starts_with(&id))
                    .collect();
                match matches.as_slice() {
                    [full] => {
                        if self.alarms.cancel(full).await? {
                            Ok(format!("🚫 Reminder {} cancelled", short_id(full)))
                        } else {
                            Ok(format!("Reminder {} can no longer be cancelled", short_id(full)))
                        }
                    }
                    [] => Ok(format!("No reminder matches '{id}'")),
                    _ => Ok(format!("'{id}' matches several reminders, use more characters")),
                }
            }
            Command::Help => Ok(HELP.to_string()),
        }
    }

    /// Read lines from `input` until EOF or cancellation, printing replies.
    pub async fn serve_from<R>(&self, input: R, cancel: CancellationToken) -> Result<()>
    where
        R: AsyncBufRead + Unpin + Send,
    {
        let mut lines = input.lines();
        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                tracing::info!("📭 Console input closed");
                break;
            };
            if let Some(reply) = self.handle_line(&line).await {
                println!("{reply}");
            }
        }
        Ok(())
    }
}

fn short_id(id: &str) -> &str {
    id.get(..8).unwrap_or(id)
}

#[async_trait]
impl Channel for CliChannel {
    fn name(&self) -> &str {
        "cli"
    }

    async fn notify(&self, owner_id: &str, text: &str) -> Result<()> {
        if owner_id != self.owner_id {
            return Err(HangoutsError::Channel(format!("'{owner_id}' is not the console user")));
        }
        println!("\n🔔 {text}");
        Ok(())
    }

    async fn serve(&self, cancel: CancellationToken) -> Result<()> {
        println!("💬 Hangouts console ready, type /help for commands.");
        self.serve_from(BufReader::new(tokio::io::stdin()), cancel).await
    }
}
