//! Every shared component, built once at startup.

use std::sync::Arc;

use hangouts_channels::{
    ChannelListener, CliChannel, ConversationHandler, DiscordChannel, MessageValidator, NotifierHub,
};
use hangouts_core::config::HangoutsConfig;
use hangouts_core::error::{HangoutsError, Result};
use hangouts_core::traits::{Channel, ConversationalEngine, SessionFactory};
use hangouts_scheduler::{AlarmEventProcessor, AlarmService, EventReceiver, queue};

use crate::supervisor::Supervisor;

/// Owner id used for console-scheduled alarms when no Discord user is configured.
pub const CONSOLE_OWNER: &str = "console";

pub struct AppContext {
    pub config: HangoutsConfig,
    pub sessions: Arc<dyn SessionFactory>,
    pub engine: Arc<dyn ConversationalEngine>,
    pub alarms: Arc<AlarmService>,
    pub processor: Arc<AlarmEventProcessor>,
    pub notifier: Arc<NotifierHub>,
    pub conversation: Arc<ConversationHandler>,
    pub channels: Vec<Arc<dyn Channel>>,
    events: Option<EventReceiver>,
}

impl AppContext {
    /// Validate the config and build the backends it names.
    pub fn build(config: HangoutsConfig) -> Result<Self> {
        config.validate()?;
        let sessions = hangouts_memory::create_session_factory(&config.database)?;
        let engine = hangouts_providers::create_engine(&config.llm)?;
        tracing::info!(
            "🧩 Context ready: storage={}, engine={}",
            sessions.name(),
            engine.name()
        );
        Self::assemble(config, sessions, engine)
    }

    /// Wire the components around the given storage and engine.
    ///
    /// Reminders have exactly one sink: Discord DMs when Discord is enabled,
    /// otherwise the console. The console always serves input.
    pub fn assemble(
        config: HangoutsConfig,
        sessions: Arc<dyn SessionFactory>,
        engine: Arc<dyn ConversationalEngine>,
    ) -> Result<Self> {
        let (events_tx, events_rx) = queue::channel();
        let alarms = Arc::new(AlarmService::new(sessions.clone(), events_tx, &config.scheduler));
        let notifier = Arc::new(NotifierHub::new());
        let processor = Arc::new(AlarmEventProcessor::new(
            sessions.clone(),
            engine.clone(),
            notifier.clone(),
            alarms.outcome_sender(),
            &config.processor,
        ));
        let conversation = Arc::new(ConversationHandler::new(
            sessions.clone(),
            engine.clone(),
            config.processor.history_limit,
        ));

        let console: Arc<dyn Channel> = Arc::new(CliChannel::new(
            console_owner(&config),
            alarms.clone(),
            conversation.clone(),
            MessageValidator::new(&config.validator),
        ));
        let mut channels = vec![console.clone()];
        let sink = if config.discord.enabled {
            let discord: Arc<dyn Channel> = Arc::new(DiscordChannel::from_config(&config.discord)?);
            channels.push(discord.clone());
            discord
        } else {
            console
        };
        notifier.register(Arc::new(ChannelListener::new(sink.clone())));
        tracing::debug!("Reminders are delivered via {}", sink.name());

        Ok(Self {
            config,
            sessions,
            engine,
            alarms,
            processor,
            notifier,
            conversation,
            channels,
            events: Some(events_rx),
        })
    }

    /// Hand every long-running component to the supervisor. Callable once.
    pub fn spawn_all(&mut self, supervisor: &mut Supervisor) -> Result<()> {
        let events = self
            .events
            .take()
            .ok_or_else(|| HangoutsError::Channel("tasks already spawned".into()))?;

        let alarms = self.alarms.clone();
        supervisor.spawn("alarm-service", move |cancel| async move { alarms.start(cancel).await });

        let processor = self.processor.clone();
        supervisor.spawn("event-processor", move |cancel| async move {
            processor.run(events, cancel).await
        });

        for channel in &self.channels {
            let channel = channel.clone();
            let name = format!("channel:{}", channel.name());
            supervisor.spawn(&name, move |cancel| async move { channel.serve(cancel).await });
        }
        Ok(())
    }
}

fn console_owner(config: &HangoutsConfig) -> &str {
    let user_id = config.discord.user_id.trim();
    if config.discord.enabled && !user_id.is_empty() {
        user_id
    } else {
        CONSOLE_OWNER
    }
}
