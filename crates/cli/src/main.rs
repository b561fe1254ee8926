use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use lexai_assistant::{
    AssistantEvent, AssistantService, AssistantSettings, ConversationReader, ConversationStore,
    EventBus, EventName, Message, Sender, SettingsStore, Subscription,
};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Terminal front end for the assistant.
///
/// Reads one line per message from stdin. Lines starting with `/` are commands:
/// `/quit`, `/reset`, `/connect`, `/disconnect`, `/state`, `/assistant [id]` and
/// `/action <type> [json]`.
#[tokio::main]
async fn main() {
    let settings_store = SettingsStore::load();
    let settings = settings_store.settings();

    let default_level = if settings.debug { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::info!(
        config = %settings_store.config_path().display(),
        endpoint = %settings.endpoint(),
        "starting assistant client"
    );

    let mut session = Session::start(settings_store, &settings);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => {
                let line = match line {
                    Ok(Some(line)) => line,
                    Ok(None) => break,
                    Err(err) => {
                        tracing::warn!(error = ?err, "failed to read stdin");
                        break;
                    }
                };
                if !session.handle_line(line.trim()).await {
                    break;
                }
            }
        }
    }

    if !session.service.disconnect_and_wait(SHUTDOWN_GRACE).await {
        tracing::warn!("connection was not closed cleanly");
    }
    tracing::info!("assistant client stopped");
}

struct Session {
    settings_store: SettingsStore,
    bus: EventBus,
    service: AssistantService,
    store: ConversationStore,
    replies: Arc<ReplyCursor>,
    _printers: Vec<Subscription>,
}

impl Session {
    fn start(settings_store: SettingsStore, settings: &AssistantSettings) -> Self {
        let bus = EventBus::new();
        let service = AssistantService::spawn(settings, bus.clone());
        let store = ConversationStore::with_service(service.clone());
        let replies = Arc::new(ReplyCursor::default());
        let printers = attach_printers(&bus, store.reader(), Arc::clone(&replies));
        service.connect();

        Self {
            settings_store,
            bus,
            service,
            store,
            replies,
            _printers: printers,
        }
    }

    /// Returns false when the session should end.
    async fn handle_line(&mut self, line: &str) -> bool {
        if line.is_empty() {
            return true;
        }
        let Some(command) = line.strip_prefix('/') else {
            self.store.send_message(line);
            return true;
        };

        let (name, rest) = command
            .split_once(char::is_whitespace)
            .map(|(name, rest)| (name, rest.trim()))
            .unwrap_or((command, ""));
        match name {
            "quit" | "exit" => return false,
            "reset" => {
                self.store.reset();
                self.replies.rewind();
                println!("-- conversation cleared");
            }
            "connect" => self.service.connect(),
            "disconnect" => self.service.disconnect(),
            "state" => println!("-- {:?}", self.service.state()),
            "assistant" if rest.is_empty() => {
                println!("-- talking to {}", self.service.endpoint());
            }
            "assistant" => self.switch_assistant(rest).await,
            "action" => match parse_action(rest) {
                Ok((action_type, payload)) => {
                    let _ = self.service.send_action(action_type, payload);
                }
                Err(message) => println!("-- {message}"),
            },
            other => println!("-- unknown command /{other}"),
        }
        true
    }

    /// Saves the new assistant id and moves the conversation to its endpoint.
    async fn switch_assistant(&mut self, assistant_id: &str) {
        let settings = match self
            .settings_store
            .modify(|settings| settings.assistant_id = assistant_id.to_string())
        {
            Ok(settings) => settings,
            Err(err) => {
                tracing::warn!(error = ?err, "failed to save settings");
                println!("!! {err}");
                return;
            }
        };
        if settings.endpoint() == self.service.endpoint() {
            println!("-- already talking to {}", self.service.endpoint());
            return;
        }

        self.service.disconnect_and_wait(SHUTDOWN_GRACE).await;
        self.service = AssistantService::spawn(&settings, self.bus.clone());
        self.store.set_service(self.service.clone());
        self.store.reset();
        self.replies.rewind();
        println!("-- switched to {}", self.service.endpoint());
        self.service.connect();
    }
}

fn parse_action(rest: &str) -> Result<(&str, Value), String> {
    let (action_type, payload) = rest
        .split_once(char::is_whitespace)
        .map(|(action_type, payload)| (action_type, payload.trim()))
        .unwrap_or((rest, ""));
    if action_type.is_empty() {
        return Err("usage: /action <type> [json]".to_string());
    }
    if payload.is_empty() {
        return Ok((action_type, Value::Null));
    }
    serde_json::from_str(payload)
        .map(|payload| (action_type, payload))
        .map_err(|err| format!("invalid action payload: {err}"))
}

/// Tracks how much of the transcript has been printed.
#[derive(Debug, Default)]
struct ReplyCursor {
    printed: AtomicUsize,
}

impl ReplyCursor {
    /// Assistant replies appended since the last call.
    fn take_new<'a>(&self, messages: &'a [Message]) -> Vec<&'a str> {
        let start = self.printed.swap(messages.len(), Ordering::SeqCst);
        messages
            .get(start..)
            .unwrap_or_default()
            .iter()
            .filter(|message| message.sender == Sender::Assistant)
            .map(|message| message.content.as_str())
            .collect()
    }

    fn rewind(&self) {
        self.printed.store(0, Ordering::SeqCst);
    }
}

fn attach_printers(
    bus: &EventBus,
    reader: ConversationReader,
    replies: Arc<ReplyCursor>,
) -> Vec<Subscription> {
    let mut subscriptions = vec![
        bus.subscribe_scoped(EventName::Connected, |_| println!("-- connected")),
        bus.subscribe_scoped(EventName::Disconnected, |event| {
            if let AssistantEvent::Disconnected { reason } = event {
                println!("-- disconnected ({reason})");
            }
        }),
        bus.subscribe_scoped(EventName::Reconnecting, |event| {
            if let AssistantEvent::Reconnecting { attempt, delay } = event {
                println!("-- reconnecting, attempt {attempt} in {}s", delay.as_secs());
            }
        }),
        bus.subscribe_scoped(EventName::InProgress, |_| println!("-- assistant is typing")),
        bus.subscribe_scoped(EventName::Error, |event| {
            if let AssistantEvent::Error { error } = event {
                println!("!! {error}");
            }
        }),
    ];

    // The store is subscribed first, so these see the already-updated transcript.
    for name in [EventName::MessagesObtained, EventName::MessageCompleted] {
        let reader = reader.clone();
        let replies = Arc::clone(&replies);
        subscriptions.push(bus.subscribe_scoped(name, move |_| {
            let snapshot = reader.snapshot();
            for reply in replies.take_new(&snapshot.messages) {
                println!("assistant> {reply}");
            }
        }));
    }
    subscriptions
}
