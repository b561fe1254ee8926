use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use uuid::Uuid;

use crate::bus::{AssistantEvent, EventName, Subscription};
use crate::error::ServiceUnavailableSnafu;
use crate::frame::WireMessage;
use crate::service::AssistantService;

/// Stable identifier for one message.
///
/// Server ids are kept verbatim; locally created messages get a fresh UUIDv7.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn fresh() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter.write_str(&self.0)
    }
}

/// Who wrote a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sender {
    User,
    Assistant,
}

/// Finalized message. Never mutated once appended to a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub id: MessageId,
    pub sender: Sender,
    pub content: String,
    pub timestamp: Option<String>,
    pub kind: Option<String>,
}

impl Message {
    pub fn new(id: MessageId, sender: Sender, content: impl Into<String>) -> Self {
        Self {
            id,
            sender,
            content: content.into(),
            timestamp: None,
            kind: None,
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new(MessageId::fresh(), Sender::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(MessageId::fresh(), Sender::Assistant, content)
    }

    /// Assistant message from a `message` frame; missing text becomes empty content.
    pub fn from_wire(message: &WireMessage) -> Self {
        let id = message
            .id_text()
            .map(MessageId::new)
            .unwrap_or_else(MessageId::fresh);
        Self {
            id,
            sender: Sender::Assistant,
            content: message.text.clone().unwrap_or_default(),
            timestamp: message.timestamp.clone(),
            kind: message.kind.clone(),
        }
    }
}

/// The one assistant reply still being streamed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialMessage {
    pub text: String,
    pub is_complete: bool,
}

impl Default for PartialMessage {
    fn default() -> Self {
        Self {
            text: String::new(),
            is_complete: true,
        }
    }
}

impl PartialMessage {
    pub fn is_visible(&self) -> bool {
        !self.text.is_empty() && !self.is_complete
    }
}

/// One rendered line of the transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TranscriptEntry<'a> {
    Final(&'a Message),
    Streaming(&'a str),
}

/// Accumulated conversation state and its reducer.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationState {
    pub messages: Vec<Message>,
    pub partial: PartialMessage,
    pub is_connected: bool,
    pub is_loading: bool,
    pub error: Option<String>,
}

impl ConversationState {
    pub fn add_message(&mut self, message: Message) {
        self.messages.push(message);
        self.is_loading = false;
    }

    pub fn update_partial(&mut self, text: impl Into<String>) {
        self.partial = PartialMessage {
            text: text.into(),
            is_complete: false,
        };
    }

    /// Finalizes non-empty partial text as an assistant message. Empty text is a no-op.
    pub fn complete_partial(&mut self) -> Option<MessageId> {
        if self.partial.text.is_empty() {
            return None;
        }

        let partial = std::mem::take(&mut self.partial);
        let message = Message::assistant(partial.text);
        let id = message.id.clone();
        self.messages.push(message);
        self.is_loading = false;
        Some(id)
    }

    pub fn clear_partial(&mut self) {
        self.partial = PartialMessage::default();
    }

    pub fn reset(&mut self) {
        self.messages.clear();
        self.clear_partial();
        self.is_loading = false;
        self.error = None;
    }

    pub fn apply(&mut self, event: &AssistantEvent) {
        match event {
            AssistantEvent::MessagesObtained { message } => {
                if let Some(message) = message {
                    self.add_message(Message::from_wire(message));
                }
            }
            AssistantEvent::MessageUpdated { text } => self.update_partial(text.as_str()),
            AssistantEvent::MessageCompleted => {
                self.complete_partial();
            }
            AssistantEvent::Connected => self.is_connected = true,
            AssistantEvent::Disconnected { .. } | AssistantEvent::Reconnecting { .. } => {
                self.is_connected = false
            }
            AssistantEvent::InProgress => self.is_loading = true,
            AssistantEvent::Error { error } => {
                self.error = Some(error.clone());
                self.is_loading = false;
            }
            AssistantEvent::MessageAdd { .. } => {}
        }
    }

    /// Finalized messages in append order, then the partial text while it streams.
    pub fn transcript(&self) -> Vec<TranscriptEntry<'_>> {
        let mut entries = self
            .messages
            .iter()
            .map(TranscriptEntry::Final)
            .collect::<Vec<_>>();
        if self.partial.is_visible() {
            entries.push(TranscriptEntry::Streaming(&self.partial.text));
        }
        entries
    }
}

const OBSERVED_EVENTS: [EventName; 8] = [
    EventName::MessagesObtained,
    EventName::MessageUpdated,
    EventName::MessageCompleted,
    EventName::Connected,
    EventName::Disconnected,
    EventName::Reconnecting,
    EventName::InProgress,
    EventName::Error,
];

/// Conversation state bound to an [`AssistantService`].
///
/// State is only mutated by this store's own methods and by its bus handlers.
/// Handlers are released when the store is dropped or re-attached.
#[derive(Default)]
pub struct ConversationStore {
    state: Arc<Mutex<ConversationState>>,
    service: Option<AssistantService>,
    subscriptions: Vec<Subscription>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(service: AssistantService) -> Self {
        let mut store = Self::new();
        store.set_service(service);
        store
    }

    pub fn set_service(&mut self, service: AssistantService) {
        self.subscriptions.clear();
        self.subscriptions = OBSERVED_EVENTS
            .into_iter()
            .map(|name| {
                let state = Arc::clone(&self.state);
                service
                    .bus()
                    .subscribe_scoped(name, move |event| lock(&state).apply(event))
            })
            .collect();
        self.service = Some(service);
    }

    pub fn service(&self) -> Option<&AssistantService> {
        self.service.as_ref()
    }

    /// Appends the user message optimistically, marks loading and hands it to the
    /// service. Delivery failures land in the error field through the `error` event;
    /// the appended message is kept.
    pub fn send_message(&self, text: &str) {
        let Some(service) = &self.service else {
            let error = ServiceUnavailableSnafu {
                stage: "conversation-send",
            }
            .build();
            tracing::warn!(error = ?error, "message dropped");
            lock(&self.state).error = Some(error.to_string());
            return;
        };

        {
            let mut state = lock(&self.state);
            state.add_message(Message::user(text));
            state.is_loading = true;
        }
        // The guard is released first: a failed send publishes synchronously into
        // this store's own handlers.
        let _ = service.send_message(text);
    }

    pub fn add_message(&self, message: Message) {
        lock(&self.state).add_message(message);
    }

    pub fn update_partial(&self, text: &str) {
        lock(&self.state).update_partial(text);
    }

    pub fn complete_partial(&self) -> Option<MessageId> {
        lock(&self.state).complete_partial()
    }

    pub fn clear_partial(&self) {
        lock(&self.state).clear_partial();
    }

    pub fn set_connected(&self, connected: bool) {
        lock(&self.state).is_connected = connected;
    }

    pub fn set_loading(&self, loading: bool) {
        lock(&self.state).is_loading = loading;
    }

    pub fn set_error(&self, error: Option<String>) {
        lock(&self.state).error = error;
    }

    pub fn reset(&self) {
        lock(&self.state).reset();
    }

    pub fn snapshot(&self) -> ConversationState {
        lock(&self.state).clone()
    }

    pub fn reader(&self) -> ConversationReader {
        ConversationReader {
            state: Arc::clone(&self.state),
        }
    }
}

/// Read-only view that can be handed to renderers and event handlers.
#[derive(Clone)]
pub struct ConversationReader {
    state: Arc<Mutex<ConversationState>>,
}

impl ConversationReader {
    pub fn snapshot(&self) -> ConversationState {
        lock(&self.state).clone()
    }
}

fn lock(state: &Mutex<ConversationState>) -> MutexGuard<'_, ConversationState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}
