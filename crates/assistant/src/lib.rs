#![deny(unsafe_code)]

/// Reconnect schedule with exponential backoff.
pub mod backoff;
/// Typed event bus shared by the service and its observers.
pub mod bus;
/// Settings persistence.
pub mod config;
/// Conversation state built from bus events.
pub mod conversation;
pub mod error;
/// Wire frames exchanged with the assistant server.
pub mod frame;
pub mod router;
/// Connection lifecycle owner.
pub mod service;
pub mod transport;
/// WebSocket transport.
pub mod ws;

pub use backoff::{ReconnectDecision, ReconnectPolicy};
pub use bus::{
    AssistantEvent, DisconnectReason, EventBus, EventHandler, EventName, Subscription,
    SubscriptionId,
};
pub use config::{AssistantSettings, ReconnectSettings, SettingsError, SettingsStore};
pub use conversation::{
    ConversationReader, ConversationState, ConversationStore, Message, MessageId,
    PartialMessage, Sender, TranscriptEntry,
};
pub use error::{AssistantError, AssistantResult};
pub use frame::{InboundFrame, OutboundFrame, WireMessage};
pub use router::FrameRouter;
pub use service::{AssistantService, ConnectionState};
pub use transport::{Connector, TransportEvent, TransportHandle};
pub use ws::WsConnector;
