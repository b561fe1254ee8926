use crate::bus::{AssistantEvent, EventBus};
use crate::frame::InboundFrame;

pub const UNKNOWN_ERROR: &str = "Unknown error";

impl InboundFrame {
    /// Maps a classified frame to the event it publishes.
    ///
    /// `Ignored` returns `None`: unknown discriminators never publish anything.
    pub fn into_event(self) -> Option<AssistantEvent> {
        match self {
            Self::Message { message } => Some(AssistantEvent::MessagesObtained { message }),
            Self::Update { text } => Some(AssistantEvent::MessageUpdated { text }),
            Self::Completed => Some(AssistantEvent::MessageCompleted),
            Self::InProgress => Some(AssistantEvent::InProgress),
            Self::Error { error } => Some(AssistantEvent::Error {
                error: error
                    .filter(|error| !error.is_empty())
                    .unwrap_or_else(|| UNKNOWN_ERROR.to_string()),
            }),
            Self::Ignored => None,
        }
    }
}

/// Classifies raw inbound frames and republishes them on the bus.
#[derive(Debug, Clone)]
pub struct FrameRouter {
    bus: EventBus,
    debug: bool,
}

impl FrameRouter {
    pub fn new(bus: EventBus, debug: bool) -> Self {
        Self { bus, debug }
    }

    /// Publishes at most one event for `raw`. Parse failures surface as an `error`
    /// event and never reach the caller.
    pub fn dispatch(&self, raw: &str) -> Option<AssistantEvent> {
        let event = match InboundFrame::parse(raw) {
            Ok(frame) => {
                if self.debug {
                    tracing::debug!(frame = ?frame, "received frame");
                }
                frame.into_event()
            }
            Err(error) => {
                tracing::warn!(error = ?error, raw_len = raw.len(), "dropping malformed frame");
                Some(AssistantEvent::error(error.to_string()))
            }
        };

        match &event {
            Some(event) => self.bus.publish(event),
            None => tracing::trace!("ignoring frame with unrecognized type"),
        }
        event
    }
}
