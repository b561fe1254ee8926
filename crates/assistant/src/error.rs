use snafu::Snafu;

/// Failures inside the assistant core.
///
/// The `Display` text of each variant is the short description carried by `error`
/// events, so it stays generic. Full context lives in the fields and is logged.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum AssistantError {
    #[snafu(display("WebSocket connection error"))]
    Connect {
        stage: &'static str,
        endpoint: String,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[snafu(display("WebSocket connection error"))]
    Socket {
        stage: &'static str,
        source: tokio_tungstenite::tungstenite::Error,
    },
    #[snafu(display("Failed to parse message"))]
    ParseFrame {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("Failed to encode {kind} frame"))]
    EncodeFrame {
        stage: &'static str,
        kind: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("Not connected to server"))]
    NotConnected { stage: &'static str },
    #[snafu(display("Failed to send {kind}"))]
    TransportGone {
        stage: &'static str,
        kind: &'static str,
    },
    #[snafu(display("Assistant service not available"))]
    ServiceUnavailable { stage: &'static str },
}

pub type AssistantResult<T> = Result<T, AssistantError>;
