//! Wire frames exchanged with the remote assistant.
//!
//! Every frame is a JSON object tagged by its `type` field. Inbound frames are
//! validated into a closed set of variants at the boundary; any tag this client
//! does not know lands in [`InboundFrame::Ignored`].

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::ResultExt;

use crate::error::{AssistantResult, EncodeFrameSnafu, ParseFrameSnafu};

/// Message object embedded in a `message` frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Server identifier, either a string or a number.
    #[serde(default)]
    pub id: Option<Value>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
    #[serde(default, rename = "type")]
    pub kind: Option<String>,
}

impl WireMessage {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: Some(text.into()),
            ..Self::default()
        }
    }

    /// Returns the server id as text, if the server sent a usable one.
    pub fn id_text(&self) -> Option<String> {
        match self.id.as_ref()? {
            Value::String(raw) if !raw.trim().is_empty() => Some(raw.clone()),
            Value::Number(number) => Some(number.to_string()),
            _ => None,
        }
    }
}

/// Classified inbound frame.
///
/// Classification is lenient: payload fields of the wrong JSON type fall back to
/// their defaults, and a frame whose `type` is absent, not a string or not
/// recognized becomes [`InboundFrame::Ignored`]. Only text that is not JSON, or
/// an embedded message object that does not fit [`WireMessage`], fails to parse.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    Message { message: Option<WireMessage> },
    Update { text: String },
    Completed,
    InProgress,
    Error { error: Option<String> },
    Ignored,
}

impl InboundFrame {
    pub fn parse(raw: &str) -> AssistantResult<Self> {
        let value: Value = serde_json::from_str(raw).context(ParseFrameSnafu {
            stage: "parse-inbound-frame",
        })?;
        Self::classify(value)
    }

    fn classify(mut value: Value) -> AssistantResult<Self> {
        let frame = match value.get("type").and_then(Value::as_str) {
            Some("message") => {
                let message = match value.get_mut("message").map(Value::take) {
                    None | Some(Value::Null) => None,
                    Some(raw) => {
                        let message = serde_json::from_value(raw).context(ParseFrameSnafu {
                            stage: "parse-embedded-message",
                        })?;
                        Some(message)
                    }
                };
                Self::Message { message }
            }
            Some("update") => Self::Update {
                text: string_field(&value, "text").unwrap_or_default(),
            },
            Some("completed") => Self::Completed,
            Some("inProgress") => Self::InProgress,
            Some("error") => Self::Error {
                error: string_field(&value, "error"),
            },
            _ => Self::Ignored,
        };
        Ok(frame)
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(str::to_owned)
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    Message {
        text: String,
        timestamp: String,
    },
    Action {
        action_type: String,
        payload: Value,
        timestamp: String,
    },
}

impl OutboundFrame {
    pub fn message(text: impl Into<String>) -> Self {
        Self::Message {
            text: text.into(),
            timestamp: now_timestamp(),
        }
    }

    pub fn action(action_type: impl Into<String>, payload: Value) -> Self {
        Self::Action {
            action_type: action_type.into(),
            payload,
            timestamp: now_timestamp(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Action { .. } => "action",
        }
    }

    pub fn encode(&self) -> AssistantResult<String> {
        serde_json::to_string(self).context(EncodeFrameSnafu {
            stage: "encode-outbound-frame",
            kind: self.kind(),
        })
    }
}

/// ISO-8601 UTC timestamp with millisecond precision, e.g. `2024-05-01T10:00:00.000Z`.
fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}
