//! Chat stream wire protocol.
//!
//! Incoming frames are loosely-typed JSON objects tagged by an `event` field.
//! [`ServerEvent::from_json`] is the single normalization point: it accepts
//! both the canonical event names and the names the backend historically
//! emits, coerces `time` to a string, turns literal `"null"` strings into
//! real nulls, and rejects anything it cannot place as a [`ProtocolError`].
//!
//! ```text
//!   ws text frame ──▶ RawIncoming (serde, lenient) ──▶ ServerEvent (closed enum)
//!                                     │
//!                                     └──▶ ProtocolError (logged, frame dropped)
//! ```

use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use strum::EnumString;

use crate::message::{Role, TokenUsage};

/// Event tag of the only outgoing frame type.
pub const REQUEST_EVENT: &str = "request";

/// Errors from decoding an incoming frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame has no event tag")]
    MissingEvent,
    #[error("unknown event: {0:?}")]
    UnknownEvent(String),
    #[error("{event} frame is missing field {field:?}")]
    MissingField { event: EventKind, field: &'static str },
}

// ============================================================================
// Event kinds
// ============================================================================

/// Tag of an incoming frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq, EnumString)]
#[strum(ascii_case_insensitive)]
pub enum EventKind {
    /// A new message begins.
    #[strum(serialize = "turn-start", serialize = "on_chain_start")]
    TurnStart,
    /// Streaming text for the open message.
    #[strum(serialize = "content-delta", serialize = "on_chat_model_stream")]
    ContentDelta,
    /// Token accounting for one model invocation.
    #[strum(serialize = "usage-update", serialize = "on_chat_model_end")]
    UsageUpdate,
    /// Query text plus an attachable query.
    #[strum(serialize = "result-stream", serialize = "on_query_stream")]
    ResultStream,
    /// Final values for the open message.
    #[strum(serialize = "turn-end", serialize = "on_chain_end")]
    TurnEnd,
}

impl EventKind {
    /// Parse from either naming scheme (case-insensitive).
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Option<Self> {
        <Self as FromStr>::from_str(s).ok()
    }

    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::TurnStart => "turn-start",
            EventKind::ContentDelta => "content-delta",
            EventKind::UsageUpdate => "usage-update",
            EventKind::ResultStream => "result-stream",
            EventKind::TurnEnd => "turn-end",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ============================================================================
// Incoming
// ============================================================================

/// Typed server event, produced only by [`ServerEvent::from_json`].
#[derive(Clone, Debug, PartialEq)]
pub enum ServerEvent {
    /// Open a new message for `role`.
    TurnStart {
        role: Role,
        table_name: Option<String>,
        pdf_name: Option<String>,
    },
    /// Streaming text. Cumulative or incremental depending on the reducer mode.
    ContentDelta {
        text: String,
        elapsed_time: Option<String>,
    },
    /// Usage for the open message.
    UsageUpdate { usage: TokenUsage },
    /// Text to append plus the query the user may run against the table.
    ResultStream {
        text: String,
        attached_query: Option<String>,
        query_label: Option<String>,
        query_type: Option<String>,
    },
    /// Terminal values. The message is frozen afterwards.
    TurnEnd {
        text: String,
        elapsed_time: Option<String>,
        thread_id: Option<String>,
        attached_query: Option<String>,
        query_label: Option<String>,
    },
}

impl ServerEvent {
    /// Decode and normalize one text frame.
    pub fn from_json(text: &str) -> Result<Self, ProtocolError> {
        let raw: RawIncoming = serde_json::from_str(text)?;
        raw.try_into()
    }

    pub fn kind(&self) -> EventKind {
        match self {
            Self::TurnStart { .. } => EventKind::TurnStart,
            Self::ContentDelta { .. } => EventKind::ContentDelta,
            Self::UsageUpdate { .. } => EventKind::UsageUpdate,
            Self::ResultStream { .. } => EventKind::ResultStream,
            Self::TurnEnd { .. } => EventKind::TurnEnd,
        }
    }

    /// Check if this event closes the turn.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::TurnEnd { .. })
    }
}

/// Lenient mirror of the incoming JSON object.
#[derive(Debug, Default, Deserialize)]
struct RawIncoming {
    #[serde(default, deserialize_with = "text")]
    event: Option<String>,
    #[serde(default, deserialize_with = "text")]
    role: Option<String>,
    #[serde(default, deserialize_with = "nullable_text")]
    table_name: Option<String>,
    #[serde(default, deserialize_with = "nullable_text")]
    pdf_name: Option<String>,
    #[serde(default, deserialize_with = "text")]
    message: Option<String>,
    #[serde(default, deserialize_with = "nullable_text")]
    time: Option<String>,
    #[serde(default, deserialize_with = "nullable_text")]
    thread_id: Option<String>,
    #[serde(default, deserialize_with = "nullable_text")]
    run_id: Option<String>,
    #[serde(default, deserialize_with = "nullable_text")]
    model_name: Option<String>,
    #[serde(default, deserialize_with = "nullable_text")]
    tool_call_name: Option<String>,
    #[serde(default, deserialize_with = "count")]
    input_tokens: Option<u64>,
    #[serde(default, deserialize_with = "count")]
    output_tokens: Option<u64>,
    #[serde(default, deserialize_with = "count")]
    total_tokens: Option<u64>,
    #[serde(
        default,
        alias = "answer_query",
        alias = "visualizing_query",
        deserialize_with = "nullable_text"
    )]
    attached_query: Option<String>,
    #[serde(default, alias = "viewing_query_label", deserialize_with = "nullable_text")]
    query_label: Option<String>,
    #[serde(default, deserialize_with = "nullable_text")]
    query_type: Option<String>,
}

impl TryFrom<RawIncoming> for ServerEvent {
    type Error = ProtocolError;

    fn try_from(raw: RawIncoming) -> Result<Self, Self::Error> {
        let tag = raw.event.ok_or(ProtocolError::MissingEvent)?;
        let kind = EventKind::from_str(&tag).ok_or(ProtocolError::UnknownEvent(tag))?;
        let missing = |field| ProtocolError::MissingField { event: kind, field };

        let event = match kind {
            EventKind::TurnStart => ServerEvent::TurnStart {
                role: raw.role.map(Role::new).ok_or_else(|| missing("role"))?,
                table_name: raw.table_name,
                pdf_name: raw.pdf_name,
            },
            EventKind::ContentDelta => ServerEvent::ContentDelta {
                text: raw.message.ok_or_else(|| missing("message"))?,
                elapsed_time: raw.time,
            },
            EventKind::UsageUpdate => {
                let input_tokens = raw.input_tokens.unwrap_or(0);
                let output_tokens = raw.output_tokens.unwrap_or(0);
                ServerEvent::UsageUpdate {
                    usage: TokenUsage {
                        run_id: raw.run_id,
                        model_name: raw.model_name.unwrap_or_default(),
                        tool_call_name: raw.tool_call_name.unwrap_or_default(),
                        input_tokens,
                        output_tokens,
                        total_tokens: raw.total_tokens.unwrap_or(input_tokens + output_tokens),
                    },
                }
            }
            EventKind::ResultStream => ServerEvent::ResultStream {
                text: raw.message.ok_or_else(|| missing("message"))?,
                attached_query: raw.attached_query,
                query_label: raw.query_label,
                query_type: raw.query_type,
            },
            EventKind::TurnEnd => ServerEvent::TurnEnd {
                text: raw.message.ok_or_else(|| missing("message"))?,
                elapsed_time: raw.time,
                thread_id: raw.thread_id,
                attached_query: raw.attached_query,
                query_label: raw.query_label,
            },
        };
        Ok(event)
    }
}

/// Strings pass through, numbers and bools are stringified, null is absent.
fn text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match Option::<serde_json::Value>::deserialize(deserializer)? {
        None | Some(serde_json::Value::Null) => Ok(None),
        Some(serde_json::Value::String(s)) => Ok(Some(s)),
        Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(serde_json::Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(D::Error::custom(format!("expected text, got {other}"))),
    }
}

/// Like [`text`], and the literal string `"null"` also means absent.
fn nullable_text<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(text(deserializer)?.filter(|s| s != "null"))
}

/// Non-negative integer given as a number or a numeric string.
fn count<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::Error;

    match nullable_text(deserializer)? {
        None => Ok(None),
        Some(s) => s
            .parse::<u64>()
            .map(Some)
            .map_err(|_| D::Error::custom(format!("expected token count, got {s:?}"))),
    }
}

// ============================================================================
// Outgoing
// ============================================================================

/// The user's question, sent as a `request` frame.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub role: Role,
    pub table_name: String,
    pub pdf_name: String,
    pub event: String,
    pub message: String,
}

impl ChatRequest {
    pub fn new(
        table_name: impl Into<String>,
        pdf_name: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            role: Role::user(),
            table_name: table_name.into(),
            pdf_name: pdf_name.into(),
            event: REQUEST_EVENT.to_string(),
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ============================================================================
// Tests
// ============================================================================
