//! Message stream reducer.
//!
//! [`Conversation`] folds [`ServerEvent`]s into an ordered message list. A
//! turn-start opens a new streaming message; every later event targets the
//! last message until a turn-end freezes it. Events that have no open message
//! to land on are logged and ignored.
//!
//! The reply guard ([`Conversation::turn_open`]) is separate from message
//! status. It opens when the user sends or a turn starts, and closes on
//! turn-end or [`Conversation::abandon_turn`]. An abandoned reply keeps its
//! message `Streaming`.
//!
//! ```text
//!            turn-start
//!   (none) ─────────────▶ Streaming ──turn-end──▶ Complete
//!                         │  ▲
//!                         └──┘ content-delta / usage-update / result-stream
//! ```

use serde::{Deserialize, Serialize};
use strum::EnumString;
use tablechat_types::{Message, MessageStatus, Role, ServerEvent, TokenUsage};

/// How content-delta payloads combine with the current content.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, EnumString)]
#[serde(rename_all = "lowercase")]
#[strum(ascii_case_insensitive, serialize_all = "lowercase")]
pub enum DeltaMode {
    /// Each delta carries the full text so far and replaces the content.
    #[default]
    Cumulative,
    /// Each delta is a fragment appended to the content.
    Incremental,
}

/// Result of applying one event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Applied {
    /// A new streaming message was appended.
    Opened,
    /// The open message changed.
    Updated,
    /// The open message was frozen.
    Completed,
    /// No open message; the event was dropped.
    Ignored,
}

/// Consecutive messages of one role, for display.
#[derive(Clone, Debug, PartialEq)]
pub struct MessageGroup<'a> {
    pub role: &'a Role,
    pub messages: &'a [Message],
}

impl<'a> MessageGroup<'a> {
    /// Usage entries of every message in the group, in order.
    pub fn token_usage(&self) -> impl Iterator<Item = &'a TokenUsage> {
        self.messages.iter().flat_map(|m| m.token_usage.iter())
    }

    pub fn total_tokens(&self) -> u64 {
        self.token_usage().map(|u| u.total_tokens).sum()
    }
}

/// Ordered chat history plus the reducer for incoming events.
#[derive(Clone, Debug, Default)]
pub struct Conversation {
    messages: Vec<Message>,
    delta_mode: DeltaMode,
    /// A reply is outstanding.
    awaiting_reply: bool,
}

impl Conversation {
    pub fn new(delta_mode: DeltaMode) -> Self {
        Self {
            messages: Vec::new(),
            delta_mode,
            awaiting_reply: false,
        }
    }

    pub fn delta_mode(&self) -> DeltaMode {
        self.delta_mode
    }

    pub fn messages(&self) -> &[Message] {
        &self.messages
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    /// Check if a reply is outstanding: sent or started, not yet ended.
    pub fn turn_open(&self) -> bool {
        self.awaiting_reply
    }

    /// Append the user's own message and open the reply guard. Returns its
    /// index.
    pub fn push_user_message(&mut self, content: impl Into<String>) -> usize {
        self.messages.push(Message::user(content));
        self.awaiting_reply = true;
        self.messages.len() - 1
    }

    /// Give up on the outstanding reply, e.g. after the link carrying it
    /// dropped. A partially streamed message stays `Streaming`. Returns
    /// whether a reply was outstanding.
    pub fn abandon_turn(&mut self) -> bool {
        let was_open = std::mem::take(&mut self.awaiting_reply);
        if was_open {
            tracing::warn!(
                partial = self.messages.last().is_some_and(Message::is_streaming),
                "abandoning outstanding reply"
            );
        }
        was_open
    }

    /// Apply one server event.
    pub fn apply(&mut self, event: &ServerEvent) -> Applied {
        if let ServerEvent::TurnStart { role, .. } = event {
            tracing::debug!(role = %role, index = self.messages.len(), "turn started");
            self.messages.push(Message::streaming(role.clone()));
            self.awaiting_reply = true;
            return Applied::Opened;
        }

        let delta_mode = self.delta_mode;
        let Some(msg) = self.messages.last_mut().filter(|m| m.is_streaming()) else {
            tracing::warn!(event = %event.kind(), "no open message for event, ignoring");
            return Applied::Ignored;
        };

        let applied = match event {
            ServerEvent::TurnStart { .. } => unreachable!("handled above"),
            ServerEvent::ContentDelta { text, elapsed_time } => {
                match delta_mode {
                    DeltaMode::Cumulative => text.clone_into(&mut msg.content),
                    DeltaMode::Incremental => msg.content.push_str(text),
                }
                if elapsed_time.is_some() {
                    msg.elapsed_time.clone_from(elapsed_time);
                }
                Applied::Updated
            }
            ServerEvent::UsageUpdate { usage } => {
                tracing::trace!(
                    model = %usage.model_name,
                    total_tokens = usage.total_tokens,
                    "usage recorded"
                );
                msg.token_usage.push(usage.clone());
                Applied::Updated
            }
            ServerEvent::ResultStream {
                text,
                attached_query,
                query_label,
                query_type,
            } => {
                msg.content.push_str(text);
                if attached_query.is_some() {
                    msg.attached_query.clone_from(attached_query);
                }
                if query_label.is_some() {
                    msg.query_label.clone_from(query_label);
                }
                if query_type.is_some() {
                    msg.query_type.clone_from(query_type);
                }
                Applied::Updated
            }
            ServerEvent::TurnEnd {
                text,
                elapsed_time,
                thread_id,
                attached_query,
                query_label,
            } => {
                text.clone_into(&mut msg.content);
                msg.elapsed_time.clone_from(elapsed_time);
                msg.thread_id.clone_from(thread_id);
                if attached_query.is_some() {
                    msg.attached_query.clone_from(attached_query);
                }
                if query_label.is_some() {
                    msg.query_label.clone_from(query_label);
                }
                msg.status = MessageStatus::Complete;
                tracing::debug!(
                    role = %msg.role,
                    tokens = msg.total_tokens(),
                    has_query = msg.attached_query.is_some(),
                    "turn complete"
                );
                Applied::Completed
            }
        };
        if event.is_terminal() {
            self.awaiting_reply = false;
        }
        applied
    }

    /// Group consecutive same-role messages. Pure projection.
    pub fn groups(&self) -> Vec<MessageGroup<'_>> {
        self.messages
            .chunk_by(|a, b| a.role == b.role)
            .map(|chunk| MessageGroup {
                role: &chunk[0].role,
                messages: chunk,
            })
            .collect()
    }

    /// Most recent message carrying an attached query.
    pub fn last_attached_query(&self) -> Option<&Message> {
        self.messages.iter().rev().find(|m| m.attached_query.is_some())
    }

    /// Sum of every usage entry in the conversation.
    pub fn total_usage(&self) -> TokenUsage {
        self.messages
            .iter()
            .flat_map(|m| m.token_usage.iter())
            .fold(TokenUsage::default(), |mut acc, u| {
                acc.input_tokens += u.input_tokens;
                acc.output_tokens += u.output_tokens;
                acc.total_tokens += u.total_tokens;
                acc
            })
    }

    pub fn clear(&mut self) {
        self.messages.clear();
        self.awaiting_reply = false;
    }
}

// ============================================================================
// Tests
// ============================================================================
