//! Chat message types.
//!
//! A [`Message`] is created by a turn-start event (or synchronously when the
//! user sends), mutated in place while its turn streams, and frozen once the
//! terminal event arrives. Token usage accumulates additively per message.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Role string the client uses for its own outgoing messages.
pub const USER_ROLE: &str = "User";

/// Conversation role.
///
/// The server names roles after the agent that produced the text
/// (`sql_agent`, `assistant`, ...), so roles stay opaque strings. Only the
/// client's own role has a fixed spelling.
#[derive(Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(String);

impl Role {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The client's own role (`"User"`).
    pub fn user() -> Self {
        Self(USER_ROLE.to_string())
    }

    /// Case-insensitive check for the client's own role.
    pub fn is_user(&self) -> bool {
        self.0.eq_ignore_ascii_case(USER_ROLE)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Role({})", self.0)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Streaming state of a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    /// The turn is open; deltas and usage still apply.
    #[default]
    Streaming,
    /// The terminal event arrived (or the message was user-authored).
    Complete,
}

/// Token accounting for one model invocation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
    pub model_name: String,
    pub tool_call_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_tokens: u64,
}

/// One chat message.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attached_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_label: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elapsed_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub token_usage: Vec<TokenUsage>,
    #[serde(default)]
    pub status: MessageStatus,
}

impl Message {
    /// An empty, streaming message opened by a turn-start event.
    pub fn streaming(role: Role) -> Self {
        Self {
            role,
            content: String::new(),
            attached_query: None,
            query_label: None,
            query_type: None,
            elapsed_time: None,
            thread_id: None,
            token_usage: Vec::new(),
            status: MessageStatus::Streaming,
        }
    }

    /// A finished user-authored message.
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            status: MessageStatus::Complete,
            ..Self::streaming(Role::user())
        }
    }

    pub fn is_streaming(&self) -> bool {
        self.status == MessageStatus::Streaming
    }

    /// Sum of `total_tokens` across all usage entries.
    pub fn total_tokens(&self) -> u64 {
        self.token_usage.iter().map(|u| u.total_tokens).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_role_matching() {
        assert!(Role::user().is_user());
        assert!(Role::new("user").is_user());
        assert!(!Role::new("sql_agent").is_user());
        assert_eq!(Role::user().as_str(), "User");
    }

    #[test]
    fn test_user_message_is_complete() {
        let msg = Message::user("how many rows?");
        assert_eq!(msg.role, Role::user());
        assert_eq!(msg.status, MessageStatus::Complete);
        assert!(!msg.is_streaming());
    }

    #[test]
    fn test_total_tokens() {
        let mut msg = Message::streaming(Role::new("assistant"));
        msg.token_usage.push(TokenUsage {
            total_tokens: 30,
            ..Default::default()
        });
        msg.token_usage.push(TokenUsage {
            total_tokens: 12,
            ..Default::default()
        });
        assert_eq!(msg.total_tokens(), 42);
    }
}
