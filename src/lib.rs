//! Muxbot: a local daemon bridging terminal-hosted coding agents to chat platforms.
//!
//! A user sends a message from a Discord or Slack channel; the bridge types it
//! into the agent's tmux pane, watches the pane (or receives structured
//! `session.*` events over HTTP), and streams the agent's reply back to the
//! originating channel.

pub mod bridge;
pub mod capture;
pub mod config;
pub mod daemon;
pub mod error;
pub mod hooks;
pub mod messaging;
pub mod mux;
pub mod pending;
pub mod prompt;
pub mod router;
pub mod routing;
pub mod state;
pub mod update;

#[cfg(test)]
pub mod testutil;

pub use error::{Error, Result};

use serde::{Deserialize, Serialize};

/// Which chat platform a messaging adapter talks to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Discord,
    Slack,
}

impl Platform {
    pub fn as_str(self) -> &'static str {
        match self {
            Platform::Discord => "discord",
            Platform::Slack => "slack",
        }
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// The kind of agent running inside a pane.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum AgentType {
    Claude,
    Codex,
    Opencode,
    Gemini,
}

impl AgentType {
    pub const ALL: [AgentType; 4] = [
        AgentType::Claude,
        AgentType::Codex,
        AgentType::Opencode,
        AgentType::Gemini,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            AgentType::Claude => "claude",
            AgentType::Codex => "codex",
            AgentType::Opencode => "opencode",
            AgentType::Gemini => "gemini",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "claude" => Some(AgentType::Claude),
            "codex" => Some(AgentType::Codex),
            "opencode" => Some(AgentType::Opencode),
            "gemini" => Some(AgentType::Gemini),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Addresses one agent instance: `(project, instance_id)`.
///
/// When a caller has no explicit instance id, the agent type tag doubles as
/// the id, so every keyed map in the runtime uses the same fallback.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InstanceKey {
    pub project: String,
    pub instance_id: String,
}

impl InstanceKey {
    pub fn new(project: impl Into<String>, instance_id: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            instance_id: instance_id.into(),
        }
    }

    /// Build a key, falling back to the agent type tag when no instance id
    /// was provided.
    pub fn resolve(
        project: impl Into<String>,
        agent_type: AgentType,
        instance_id: Option<&str>,
    ) -> Self {
        Self {
            project: project.into(),
            instance_id: instance_id
                .filter(|id| !id.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| agent_type.as_str().to_string()),
        }
    }
}

impl std::fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.project, self.instance_id)
    }
}

/// File attachment metadata on an inbound chat message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    pub mime_type: String,
    pub url: String,
    pub size_bytes: Option<u64>,
}

/// Inbound message from a chat platform, as handed to the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Platform message id.
    pub id: String,
    /// Channel (or thread) the message arrived in.
    pub channel_id: String,
    /// Sender display name.
    pub sender: String,
    /// Raw message text.
    pub text: String,
    pub platform: Platform,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Message id this one replies to, when the platform reports one.
    pub reply_to_message_id: Option<String>,
    /// Thread root id when the message was posted inside a thread.
    pub thread_id: Option<String>,
    /// Stable key for the surrounding conversation (thread id on Discord,
    /// `channel:thread_ts` on Slack).
    pub conversation_key: Option<String>,
}

impl ChatMessage {
    pub fn has_attachments(&self) -> bool {
        !self.attachments.is_empty()
    }
}

/// How a route was found, reported back to the tracker so provenance is
/// visible in the chat client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteHint {
    Reply,
    Thread,
    Memory,
    Attachment,
}

impl RouteHint {
    pub fn as_str(self) -> &'static str {
        match self {
            RouteHint::Reply => "reply",
            RouteHint::Thread => "thread",
            RouteHint::Memory => "memory",
            RouteHint::Attachment => "attachment",
        }
    }
}

/// Truncate to a character limit without splitting a code point.
pub(crate) fn truncate_chars(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_index, _)) => &text[..byte_index],
        None => text,
    }
}
