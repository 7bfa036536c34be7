//! Wire types for `/agent-event` and `/opencode-event`.
//!
//! Events are parsed into typed payloads at the HTTP boundary; anything that
//! does not fit the shape is rejected with a 400 before any side effect.

use crate::config::ProgressMode;
use crate::error::EventError;
use crate::AgentType;

use serde::{Deserialize, Serialize};

/// The `session.*` event family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Progress,
    Final,
    Idle,
    Error,
    Cancelled,
}

impl EventKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "session.start" => Some(EventKind::Start),
            "session.progress" => Some(EventKind::Progress),
            "session.final" => Some(EventKind::Final),
            "session.idle" => Some(EventKind::Idle),
            "session.error" => Some(EventKind::Error),
            "session.cancelled" => Some(EventKind::Cancelled),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            EventKind::Start => "session.start",
            EventKind::Progress => "session.progress",
            EventKind::Final => "session.final",
            EventKind::Idle => "session.idle",
            EventKind::Error => "session.error",
            EventKind::Cancelled => "session.cancelled",
        }
    }

    /// Terminal and progress events require a preceding `session.start` under
    /// lifecycle strict mode.
    pub fn requires_started_turn(self) -> bool {
        !matches!(self, EventKind::Start)
    }
}

/// Raw JSON body accepted by the event endpoints.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentEventPayload {
    pub project_name: String,
    #[serde(default)]
    pub agent_type: Option<String>,
    #[serde(default)]
    pub instance_id: Option<String>,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub turn_text: Option<String>,
    #[serde(default)]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub event_id: Option<String>,
    #[serde(default)]
    pub seq: Option<u64>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub progress_mode: Option<String>,
    #[serde(default)]
    pub progress_block_streaming: Option<bool>,
    #[serde(default)]
    pub progress_block_window_ms: Option<u64>,
    #[serde(default)]
    pub progress_block_max_chars: Option<usize>,
}

/// A validated event.
#[derive(Debug, Clone)]
pub struct AgentEvent {
    pub project_name: String,
    pub agent_type: AgentType,
    pub instance_id: Option<String>,
    pub kind: EventKind,
    pub text: String,
    pub turn_text: Option<String>,
    pub turn_id: Option<String>,
    pub event_id: Option<String>,
    pub seq: Option<u64>,
    pub source: Option<String>,
    pub progress_mode_override: Option<ProgressMode>,
    pub progress_block_streaming: Option<bool>,
    pub progress_block_window_ms: Option<u64>,
    pub progress_block_max_chars: Option<usize>,
}

impl AgentEventPayload {
    /// Validate the wire shape. Events without an agent type default to
    /// claude, matching what the stock agent hooks emit.
    pub fn validate(self) -> Result<AgentEvent, EventError> {
        if self.project_name.trim().is_empty() {
            return Err(EventError::MissingField("projectName"));
        }
        let kind = EventKind::parse(&self.event_type)
            .ok_or_else(|| EventError::UnknownType(self.event_type.clone()))?;
        let agent_type = match self.agent_type.as_deref() {
            None | Some("") => AgentType::Claude,
            Some(tag) => {
                AgentType::parse(tag).ok_or_else(|| EventError::UnknownType(tag.to_string()))?
            }
        };
        let progress_mode_override = match self.progress_mode.as_deref() {
            None | Some("") => None,
            Some(mode) => Some(
                ProgressMode::parse(mode)
                    .ok_or_else(|| EventError::UnknownType(mode.to_string()))?,
            ),
        };
        Ok(AgentEvent {
            project_name: self.project_name,
            agent_type,
            instance_id: self.instance_id.filter(|id| !id.is_empty()),
            kind,
            text: self.text.unwrap_or_default(),
            turn_text: self.turn_text.filter(|text| !text.is_empty()),
            turn_id: self.turn_id.filter(|id| !id.is_empty()),
            event_id: self.event_id.filter(|id| !id.is_empty()),
            seq: self.seq,
            source: self.source.filter(|source| !source.is_empty()),
            progress_mode_override,
            progress_block_streaming: self.progress_block_streaming,
            progress_block_window_ms: self.progress_block_window_ms,
            progress_block_max_chars: self.progress_block_max_chars,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(json: serde_json::Value) -> AgentEventPayload {
        serde_json::from_value(json).expect("payload should deserialize")
    }

    #[test]
    fn minimal_final_event_validates() {
        let event = payload(serde_json::json!({
            "projectName": "demo",
            "agentType": "codex",
            "type": "session.final",
            "text": "done",
            "turnId": "t1",
        }))
        .validate()
        .expect("valid event");

        assert_eq!(event.kind, EventKind::Final);
        assert_eq!(event.agent_type, AgentType::Codex);
        assert_eq!(event.text, "done");
        assert_eq!(event.turn_id.as_deref(), Some("t1"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let result = payload(serde_json::json!({
            "projectName": "demo",
            "type": "session.bogus",
        }))
        .validate();
        assert!(matches!(result, Err(EventError::UnknownType(_))));
    }

    #[test]
    fn missing_project_is_rejected() {
        let result = payload(serde_json::json!({
            "projectName": "",
            "type": "session.start",
        }))
        .validate();
        assert!(matches!(result, Err(EventError::MissingField(_))));
    }

    #[test]
    fn agent_type_defaults_to_claude() {
        let event = payload(serde_json::json!({
            "projectName": "demo",
            "type": "session.start",
        }))
        .validate()
        .expect("valid event");
        assert_eq!(event.agent_type, AgentType::Claude);
    }

    #[test]
    fn progress_mode_override_parses() {
        let event = payload(serde_json::json!({
            "projectName": "demo",
            "type": "session.progress",
            "text": "step",
            "progressMode": "thread",
        }))
        .validate()
        .expect("valid event");
        assert_eq!(event.progress_mode_override, Some(ProgressMode::Thread));
    }
}
