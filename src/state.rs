//! Project/instance state model and the `StateStore` port.

pub mod store;

pub use store::FileStateStore;

use crate::error::Result;
use crate::AgentType;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// A named collection of agent instances sharing one tmux session and one
/// filesystem path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    /// Filesystem path agents run in; `/send-files` validation is rooted here.
    pub path: PathBuf,
    /// tmux session the project's windows live in.
    pub mux_session: String,
    #[serde(default)]
    pub instances: BTreeMap<String, Instance>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub last_active: chrono::DateTime<chrono::Utc>,
}

impl Project {
    /// The primary instance for an agent type: the one flagged primary, or
    /// the first instance of that type in id order.
    pub fn primary_for(&self, agent_type: AgentType) -> Option<(&str, &Instance)> {
        let mut fallback = None;
        for (id, instance) in &self.instances {
            if instance.agent_type != agent_type {
                continue;
            }
            if instance.primary {
                return Some((id.as_str(), instance));
            }
            if fallback.is_none() {
                fallback = Some((id.as_str(), instance));
            }
        }
        fallback
    }

    /// Find the instance bound to a channel id.
    pub fn instance_for_channel(&self, channel_id: &str) -> Option<(&str, &Instance)> {
        self.instances
            .iter()
            .find(|(_, instance)| instance.channel_id.as_deref() == Some(channel_id))
            .map(|(id, instance)| (id.as_str(), instance))
    }
}

/// A single agent process attached to one tmux window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub agent_type: AgentType,
    /// tmux window name. Never empty.
    pub window: String,
    /// Default channel replies go to when no pending turn says otherwise.
    #[serde(default)]
    pub channel_id: Option<String>,
    /// true = output arrives as `session.*` events; false = the capture
    /// poller scrapes the pane.
    #[serde(default)]
    pub event_hook: bool,
    /// Preferred target when routing falls through to the agent type.
    #[serde(default)]
    pub primary: bool,
}

/// Read/write access to persisted projects and the channel→instance mapping.
///
/// Implementations must be safe for concurrent calls; reads are snapshots
/// and never observe a half-applied mutation.
pub trait StateStore: Send + Sync + 'static {
    /// All projects, by name.
    fn projects(&self) -> BTreeMap<String, Project>;

    fn project(&self, name: &str) -> Option<Project>;

    fn instance(&self, project: &str, instance_id: &str) -> Option<Instance>;

    /// Resolve a channel id to `(project, instance_id)` via the channel
    /// mapping.
    fn route_for_channel(&self, channel_id: &str) -> Option<(String, String)>;

    /// Bind a channel to an instance. Rebinding an existing channel replaces
    /// the old entry.
    fn bind_channel(&self, channel_id: &str, project: &str, instance_id: &str) -> Result<()>;

    /// Remove an instance; a project left with zero instances is removed too.
    fn remove_instance(&self, project: &str, instance_id: &str) -> Result<()>;

    /// Update the project's last-active timestamp.
    fn touch_project(&self, project: &str) -> Result<()>;

    /// Atomically re-read persisted state, replacing the in-memory snapshot.
    fn reload(&self) -> Result<()>;
}
