//! In-memory fakes for the bridge's ports, shared by unit tests.

use crate::error::{MessagingError, MuxError, Result};
use crate::messaging::traits::{InboundStream, MessagingClient};
use crate::mux::{Key, Multiplexer, SendOutcome, chunk_payload};
use crate::state::{Instance, Project, StateStore};
use crate::{AgentType, Platform};

use async_trait::async_trait;
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex};

/// Everything a `FakeMessaging` was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessagingCall {
    Send { channel_id: String, text: String },
    SendLong { channel_id: String, summary: String, text: String },
    AddReaction { channel_id: String, message_id: String, emoji: String },
    RemoveReaction { channel_id: String, message_id: String, emoji: String },
    StartTyping { channel_id: String },
    StopTyping { channel_id: String },
    CreateThread { channel_id: String, name: String },
    RenameChannel { channel_id: String, name: String },
    DeleteChannel { channel_id: String },
}

/// Recording messaging fake.
pub struct FakeMessaging {
    platform: Platform,
    pub calls: Mutex<Vec<MessagingCall>>,
    /// When set, every platform call fails.
    pub fail: Mutex<bool>,
}

impl FakeMessaging {
    pub fn new(platform: Platform) -> Arc<Self> {
        Arc::new(Self {
            platform,
            calls: Mutex::new(Vec::new()),
            fail: Mutex::new(false),
        })
    }

    pub fn discord() -> Arc<Self> {
        Self::new(Platform::Discord)
    }

    pub fn calls(&self) -> Vec<MessagingCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn sent_texts(&self) -> Vec<(String, String)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                MessagingCall::Send { channel_id, text } => Some((channel_id, text)),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: MessagingCall) -> Result<()> {
        if *self.fail.lock().expect("fail lock") {
            return Err(MessagingError::PlatformRequest("fake failure".into()).into());
        }
        self.calls.lock().expect("calls lock").push(call);
        Ok(())
    }
}

impl MessagingClient for FakeMessaging {
    fn platform(&self) -> Platform {
        self.platform
    }

    fn max_message_len(&self) -> usize {
        2000
    }

    fn supports_threads(&self) -> bool {
        self.platform == Platform::Discord
    }

    async fn start(&self) -> Result<InboundStream> {
        Ok(Box::pin(futures::stream::empty()))
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<()> {
        self.record(MessagingCall::Send {
            channel_id: channel_id.to_string(),
            text: text.to_string(),
        })
    }

    async fn send_long(&self, channel_id: &str, summary: &str, text: &str) -> Result<()> {
        self.record(MessagingCall::SendLong {
            channel_id: channel_id.to_string(),
            summary: summary.to_string(),
            text: text.to_string(),
        })
    }

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        self.record(MessagingCall::AddReaction {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
        })
    }

    async fn remove_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        self.record(MessagingCall::RemoveReaction {
            channel_id: channel_id.to_string(),
            message_id: message_id.to_string(),
            emoji: emoji.to_string(),
        })
    }

    async fn start_typing(&self, channel_id: &str) -> Result<()> {
        self.record(MessagingCall::StartTyping {
            channel_id: channel_id.to_string(),
        })
    }

    async fn stop_typing(&self, channel_id: &str) -> Result<()> {
        self.record(MessagingCall::StopTyping {
            channel_id: channel_id.to_string(),
        })
    }

    async fn create_thread(
        &self,
        channel_id: &str,
        _source_message_id: Option<&str>,
        name: &str,
    ) -> Result<String> {
        self.record(MessagingCall::CreateThread {
            channel_id: channel_id.to_string(),
            name: name.to_string(),
        })?;
        Ok(format!("thread-of-{channel_id}"))
    }

    async fn channel_name(&self, channel_id: &str) -> Result<String> {
        Ok(format!("name-of-{channel_id}"))
    }

    async fn rename_channel(&self, channel_id: &str, name: &str) -> Result<()> {
        self.record(MessagingCall::RenameChannel {
            channel_id: channel_id.to_string(),
            name: name.to_string(),
        })
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        self.record(MessagingCall::DeleteChannel {
            channel_id: channel_id.to_string(),
        })
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Everything a `FakeMux` was asked to do, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxCall {
    SendText { target: String, text: String },
    SendKey { target: String, key: &'static str },
    SendLine { target: String, text: String },
    Capture { target: String },
    KillWindow { target: String },
}

/// Scriptable multiplexer fake.
pub struct FakeMux {
    pub calls: Mutex<Vec<MuxCall>>,
    /// Queue of capture outputs; the last one repeats when drained.
    pub captures: Mutex<VecDeque<String>>,
    pub foreground: Mutex<String>,
    /// When set, every call fails with a pane-missing error.
    pub pane_missing: Mutex<bool>,
    pub chunk_size: usize,
}

impl FakeMux {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            captures: Mutex::new(VecDeque::new()),
            foreground: Mutex::new("codex".to_string()),
            pane_missing: Mutex::new(false),
            chunk_size: 2000,
        })
    }

    pub fn push_capture(&self, snapshot: impl Into<String>) {
        self.captures
            .lock()
            .expect("captures lock")
            .push_back(snapshot.into());
    }

    pub fn set_foreground(&self, command: impl Into<String>) {
        *self.foreground.lock().expect("foreground lock") = command.into();
    }

    pub fn calls(&self) -> Vec<MuxCall> {
        self.calls.lock().expect("calls lock").clone()
    }

    fn check(&self, target: &str) -> Result<()> {
        if *self.pane_missing.lock().expect("pane lock") {
            return Err(MuxError::PaneMissing {
                target: target.to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn record(&self, call: MuxCall) {
        self.calls.lock().expect("calls lock").push(call);
    }
}

#[async_trait]
impl Multiplexer for FakeMux {
    async fn send_text(&self, session: &str, window: &str, text: &str) -> Result<SendOutcome> {
        let target = format!("{session}:{window}");
        self.check(&target)?;
        let chunks = chunk_payload(text, self.chunk_size).len();
        self.record(MuxCall::SendText {
            target,
            text: text.to_string(),
        });
        Ok(SendOutcome { chunks })
    }

    async fn send_key(&self, session: &str, window: &str, key: Key) -> Result<()> {
        let target = format!("{session}:{window}");
        self.check(&target)?;
        self.record(MuxCall::SendKey {
            target,
            key: key.as_str(),
        });
        Ok(())
    }

    async fn send_line(&self, session: &str, window: &str, text: &str) -> Result<()> {
        let target = format!("{session}:{window}");
        self.check(&target)?;
        self.record(MuxCall::SendLine {
            target,
            text: text.to_string(),
        });
        Ok(())
    }

    async fn capture_pane(&self, session: &str, window: &str) -> Result<String> {
        let target = format!("{session}:{window}");
        self.check(&target)?;
        self.record(MuxCall::Capture {
            target: target.clone(),
        });
        let mut captures = self.captures.lock().expect("captures lock");
        if captures.len() > 1 {
            Ok(captures.pop_front().expect("non-empty"))
        } else {
            captures.front().cloned().ok_or_else(|| {
                MuxError::CommandFailed {
                    status: "exit status: 1".into(),
                    stderr: "no capture scripted".into(),
                }
                .into()
            })
        }
    }

    async fn foreground_command(&self, session: &str, window: &str) -> Result<String> {
        self.check(&format!("{session}:{window}"))?;
        Ok(self.foreground.lock().expect("foreground lock").clone())
    }

    async fn kill_window(&self, session: &str, window: &str) -> Result<()> {
        let target = format!("{session}:{window}");
        self.check(&target)?;
        self.record(MuxCall::KillWindow { target });
        Ok(())
    }
}

/// In-memory `StateStore`.
pub struct MemoryStateStore {
    projects: Mutex<BTreeMap<String, Project>>,
    channels: Mutex<BTreeMap<String, (String, String)>>,
}

impl MemoryStateStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            projects: Mutex::new(BTreeMap::new()),
            channels: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn with_project(self: Arc<Self>, name: &str, project: Project) -> Arc<Self> {
        self.projects
            .lock()
            .expect("projects lock")
            .insert(name.to_string(), project);
        self
    }

    pub fn insert_project(&self, name: &str, project: Project) {
        self.projects
            .lock()
            .expect("projects lock")
            .insert(name.to_string(), project);
    }
}

/// Build a project with the given instances for tests.
pub fn project_with(path: &str, instances: &[(&str, AgentType, Option<&str>, bool)]) -> Project {
    let mut map = BTreeMap::new();
    for (id, agent_type, channel, event_hook) in instances {
        map.insert(
            id.to_string(),
            Instance {
                agent_type: *agent_type,
                window: id.to_string(),
                channel_id: channel.map(str::to_string),
                event_hook: *event_hook,
                primary: false,
            },
        );
    }
    Project {
        path: path.into(),
        mux_session: "muxbot-test".into(),
        instances: map,
        created_at: chrono::Utc::now(),
        last_active: chrono::Utc::now(),
    }
}

impl StateStore for MemoryStateStore {
    fn projects(&self) -> BTreeMap<String, Project> {
        self.projects.lock().expect("projects lock").clone()
    }

    fn project(&self, name: &str) -> Option<Project> {
        self.projects.lock().expect("projects lock").get(name).cloned()
    }

    fn instance(&self, project: &str, instance_id: &str) -> Option<Instance> {
        self.projects
            .lock()
            .expect("projects lock")
            .get(project)?
            .instances
            .get(instance_id)
            .cloned()
    }

    fn route_for_channel(&self, channel_id: &str) -> Option<(String, String)> {
        if let Some(route) = self
            .channels
            .lock()
            .expect("channels lock")
            .get(channel_id)
            .cloned()
        {
            return Some(route);
        }
        for (name, project) in self.projects.lock().expect("projects lock").iter() {
            if let Some((instance_id, _)) = project.instance_for_channel(channel_id) {
                return Some((name.clone(), instance_id.to_string()));
            }
        }
        None
    }

    fn bind_channel(&self, channel_id: &str, project: &str, instance_id: &str) -> Result<()> {
        self.channels.lock().expect("channels lock").insert(
            channel_id.to_string(),
            (project.to_string(), instance_id.to_string()),
        );
        Ok(())
    }

    fn remove_instance(&self, project: &str, instance_id: &str) -> Result<()> {
        let mut projects = self.projects.lock().expect("projects lock");
        if let Some(entry) = projects.get_mut(project) {
            entry.instances.remove(instance_id);
            if entry.instances.is_empty() {
                projects.remove(project);
            }
        }
        Ok(())
    }

    fn touch_project(&self, project: &str) -> Result<()> {
        if let Some(entry) = self.projects.lock().expect("projects lock").get_mut(project) {
            entry.last_active = chrono::Utc::now();
        }
        Ok(())
    }

    fn reload(&self) -> Result<()> {
        Ok(())
    }
}
