//! Inbound message router: command vocabulary, prompt transforms, dispatch.

use crate::capture::clean_capture;
use crate::config::{CaptureConfig, DispatchConfig};
use crate::error::{Error, Result};
use crate::messaging::MessagingClientDyn;
use crate::mux::{Key, Multiplexer, is_shell_command};
use crate::pending::{PendingTracker, ResolveTarget, prompt_tail};
use crate::prompt::transform_codex_prompt;
use crate::routing::{ResolvedRoute, RouteContext, RouteMemory, RouteQuery, RouteResolver};
use crate::state::{Instance, Project, StateStore};
use crate::{AgentType, ChatMessage, InstanceKey};

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

const NO_ROUTE_REPLY: &str = "No agent instance is bound to this channel. Attach one with \
`muxbot attach <project> <instance>` or post in an instance channel.";

const CODEX_RELAUNCH_REPLY: &str = "The pane was sitting at a shell, so I relaunched `codex`. \
Resend your message once it is back up.";

const DISPATCH_FAILED_REPLY: &str = "⚠️ I couldn't deliver that to the agent pane. Check the \
tmux session and try again.";

/// Minimum normalized length before a pane tail line counts as prompt echo
/// during the re-enter verification capture.
const REENTER_ECHO_MIN_CHARS: usize = 8;

/// Everything the router recognizes before treating text as a prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedCommand {
    /// `/q` (delete channel) or `/qw` (save channel).
    Quit { save: bool },
    /// `/enter`, `/tab`, `/esc`, `/up`, `/down`, with an optional 1–20 count.
    Keys { key: Key, count: u8 },
    /// Retired `!enter`-style form; points at the slash replacement.
    LegacyKeys { slash_form: &'static str },
    Retry,
    Health,
    Snapshot { lines: Option<usize> },
    IoStatus,
    Doctor { fix: bool },
    Update { git: bool },
    DaemonRestart,
    Prompt,
}

/// Parse the command vocabulary. Anything that does not exactly match a
/// command shape is a prompt.
pub fn parse_command(text: &str) -> ParsedCommand {
    let trimmed = text.trim();
    let mut parts = trimmed.split_whitespace();
    let Some(head) = parts.next() else {
        return ParsedCommand::Prompt;
    };
    let rest: Vec<&str> = parts.collect();

    let key_for = |head: &str| match head {
        "/enter" => Some(Key::Enter),
        "/tab" => Some(Key::Tab),
        "/esc" => Some(Key::Escape),
        "/up" => Some(Key::Up),
        "/down" => Some(Key::Down),
        _ => None,
    };

    match head {
        "/q" if rest.is_empty() => ParsedCommand::Quit { save: false },
        "/qw" if rest.is_empty() => ParsedCommand::Quit { save: true },
        "/enter" | "/tab" | "/esc" | "/up" | "/down" => {
            let key = key_for(head).expect("matched above");
            match rest.as_slice() {
                [] => ParsedCommand::Keys { key, count: 1 },
                [count] => match count.parse::<u8>() {
                    Ok(n @ 1..=20) => ParsedCommand::Keys { key, count: n },
                    _ => ParsedCommand::Prompt,
                },
                _ => ParsedCommand::Prompt,
            }
        }
        "!enter" => ParsedCommand::LegacyKeys { slash_form: "/enter" },
        "!tab" => ParsedCommand::LegacyKeys { slash_form: "/tab" },
        "!esc" => ParsedCommand::LegacyKeys { slash_form: "/esc" },
        "!up" => ParsedCommand::LegacyKeys { slash_form: "/up" },
        "!down" => ParsedCommand::LegacyKeys { slash_form: "/down" },
        "/retry" if rest.is_empty() => ParsedCommand::Retry,
        "/health" if rest.is_empty() => ParsedCommand::Health,
        "/snapshot" => match rest.as_slice() {
            [] => ParsedCommand::Snapshot { lines: None },
            [count] => match count.parse::<usize>() {
                Ok(n) if n > 0 => ParsedCommand::Snapshot { lines: Some(n) },
                _ => ParsedCommand::Prompt,
            },
            _ => ParsedCommand::Prompt,
        },
        "/io" if rest.is_empty() => ParsedCommand::IoStatus,
        "/doctor" => match rest.as_slice() {
            [] => ParsedCommand::Doctor { fix: false },
            ["fix"] => ParsedCommand::Doctor { fix: true },
            _ => ParsedCommand::Prompt,
        },
        "/update" => match rest.as_slice() {
            [] => ParsedCommand::Update { git: false },
            ["git"] => ParsedCommand::Update { git: true },
            _ => ParsedCommand::Prompt,
        },
        "/daemon-restart" if rest.is_empty() => ParsedCommand::DaemonRestart,
        _ => ParsedCommand::Prompt,
    }
}

enum DispatchOutcome {
    Dispatched,
    /// The codex pane was sitting at a shell; `codex` was relaunched instead.
    CodexAtShell,
}

/// Per-instance dispatch counters behind `/io`.
#[derive(Debug, Default, Clone)]
pub struct IoStats {
    pub dispatched: u64,
    pub last_dispatch_at: Option<chrono::DateTime<chrono::Utc>>,
}

struct RoutedTarget {
    resolved: ResolvedRoute,
    context: RouteContext,
    project: Project,
    instance: Instance,
}

/// Routes inbound chat messages to agent panes.
pub struct MessageRouter {
    mux: Arc<dyn Multiplexer>,
    messaging: Arc<dyn MessagingClientDyn>,
    tracker: Arc<PendingTracker>,
    resolver: Arc<RouteResolver>,
    memory: Arc<RouteMemory>,
    store: Arc<dyn StateStore>,
    dispatch: DispatchConfig,
    capture: CaptureConfig,
    started_at: Instant,
    io: Mutex<HashMap<InstanceKey, IoStats>>,
}

impl MessageRouter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        messaging: Arc<dyn MessagingClientDyn>,
        tracker: Arc<PendingTracker>,
        resolver: Arc<RouteResolver>,
        memory: Arc<RouteMemory>,
        store: Arc<dyn StateStore>,
        dispatch: DispatchConfig,
        capture: CaptureConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            mux,
            messaging,
            tracker,
            resolver,
            memory,
            store,
            dispatch,
            capture,
            started_at: Instant::now(),
            io: Mutex::new(HashMap::new()),
        })
    }

    /// Handle one inbound message end to end.
    pub async fn handle(&self, message: &ChatMessage) {
        if message.text.trim().is_empty() && message.attachments.is_empty() {
            return;
        }

        match parse_command(&message.text) {
            ParsedCommand::Prompt => {
                let text = message.text.trim().to_string();
                self.handle_prompt(message, &text).await;
            }
            ParsedCommand::Retry => self.handle_retry(message).await,
            ParsedCommand::Quit { save } => self.handle_quit(message, save).await,
            ParsedCommand::Keys { key, count } => self.handle_keys(message, key, count).await,
            ParsedCommand::LegacyKeys { slash_form } => {
                self.reply(
                    message,
                    &format!("Bang commands are retired — use `{slash_form}` instead."),
                )
                .await;
            }
            ParsedCommand::Health => self.handle_health(message).await,
            ParsedCommand::Snapshot { lines } => self.handle_snapshot(message, lines).await,
            ParsedCommand::IoStatus => self.handle_io(message).await,
            ParsedCommand::Doctor { fix } => {
                self.handle_maintenance(message, "doctor", fix.then_some("fix"))
                    .await;
            }
            ParsedCommand::Update { git } => {
                self.handle_maintenance(message, "update", git.then_some("git"))
                    .await;
            }
            ParsedCommand::DaemonRestart => {
                self.handle_maintenance(message, "restart", None).await;
            }
        }
    }

    /// Resolve which instance owns this message.
    fn resolve_for(&self, message: &ChatMessage) -> Option<RoutedTarget> {
        let mapped = self.store.route_for_channel(&message.channel_id);
        let (project_name, mapped_instance_id, agent_type) = match &mapped {
            Some((project, instance_id)) => {
                let agent_type = self
                    .store
                    .instance(project, instance_id)
                    .map(|instance| instance.agent_type)
                    .unwrap_or(AgentType::Claude);
                (project.clone(), Some(instance_id.clone()), agent_type)
            }
            None => (String::new(), None, AgentType::Claude),
        };

        let context = RouteContext {
            reply_to_message_id: message.reply_to_message_id.clone(),
            conversation_key: message.conversation_key.clone(),
            thread_id: message.thread_id.clone(),
            route_channel_id: Some(message.channel_id.clone()),
        };
        let query = RouteQuery {
            agent_type,
            project_name,
            channel_id: message.channel_id.clone(),
            message_id: Some(message.id.clone()),
            mapped_instance_id,
            context: context.clone(),
        };

        let resolved = self.resolver.resolve(&query)?;
        let project = self.store.project(&resolved.route.project)?;
        let instance = project.instances.get(&resolved.route.instance_id).cloned()?;
        Some(RoutedTarget {
            resolved,
            context,
            project,
            instance,
        })
    }

    async fn handle_prompt(&self, message: &ChatMessage, prompt_text: &str) {
        let Some(target) = self.resolve_for(message) else {
            self.reply(message, NO_ROUTE_REPLY).await;
            return;
        };
        let route = target.resolved.route.clone();
        let agent = route.agent_type;
        let key = target.resolved.key();

        self.tracker
            .mark_pending(
                &route.project,
                agent,
                Some(&route.instance_id),
                &message.channel_id,
                &message.id,
                Some(prompt_text),
            )
            .await;
        self.tracker
            .mark_route_resolved(
                &route.project,
                agent,
                Some(&route.instance_id),
                target.resolved.hint(&target.context),
            )
            .await;
        if message.has_attachments() {
            self.tracker
                .mark_has_attachments(&route.project, agent, Some(&route.instance_id))
                .await;
        }

        let prompt = if agent == AgentType::Codex {
            transform_codex_prompt(prompt_text, &target.project.path)
        } else {
            prompt_text.to_string()
        };

        self.tracker
            .mark_dispatching(&route.project, agent, Some(&route.instance_id))
            .await;

        let outcome = self
            .dispatch_prompt(
                &target.project.mux_session,
                &target.instance.window,
                agent,
                &prompt,
            )
            .await;

        match outcome {
            Ok(DispatchOutcome::Dispatched) => {
                self.memory.remember_message(&message.id, route.clone());
                if let Some(conversation_key) = &message.conversation_key {
                    self.memory.remember_conversation(conversation_key, route.clone());
                }
                self.memory.remember_prompt(&key, prompt_text);
                if let Err(error) = self.store.touch_project(&route.project) {
                    tracing::warn!(%error, project = %route.project, "failed to touch project");
                }
                let mut io = self.io.lock().expect("io stats");
                let stats = io.entry(key).or_default();
                stats.dispatched += 1;
                stats.last_dispatch_at = Some(chrono::Utc::now());
            }
            Ok(DispatchOutcome::CodexAtShell) => {
                self.tracker
                    .mark_retry(
                        &route.project,
                        agent,
                        Some(&route.instance_id),
                        ResolveTarget::Tail,
                    )
                    .await;
                self.reply(message, CODEX_RELAUNCH_REPLY).await;
            }
            Err(error) => {
                tracing::warn!(%error, %key, "dispatch failed");
                self.tracker
                    .mark_error_by_message_id(
                        &route.project,
                        agent,
                        Some(&route.instance_id),
                        &message.id,
                    )
                    .await;
                if is_pane_missing(&error) {
                    self.reply(
                        message,
                        &format!(
                            "⚠️ The pane for `{key}` is gone. Run `muxbot attach {} {}` to \
                             restart it, then resend your message.",
                            route.project, route.instance_id
                        ),
                    )
                    .await;
                } else {
                    self.reply(message, DISPATCH_FAILED_REPLY).await;
                }
            }
        }
    }

    async fn dispatch_prompt(
        &self,
        session: &str,
        window: &str,
        agent: AgentType,
        prompt: &str,
    ) -> Result<DispatchOutcome> {
        match agent {
            AgentType::Opencode => {
                self.mux.send_text(session, window, prompt).await?;
                tokio::time::sleep(self.dispatch.opencode_submit_delay).await;
                self.mux.send_key(session, window, Key::Enter).await?;
                Ok(DispatchOutcome::Dispatched)
            }
            AgentType::Codex => {
                let foreground = self.mux.foreground_command(session, window).await?;
                if is_shell_command(&foreground) {
                    self.mux.send_text(session, window, "codex").await?;
                    self.mux.send_key(session, window, Key::Enter).await?;
                    return Ok(DispatchOutcome::CodexAtShell);
                }

                let sent = self.mux.send_text(session, window, prompt).await?;
                tokio::time::sleep(self.dispatch.codex_submit_delay).await;
                self.mux.send_key(session, window, Key::Enter).await?;

                // Long prompts sometimes swallow the first Enter while the
                // composer is still laying out pasted text.
                let needs_reenter = prompt.chars().count()
                    >= self.dispatch.codex_long_prompt_reenter_threshold
                    || sent.chunks >= 2
                    || self.echo_still_at_tail(session, window, prompt).await;
                if needs_reenter {
                    tokio::time::sleep(self.dispatch.codex_long_prompt_reenter_delay).await;
                    self.mux.send_key(session, window, Key::Enter).await?;
                }
                Ok(DispatchOutcome::Dispatched)
            }
            AgentType::Claude | AgentType::Gemini => {
                self.mux.send_line(session, window, prompt).await?;
                Ok(DispatchOutcome::Dispatched)
            }
        }
    }

    /// Verification capture: does the pane still end with the prompt text?
    async fn echo_still_at_tail(&self, session: &str, window: &str, prompt: &str) -> bool {
        let Ok(raw) = self.mux.capture_pane(session, window).await else {
            return false;
        };
        let cleaned = clean_capture(&raw);
        let Some(last) = cleaned.lines().rev().find(|line| !line.trim().is_empty()) else {
            return false;
        };
        let line = last.split_whitespace().collect::<Vec<_>>().join(" ");
        line.chars().count() >= REENTER_ECHO_MIN_CHARS && prompt_tail(prompt).contains(&line)
    }

    async fn handle_retry(&self, message: &ChatMessage) {
        let Some(target) = self.resolve_for(message) else {
            self.reply(message, NO_ROUTE_REPLY).await;
            return;
        };
        let key = target.resolved.key();
        match self.memory.last_prompt(&key) {
            Some(prompt) => self.handle_prompt(message, &prompt).await,
            None => {
                self.reply(message, "No remembered prompt for this instance yet.")
                    .await;
            }
        }
    }

    async fn handle_keys(&self, message: &ChatMessage, key: Key, count: u8) {
        let Some(target) = self.resolve_for(message) else {
            self.reply(message, NO_ROUTE_REPLY).await;
            return;
        };
        if let Err(error) = self
            .mux
            .send_key_times(
                &target.project.mux_session,
                &target.instance.window,
                key,
                count,
            )
            .await
        {
            tracing::warn!(%error, "key injection failed");
            self.reply(message, DISPATCH_FAILED_REPLY).await;
        }
    }

    async fn handle_quit(&self, message: &ChatMessage, save: bool) {
        let Some(target) = self.resolve_for(message) else {
            self.reply(message, NO_ROUTE_REPLY).await;
            return;
        };
        let route = &target.resolved.route;
        let action = if save { "saving" } else { "removing" };
        self.reply(
            message,
            &format!("Stopping `{}` and {action} this channel.", route.instance_id),
        )
        .await;

        self.tracker
            .clear_instance(&route.project, route.agent_type, Some(&route.instance_id))
            .await;

        if let Err(error) = self
            .mux
            .kill_window(&target.project.mux_session, &target.instance.window)
            .await
        {
            // The window may already be gone; state cleanup still proceeds.
            tracing::warn!(%error, "kill-window failed");
        }
        if let Err(error) = self
            .store
            .remove_instance(&route.project, &route.instance_id)
        {
            tracing::warn!(%error, "failed to remove instance from state");
        }

        if save {
            let old_name = self
                .messaging
                .channel_name(&message.channel_id)
                .await
                .unwrap_or_else(|_| route.instance_id.clone());
            let stamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
            let new_name = format!("saved_{stamp}_{old_name}");
            if let Err(error) = self
                .messaging
                .rename_channel(&message.channel_id, &new_name)
                .await
            {
                tracing::warn!(%error, "failed to rename channel");
            }
        } else if let Err(error) = self.messaging.delete_channel(&message.channel_id).await {
            tracing::warn!(%error, "failed to delete channel");
        }
    }

    async fn handle_health(&self, message: &ChatMessage) {
        let uptime = self.started_at.elapsed();
        let mut lines = vec![format!(
            "muxbot v{} — up {}",
            env!("CARGO_PKG_VERSION"),
            format_duration(uptime)
        )];

        let snapshot = self.tracker.runtime_snapshot();
        for (name, project) in self.store.projects() {
            for (instance_id, instance) in &project.instances {
                let depth = snapshot
                    .iter()
                    .find(|entry| entry.project == name && entry.instance_id == *instance_id)
                    .map(|entry| entry.pending_depth)
                    .unwrap_or(0);
                let source = if instance.event_hook { "events" } else { "capture" };
                lines.push(format!(
                    "• {name}/{instance_id} ({}, {source}) — {depth} pending",
                    instance.agent_type
                ));
            }
        }

        match crate::update::check_latest().await {
            Ok(check) if check.update_available() => {
                lines.push(format!(
                    "Update available: v{} → v{}",
                    check.current, check.latest
                ));
            }
            Ok(check) => lines.push(format!("Up to date (v{})", check.current)),
            Err(error) => {
                tracing::debug!(%error, "update check failed");
                lines.push("Update check unavailable".to_string());
            }
        }

        self.reply(message, &lines.join("\n")).await;
    }

    async fn handle_snapshot(&self, message: &ChatMessage, lines: Option<usize>) {
        let Some(target) = self.resolve_for(message) else {
            self.reply(message, NO_ROUTE_REPLY).await;
            return;
        };
        let raw = match self
            .mux
            .capture_pane(&target.project.mux_session, &target.instance.window)
            .await
        {
            Ok(raw) => raw,
            Err(error) => {
                tracing::warn!(%error, "snapshot capture failed");
                self.reply(message, DISPATCH_FAILED_REPLY).await;
                return;
            }
        };
        let cleaned = clean_capture(&raw);
        let wanted = lines
            .unwrap_or(self.capture.snapshot_default_lines)
            .min(self.capture.snapshot_max_lines);
        let all: Vec<&str> = cleaned.lines().collect();
        let start = all.len().saturating_sub(wanted);
        let tail = all[start..].join("\n");
        self.reply(message, &format!("```\n{tail}\n```")).await;
    }

    async fn handle_io(&self, message: &ChatMessage) {
        let io = self.io.lock().expect("io stats").clone();
        if io.is_empty() {
            self.reply(message, "No prompts dispatched yet.").await;
            return;
        }
        let mut lines = Vec::new();
        let mut entries: Vec<(&InstanceKey, &IoStats)> = io.iter().collect();
        entries.sort_by_key(|(key, _)| (*key).clone());
        for (key, stats) in entries {
            let depth = self.tracker.pending_depth(key);
            let last = stats
                .last_dispatch_at
                .map(|at| at.format("%H:%M:%S").to_string())
                .unwrap_or_else(|| "never".to_string());
            lines.push(format!(
                "• {key} — {} dispatched, last {last}, {depth} pending",
                stats.dispatched
            ));
        }
        self.reply(message, &lines.join("\n")).await;
    }

    /// Maintenance commands acknowledge first, then hand off to an external
    /// process. The daemon never awaits it.
    async fn handle_maintenance(&self, message: &ChatMessage, command: &str, arg: Option<&str>) {
        self.reply(message, &format!("Running `{command}`…")).await;

        let mut args = vec![command.to_string()];
        if let Some(arg) = arg {
            args.push(arg.to_string());
        }
        tokio::spawn(async move {
            // Give the acknowledgement a moment to reach the user.
            tokio::time::sleep(Duration::from_millis(350)).await;
            let exe = match std::env::current_exe() {
                Ok(exe) => exe,
                Err(error) => {
                    tracing::warn!(%error, "cannot locate own binary for maintenance");
                    return;
                }
            };
            match std::process::Command::new(exe).args(&args).spawn() {
                Ok(_child) => {}
                Err(error) => tracing::warn!(%error, ?args, "failed to spawn maintenance command"),
            }
        });
    }

    /// `/io` snapshot for other components.
    pub fn io_stats(&self, key: &InstanceKey) -> Option<IoStats> {
        self.io.lock().expect("io stats").get(key).cloned()
    }

    async fn reply(&self, message: &ChatMessage, text: &str) {
        if let Err(error) = self.messaging.send(&message.channel_id, text).await {
            tracing::warn!(%error, channel = %message.channel_id, "reply failed");
        }
    }
}

fn is_pane_missing(error: &Error) -> bool {
    matches!(error, Error::Mux(mux_error) if mux_error.is_pane_missing())
}

fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    if secs >= 3600 {
        format!("{}h{:02}m", secs / 3600, (secs % 3600) / 60)
    } else if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
