//! Per-instance FIFO tracking of in-flight turns.
//!
//! Every user message becomes a pending turn owned by this tracker until the
//! capture poller or hook server resolves it. The tracker drives the visible
//! status surface: one status reaction per turn, a typing indicator while the
//! agent works, and a stuck alert when nothing resolves in time.
//!
//! Mutations for one instance run on a dedicated worker task, so reaction
//! updates are observed in FIFO order even when an operation awaits the chat
//! platform mid-flight. Unrelated instances never serialize against each
//! other.

use crate::config::PendingConfig;
use crate::error::Result;
use crate::messaging::MessagingClientDyn;
use crate::{AgentType, InstanceKey, Platform, RouteHint};

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Cap on remembered terminal snapshots across all instances.
const TERMINAL_MEMORY_CAP: usize = 4000;

/// Prompt tails keep this many characters after whitespace collapse.
const PROMPT_TAIL_CHARS: usize = 240;

/// Stage of a pending turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStage {
    Received,
    Routed,
    Processing,
    Completed,
    Error,
    Retry,
}

impl TurnStage {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TurnStage::Completed | TurnStage::Error | TurnStage::Retry
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TurnStage::Received => "received",
            TurnStage::Routed => "routed",
            TurnStage::Processing => "processing",
            TurnStage::Completed => "completed",
            TurnStage::Error => "error",
            TurnStage::Retry => "retry",
        }
    }
}

/// Which end of the queue a terminal transition removes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveTarget {
    Head,
    Tail,
}

/// Status emoji for a stage. Discord gets a distinct emoji per stage; Slack
/// collapses the intermediate stages into one in-progress marker so the
/// reaction churn stays low.
pub fn status_emoji(platform: Platform, stage: TurnStage) -> &'static str {
    match platform {
        Platform::Discord => match stage {
            TurnStage::Received => "📨",
            TurnStage::Routed => "📬",
            TurnStage::Processing => "⏳",
            TurnStage::Completed => "✅",
            TurnStage::Error => "❌",
            TurnStage::Retry => "🔁",
        },
        Platform::Slack => match stage {
            TurnStage::Received | TurnStage::Routed | TurnStage::Processing => "⏳",
            TurnStage::Completed => "✅",
            TurnStage::Error => "❌",
            TurnStage::Retry => "🔁",
        },
    }
}

/// Informational reaction for route provenance.
pub fn hint_emoji(hint: RouteHint) -> &'static str {
    match hint {
        RouteHint::Reply => "↩️",
        RouteHint::Thread => "🧵",
        RouteHint::Memory => "🧠",
        RouteHint::Attachment => "📎",
    }
}

/// Collapse whitespace and keep the last `PROMPT_TAIL_CHARS` characters.
pub fn prompt_tail(prompt: &str) -> String {
    let collapsed = prompt.split_whitespace().collect::<Vec<_>>().join(" ");
    let total = collapsed.chars().count();
    if total <= PROMPT_TAIL_CHARS {
        collapsed
    } else {
        collapsed.chars().skip(total - PROMPT_TAIL_CHARS).collect()
    }
}

/// One in-flight turn.
#[derive(Debug)]
struct PendingTurn {
    channel_id: String,
    message_id: String,
    stage: TurnStage,
    created_at: chrono::DateTime<chrono::Utc>,
    updated_at: chrono::DateTime<chrono::Utc>,
    prompt_tail: Option<String>,
    /// Status emoji currently on the message, for idempotent replacement.
    current_emoji: Option<&'static str>,
    stuck_timer: Option<tokio::task::AbortHandle>,
}

#[derive(Debug, Default)]
struct InstanceState {
    agent_type: Option<AgentType>,
    queue: VecDeque<PendingTurn>,
}

/// Last terminal stage an instance saw.
#[derive(Debug, Clone, serde::Serialize)]
pub struct TerminalSnapshot {
    pub stage: TurnStage,
    pub at: chrono::DateTime<chrono::Utc>,
}

/// Read-only view of one instance's pending queue.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingSnapshot {
    pub project: String,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<AgentType>,
    pub pending_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_stage: Option<TurnStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_stage: Option<TurnStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_created_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_terminal: Option<TerminalSnapshot>,
}

enum Command {
    Pending {
        agent_type: AgentType,
        channel_id: String,
        message_id: String,
        prompt_tail: Option<String>,
    },
    Stage {
        stage: TurnStage,
        hint: Option<RouteHint>,
    },
    Attachments,
    Resolve {
        stage: TurnStage,
        target: ResolveTarget,
    },
    ResolveByMessageId {
        stage: TurnStage,
        message_id: String,
    },
    StuckCheck {
        message_id: String,
    },
    Clear,
}

struct Envelope {
    command: Command,
    ack: Option<oneshot::Sender<()>>,
}

struct Shared {
    platform: Platform,
    messaging: Arc<dyn MessagingClientDyn>,
    stuck_alert_after: Duration,
    state: Mutex<TrackerState>,
}

#[derive(Default)]
struct TrackerState {
    instances: HashMap<InstanceKey, InstanceState>,
    terminal: HashMap<InstanceKey, TerminalSnapshot>,
    terminal_order: VecDeque<InstanceKey>,
}

/// FIFO pending-turn tracker. See module docs.
pub struct PendingTracker {
    shared: Arc<Shared>,
    workers: Mutex<HashMap<InstanceKey, mpsc::UnboundedSender<Envelope>>>,
}

impl PendingTracker {
    pub fn new(messaging: Arc<dyn MessagingClientDyn>, config: &PendingConfig) -> Arc<Self> {
        Arc::new(Self {
            shared: Arc::new(Shared {
                platform: messaging.platform(),
                messaging,
                stuck_alert_after: config.stuck_alert_after,
                state: Mutex::new(TrackerState::default()),
            }),
            workers: Mutex::new(HashMap::new()),
        })
    }

    /// Append a pending turn: received reaction, typing indicator, stuck
    /// timer.
    pub async fn mark_pending(
        &self,
        project: &str,
        agent_type: AgentType,
        instance_id: Option<&str>,
        channel_id: &str,
        message_id: &str,
        prompt: Option<&str>,
    ) {
        let key = InstanceKey::resolve(project, agent_type, instance_id);
        self.run(
            key,
            Command::Pending {
                agent_type,
                channel_id: channel_id.to_string(),
                message_id: message_id.to_string(),
                prompt_tail: prompt.map(prompt_tail),
            },
        )
        .await;
    }

    /// Transition the head turn to `routed`, optionally tagging provenance.
    pub async fn mark_route_resolved(
        &self,
        project: &str,
        agent_type: AgentType,
        instance_id: Option<&str>,
        hint: Option<RouteHint>,
    ) {
        let key = InstanceKey::resolve(project, agent_type, instance_id);
        self.run(
            key,
            Command::Stage {
                stage: TurnStage::Routed,
                hint,
            },
        )
        .await;
    }

    /// Transition the head turn to `processing`.
    pub async fn mark_dispatching(
        &self,
        project: &str,
        agent_type: AgentType,
        instance_id: Option<&str>,
    ) {
        let key = InstanceKey::resolve(project, agent_type, instance_id);
        self.run(
            key,
            Command::Stage {
                stage: TurnStage::Processing,
                hint: None,
            },
        )
        .await;
    }

    /// Tag the head turn as carrying attachments.
    pub async fn mark_has_attachments(
        &self,
        project: &str,
        agent_type: AgentType,
        instance_id: Option<&str>,
    ) {
        let key = InstanceKey::resolve(project, agent_type, instance_id);
        self.run(key, Command::Attachments).await;
    }

    pub async fn mark_completed(
        &self,
        project: &str,
        agent_type: AgentType,
        instance_id: Option<&str>,
    ) {
        let key = InstanceKey::resolve(project, agent_type, instance_id);
        self.run(
            key,
            Command::Resolve {
                stage: TurnStage::Completed,
                target: ResolveTarget::Head,
            },
        )
        .await;
    }

    pub async fn mark_error(
        &self,
        project: &str,
        agent_type: AgentType,
        instance_id: Option<&str>,
    ) {
        let key = InstanceKey::resolve(project, agent_type, instance_id);
        self.run(
            key,
            Command::Resolve {
                stage: TurnStage::Error,
                target: ResolveTarget::Head,
            },
        )
        .await;
    }

    /// Mark a turn `retry` and drop it. The router uses the tail target when
    /// a just-enqueued prompt bounced off a shell pane.
    pub async fn mark_retry(
        &self,
        project: &str,
        agent_type: AgentType,
        instance_id: Option<&str>,
        target: ResolveTarget,
    ) {
        let key = InstanceKey::resolve(project, agent_type, instance_id);
        self.run(
            key,
            Command::Resolve {
                stage: TurnStage::Retry,
                target,
            },
        )
        .await;
    }

    pub async fn mark_completed_by_message_id(
        &self,
        project: &str,
        agent_type: AgentType,
        instance_id: Option<&str>,
        message_id: &str,
    ) {
        let key = InstanceKey::resolve(project, agent_type, instance_id);
        self.run(
            key,
            Command::ResolveByMessageId {
                stage: TurnStage::Completed,
                message_id: message_id.to_string(),
            },
        )
        .await;
    }

    pub async fn mark_error_by_message_id(
        &self,
        project: &str,
        agent_type: AgentType,
        instance_id: Option<&str>,
        message_id: &str,
    ) {
        let key = InstanceKey::resolve(project, agent_type, instance_id);
        self.run(
            key,
            Command::ResolveByMessageId {
                stage: TurnStage::Error,
                message_id: message_id.to_string(),
            },
        )
        .await;
    }

    /// Stop all indicators for an instance and drop its queue.
    pub async fn clear_instance(
        &self,
        project: &str,
        agent_type: AgentType,
        instance_id: Option<&str>,
    ) {
        let key = InstanceKey::resolve(project, agent_type, instance_id);
        self.run(key, Command::Clear).await;
    }

    /// Channel of the oldest unresolved turn.
    pub fn pending_channel(&self, key: &InstanceKey) -> Option<String> {
        let state = self.shared.state.lock().expect("tracker state");
        state
            .instances
            .get(key)?
            .queue
            .front()
            .map(|turn| turn.channel_id.clone())
    }

    pub fn pending_depth(&self, key: &InstanceKey) -> usize {
        let state = self.shared.state.lock().expect("tracker state");
        state
            .instances
            .get(key)
            .map(|instance| instance.queue.len())
            .unwrap_or(0)
    }

    /// Prompt tail of the head turn.
    pub fn pending_prompt_tail(&self, key: &InstanceKey) -> Option<String> {
        let state = self.shared.state.lock().expect("tracker state");
        state
            .instances
            .get(key)?
            .queue
            .front()
            .and_then(|turn| turn.prompt_tail.clone())
    }

    /// Prompt tails of every pending turn, head first.
    pub fn pending_prompt_tails(&self, key: &InstanceKey) -> Vec<String> {
        let state = self.shared.state.lock().expect("tracker state");
        state
            .instances
            .get(key)
            .map(|instance| {
                instance
                    .queue
                    .iter()
                    .filter_map(|turn| turn.prompt_tail.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Snapshot every tracked instance for `/runtime-status` and `/health`.
    pub fn runtime_snapshot(&self) -> Vec<PendingSnapshot> {
        let state = self.shared.state.lock().expect("tracker state");
        let mut keys: Vec<&InstanceKey> = state
            .instances
            .keys()
            .chain(state.terminal.keys())
            .collect();
        keys.sort();
        keys.dedup();

        keys.into_iter()
            .map(|key| {
                let instance = state.instances.get(key);
                let queue = instance.map(|i| &i.queue);
                PendingSnapshot {
                    project: key.project.clone(),
                    instance_id: key.instance_id.clone(),
                    agent_type: instance.and_then(|i| i.agent_type),
                    pending_depth: queue.map(VecDeque::len).unwrap_or(0),
                    oldest_stage: queue.and_then(|q| q.front()).map(|turn| turn.stage),
                    latest_stage: queue.and_then(|q| q.back()).map(|turn| turn.stage),
                    oldest_created_at: queue.and_then(|q| q.front()).map(|turn| turn.created_at),
                    channel_id: queue
                        .and_then(|q| q.front())
                        .map(|turn| turn.channel_id.clone()),
                    last_terminal: state.terminal.get(key).cloned(),
                }
            })
            .collect()
    }

    /// Last terminal stage recorded for an instance.
    pub fn last_terminal(&self, key: &InstanceKey) -> Option<TerminalSnapshot> {
        let state = self.shared.state.lock().expect("tracker state");
        state.terminal.get(key).cloned()
    }

    /// Enqueue onto the instance's serial queue and wait for it to apply.
    async fn run(&self, key: InstanceKey, command: Command) {
        let (ack_tx, ack_rx) = oneshot::channel();
        let sender = self.worker_for(&key);
        if sender
            .send(Envelope {
                command,
                ack: Some(ack_tx),
            })
            .is_err()
        {
            tracing::warn!(%key, "pending worker gone, dropping operation");
            return;
        }
        let _ = ack_rx.await;
    }

    fn worker_for(&self, key: &InstanceKey) -> mpsc::UnboundedSender<Envelope> {
        let mut workers = self.workers.lock().expect("tracker workers");
        if let Some(sender) = workers.get(key) {
            return sender.clone();
        }
        let (tx, mut rx) = mpsc::unbounded_channel::<Envelope>();
        let shared = self.shared.clone();
        let worker_key = key.clone();
        let self_tx = tx.clone();
        tokio::spawn(async move {
            while let Some(envelope) = rx.recv().await {
                apply(&shared, &worker_key, &self_tx, envelope.command).await;
                if let Some(ack) = envelope.ack {
                    let _ = ack.send(());
                }
            }
        });
        workers.insert(key.clone(), tx.clone());
        tx
    }
}

/// Platform side effects computed under the state lock, performed after it is
/// released.
#[derive(Default)]
struct SideEffects {
    remove_reaction: Option<(String, String, &'static str)>,
    add_reaction: Option<(String, String, &'static str)>,
    hint_reaction: Option<(String, String, &'static str)>,
    start_typing: Option<String>,
    stop_typing: Option<String>,
}

async fn apply(
    shared: &Arc<Shared>,
    key: &InstanceKey,
    self_tx: &mpsc::UnboundedSender<Envelope>,
    command: Command,
) {
    let mut effects = SideEffects::default();

    match command {
        Command::Pending {
            agent_type,
            channel_id,
            message_id,
            prompt_tail,
        } => {
            let emoji = status_emoji(shared.platform, TurnStage::Received);
            let stuck_timer =
                schedule_stuck_check(shared.stuck_alert_after, self_tx.clone(), &message_id);
            {
                let mut state = shared.state.lock().expect("tracker state");
                let instance = state.instances.entry(key.clone()).or_default();
                instance.agent_type = Some(agent_type);
                instance.queue.push_back(PendingTurn {
                    channel_id: channel_id.clone(),
                    message_id: message_id.clone(),
                    stage: TurnStage::Received,
                    created_at: chrono::Utc::now(),
                    updated_at: chrono::Utc::now(),
                    prompt_tail,
                    current_emoji: Some(emoji),
                    stuck_timer: Some(stuck_timer),
                });
            }
            effects.add_reaction = Some((channel_id.clone(), message_id, emoji));
            effects.start_typing = Some(channel_id);
        }

        Command::Stage { stage, hint } => {
            let mut state = shared.state.lock().expect("tracker state");
            if let Some(turn) = state
                .instances
                .get_mut(key)
                .and_then(|instance| instance.queue.front_mut())
            {
                turn.stage = stage;
                turn.updated_at = chrono::Utc::now();
                let emoji = status_emoji(shared.platform, stage);
                if turn.current_emoji != Some(emoji) {
                    if let Some(old) = turn.current_emoji {
                        effects.remove_reaction =
                            Some((turn.channel_id.clone(), turn.message_id.clone(), old));
                    }
                    effects.add_reaction =
                        Some((turn.channel_id.clone(), turn.message_id.clone(), emoji));
                    turn.current_emoji = Some(emoji);
                }
                if let Some(hint) = hint {
                    effects.hint_reaction = Some((
                        turn.channel_id.clone(),
                        turn.message_id.clone(),
                        hint_emoji(hint),
                    ));
                }
            }
        }

        Command::Attachments => {
            let mut state = shared.state.lock().expect("tracker state");
            if let Some(turn) = state
                .instances
                .get_mut(key)
                .and_then(|instance| instance.queue.front_mut())
            {
                turn.updated_at = chrono::Utc::now();
                effects.hint_reaction = Some((
                    turn.channel_id.clone(),
                    turn.message_id.clone(),
                    hint_emoji(RouteHint::Attachment),
                ));
            }
        }

        Command::Resolve { stage, target } => {
            let mut state = shared.state.lock().expect("tracker state");
            let removed = state.instances.get_mut(key).and_then(|instance| {
                match target {
                    ResolveTarget::Head => instance.queue.pop_front(),
                    ResolveTarget::Tail => instance.queue.pop_back(),
                }
            });
            if let Some(turn) = removed {
                finish_turn(&mut state, shared.platform, key, turn, stage, &mut effects);
            }
        }

        Command::ResolveByMessageId { stage, message_id } => {
            let mut state = shared.state.lock().expect("tracker state");
            let removed = state.instances.get_mut(key).and_then(|instance| {
                let position = instance
                    .queue
                    .iter()
                    .position(|turn| turn.message_id == message_id)?;
                instance.queue.remove(position)
            });
            if let Some(turn) = removed {
                finish_turn(&mut state, shared.platform, key, turn, stage, &mut effects);
            }
        }

        Command::StuckCheck { message_id } => {
            let mut state = shared.state.lock().expect("tracker state");
            if let Some(turn) = state.instances.get_mut(key).and_then(|instance| {
                instance
                    .queue
                    .iter_mut()
                    .find(|turn| turn.message_id == message_id)
            }) {
                // Still pending: nudge the typing indicator and come back.
                effects.start_typing = Some(turn.channel_id.clone());
                turn.stuck_timer = Some(schedule_stuck_check(
                    shared.stuck_alert_after,
                    self_tx.clone(),
                    &message_id,
                ));
            }
        }

        Command::Clear => {
            let removed_channels = {
                let mut state = shared.state.lock().expect("tracker state");
                state.instances.remove(key).map(|instance| {
                    let mut channels: Vec<String> = Vec::new();
                    for turn in instance.queue {
                        if let Some(timer) = turn.stuck_timer {
                            timer.abort();
                        }
                        if !channels.contains(&turn.channel_id) {
                            channels.push(turn.channel_id);
                        }
                    }
                    channels
                })
            };
            if let Some(channels) = removed_channels {
                for channel in channels {
                    if let Err(error) = shared.messaging.stop_typing(&channel).await {
                        tracing::warn!(%error, %channel, "failed to stop typing indicator");
                    }
                }
                return;
            }
        }
    }

    perform(shared, effects).await;
}

fn finish_turn(
    state: &mut TrackerState,
    platform: Platform,
    key: &InstanceKey,
    turn: PendingTurn,
    stage: TurnStage,
    effects: &mut SideEffects,
) {
    debug_assert!(stage.is_terminal());
    if let Some(timer) = turn.stuck_timer {
        timer.abort();
    }

    let emoji = status_emoji(platform, stage);
    if let Some(old) = turn.current_emoji {
        if old != emoji {
            effects.remove_reaction = Some((turn.channel_id.clone(), turn.message_id.clone(), old));
        }
    }
    effects.add_reaction = Some((turn.channel_id.clone(), turn.message_id.clone(), emoji));

    // Stop typing when no remaining turn targets this channel.
    let channel_busy = state
        .instances
        .get(key)
        .is_some_and(|instance| {
            instance
                .queue
                .iter()
                .any(|other| other.channel_id == turn.channel_id)
        });
    if !channel_busy {
        effects.stop_typing = Some(turn.channel_id.clone());
    }

    if state
        .instances
        .get(key)
        .is_some_and(|instance| instance.queue.is_empty())
    {
        state.instances.remove(key);
    }

    if !state.terminal.contains_key(key) {
        state.terminal_order.push_back(key.clone());
        if state.terminal_order.len() > TERMINAL_MEMORY_CAP {
            if let Some(evicted) = state.terminal_order.pop_front() {
                state.terminal.remove(&evicted);
            }
        }
    }
    state.terminal.insert(
        key.clone(),
        TerminalSnapshot {
            stage,
            at: chrono::Utc::now(),
        },
    );
}

async fn perform(shared: &Arc<Shared>, effects: SideEffects) {
    if let Some((channel, message, emoji)) = effects.remove_reaction {
        log_reaction_failure(
            shared
                .messaging
                .remove_reaction(&channel, &message, emoji)
                .await,
            &channel,
        );
    }
    if let Some((channel, message, emoji)) = effects.add_reaction {
        log_reaction_failure(
            shared.messaging.add_reaction(&channel, &message, emoji).await,
            &channel,
        );
    }
    if let Some((channel, message, emoji)) = effects.hint_reaction {
        log_reaction_failure(
            shared.messaging.add_reaction(&channel, &message, emoji).await,
            &channel,
        );
    }
    if let Some(channel) = effects.start_typing {
        if let Err(error) = shared.messaging.start_typing(&channel).await {
            tracing::warn!(%error, %channel, "failed to start typing indicator");
        }
    }
    if let Some(channel) = effects.stop_typing {
        if let Err(error) = shared.messaging.stop_typing(&channel).await {
            tracing::warn!(%error, %channel, "failed to stop typing indicator");
        }
    }
}

fn log_reaction_failure(result: Result<()>, channel: &str) {
    if let Err(error) = result {
        tracing::warn!(%error, %channel, "reaction update failed");
    }
}

fn schedule_stuck_check(
    after: Duration,
    tx: mpsc::UnboundedSender<Envelope>,
    message_id: &str,
) -> tokio::task::AbortHandle {
    let message_id = message_id.to_string();
    tokio::spawn(async move {
        tokio::time::sleep(after).await;
        let _ = tx.send(Envelope {
            command: Command::StuckCheck { message_id },
            ack: None,
        });
    })
    .abort_handle()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PendingConfig;
    use crate::testutil::{FakeMessaging, MessagingCall};

    fn tracker_with(
        messaging: Arc<FakeMessaging>,
        stuck_alert_after: Duration,
    ) -> Arc<PendingTracker> {
        PendingTracker::new(
            messaging,
            &PendingConfig { stuck_alert_after },
        )
    }

    fn key() -> InstanceKey {
        InstanceKey::new("demo", "codex-1")
    }

    async fn pending(tracker: &PendingTracker, message_id: &str) {
        tracker
            .mark_pending(
                "demo",
                AgentType::Codex,
                Some("codex-1"),
                "ch-1",
                message_id,
                Some("hello world"),
            )
            .await;
    }

    #[tokio::test]
    async fn head_is_always_the_oldest_turn() {
        let messaging = FakeMessaging::discord();
        let tracker = tracker_with(messaging.clone(), Duration::from_secs(45));

        pending(&tracker, "m1").await;
        pending(&tracker, "m2").await;
        assert_eq!(tracker.pending_depth(&key()), 2);

        tracker
            .mark_completed("demo", AgentType::Codex, Some("codex-1"))
            .await;
        assert_eq!(tracker.pending_depth(&key()), 1);

        let snapshot = tracker.runtime_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].pending_depth, 1);
    }

    #[tokio::test]
    async fn stage_transition_replaces_exactly_one_reaction() {
        let messaging = FakeMessaging::discord();
        let tracker = tracker_with(messaging.clone(), Duration::from_secs(45));

        pending(&tracker, "m1").await;
        let before = messaging.calls().len();

        tracker
            .mark_route_resolved("demo", AgentType::Codex, Some("codex-1"), None)
            .await;
        let calls = messaging.calls();
        let new: Vec<_> = calls[before..].to_vec();
        assert_eq!(
            new,
            vec![
                MessagingCall::RemoveReaction {
                    channel_id: "ch-1".into(),
                    message_id: "m1".into(),
                    emoji: "📨".into(),
                },
                MessagingCall::AddReaction {
                    channel_id: "ch-1".into(),
                    message_id: "m1".into(),
                    emoji: "📬".into(),
                },
            ]
        );
    }

    #[tokio::test]
    async fn same_stage_transition_makes_no_platform_calls() {
        let messaging = FakeMessaging::new(Platform::Slack);
        let tracker = tracker_with(messaging.clone(), Duration::from_secs(45));

        pending(&tracker, "m1").await;
        let before = messaging.calls().len();

        // Slack collapses received → routed → processing into one emoji, so
        // these transitions are reaction no-ops.
        tracker
            .mark_route_resolved("demo", AgentType::Codex, Some("codex-1"), None)
            .await;
        tracker
            .mark_dispatching("demo", AgentType::Codex, Some("codex-1"))
            .await;
        assert_eq!(messaging.calls().len(), before);
    }

    #[tokio::test]
    async fn hint_reaction_is_added_without_removing_status() {
        let messaging = FakeMessaging::discord();
        let tracker = tracker_with(messaging.clone(), Duration::from_secs(45));

        pending(&tracker, "m1").await;
        tracker
            .mark_route_resolved(
                "demo",
                AgentType::Codex,
                Some("codex-1"),
                Some(RouteHint::Thread),
            )
            .await;

        let calls = messaging.calls();
        assert!(calls.contains(&MessagingCall::AddReaction {
            channel_id: "ch-1".into(),
            message_id: "m1".into(),
            emoji: "🧵".into(),
        }));
    }

    #[tokio::test]
    async fn terminal_transition_on_missing_key_is_a_noop() {
        let messaging = FakeMessaging::discord();
        let tracker = tracker_with(messaging.clone(), Duration::from_secs(45));

        tracker
            .mark_completed("demo", AgentType::Codex, Some("codex-1"))
            .await;
        assert!(messaging.calls().is_empty());
        assert!(tracker.last_terminal(&key()).is_none());
    }

    #[tokio::test]
    async fn resolve_by_message_id_removes_the_right_turn() {
        let messaging = FakeMessaging::discord();
        let tracker = tracker_with(messaging.clone(), Duration::from_secs(45));

        pending(&tracker, "m1").await;
        pending(&tracker, "m2").await;
        pending(&tracker, "m3").await;

        tracker
            .mark_completed_by_message_id("demo", AgentType::Codex, Some("codex-1"), "m2")
            .await;
        assert_eq!(tracker.pending_depth(&key()), 2);
        let tails = tracker.pending_prompt_tails(&key());
        assert_eq!(tails.len(), 2);

        // The head is untouched.
        assert_eq!(tracker.pending_channel(&key()), Some("ch-1".to_string()));
    }

    #[tokio::test]
    async fn retry_with_tail_target_drops_the_newest_turn() {
        let messaging = FakeMessaging::discord();
        let tracker = tracker_with(messaging.clone(), Duration::from_secs(45));

        pending(&tracker, "m1").await;
        pending(&tracker, "m2").await;

        tracker
            .mark_retry(
                "demo",
                AgentType::Codex,
                Some("codex-1"),
                ResolveTarget::Tail,
            )
            .await;
        assert_eq!(tracker.pending_depth(&key()), 1);
        assert!(messaging.calls().contains(&MessagingCall::AddReaction {
            channel_id: "ch-1".into(),
            message_id: "m2".into(),
            emoji: "🔁".into(),
        }));
    }

    #[tokio::test]
    async fn typing_stops_when_the_channel_drains() {
        let messaging = FakeMessaging::discord();
        let tracker = tracker_with(messaging.clone(), Duration::from_secs(45));

        pending(&tracker, "m1").await;
        assert!(messaging.calls().contains(&MessagingCall::StartTyping {
            channel_id: "ch-1".into()
        }));

        tracker
            .mark_completed("demo", AgentType::Codex, Some("codex-1"))
            .await;
        assert!(messaging.calls().contains(&MessagingCall::StopTyping {
            channel_id: "ch-1".into()
        }));
    }

    #[tokio::test]
    async fn clear_instance_drops_queue_and_stops_typing() {
        let messaging = FakeMessaging::discord();
        let tracker = tracker_with(messaging.clone(), Duration::from_secs(45));

        pending(&tracker, "m1").await;
        pending(&tracker, "m2").await;

        tracker
            .clear_instance("demo", AgentType::Codex, Some("codex-1"))
            .await;
        assert_eq!(tracker.pending_depth(&key()), 0);
        assert!(messaging.calls().contains(&MessagingCall::StopTyping {
            channel_id: "ch-1".into()
        }));
    }

    #[tokio::test]
    async fn reaction_failures_never_abort_the_operation() {
        let messaging = FakeMessaging::discord();
        let tracker = tracker_with(messaging.clone(), Duration::from_secs(45));

        *messaging.fail.lock().expect("fail lock") = true;
        pending(&tracker, "m1").await;

        // State advanced even though every platform call failed.
        assert_eq!(tracker.pending_depth(&key()), 1);
        assert_eq!(tracker.pending_channel(&key()), Some("ch-1".to_string()));
    }

    #[tokio::test]
    async fn terminal_snapshot_is_recorded_per_instance() {
        let messaging = FakeMessaging::discord();
        let tracker = tracker_with(messaging.clone(), Duration::from_secs(45));

        pending(&tracker, "m1").await;
        tracker
            .mark_error("demo", AgentType::Codex, Some("codex-1"))
            .await;

        let terminal = tracker.last_terminal(&key()).expect("terminal snapshot");
        assert_eq!(terminal.stage, TurnStage::Error);
    }

    #[tokio::test]
    async fn stuck_alert_restarts_typing_until_resolution() {
        let messaging = FakeMessaging::discord();
        let tracker = tracker_with(messaging.clone(), Duration::from_millis(30));

        pending(&tracker, "m1").await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let typing_count = messaging
            .calls()
            .iter()
            .filter(|call| {
                matches!(call, MessagingCall::StartTyping { channel_id } if channel_id == "ch-1")
            })
            .count();
        assert!(
            typing_count >= 2,
            "expected stuck alert to restart typing, saw {typing_count} starts"
        );

        tracker
            .mark_completed("demo", AgentType::Codex, Some("codex-1"))
            .await;
        let after_resolve = messaging.calls().len();
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(
            messaging.calls().len(),
            after_resolve,
            "no further activity after resolution"
        );
    }

    #[test]
    fn prompt_tail_collapses_whitespace_and_keeps_the_end() {
        let prompt = format!("start  {}   end", "word ".repeat(100));
        let tail = prompt_tail(&prompt);
        assert!(tail.chars().count() <= 240);
        assert!(tail.ends_with("end"));
        assert!(!tail.contains("  "));
    }
}
