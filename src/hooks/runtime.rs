//! Event ingest pipeline and runtime bookkeeping for the hook server.

use crate::config::{EventConfig, LifecycleStrictMode, ProgressMode};
use crate::error::EventError;
use crate::hooks::event::{AgentEvent, EventKind};
use crate::hooks::progress::{ProgressBlock, merge_progress};
use crate::messaging::MessagingClientDyn;
use crate::messaging::split::split_message_non_empty;
use crate::pending::PendingTracker;
use crate::routing::{RouteContext, RouteQuery, RouteResolver, output_route};
use crate::state::StateStore;
use crate::{AgentType, InstanceKey, Platform};

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Lifecycle stage of an event-driven instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStage {
    Idle,
    Started,
    Progress,
    Final,
    Error,
    Cancelled,
}

impl LifecycleStage {
    fn from_kind(kind: EventKind) -> Self {
        match kind {
            EventKind::Start => LifecycleStage::Started,
            EventKind::Progress => LifecycleStage::Progress,
            EventKind::Final => LifecycleStage::Final,
            EventKind::Idle => LifecycleStage::Idle,
            EventKind::Error => LifecycleStage::Error,
            EventKind::Cancelled => LifecycleStage::Cancelled,
        }
    }
}

/// How an accepted event was handled. Every variant maps to HTTP 200.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Processed,
    /// Capture-driven instance; counted and dropped.
    Ignored,
    Duplicate,
    OutOfOrder,
    LifecycleRejected,
}

/// `/send-files` failures, mapped to HTTP statuses by the server.
#[derive(Debug, thiserror::Error)]
pub enum SendFilesError {
    #[error("No files provided")]
    NoFiles,
    #[error("No valid files")]
    NoValidFiles,
    #[error("Project/channel not found")]
    NotFound,
}

#[derive(Debug, Clone)]
struct LifecycleEntry {
    stage: LifecycleStage,
    turn_id: Option<String>,
    event_id: Option<String>,
    seq: Option<u64>,
    progress_mode: Option<ProgressMode>,
    updated_at: chrono::DateTime<chrono::Utc>,
    updated: Instant,
}

struct SeqEntry {
    last_seq: u64,
    updated: Instant,
}

struct TranscriptEntry {
    text: String,
    updated: Instant,
}

#[derive(Default)]
struct IgnoredEntry {
    counts: HashMap<&'static str, u64>,
    updated: Option<Instant>,
}

#[derive(Default)]
struct HookMaps {
    dedupe: HashMap<String, Instant>,
    dedupe_order: VecDeque<String>,
    seq: HashMap<String, SeqEntry>,
    started: HashMap<String, Instant>,
    lifecycle: HashMap<InstanceKey, LifecycleEntry>,
    transcripts: HashMap<String, TranscriptEntry>,
    /// Per-turn progress-mode memory, consulted by the final-event fallback.
    turn_modes: HashMap<String, (ProgressMode, Instant)>,
    blocks: HashMap<String, ProgressBlock>,
    /// Per-turn progress thread, created lazily on the first thread flush.
    progress_threads: HashMap<String, String>,
    ignored: HashMap<InstanceKey, IgnoredEntry>,
    rejected: HashMap<InstanceKey, u64>,
}

/// Shared hook-server runtime: the ingest pipeline plus every event-side map.
pub struct HookRuntime {
    messaging: Arc<dyn MessagingClientDyn>,
    tracker: Arc<PendingTracker>,
    resolver: Arc<RouteResolver>,
    store: Arc<dyn StateStore>,
    config: EventConfig,
    long_output_threshold: usize,
    maps: Mutex<HookMaps>,
}

fn turn_key(key: &InstanceKey, agent_type: AgentType, turn_id: Option<&str>) -> String {
    format!(
        "{}|{}|{}|{}",
        key.project,
        agent_type,
        key.instance_id,
        turn_id.unwrap_or("-")
    )
}

impl HookRuntime {
    pub fn new(
        messaging: Arc<dyn MessagingClientDyn>,
        tracker: Arc<PendingTracker>,
        resolver: Arc<RouteResolver>,
        store: Arc<dyn StateStore>,
        config: EventConfig,
        long_output_threshold: usize,
    ) -> Arc<Self> {
        Arc::new(Self {
            messaging,
            tracker,
            resolver,
            store,
            config,
            long_output_threshold,
            maps: Mutex::new(HookMaps::default()),
        })
    }

    /// Drop buffered progress state and cancel all flush timers.
    pub fn stop(&self) {
        let mut maps = self.maps.lock().expect("hook maps");
        maps.blocks.clear();
        maps.transcripts.clear();
    }

    /// Run one event through the full pipeline.
    pub async fn ingest(self: &Arc<Self>, event: AgentEvent) -> Result<IngestOutcome, EventError> {
        // (1) Resolve the instance the same way chat messages do.
        let query = RouteQuery {
            agent_type: event.agent_type,
            project_name: event.project_name.clone(),
            channel_id: String::new(),
            message_id: None,
            mapped_instance_id: event.instance_id.clone(),
            context: RouteContext::default(),
        };
        let Some(resolved) = self.resolver.resolve(&query) else {
            if self.store.project(&event.project_name).is_none() {
                return Err(EventError::UnknownProject(event.project_name));
            }
            return Err(EventError::NoRoute);
        };
        let key = resolved.key();
        let agent_type = resolved.route.agent_type;
        let Some(instance) = self.store.instance(&key.project, &key.instance_id) else {
            return Err(EventError::NoRoute);
        };

        // (2) Capture-driven instances ignore events, except the codex-poc
        // shim that feeds both paths during migration.
        if !instance.event_hook && event.source.as_deref() != Some("codex-poc") {
            let mut maps = self.maps.lock().expect("hook maps");
            let entry = maps.ignored.entry(key.clone()).or_default();
            *entry.counts.entry(event.kind.as_str()).or_insert(0) += 1;
            entry.updated = Some(Instant::now());
            prune(&mut maps, &self.config);
            return Ok(IngestOutcome::Ignored);
        }

        let tkey = turn_key(&key, agent_type, event.turn_id.as_deref());

        {
            let mut maps = self.maps.lock().expect("hook maps");
            prune(&mut maps, &self.config);

            // (3) Dedupe by event id.
            if let Some(event_id) = event.event_id.as_deref() {
                let dkey = format!("{}|{}|{}|{}", key.project, agent_type, key.instance_id, event_id);
                if maps.dedupe.contains_key(&dkey) {
                    return Ok(IngestOutcome::Duplicate);
                }
                maps.dedupe.insert(dkey.clone(), Instant::now());
                maps.dedupe_order.push_back(dkey);
                while maps.dedupe_order.len() > self.config.dedupe_max_entries {
                    if let Some(evicted) = maps.dedupe_order.pop_front() {
                        maps.dedupe.remove(&evicted);
                    }
                }
            }

            // (4) Sequence gate per turn.
            if let Some(seq) = event.seq {
                match maps.seq.get_mut(&tkey) {
                    Some(entry) if seq <= entry.last_seq => {
                        return Ok(IngestOutcome::OutOfOrder);
                    }
                    Some(entry) => {
                        entry.last_seq = seq;
                        entry.updated = Instant::now();
                    }
                    None => {
                        maps.seq.insert(
                            tkey.clone(),
                            SeqEntry {
                                last_seq: seq,
                                updated: Instant::now(),
                            },
                        );
                    }
                }
            }

            // (5) Lifecycle gate: progress/terminal events without a start.
            if event.kind.requires_started_turn()
                && event.turn_id.is_some()
                && !maps.started.contains_key(&tkey)
            {
                match self.config.lifecycle_strict_mode {
                    LifecycleStrictMode::Off => {}
                    LifecycleStrictMode::Warn => {
                        tracing::warn!(
                            turn = %tkey,
                            kind = event.kind.as_str(),
                            "event arrived without session.start"
                        );
                    }
                    LifecycleStrictMode::Reject => {
                        *maps.rejected.entry(key.clone()).or_insert(0) += 1;
                        return Ok(IngestOutcome::LifecycleRejected);
                    }
                }
            }

            // (6) Update the lifecycle stage.
            let entry = maps.lifecycle.entry(key.clone()).or_insert(LifecycleEntry {
                stage: LifecycleStage::Idle,
                turn_id: None,
                event_id: None,
                seq: None,
                progress_mode: None,
                updated_at: chrono::Utc::now(),
                updated: Instant::now(),
            });
            entry.stage = LifecycleStage::from_kind(event.kind);
            entry.turn_id = event.turn_id.clone();
            entry.event_id = event.event_id.clone();
            if event.seq.is_some() {
                entry.seq = event.seq;
            }
            entry.updated_at = chrono::Utc::now();
            entry.updated = Instant::now();
        }

        // (7) Dispatch.
        match event.kind {
            EventKind::Start => self.on_start(&tkey),
            EventKind::Progress => self.on_progress(&key, agent_type, &instance.channel_id, &tkey, &event).await,
            EventKind::Final | EventKind::Idle => {
                self.on_final(&key, agent_type, &instance.channel_id, &tkey, &event)
                    .await;
            }
            EventKind::Error => {
                self.on_error(&key, agent_type, &instance.channel_id, &event)
                    .await;
            }
            EventKind::Cancelled => {
                self.on_cancelled(&key, agent_type, &instance.channel_id, &event)
                    .await;
            }
        }

        Ok(IngestOutcome::Processed)
    }

    fn on_start(&self, tkey: &str) {
        let mut maps = self.maps.lock().expect("hook maps");
        maps.blocks.remove(tkey);
        maps.transcripts.remove(tkey);
        maps.turn_modes.remove(tkey);
        maps.progress_threads.remove(tkey);
        maps.started.insert(tkey.to_string(), Instant::now());
    }

    async fn on_progress(
        self: &Arc<Self>,
        key: &InstanceKey,
        agent_type: AgentType,
        default_channel: &Option<String>,
        tkey: &str,
        event: &AgentEvent,
    ) {
        let mode = self.effective_progress_mode(agent_type, event.progress_mode_override);
        let streaming = event
            .progress_block_streaming
            .unwrap_or(self.config.progress_block_streaming);
        let window = event
            .progress_block_window_ms
            .map(Duration::from_millis)
            .unwrap_or(self.config.progress_block_window);
        let max_chars = event
            .progress_block_max_chars
            .unwrap_or(self.config.progress_block_max_chars);

        let channel = self.route_channel(key, default_channel.as_deref());

        let flush_now = {
            let mut maps = self.maps.lock().expect("hook maps");

            // Transcript always accumulates, capped from the front.
            let transcript = maps
                .transcripts
                .entry(tkey.to_string())
                .or_insert_with(|| TranscriptEntry {
                    text: String::new(),
                    updated: Instant::now(),
                });
            if !transcript.text.is_empty() {
                transcript.text.push('\n');
            }
            transcript.text.push_str(&event.text);
            cap_tail(&mut transcript.text, self.config.transcript_max_chars);
            transcript.updated = Instant::now();

            maps.turn_modes
                .insert(tkey.to_string(), (mode, Instant::now()));
            if let Some(entry) = maps.lifecycle.get_mut(key) {
                entry.progress_mode = Some(mode);
            }

            if mode == ProgressMode::Off || event.text.trim().is_empty() {
                None
            } else if !streaming {
                // No coalescing: forward this event's text directly.
                Some(ProgressBlock {
                    text: event.text.clone(),
                    channel: channel.clone().unwrap_or_default(),
                    mode,
                    timer: None,
                })
            } else {
                let Some(channel) = channel.clone() else {
                    return;
                };
                let should_flush = {
                    let block = maps
                        .blocks
                        .entry(tkey.to_string())
                        .or_insert_with(|| ProgressBlock {
                            text: String::new(),
                            channel,
                            mode,
                            timer: None,
                        });
                    block.text = merge_progress(&block.text, &event.text);
                    block.mode = mode;
                    if block.text.chars().count() >= max_chars {
                        true
                    } else {
                        if block.timer.is_none() {
                            block.timer = Some(self.schedule_flush(tkey.to_string(), window));
                        }
                        false
                    }
                };
                if should_flush {
                    maps.blocks.remove(tkey)
                } else {
                    None
                }
            }
        };

        if let Some(block) = flush_now {
            if !block.channel.is_empty() {
                self.send_block(tkey, block).await;
            }
        }
    }

    async fn on_final(
        &self,
        key: &InstanceKey,
        agent_type: AgentType,
        default_channel: &Option<String>,
        tkey: &str,
        event: &AgentEvent,
    ) {
        let (transcript, mode) = {
            let mut maps = self.maps.lock().expect("hook maps");
            maps.blocks.remove(tkey);
            let transcript = maps
                .transcripts
                .remove(tkey)
                .map(|entry| entry.text)
                .unwrap_or_default();
            let mode = maps.turn_modes.remove(tkey).map(|(mode, _)| mode);
            (transcript, mode)
        };

        let delivered = if event.text.trim().is_empty()
            && mode != Some(ProgressMode::Channel)
            && self.config.final_from_progress_on_empty
        {
            transcript
        } else {
            event.text.clone()
        };

        // Project-local files named in the turn are delivered as attachments
        // and stripped from the display text.
        let project_path = self.store.project(&key.project).map(|project| project.path);
        let file_source = event.turn_text.as_deref().unwrap_or(&delivered);
        let files = match &project_path {
            Some(root) => extract_project_files(file_source, root),
            None => Vec::new(),
        };
        let display = strip_paths(&delivered, &files);

        if let Some(channel) = self.route_channel(key, default_channel.as_deref()) {
            if !display.trim().is_empty() {
                self.deliver(&channel, &display).await;
            }
            if !files.is_empty() {
                let listing = files
                    .iter()
                    .map(|path| path.display().to_string())
                    .collect::<Vec<_>>()
                    .join("\n");
                if let Err(error) = self
                    .messaging
                    .send(&channel, &format!("📎 Files from this turn:\n{listing}"))
                    .await
                {
                    tracing::warn!(%error, %channel, "failed to send file listing");
                }
            }
        }

        match event.turn_id.as_deref() {
            Some(turn_id) => {
                self.tracker
                    .mark_completed_by_message_id(
                        &key.project,
                        agent_type,
                        Some(&key.instance_id),
                        turn_id,
                    )
                    .await;
            }
            None => {
                self.tracker
                    .mark_completed(&key.project, agent_type, Some(&key.instance_id))
                    .await;
            }
        }
    }

    async fn on_error(
        &self,
        key: &InstanceKey,
        agent_type: AgentType,
        default_channel: &Option<String>,
        event: &AgentEvent,
    ) {
        self.cancel_turn_state(key, agent_type, event.turn_id.as_deref());

        if let Some(channel) = self.route_channel(key, default_channel.as_deref()) {
            let detail = if event.text.trim().is_empty() {
                "the agent reported an error".to_string()
            } else {
                event.text.clone()
            };
            if let Err(error) = self
                .messaging
                .send(&channel, &format!("⚠️ Agent error: {detail}"))
                .await
            {
                tracing::warn!(%error, %channel, "failed to send error notice");
            }
        }

        match event.turn_id.as_deref() {
            Some(turn_id) => {
                self.tracker
                    .mark_error_by_message_id(&key.project, agent_type, Some(&key.instance_id), turn_id)
                    .await;
            }
            None => {
                self.tracker
                    .mark_error(&key.project, agent_type, Some(&key.instance_id))
                    .await;
            }
        }
    }

    async fn on_cancelled(
        &self,
        key: &InstanceKey,
        agent_type: AgentType,
        default_channel: &Option<String>,
        event: &AgentEvent,
    ) {
        self.cancel_turn_state(key, agent_type, event.turn_id.as_deref());

        if let Some(channel) = self.route_channel(key, default_channel.as_deref()) {
            if let Err(error) = self
                .messaging
                .send(&channel, "🛑 The agent cancelled this turn.")
                .await
            {
                tracing::warn!(%error, %channel, "failed to send cancellation notice");
            }
        }

        match event.turn_id.as_deref() {
            Some(turn_id) => {
                self.tracker
                    .mark_completed_by_message_id(
                        &key.project,
                        agent_type,
                        Some(&key.instance_id),
                        turn_id,
                    )
                    .await;
            }
            None => {
                self.tracker
                    .mark_completed(&key.project, agent_type, Some(&key.instance_id))
                    .await;
            }
        }
    }

    fn cancel_turn_state(&self, key: &InstanceKey, agent_type: AgentType, turn_id: Option<&str>) {
        let tkey = turn_key(key, agent_type, turn_id);
        let mut maps = self.maps.lock().expect("hook maps");
        maps.blocks.remove(&tkey);
        maps.transcripts.remove(&tkey);
        maps.turn_modes.remove(&tkey);
        maps.progress_threads.remove(&tkey);
    }

    /// Progress forwarding mode after env default, per-event override, and
    /// the codex event-only gate.
    fn effective_progress_mode(
        &self,
        agent_type: AgentType,
        event_override: Option<ProgressMode>,
    ) -> ProgressMode {
        let mut mode = event_override.unwrap_or(self.config.progress_forward);
        if agent_type == AgentType::Codex
            && self.config.codex_event_only
            && mode == ProgressMode::Channel
        {
            // Event-only codex sessions must not double-emit into the main
            // channel.
            mode = if self.messaging.supports_threads() {
                ProgressMode::Thread
            } else {
                ProgressMode::Off
            };
        }
        mode
    }

    fn route_channel(&self, key: &InstanceKey, default_channel: Option<&str>) -> Option<String> {
        let pending_channel = self.tracker.pending_channel(key);
        let depth = self.tracker.pending_depth(key);
        output_route(default_channel, pending_channel.as_deref(), depth)
    }

    fn schedule_flush(self: &Arc<Self>, tkey: String, window: Duration) -> tokio::task::AbortHandle {
        let runtime = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            runtime.flush_block(&tkey).await;
        })
        .abort_handle()
    }

    /// Flush a buffered progress block (timer path and size path both land
    /// here).
    pub async fn flush_block(self: &Arc<Self>, tkey: &str) {
        let block = {
            let mut maps = self.maps.lock().expect("hook maps");
            maps.blocks.remove(tkey)
        };
        if let Some(block) = block {
            if !block.text.trim().is_empty() && !block.channel.is_empty() {
                self.send_block(tkey, block).await;
            }
        }
    }

    async fn send_block(&self, tkey: &str, block: ProgressBlock) {
        let destination = match block.mode {
            ProgressMode::Thread if self.messaging.supports_threads() => {
                self.progress_thread_for(tkey, &block.channel).await
            }
            _ => block.channel.clone(),
        };
        for chunk in split_message_non_empty(&block.text, self.messaging.max_message_len()) {
            if let Err(error) = self.messaging.send(&destination, &chunk).await {
                tracing::warn!(%error, channel = %destination, "progress block send failed");
            }
        }
    }

    /// Lazily create the per-turn progress thread; fall back to the channel.
    async fn progress_thread_for(&self, tkey: &str, channel: &str) -> String {
        if let Some(existing) = self
            .maps
            .lock()
            .expect("hook maps")
            .progress_threads
            .get(tkey)
            .cloned()
        {
            return existing;
        }
        match self
            .messaging
            .create_thread(channel, None, "agent progress")
            .await
        {
            Ok(thread_id) => {
                self.maps
                    .lock()
                    .expect("hook maps")
                    .progress_threads
                    .insert(tkey.to_string(), thread_id.clone());
                thread_id
            }
            Err(error) => {
                tracing::warn!(%error, %channel, "failed to create progress thread, using channel");
                channel.to_string()
            }
        }
    }

    async fn deliver(&self, channel: &str, text: &str) {
        if self.messaging.platform() == Platform::Discord
            && self.messaging.supports_threads()
            && text.len() >= self.long_output_threshold
        {
            let summary = crate::truncate_chars(
                text.lines().find(|l| !l.trim().is_empty()).unwrap_or("output"),
                80,
            );
            if let Err(error) = self.messaging.send_long(channel, summary, text).await {
                tracing::warn!(%error, %channel, "long-output send failed");
            }
            return;
        }
        for chunk in split_message_non_empty(text, self.messaging.max_message_len()) {
            if let Err(error) = self.messaging.send(channel, &chunk).await {
                tracing::warn!(%error, %channel, "event send failed");
            }
        }
    }

    /// Deliver project files to the instance's route channel.
    pub async fn send_files(
        &self,
        project_name: &str,
        agent_type: Option<AgentType>,
        instance_id: Option<&str>,
        files: &[String],
    ) -> Result<(), SendFilesError> {
        if files.is_empty() {
            return Err(SendFilesError::NoFiles);
        }
        let project = self
            .store
            .project(project_name)
            .ok_or(SendFilesError::NotFound)?;
        let root = project.path.clone();

        let valid: Vec<PathBuf> = files
            .iter()
            .filter_map(|candidate| resolve_project_file(candidate, &root))
            .collect();
        if valid.is_empty() {
            return Err(SendFilesError::NoValidFiles);
        }

        let agent_type = agent_type.unwrap_or(AgentType::Claude);
        let query = RouteQuery {
            agent_type,
            project_name: project_name.to_string(),
            channel_id: String::new(),
            message_id: None,
            mapped_instance_id: instance_id.map(str::to_string),
            context: RouteContext::default(),
        };
        let resolved = self.resolver.resolve(&query).ok_or(SendFilesError::NotFound)?;
        let key = resolved.key();
        let default_channel = self
            .store
            .instance(&key.project, &key.instance_id)
            .and_then(|instance| instance.channel_id);
        let channel = self
            .route_channel(&key, default_channel.as_deref())
            .ok_or(SendFilesError::NotFound)?;

        let listing = valid
            .iter()
            .map(|path| path.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        if let Err(error) = self
            .messaging
            .send(&channel, &format!("📎 Files:\n{listing}"))
            .await
        {
            tracing::warn!(%error, %channel, "failed to deliver files message");
        }
        Ok(())
    }

    /// Aggregate view for `GET /runtime-status`.
    pub fn runtime_status(&self) -> RuntimeStatus {
        let pending = self.tracker.runtime_snapshot();
        let mut maps = self.maps.lock().expect("hook maps");
        prune(&mut maps, &self.config);

        let mut keys: Vec<InstanceKey> = pending
            .iter()
            .map(|snapshot| InstanceKey::new(snapshot.project.clone(), snapshot.instance_id.clone()))
            .collect();
        keys.extend(maps.lifecycle.keys().cloned());
        keys.extend(maps.ignored.keys().cloned());
        keys.extend(maps.rejected.keys().cloned());
        keys.sort();
        keys.dedup();

        let instances = keys
            .into_iter()
            .map(|key| {
                let pending_snapshot = pending
                    .iter()
                    .find(|snapshot| {
                        snapshot.project == key.project && snapshot.instance_id == key.instance_id
                    });
                let lifecycle = maps.lifecycle.get(&key);
                InstanceStatus {
                    project_name: key.project.clone(),
                    instance_id: key.instance_id.clone(),
                    agent_type: pending_snapshot.and_then(|snapshot| snapshot.agent_type),
                    pending_depth: pending_snapshot.map(|s| s.pending_depth).unwrap_or(0),
                    oldest_stage: pending_snapshot.and_then(|s| s.oldest_stage),
                    latest_stage: pending_snapshot.and_then(|s| s.latest_stage),
                    event_lifecycle_stage: lifecycle.map(|entry| entry.stage),
                    event_lifecycle_turn_id: lifecycle.and_then(|entry| entry.turn_id.clone()),
                    event_lifecycle_seq: lifecycle.and_then(|entry| entry.seq),
                    event_lifecycle_updated_at: lifecycle.map(|entry| entry.updated_at),
                    event_lifecycle_stale: lifecycle
                        .map(|entry| entry.updated.elapsed() > self.config.lifecycle_stale_after),
                    event_progress_mode: lifecycle
                        .and_then(|entry| entry.progress_mode)
                        .map(ProgressMode::as_str),
                    ignored_event_counts: maps.ignored.get(&key).map(|entry| {
                        entry
                            .counts
                            .iter()
                            .map(|(kind, count)| (kind.to_string(), *count))
                            .collect()
                    }),
                    lifecycle_rejected_event_count: maps.rejected.get(&key).copied(),
                }
            })
            .collect();

        RuntimeStatus {
            generated_at: chrono::Utc::now(),
            instances,
        }
    }
}

/// Keep only the last `max_chars` characters of a growing buffer.
fn cap_tail(text: &mut String, max_chars: usize) {
    let total = text.chars().count();
    if total > max_chars {
        *text = text.chars().skip(total - max_chars).collect();
    }
}

fn prune(maps: &mut HookMaps, config: &EventConfig) {
    let now = Instant::now();

    while let Some(front) = maps.dedupe_order.front() {
        let expired = maps
            .dedupe
            .get(front)
            .is_none_or(|at| now.duration_since(*at) > config.dedupe_retention);
        if expired {
            let front = maps.dedupe_order.pop_front().expect("non-empty");
            maps.dedupe.remove(&front);
        } else {
            break;
        }
    }

    maps.seq
        .retain(|_, entry| now.duration_since(entry.updated) <= config.seq_retention);
    if maps.seq.len() > config.seq_max_entries {
        // Over the hard cap: drop the stalest entries.
        let mut entries: Vec<(String, Instant)> = maps
            .seq
            .iter()
            .map(|(key, entry)| (key.clone(), entry.updated))
            .collect();
        entries.sort_by_key(|(_, updated)| *updated);
        for (key, _) in entries
            .into_iter()
            .take(maps.seq.len() - config.seq_max_entries)
        {
            maps.seq.remove(&key);
        }
    }

    maps.started
        .retain(|_, at| now.duration_since(*at) <= config.seq_retention);
    maps.transcripts
        .retain(|_, entry| now.duration_since(entry.updated) <= config.seq_retention);
    maps.turn_modes
        .retain(|_, (_, updated)| now.duration_since(*updated) <= config.seq_retention);
    maps.ignored.retain(|_, entry| {
        entry
            .updated
            .is_none_or(|at| now.duration_since(at) <= config.ignored_event_retention)
    });
}

/// Check a path resolves inside the project root.
pub fn resolve_project_file(candidate: &str, project_root: &Path) -> Option<PathBuf> {
    let trimmed = candidate.trim().trim_matches(|c| "\"'`".contains(c));
    if trimmed.is_empty() {
        return None;
    }
    let path = Path::new(trimmed);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        project_root.join(path)
    };
    let canonical = std::fs::canonicalize(&absolute).ok()?;
    let root = std::fs::canonicalize(project_root).ok()?;
    canonical.starts_with(&root).then_some(canonical)
}

/// Pull project-local file paths out of free text. Only paths that actually
/// resolve inside the project survive.
pub fn extract_project_files(text: &str, project_root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    for token in text.split_whitespace() {
        let trimmed = token.trim_matches(|c: char| ",.;:()[]<>".contains(c));
        if !trimmed.contains('/') {
            continue;
        }
        if let Some(resolved) = resolve_project_file(trimmed, project_root) {
            if resolved.is_file() && !files.contains(&resolved) {
                files.push(resolved);
            }
        }
    }
    files
}

/// Remove delivered file paths from the display text.
fn strip_paths(text: &str, files: &[PathBuf]) -> String {
    if files.is_empty() {
        return text.to_string();
    }
    let mut out = text.to_string();
    for file in files {
        out = out.replace(&file.display().to_string(), "");
    }
    out.lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

/// JSON body of `GET /runtime-status`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeStatus {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub instances: Vec<InstanceStatus>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceStatus {
    pub project_name: String,
    pub instance_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<AgentType>,
    pub pending_depth: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub oldest_stage: Option<crate::pending::TurnStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub latest_stage: Option<crate::pending::TurnStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_lifecycle_stage: Option<LifecycleStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_lifecycle_turn_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_lifecycle_seq: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_lifecycle_updated_at: Option<chrono::DateTime<chrono::Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_lifecycle_stale: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_progress_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ignored_event_counts: Option<HashMap<String, u64>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lifecycle_rejected_event_count: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::hooks::event::AgentEventPayload;
    use crate::routing::{RouteMemory, RouteResolver};
    use crate::testutil::{FakeMessaging, MemoryStateStore, MessagingCall, project_with};

    struct Fixture {
        messaging: Arc<FakeMessaging>,
        tracker: Arc<PendingTracker>,
        runtime: Arc<HookRuntime>,
    }

    fn fixture_with(mutate: impl FnOnce(&mut BridgeConfig), project_path: &str) -> Fixture {
        let mut config = BridgeConfig::default();
        mutate(&mut config);
        let messaging = FakeMessaging::discord();
        let tracker = PendingTracker::new(messaging.clone(), &config.pending);
        let store = MemoryStateStore::new().with_project(
            "demo",
            project_with(
                project_path,
                &[
                    ("codex-1", AgentType::Codex, Some("ch-1"), true),
                    ("scraped", AgentType::Gemini, Some("ch-2"), false),
                ],
            ),
        );
        let resolver = RouteResolver::new(store.clone(), RouteMemory::new());
        let runtime = HookRuntime::new(
            messaging.clone(),
            tracker.clone(),
            resolver,
            store,
            config.events.clone(),
            config.capture.long_output_thread_threshold,
        );
        Fixture {
            messaging,
            tracker,
            runtime,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(|_| {}, "/tmp/demo")
    }

    fn event(json: serde_json::Value) -> AgentEvent {
        serde_json::from_value::<AgentEventPayload>(json)
            .expect("payload")
            .validate()
            .expect("valid event")
    }

    fn key() -> InstanceKey {
        InstanceKey::new("demo", "codex-1")
    }

    async fn start_turn(f: &Fixture, turn_id: &str) {
        f.runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "codex",
                "instanceId": "codex-1",
                "type": "session.start",
                "turnId": turn_id,
            })))
            .await
            .expect("start ingests");
    }

    #[tokio::test]
    async fn final_with_empty_text_falls_back_to_transcript() {
        let f = fixture();
        f.tracker
            .mark_pending("demo", AgentType::Codex, Some("codex-1"), "ch-1", "t1", None)
            .await;

        start_turn(&f, "t1").await;
        for text in ["line one", "line two"] {
            let outcome = f
                .runtime
                .ingest(event(serde_json::json!({
                    "projectName": "demo",
                    "agentType": "codex",
                    "instanceId": "codex-1",
                    "type": "session.progress",
                    "turnId": "t1",
                    "text": text,
                })))
                .await
                .expect("progress ingests");
            assert_eq!(outcome, IngestOutcome::Processed);
        }
        // forward=off: nothing streamed yet.
        assert!(f.messaging.sent_texts().is_empty());

        f.runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "codex",
                "instanceId": "codex-1",
                "type": "session.final",
                "turnId": "t1",
                "text": "",
            })))
            .await
            .expect("final ingests");

        let sent = f.messaging.sent_texts();
        assert_eq!(sent.len(), 1, "exactly one outbound send: {sent:?}");
        assert_eq!(sent[0].0, "ch-1");
        assert!(sent[0].1.contains("line one") && sent[0].1.contains("line two"));
        assert_eq!(f.tracker.pending_depth(&key()), 0);
    }

    #[tokio::test]
    async fn duplicate_event_ids_produce_one_send_and_one_completion() {
        let f = fixture();
        f.tracker
            .mark_pending("demo", AgentType::Codex, Some("codex-1"), "ch-1", "t1", None)
            .await;
        start_turn(&f, "t1").await;

        let body = serde_json::json!({
            "projectName": "demo",
            "agentType": "codex",
            "instanceId": "codex-1",
            "eventId": "e1",
            "turnId": "t1",
            "type": "session.final",
            "text": "x",
        });
        let first = f.runtime.ingest(event(body.clone())).await.expect("first");
        let second = f.runtime.ingest(event(body)).await.expect("second");

        assert_eq!(first, IngestOutcome::Processed);
        assert_eq!(second, IngestOutcome::Duplicate);
        assert_eq!(f.messaging.sent_texts().len(), 1);
    }

    #[tokio::test]
    async fn out_of_order_seq_is_dropped() {
        let f = fixture();
        start_turn(&f, "t1").await;

        let outcome = f
            .runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "codex",
                "instanceId": "codex-1",
                "type": "session.final",
                "turnId": "t1",
                "seq": 2,
                "text": "new",
            })))
            .await
            .expect("seq 2");
        assert_eq!(outcome, IngestOutcome::Processed);

        let outcome = f
            .runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "codex",
                "instanceId": "codex-1",
                "type": "session.final",
                "turnId": "t1",
                "seq": 1,
                "text": "old",
            })))
            .await
            .expect("seq 1");
        assert_eq!(outcome, IngestOutcome::OutOfOrder);

        let sent = f.messaging.sent_texts();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("new"));

        let status = f.runtime.runtime_status();
        let instance = status
            .instances
            .iter()
            .find(|i| i.instance_id == "codex-1")
            .expect("instance status");
        assert_eq!(instance.event_lifecycle_seq, Some(2));
    }

    #[tokio::test]
    async fn events_for_capture_driven_instances_are_counted_and_dropped() {
        let f = fixture();
        let outcome = f
            .runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "gemini",
                "instanceId": "scraped",
                "type": "session.final",
                "text": "ignored",
            })))
            .await
            .expect("ingest");
        assert_eq!(outcome, IngestOutcome::Ignored);
        assert!(f.messaging.sent_texts().is_empty());

        let status = f.runtime.runtime_status();
        let instance = status
            .instances
            .iter()
            .find(|i| i.instance_id == "scraped")
            .expect("instance status");
        assert_eq!(
            instance
                .ignored_event_counts
                .as_ref()
                .and_then(|counts| counts.get("session.final")),
            Some(&1)
        );
    }

    #[tokio::test]
    async fn codex_poc_source_bypasses_the_capture_gate() {
        let f = fixture();
        let outcome = f
            .runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "gemini",
                "instanceId": "scraped",
                "type": "session.final",
                "source": "codex-poc",
                "text": "allowed",
            })))
            .await
            .expect("ingest");
        assert_eq!(outcome, IngestOutcome::Processed);
        assert_eq!(f.messaging.sent_texts().len(), 1);
    }

    #[tokio::test]
    async fn strict_reject_drops_events_without_start() {
        let f = fixture_with(
            |config| config.events.lifecycle_strict_mode = LifecycleStrictMode::Reject,
            "/tmp/demo",
        );

        let outcome = f
            .runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "codex",
                "instanceId": "codex-1",
                "type": "session.progress",
                "turnId": "t9",
                "text": "orphan",
            })))
            .await
            .expect("ingest");
        assert_eq!(outcome, IngestOutcome::LifecycleRejected);

        let status = f.runtime.runtime_status();
        let instance = status
            .instances
            .iter()
            .find(|i| i.instance_id == "codex-1")
            .expect("instance status");
        assert_eq!(instance.lifecycle_rejected_event_count, Some(1));
    }

    #[tokio::test]
    async fn unknown_project_is_a_client_error() {
        let f = fixture();
        let result = f
            .runtime
            .ingest(event(serde_json::json!({
                "projectName": "nope",
                "type": "session.start",
            })))
            .await;
        assert!(matches!(result, Err(EventError::UnknownProject(_))));
    }

    #[tokio::test]
    async fn channel_progress_streams_coalesced_blocks_by_size() {
        let f = fixture();
        start_turn(&f, "t1").await;

        // Override: channel mode, tiny block, so the second chunk flushes.
        for text in ["first part of the stream", "second part of the stream"] {
            f.runtime
                .ingest(event(serde_json::json!({
                    "projectName": "demo",
                    "agentType": "codex",
                    "instanceId": "codex-1",
                    "type": "session.progress",
                    "turnId": "t1",
                    "text": text,
                    "progressMode": "channel",
                    "progressBlockMaxChars": 30,
                })))
                .await
                .expect("progress");
        }

        let sent = f.messaging.sent_texts();
        assert_eq!(sent.len(), 1, "size flush emits one block: {sent:?}");
        assert!(sent[0].1.contains("first part"));
        assert!(sent[0].1.contains("second part"));
    }

    #[tokio::test]
    async fn codex_event_only_rewrites_channel_progress_to_thread() {
        let f = fixture_with(
            |config| config.events.codex_event_only = true,
            "/tmp/demo",
        );
        start_turn(&f, "t1").await;

        f.runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "codex",
                "instanceId": "codex-1",
                "type": "session.progress",
                "turnId": "t1",
                "text": "streaming into what would be the channel",
                "progressMode": "channel",
                "progressBlockMaxChars": 10,
            })))
            .await
            .expect("progress");

        let calls = f.messaging.calls();
        assert!(
            calls
                .iter()
                .any(|call| matches!(call, MessagingCall::CreateThread { .. })),
            "expected a progress thread, got {calls:?}"
        );
        let sent = f.messaging.sent_texts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "thread-of-ch-1");
    }

    #[tokio::test]
    async fn final_extracts_and_strips_project_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let file = dir.path().join("report.md");
        std::fs::write(&file, "# report").expect("write");
        let root = dir.path().to_string_lossy().into_owned();
        let f = fixture_with(|_| {}, &root);

        start_turn(&f, "t1").await;
        f.runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "codex",
                "instanceId": "codex-1",
                "type": "session.final",
                "turnId": "t1",
                "text": format!("wrote the summary to {}", file.display()),
            })))
            .await
            .expect("final");

        let sent = f.messaging.sent_texts();
        assert_eq!(sent.len(), 2, "display text plus file listing: {sent:?}");
        assert!(!sent[0].1.contains("report.md"), "path stripped from display");
        assert!(sent[1].1.contains("report.md"));
    }

    #[tokio::test]
    async fn error_event_sends_notice_and_marks_error() {
        let f = fixture();
        f.tracker
            .mark_pending("demo", AgentType::Codex, Some("codex-1"), "ch-1", "t1", None)
            .await;
        start_turn(&f, "t1").await;

        f.runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "codex",
                "instanceId": "codex-1",
                "type": "session.error",
                "turnId": "t1",
                "text": "compile failed",
            })))
            .await
            .expect("error");

        let sent = f.messaging.sent_texts();
        assert!(sent[0].1.contains("compile failed"));
        let terminal = f.tracker.last_terminal(&key()).expect("terminal");
        assert_eq!(terminal.stage, crate::pending::TurnStage::Error);
    }

    #[tokio::test]
    async fn send_files_validates_against_the_project_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let inside = dir.path().join("notes.txt");
        std::fs::write(&inside, "hi").expect("write");
        let root = dir.path().to_string_lossy().into_owned();
        let f = fixture_with(|_| {}, &root);

        let result = f.runtime.send_files("demo", None, None, &[]).await;
        assert!(matches!(result, Err(SendFilesError::NoFiles)));

        let result = f
            .runtime
            .send_files("demo", None, None, &["/etc/passwd".to_string()])
            .await;
        assert!(matches!(result, Err(SendFilesError::NoValidFiles)));

        let result = f
            .runtime
            .send_files("nope", None, None, &[inside.display().to_string()])
            .await;
        assert!(matches!(result, Err(SendFilesError::NotFound)));

        f.runtime
            .send_files(
                "demo",
                Some(AgentType::Codex),
                Some("codex-1"),
                &[inside.display().to_string()],
            )
            .await
            .expect("valid send-files");
        let sent = f.messaging.sent_texts();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.contains("notes.txt"));
    }

    #[tokio::test]
    async fn session_start_clears_residual_turn_state() {
        let f = fixture();
        start_turn(&f, "t1").await;
        f.runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "codex",
                "instanceId": "codex-1",
                "type": "session.progress",
                "turnId": "t1",
                "text": "stale progress",
            })))
            .await
            .expect("progress");

        // A new start for the same turn id wipes the transcript.
        start_turn(&f, "t1").await;
        f.runtime
            .ingest(event(serde_json::json!({
                "projectName": "demo",
                "agentType": "codex",
                "instanceId": "codex-1",
                "type": "session.final",
                "turnId": "t1",
                "text": "",
            })))
            .await
            .expect("final");

        // Empty text + empty transcript → nothing to send.
        assert!(f.messaging.sent_texts().is_empty());
    }
}
