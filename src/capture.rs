//! Capture poller: derives assistant output from periodic pane snapshots.
//!
//! Applies only to instances with `event_hook == false`. Each pass snapshots
//! every capture-driven pane, diffs it against the previous snapshot, filters
//! agent chrome and prompt echo out of the delta, and sends what remains to
//! the turn's output channel. Turns complete after a run of quiet polls.

use crate::config::CaptureConfig;
use crate::messaging::MessagingClientDyn;
use crate::messaging::split::split_message_non_empty;
use crate::mux::Multiplexer;
use crate::pending::PendingTracker;
use crate::routing::output_route;
use crate::state::StateStore;
use crate::{AgentType, InstanceKey, Platform};

use regex::Regex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use tokio::sync::watch;

/// Deltas longer than this that were not plain prefix extensions get clamped.
const DELTA_CLAMP_CHARS: usize = 4000;
/// Lines kept when clamping an oversized delta.
const DELTA_CLAMP_LINES: usize = 24;
/// Lines returned when no anchor line can be found.
const ANCHOR_FALLBACK_LINES: usize = 20;
/// Minimum overlap for the suffix/prefix strategy to count as a match.
const MIN_OVERLAP_CHARS: usize = 16;
/// Echo scan depth: single pending turn vs. a backlog.
const ECHO_SCAN_LINES: usize = 8;
const ECHO_SCAN_LINES_BACKLOG: usize = 2;
/// Minimum line length for containment-based echo matching.
const ECHO_MIN_LINE_CHARS: usize = 16;
const ECHO_MIN_LINE_CHARS_BACKLOG: usize = 48;

static ANSI_ESCAPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\x1b\[[0-9;?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)")
        .expect("hardcoded regex")
});

static CODEX_BOOTSTRAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^cd "[^"]*" && codex\b"#).expect("hardcoded regex"));

static CODEX_FOOTER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+% (context )?left( ·|$)").expect("hardcoded regex"));

/// A pane delta plus how it was derived.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delta {
    pub text: String,
    /// The current snapshot simply extended the previous one.
    pub prefix_extended: bool,
}

/// Strip ANSI sequences and carriage returns, trim line tails, drop trailing
/// blank lines.
pub fn clean_capture(raw: &str) -> String {
    let stripped = ANSI_ESCAPES.replace_all(raw, "");
    let without_cr = stripped.replace('\r', "");
    let mut lines: Vec<&str> = without_cr.lines().map(str::trim_end).collect();
    while lines.last().is_some_and(|line| line.is_empty()) {
        lines.pop();
    }
    lines.join("\n")
}

/// Longest suffix of `a` that is also a prefix of `b`, in bytes.
///
/// Shared by the pane differ and the progress-block merge so streamed text is
/// never repeated.
pub fn overlap_len(a: &str, b: &str) -> usize {
    let max = a.len().min(b.len());
    for k in (1..=max).rev() {
        if !a.is_char_boundary(a.len() - k) || !b.is_char_boundary(k) {
            continue;
        }
        if a[a.len() - k..] == b[..k] {
            return k;
        }
    }
    0
}

/// Compute the newly appended portion of `current` relative to `previous`.
///
/// Strategies in order: prefix extension, longest suffix/prefix overlap,
/// line anchor. A full-screen redraw whose anchor is the last line of
/// `current` yields an empty delta.
pub fn extract_delta(previous: &str, current: &str) -> Delta {
    if previous == current {
        return Delta {
            text: String::new(),
            prefix_extended: true,
        };
    }

    if let Some(suffix) = current.strip_prefix(previous) {
        return Delta {
            text: suffix.trim_start_matches('\n').to_string(),
            prefix_extended: true,
        };
    }

    let overlap = overlap_len(previous, current);
    if overlap >= MIN_OVERLAP_CHARS {
        return Delta {
            text: current[overlap..].trim_start_matches('\n').to_string(),
            prefix_extended: false,
        };
    }

    // Line anchor: find the most recent non-blank line of the previous
    // snapshot inside the current one.
    if let Some(anchor) = previous.lines().rev().find(|line| !line.trim().is_empty()) {
        if let Some(position) = current.rfind(anchor) {
            let after = &current[position + anchor.len()..];
            return Delta {
                text: after.trim_start_matches('\n').to_string(),
                prefix_extended: false,
            };
        }
    }

    let lines: Vec<&str> = current.lines().collect();
    let start = lines.len().saturating_sub(ANCHOR_FALLBACK_LINES);
    Delta {
        text: lines[start..].join("\n"),
        prefix_extended: false,
    }
}

/// Drop codex shell-bootstrap and HUD lines from a delta.
pub fn filter_codex_noise(delta: &str) -> String {
    delta
        .lines()
        .filter(|line| {
            let trimmed = line.trim();
            if trimmed.starts_with("export AGENT_DISCORD_") {
                return false;
            }
            if CODEX_BOOTSTRAP.is_match(trimmed) {
                return false;
            }
            if trimmed.contains("? for shortcuts") {
                return false;
            }
            if CODEX_FOOTER.is_match(trimmed) {
                return false;
            }
            true
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Clamp an oversized, non-prefix-extended delta to its last lines.
pub fn clamp_delta(delta: &Delta) -> String {
    if delta.prefix_extended || delta.text.chars().count() <= DELTA_CLAMP_CHARS {
        return delta.text.clone();
    }
    let lines: Vec<&str> = delta.text.lines().collect();
    let start = lines.len().saturating_sub(DELTA_CLAMP_LINES);
    lines[start..].join("\n")
}

fn collapse_ws(line: &str) -> String {
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Remove lines that are just the user's own prompt echoing in the pane.
///
/// Scans only the head of the delta and stops at the first line that reads as
/// structured agent output.
pub fn suppress_prompt_echo(delta: &str, prompt_tails: &[String], pending_depth: usize) -> String {
    if prompt_tails.is_empty() {
        return delta.to_string();
    }
    let (scan_limit, min_line_chars) = if pending_depth > 1 {
        (ECHO_SCAN_LINES_BACKLOG, ECHO_MIN_LINE_CHARS_BACKLOG)
    } else {
        (ECHO_SCAN_LINES, ECHO_MIN_LINE_CHARS)
    };

    let mut kept: Vec<&str> = Vec::new();
    for (index, line) in delta.lines().enumerate() {
        if index >= scan_limit {
            kept.extend(delta.lines().skip(index));
            break;
        }
        let normalized = collapse_ws(line);
        let lowered = normalized.to_lowercase();
        if lowered.starts_with("assistant:")
            || lowered.starts_with("system:")
            || lowered.starts_with("user:")
        {
            kept.extend(delta.lines().skip(index));
            break;
        }
        let is_echo = !normalized.is_empty()
            && prompt_tails.iter().any(|tail| {
                normalized == *tail
                    || (normalized.chars().count() >= min_line_chars && tail.contains(&normalized))
            });
        if !is_echo {
            kept.push(line);
        }
    }
    kept.join("\n")
}

#[derive(Debug, Default)]
struct PaneState {
    last_snapshot: String,
    quiet_polls: u32,
    /// The current turn has produced output; quiet completion uses the
    /// normal threshold once this is set.
    emitted_output: bool,
    /// Polls spent echo-filtering the current turn.
    echo_polls: u32,
}

/// Periodic pane poller. One pass runs at a time; an overlapping pass is
/// skipped.
pub struct CapturePoller {
    mux: Arc<dyn Multiplexer>,
    messaging: Arc<dyn MessagingClientDyn>,
    tracker: Arc<PendingTracker>,
    store: Arc<dyn StateStore>,
    config: CaptureConfig,
    panes: Mutex<HashMap<InstanceKey, PaneState>>,
    running: AtomicBool,
}

impl CapturePoller {
    pub fn new(
        mux: Arc<dyn Multiplexer>,
        messaging: Arc<dyn MessagingClientDyn>,
        tracker: Arc<PendingTracker>,
        store: Arc<dyn StateStore>,
        config: CaptureConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            mux,
            messaging,
            tracker,
            store,
            config,
            panes: Mutex::new(HashMap::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Spawn the polling loop. Stops when `shutdown` flips to true.
    pub fn spawn(self: &Arc<Self>, mut shutdown: watch::Receiver<bool>) -> tokio::task::JoinHandle<()> {
        let poller = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poller.config.poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => {
                        poller.poll_once().await;
                    }
                }
            }
        })
    }

    /// Run one full pass over all capture-driven instances.
    pub async fn poll_once(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }

        let projects = self.store.projects();
        for (project_name, project) in &projects {
            for (instance_id, instance) in &project.instances {
                if instance.event_hook {
                    continue;
                }
                self.poll_instance(
                    project_name,
                    &project.mux_session,
                    instance_id,
                    instance.agent_type,
                    instance.channel_id.as_deref(),
                    &instance.window,
                )
                .await;
            }
        }

        // Drop pane state for instances that no longer exist.
        {
            let mut panes = self.panes.lock().expect("pane state");
            panes.retain(|key, _| {
                projects
                    .get(&key.project)
                    .is_some_and(|project| project.instances.contains_key(&key.instance_id))
            });
        }

        self.running.store(false, Ordering::SeqCst);
    }

    async fn poll_instance(
        &self,
        project_name: &str,
        mux_session: &str,
        instance_id: &str,
        agent_type: AgentType,
        default_channel: Option<&str>,
        window: &str,
    ) {
        let key = InstanceKey::new(project_name, instance_id);

        let raw = match self.mux.capture_pane(mux_session, window).await {
            Ok(raw) => raw,
            Err(error) => {
                tracing::debug!(%error, %key, "capture failed, skipping instance");
                return;
            }
        };
        let cleaned = clean_capture(&raw);

        // First sighting establishes the baseline without emitting anything.
        let previous = {
            let mut panes = self.panes.lock().expect("pane state");
            match panes.get_mut(&key) {
                None => {
                    panes.insert(
                        key.clone(),
                        PaneState {
                            last_snapshot: cleaned,
                            ..PaneState::default()
                        },
                    );
                    return;
                }
                Some(pane) => {
                    if cleaned.is_empty() {
                        // An empty pane is quiet, not a new baseline.
                        pane.last_snapshot.clone()
                    } else {
                        std::mem::replace(&mut pane.last_snapshot, cleaned.clone())
                    }
                }
            }
        };

        if cleaned.is_empty() {
            self.quiet_cycle(&key, agent_type).await;
            return;
        }

        let delta = extract_delta(&previous, &cleaned);
        if delta.text.trim().is_empty() {
            self.quiet_cycle(&key, agent_type).await;
            return;
        }

        let mut text = if agent_type == AgentType::Codex {
            filter_codex_noise(&clamp_delta(&delta))
        } else {
            delta.text.clone()
        };

        let pending_depth = self.tracker.pending_depth(&key);

        // Prompt-echo suppression (codex only).
        if agent_type == AgentType::Codex && pending_depth > 0 && self.config.filter_prompt_echo {
            let echo_polls = {
                let mut panes = self.panes.lock().expect("pane state");
                let pane = panes.entry(key.clone()).or_default();
                pane.echo_polls += 1;
                pane.echo_polls
            };
            let still_filtering = self
                .config
                .prompt_echo_max_polls
                .map(|max| echo_polls <= max)
                .unwrap_or(true);
            if still_filtering {
                let tails = self.tracker.pending_prompt_tails(&key);
                text = suppress_prompt_echo(&text, &tails, pending_depth);
            }
        }

        if text.trim().is_empty() {
            // Everything was suppressed as echo: activity, but nothing to say.
            let mut panes = self.panes.lock().expect("pane state");
            if let Some(pane) = panes.get_mut(&key) {
                pane.quiet_polls = 0;
            }
            return;
        }

        let pending_channel = self.tracker.pending_channel(&key);
        let Some(channel) = output_route(default_channel, pending_channel.as_deref(), pending_depth)
        else {
            tracing::debug!(%key, "no output channel for delta, dropping");
            return;
        };

        let sent = self.deliver(&channel, &text).await;
        if sent {
            let mut panes = self.panes.lock().expect("pane state");
            if let Some(pane) = panes.get_mut(&key) {
                pane.quiet_polls = 0;
                pane.emitted_output = true;
            }
        }
    }

    /// Send a delta, threading long output on Discord. Returns whether any
    /// chunk made it out.
    async fn deliver(&self, channel: &str, text: &str) -> bool {
        if self.messaging.platform() == Platform::Discord
            && self.messaging.supports_threads()
            && text.len() >= self.config.long_output_thread_threshold
        {
            let summary = summary_line(text);
            match self.messaging.send_long(channel, &summary, text).await {
                Ok(()) => return true,
                Err(error) => {
                    tracing::warn!(%error, %channel, "long-output send failed");
                    return false;
                }
            }
        }

        // Attempt every chunk even when one fails; the turn resolves on the
        // last observed outcome.
        let mut any_ok = false;
        for chunk in split_message_non_empty(text, self.messaging.max_message_len()) {
            match self.messaging.send(channel, &chunk).await {
                Ok(()) => any_ok = true,
                Err(error) => {
                    tracing::warn!(%error, %channel, "capture chunk send failed");
                }
            }
        }
        any_ok
    }

    /// Handle a cycle that produced no output for an instance.
    async fn quiet_cycle(&self, key: &InstanceKey, agent_type: AgentType) {
        let pending_depth = self.tracker.pending_depth(key);
        if pending_depth == 0 {
            let mut panes = self.panes.lock().expect("pane state");
            if let Some(pane) = panes.get_mut(key) {
                pane.quiet_polls = 0;
                pane.emitted_output = false;
                pane.echo_polls = 0;
            }
            return;
        }

        let complete = {
            let mut panes = self.panes.lock().expect("pane state");
            let pane = panes.entry(key.clone()).or_default();
            pane.quiet_polls += 1;
            let threshold = if agent_type == AgentType::Codex && !pane.emitted_output {
                self.config.codex_initial_quiet_pending_polls
            } else {
                self.config.quiet_pending_polls
            };
            if pane.quiet_polls >= threshold {
                pane.quiet_polls = 0;
                pane.emitted_output = false;
                pane.echo_polls = 0;
                true
            } else {
                false
            }
        };

        if complete {
            self.tracker
                .mark_completed(&key.project, agent_type, Some(&key.instance_id))
                .await;
        }
    }
}

/// First line of a delta, shortened for a thread title.
fn summary_line(text: &str) -> String {
    let first = text.lines().find(|line| !line.trim().is_empty()).unwrap_or("output");
    crate::truncate_chars(first.trim(), 80).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BridgeConfig;
    use crate::pending::TurnStage;
    use crate::testutil::{FakeMessaging, FakeMux, MemoryStateStore, MessagingCall, project_with};
    use indoc::indoc;

    // -- pure delta extraction --

    #[test]
    fn prefix_extension_yields_suffix() {
        let delta = extract_delta("boot line", "boot line\nanswer from codex");
        assert_eq!(delta.text, "answer from codex");
        assert!(delta.prefix_extended);
    }

    #[test]
    fn identical_snapshots_yield_empty_delta() {
        let delta = extract_delta("same", "same");
        assert!(delta.text.is_empty());
        assert!(delta.prefix_extended);
    }

    #[test]
    fn scrolled_pane_uses_suffix_prefix_overlap() {
        let previous = "line one is long enough\nline two is long enough";
        let current = "line two is long enough\nline three appears";
        let delta = extract_delta(previous, current);
        assert_eq!(delta.text, "line three appears");
        assert!(!delta.prefix_extended);
    }

    #[test]
    fn anchor_at_last_line_of_current_means_empty_delta() {
        // Full-screen redraw where the previous tail is now the final line.
        let previous = "a\nthe anchor line";
        let current = "completely new chrome\nthe anchor line";
        let delta = extract_delta(previous, current);
        assert!(delta.text.is_empty());
    }

    #[test]
    fn missing_anchor_falls_back_to_last_twenty_lines() {
        let previous = "gone entirely";
        let current = (0..30).map(|i| format!("l{i}")).collect::<Vec<_>>().join("\n");
        let delta = extract_delta(previous, &current);
        assert_eq!(delta.text.lines().count(), 20);
        assert!(delta.text.starts_with("l10"));
    }

    #[test]
    fn clean_capture_strips_ansi_and_trailing_blanks() {
        let raw = "\x1b[31mred\x1b[0m line\r\nnext\n\n\n";
        assert_eq!(clean_capture(raw), "red line\nnext");
    }

    #[test]
    fn overlap_len_finds_longest_shared_run() {
        assert_eq!(overlap_len("abcdef", "defxyz"), 3);
        assert_eq!(overlap_len("abc", "xyz"), 0);
        assert_eq!(overlap_len("abc", "abc"), 3);
    }

    #[test]
    fn codex_noise_lines_are_dropped() {
        let delta = indoc! {r#"
            export AGENT_DISCORD_HOOK_PORT=48620
            cd "/home/u/demo" && codex
            real output survives
            ? for shortcuts   62% context left
            gpt-5-codex 37% left · ~/demo
        "#};
        assert_eq!(filter_codex_noise(delta.trim()), "real output survives");
    }

    #[test]
    fn oversized_non_prefix_delta_clamps_to_last_lines() {
        let lines: Vec<String> = (0..60).map(|i| format!("line {i} {}", "x".repeat(90))).collect();
        let delta = Delta {
            text: lines.join("\n"),
            prefix_extended: false,
        };
        let clamped = clamp_delta(&delta);
        assert_eq!(clamped.lines().count(), 24);

        let extended = Delta {
            prefix_extended: true,
            ..delta
        };
        assert_eq!(clamp_delta(&extended).lines().count(), 60);
    }

    #[test]
    fn prompt_echo_lines_are_suppressed() {
        let tail = crate::pending::prompt_tail("please fix the parser bug in the tokenizer");
        let delta = "please fix the parser bug in the tokenizer\nworking on it";
        let filtered = suppress_prompt_echo(delta, &[tail], 1);
        assert_eq!(filtered, "working on it");
    }

    #[test]
    fn echo_scan_stops_at_structured_output() {
        let tail = crate::pending::prompt_tail("assistant: hello there friend of mine");
        let delta = "assistant: hello there friend of mine";
        let filtered = suppress_prompt_echo(delta, &[tail], 1);
        assert_eq!(filtered, delta, "lines after the marker are never dropped");
    }

    #[test]
    fn short_lines_need_exact_match_to_be_echo() {
        let tails = vec!["the quick brown fox jumps over the lazy dog".to_string()];
        // Contained but under the 16-char containment floor: kept.
        let filtered = suppress_prompt_echo("quick brown", &tails, 1);
        assert_eq!(filtered, "quick brown");
        // Contained and long enough: dropped.
        let filtered = suppress_prompt_echo("quick brown fox jumps over", &tails, 1);
        assert!(filtered.is_empty());
    }

    // -- poller scenarios --

    struct Fixture {
        mux: Arc<FakeMux>,
        messaging: Arc<FakeMessaging>,
        tracker: Arc<crate::pending::PendingTracker>,
        poller: Arc<CapturePoller>,
    }

    fn fixture(agent_type: AgentType) -> Fixture {
        let config = BridgeConfig::default();
        let mux = FakeMux::new();
        let messaging = FakeMessaging::discord();
        let tracker =
            crate::pending::PendingTracker::new(messaging.clone(), &config.pending);
        let store = MemoryStateStore::new().with_project(
            "demo",
            project_with("/tmp/demo", &[("agent-1", agent_type, Some("ch-1"), false)]),
        );
        let poller = CapturePoller::new(
            mux.clone(),
            messaging.clone(),
            tracker.clone(),
            store,
            config.capture,
        );
        Fixture {
            mux,
            messaging,
            tracker,
            poller,
        }
    }

    fn key() -> InstanceKey {
        InstanceKey::new("demo", "agent-1")
    }

    #[tokio::test]
    async fn capture_happy_path_sends_delta_to_default_channel() {
        let f = fixture(AgentType::Codex);
        f.mux.push_capture("boot line");
        f.mux.push_capture("boot line\nanswer from codex");

        f.poller.poll_once().await; // establishes baseline
        f.poller.poll_once().await;

        assert_eq!(
            f.messaging.sent_texts(),
            vec![("ch-1".to_string(), "answer from codex".to_string())]
        );
        assert!(f.tracker.last_terminal(&key()).is_none());
    }

    #[tokio::test]
    async fn pending_turn_routes_output_and_completes_after_quiet_polls() {
        let f = fixture(AgentType::Claude);
        f.tracker
            .mark_pending("demo", AgentType::Claude, Some("agent-1"), "thread-ch", "m1", None)
            .await;

        f.mux.push_capture("base");
        f.mux.push_capture("base\nfirst chunk");
        f.mux.push_capture("base\nfirst chunk\nsecond chunk");
        // Captures repeat the last snapshot from here on: quiet cycles.

        f.poller.poll_once().await; // baseline
        f.poller.poll_once().await; // first chunk
        f.poller.poll_once().await; // second chunk
        assert_eq!(
            f.messaging.sent_texts(),
            vec![
                ("thread-ch".to_string(), "first chunk".to_string()),
                ("thread-ch".to_string(), "second chunk".to_string()),
            ]
        );
        assert!(f.tracker.last_terminal(&key()).is_none());

        f.poller.poll_once().await; // quiet 1
        assert!(f.tracker.last_terminal(&key()).is_none());
        f.poller.poll_once().await; // quiet 2 → complete
        let terminal = f.tracker.last_terminal(&key()).expect("turn completed");
        assert_eq!(terminal.stage, TurnStage::Completed);
        assert_eq!(f.tracker.pending_depth(&key()), 0);
    }

    #[tokio::test]
    async fn codex_without_output_waits_for_the_initial_threshold() {
        let f = fixture(AgentType::Codex);
        f.tracker
            .mark_pending("demo", AgentType::Codex, Some("agent-1"), "ch-1", "m1", None)
            .await;

        f.mux.push_capture("base");
        f.poller.poll_once().await; // baseline

        // 11 quiet polls: still pending (initial threshold is 12).
        for _ in 0..11 {
            f.poller.poll_once().await;
        }
        assert_eq!(f.tracker.pending_depth(&key()), 1);

        f.poller.poll_once().await; // 12th quiet poll
        assert_eq!(f.tracker.pending_depth(&key()), 0);
    }

    #[tokio::test]
    async fn all_echo_delta_sends_nothing_and_resets_quiet_counter() {
        let f = fixture(AgentType::Codex);
        let prompt = "please fix the parser bug in the tokenizer module";
        f.tracker
            .mark_pending(
                "demo",
                AgentType::Codex,
                Some("agent-1"),
                "ch-1",
                "m1",
                Some(prompt),
            )
            .await;

        f.mux.push_capture("base");
        f.mux.push_capture(format!("base\n{prompt}"));

        f.poller.poll_once().await; // baseline
        f.poller.poll_once().await; // echo-only delta

        assert!(f.messaging.sent_texts().is_empty());
        assert_eq!(f.tracker.pending_depth(&key()), 1, "turn still pending");
    }

    #[tokio::test]
    async fn long_output_goes_to_a_thread_on_discord() {
        let f = fixture(AgentType::Claude);
        let big = "a".repeat(2500);
        f.mux.push_capture("base");
        f.mux.push_capture(format!("base\n{big}"));

        f.poller.poll_once().await;
        f.poller.poll_once().await;

        let calls = f.messaging.calls();
        assert!(
            calls
                .iter()
                .any(|call| matches!(call, MessagingCall::SendLong { channel_id, .. } if channel_id == "ch-1")),
            "expected a long-output thread send, got {calls:?}"
        );
        assert!(f.messaging.sent_texts().is_empty());
    }

    #[tokio::test]
    async fn capture_failure_skips_the_instance() {
        let f = fixture(AgentType::Codex);
        *f.mux.pane_missing.lock().expect("pane lock") = true;
        f.poller.poll_once().await;
        assert!(f.messaging.calls().is_empty());
    }
}
