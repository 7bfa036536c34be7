//! Configuration loading and validation.
//!
//! Every runtime knob is an `AGENT_DISCORD_*` environment variable with a
//! baked-in default. Values are read once at startup; `BridgeConfig` is
//! cheap to clone and shared by value with every component.

use crate::Platform;
use crate::error::{ConfigError, Result};

use std::time::Duration;

/// Policy for events that arrive without a preceding `session.start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LifecycleStrictMode {
    Off,
    Warn,
    Reject,
}

impl LifecycleStrictMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(LifecycleStrictMode::Off),
            "warn" => Some(LifecycleStrictMode::Warn),
            "reject" => Some(LifecycleStrictMode::Reject),
            _ => None,
        }
    }
}

/// Where `session.progress` text is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    Off,
    Thread,
    Channel,
}

impl ProgressMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "off" => Some(ProgressMode::Off),
            "thread" => Some(ProgressMode::Thread),
            "channel" => Some(ProgressMode::Channel),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProgressMode::Off => "off",
            ProgressMode::Thread => "thread",
            ProgressMode::Channel => "channel",
        }
    }
}

/// Bridge daemon configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Loopback port for the agent hook server.
    pub hook_port: u16,

    /// Discord bot token, when the Discord adapter should start.
    pub discord_token: Option<String>,
    /// Slack bot token (xoxb-) for the Slack adapter.
    pub slack_bot_token: Option<String>,
    /// Slack app token (xapp-) for Socket Mode.
    pub slack_app_token: Option<String>,

    pub capture: CaptureConfig,
    pub dispatch: DispatchConfig,
    pub events: EventConfig,
    pub pending: PendingConfig,
}

/// Capture poller knobs.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Poll interval. Clamped to a 250 ms floor.
    pub poll_interval: Duration,
    /// Quiet cycles before a pending turn is marked complete.
    pub quiet_pending_polls: u32,
    /// Larger initial threshold for codex, applied until the turn has
    /// produced any output.
    pub codex_initial_quiet_pending_polls: u32,
    /// Whether prompt-echo lines are filtered out of codex deltas.
    pub filter_prompt_echo: bool,
    /// Stop echo-filtering after this many polls of one turn (None = always).
    pub prompt_echo_max_polls: Option<u32>,
    /// Default line count for `/snapshot`.
    pub snapshot_default_lines: usize,
    /// Hard cap for `/snapshot <n>`.
    pub snapshot_max_lines: usize,
    /// Payloads at or above this many chars go to a long-output thread on
    /// Discord. Clamped to [1200, 20000]; legacy configs up to 100000 are
    /// accepted and clamped rather than rejected.
    pub long_output_thread_threshold: usize,
}

/// Keystroke dispatch knobs.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    pub codex_submit_delay: Duration,
    pub opencode_submit_delay: Duration,
    /// Prompt length at which codex gets a follow-up Enter.
    pub codex_long_prompt_reenter_threshold: usize,
    pub codex_long_prompt_reenter_delay: Duration,
    /// tmux send-keys payload boundary.
    pub tmux_send_keys_chunk_size: usize,
}

/// Event hook server knobs.
#[derive(Debug, Clone)]
pub struct EventConfig {
    pub progress_forward: ProgressMode,
    pub progress_block_streaming: bool,
    pub progress_block_window: Duration,
    pub progress_block_max_chars: usize,
    pub transcript_max_chars: usize,
    pub final_from_progress_on_empty: bool,
    pub dedupe_retention: Duration,
    pub dedupe_max_entries: usize,
    pub seq_retention: Duration,
    pub seq_max_entries: usize,
    pub lifecycle_stale_after: Duration,
    pub lifecycle_strict_mode: LifecycleStrictMode,
    pub ignored_event_retention: Duration,
    /// Force event-only codex sessions to keep progress out of the channel.
    pub codex_event_only: bool,
}

/// Pending tracker knobs.
#[derive(Debug, Clone)]
pub struct PendingConfig {
    /// How long a turn may stay pending before the stuck alert fires.
    pub stuck_alert_after: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None).expect("defaults are valid")
    }
}

impl BridgeConfig {
    /// Load configuration from the process environment.
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unset keys take their
    /// defaults; set keys that fail to parse are an error rather than a
    /// silent fallback.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let env = Env { lookup: &lookup };

        let capture = CaptureConfig {
            poll_interval: Duration::from_millis(
                env.u64("AGENT_DISCORD_CAPTURE_POLL_MS", 3000)?.max(250),
            ),
            quiet_pending_polls: env.u32("AGENT_DISCORD_CAPTURE_PENDING_QUIET_POLLS", 2)?,
            codex_initial_quiet_pending_polls: env
                .u32("AGENT_DISCORD_CAPTURE_PENDING_INITIAL_QUIET_POLLS_CODEX", 12)?,
            filter_prompt_echo: env.bool("AGENT_DISCORD_CAPTURE_FILTER_PROMPT_ECHO", true)?,
            prompt_echo_max_polls: env.opt_u32("AGENT_DISCORD_CAPTURE_PROMPT_ECHO_MAX_POLLS")?,
            snapshot_default_lines: env.usize("AGENT_DISCORD_SNAPSHOT_LINES", 30)?,
            snapshot_max_lines: env.usize("AGENT_DISCORD_SNAPSHOT_MAX_LINES", 120)?,
            long_output_thread_threshold: env
                .usize("AGENT_DISCORD_LONG_OUTPUT_THREAD_THRESHOLD", 2000)?
                .clamp(1200, 20_000),
        };

        let dispatch = DispatchConfig {
            codex_submit_delay: Duration::from_millis(
                env.u64("AGENT_DISCORD_CODEX_SUBMIT_DELAY_MS", 75)?,
            ),
            opencode_submit_delay: Duration::from_millis(
                env.u64("AGENT_DISCORD_OPENCODE_SUBMIT_DELAY_MS", 75)?,
            ),
            codex_long_prompt_reenter_threshold: env
                .usize("AGENT_DISCORD_CODEX_LONG_PROMPT_REENTER_THRESHOLD", 3500)?,
            codex_long_prompt_reenter_delay: Duration::from_millis(
                env.u64("AGENT_DISCORD_CODEX_LONG_PROMPT_REENTER_DELAY_MS", 120)?,
            ),
            tmux_send_keys_chunk_size: env
                .usize("AGENT_DISCORD_TMUX_SEND_KEYS_CHUNK_SIZE", 2000)?
                .max(1),
        };

        let events = EventConfig {
            progress_forward: env.parse_with(
                "AGENT_DISCORD_EVENT_PROGRESS_FORWARD",
                ProgressMode::Off,
                ProgressMode::parse,
            )?,
            progress_block_streaming: env
                .bool("AGENT_DISCORD_EVENT_PROGRESS_BLOCK_STREAMING", true)?,
            progress_block_window: Duration::from_millis(
                env.u64("AGENT_DISCORD_EVENT_PROGRESS_BLOCK_WINDOW_MS", 450)?,
            ),
            progress_block_max_chars: env
                .usize("AGENT_DISCORD_EVENT_PROGRESS_BLOCK_MAX_CHARS", 1800)?,
            transcript_max_chars: env
                .usize("AGENT_DISCORD_EVENT_PROGRESS_TRANSCRIPT_MAX_CHARS", 24_000)?,
            final_from_progress_on_empty: env
                .bool("AGENT_DISCORD_EVENT_FINAL_FROM_PROGRESS_ON_EMPTY", true)?,
            dedupe_retention: Duration::from_millis(
                env.u64("AGENT_DISCORD_EVENT_DEDUPE_RETENTION_MS", 600_000)?,
            ),
            dedupe_max_entries: env.usize("AGENT_DISCORD_EVENT_DEDUPE_MAX", 50_000)?,
            seq_retention: Duration::from_millis(
                env.u64("AGENT_DISCORD_EVENT_SEQ_RETENTION_MS", 1_800_000)?,
            ),
            seq_max_entries: env.usize("AGENT_DISCORD_EVENT_SEQ_MAX", 100_000)?,
            lifecycle_stale_after: Duration::from_millis(
                env.u64("AGENT_DISCORD_EVENT_LIFECYCLE_STALE_MS", 120_000)?,
            ),
            lifecycle_strict_mode: env.parse_with(
                "AGENT_DISCORD_EVENT_LIFECYCLE_STRICT_MODE",
                LifecycleStrictMode::Off,
                LifecycleStrictMode::parse,
            )?,
            ignored_event_retention: Duration::from_millis(
                env.u64("AGENT_DISCORD_IGNORED_EVENT_RETENTION_MS", 86_400_000)?,
            ),
            codex_event_only: env.bool("AGENT_DISCORD_CODEX_EVENT_ONLY", false)?,
        };

        let pending = PendingConfig {
            stuck_alert_after: Duration::from_millis(
                env.u64("AGENT_DISCORD_PENDING_ALERT_MS", 45_000)?,
            ),
        };

        Ok(Self {
            hook_port: env.u16("AGENT_DISCORD_HOOK_PORT", 48620)?,
            discord_token: env.string("DISCORD_BOT_TOKEN"),
            slack_bot_token: env.string("SLACK_BOT_TOKEN"),
            slack_app_token: env.string("SLACK_APP_TOKEN"),
            capture,
            dispatch,
            events,
            pending,
        })
    }

    /// Pick the platform to start, Discord first.
    pub fn platform(&self) -> Result<Platform> {
        if self.discord_token.is_some() {
            Ok(Platform::Discord)
        } else if self.slack_bot_token.is_some() && self.slack_app_token.is_some() {
            Ok(Platform::Slack)
        } else {
            Err(ConfigError::Invalid(
                "no chat platform configured. Set DISCORD_BOT_TOKEN, or SLACK_BOT_TOKEN and SLACK_APP_TOKEN.".into(),
            )
            .into())
        }
    }
}

struct Env<'a> {
    lookup: &'a dyn Fn(&str) -> Option<String>,
}

impl Env<'_> {
    fn string(&self, key: &str) -> Option<String> {
        (self.lookup)(key).filter(|value| !value.trim().is_empty())
    }

    fn u64(&self, key: &str, default: u64) -> Result<u64> {
        self.parse_with(key, default, |value| value.parse().ok())
    }

    fn u32(&self, key: &str, default: u32) -> Result<u32> {
        self.parse_with(key, default, |value| value.parse().ok())
    }

    fn u16(&self, key: &str, default: u16) -> Result<u16> {
        self.parse_with(key, default, |value| value.parse().ok())
    }

    fn usize(&self, key: &str, default: usize) -> Result<usize> {
        self.parse_with(key, default, |value| value.parse().ok())
    }

    fn opt_u32(&self, key: &str) -> Result<Option<u32>> {
        match self.string(key) {
            None => Ok(None),
            Some(raw) => raw
                .trim()
                .parse()
                .map(Some)
                .map_err(|_| invalid(key, &raw)),
        }
    }

    fn bool(&self, key: &str, default: bool) -> Result<bool> {
        self.parse_with(key, default, |value| {
            match value.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Some(true),
                "0" | "false" | "no" | "off" => Some(false),
                _ => None,
            }
        })
    }

    fn parse_with<T>(
        &self,
        key: &str,
        default: T,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Result<T> {
        match self.string(key) {
            None => Ok(default),
            Some(raw) => parse(raw.trim()).ok_or_else(|| invalid(key, &raw)),
        }
    }
}

fn invalid(key: &str, value: &str) -> crate::Error {
    ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
    .into()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)]) -> BridgeConfig {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        BridgeConfig::from_lookup(|key| map.get(key).cloned()).expect("config should parse")
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = BridgeConfig::default();
        assert_eq!(config.capture.poll_interval, Duration::from_millis(3000));
        assert_eq!(config.capture.quiet_pending_polls, 2);
        assert_eq!(config.capture.codex_initial_quiet_pending_polls, 12);
        assert!(config.capture.filter_prompt_echo);
        assert_eq!(config.capture.long_output_thread_threshold, 2000);
        assert_eq!(config.dispatch.codex_long_prompt_reenter_threshold, 3500);
        assert_eq!(config.dispatch.tmux_send_keys_chunk_size, 2000);
        assert_eq!(config.events.progress_forward, ProgressMode::Off);
        assert_eq!(config.events.progress_block_max_chars, 1800);
        assert_eq!(
            config.events.lifecycle_strict_mode,
            LifecycleStrictMode::Off
        );
        assert_eq!(config.pending.stuck_alert_after, Duration::from_secs(45));
    }

    #[test]
    fn poll_interval_clamps_to_floor() {
        let config = config_with(&[("AGENT_DISCORD_CAPTURE_POLL_MS", "50")]);
        assert_eq!(config.capture.poll_interval, Duration::from_millis(250));
    }

    #[test]
    fn legacy_long_output_threshold_is_clamped_not_rejected() {
        let config = config_with(&[("AGENT_DISCORD_LONG_OUTPUT_THREAD_THRESHOLD", "100000")]);
        assert_eq!(config.capture.long_output_thread_threshold, 20_000);

        let config = config_with(&[("AGENT_DISCORD_LONG_OUTPUT_THREAD_THRESHOLD", "500")]);
        assert_eq!(config.capture.long_output_thread_threshold, 1200);
    }

    #[test]
    fn invalid_values_error_instead_of_falling_back() {
        let map: HashMap<String, String> = [(
            "AGENT_DISCORD_CAPTURE_POLL_MS".to_string(),
            "soon".to_string(),
        )]
        .into();
        let result = BridgeConfig::from_lookup(|key| map.get(key).cloned());
        assert!(result.is_err());
    }

    #[test]
    fn codex_event_only_accepts_numeric_flag() {
        let config = config_with(&[("AGENT_DISCORD_CODEX_EVENT_ONLY", "1")]);
        assert!(config.events.codex_event_only);
    }

    #[test]
    fn platform_prefers_discord() {
        let config = config_with(&[
            ("DISCORD_BOT_TOKEN", "token"),
            ("SLACK_BOT_TOKEN", "xoxb"),
            ("SLACK_APP_TOKEN", "xapp"),
        ]);
        assert_eq!(config.platform().expect("platform"), Platform::Discord);
    }

    #[test]
    fn platform_requires_both_slack_tokens() {
        let config = config_with(&[("SLACK_BOT_TOKEN", "xoxb")]);
        assert!(config.platform().is_err());
    }
}
