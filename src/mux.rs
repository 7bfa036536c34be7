//! Terminal multiplexer port and the tmux implementation.

use crate::error::{MuxError, Result};

use async_trait::async_trait;
use tokio::process::Command;

/// Special keys the router can inject into a pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Key {
    Enter,
    Tab,
    Escape,
    Up,
    Down,
}

impl Key {
    /// tmux key name.
    pub fn as_str(self) -> &'static str {
        match self {
            Key::Enter => "Enter",
            Key::Tab => "Tab",
            Key::Escape => "Escape",
            Key::Up => "Up",
            Key::Down => "Down",
        }
    }
}

/// Result of typing literal text into a pane.
#[derive(Debug, Clone, Copy)]
pub struct SendOutcome {
    /// How many send-keys payload chunks the text was split into.
    pub chunks: usize,
}

/// Keystroke and pane access for one multiplexer backend.
///
/// Implementations must be safe for concurrent calls; the bridge does not
/// serialize them beyond per-instance dispatch ordering.
#[async_trait]
pub trait Multiplexer: Send + Sync + 'static {
    /// Type literal text into the pane without submitting it.
    async fn send_text(&self, session: &str, window: &str, text: &str) -> Result<SendOutcome>;

    /// Press a special key.
    async fn send_key(&self, session: &str, window: &str, key: Key) -> Result<()>;

    /// Press a special key `count` times.
    async fn send_key_times(
        &self,
        session: &str,
        window: &str,
        key: Key,
        count: u8,
    ) -> Result<()> {
        for _ in 0..count {
            self.send_key(session, window, key).await?;
        }
        Ok(())
    }

    /// Type text and submit it in one multiplexer invocation.
    async fn send_line(&self, session: &str, window: &str, text: &str) -> Result<()>;

    /// Snapshot the visible pane contents.
    async fn capture_pane(&self, session: &str, window: &str) -> Result<String>;

    /// The pane's current foreground command (e.g. `zsh`, `codex`).
    async fn foreground_command(&self, session: &str, window: &str) -> Result<String>;

    /// Kill the instance's window.
    async fn kill_window(&self, session: &str, window: &str) -> Result<()>;
}

/// Shells out to the `tmux` binary.
pub struct TmuxMultiplexer {
    tmux_bin: String,
    chunk_size: usize,
}

impl TmuxMultiplexer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            tmux_bin: "tmux".to_string(),
            chunk_size: chunk_size.max(1),
        }
    }

    fn target(session: &str, window: &str) -> String {
        format!("{session}:{window}")
    }

    async fn run(&self, target: &str, args: &[&str]) -> Result<String> {
        let output = Command::new(&self.tmux_bin)
            .args(args)
            .output()
            .await
            .map_err(|error| MuxError::Invocation(error.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(MuxError::from_tmux_stderr(
                target,
                &output.status.to_string(),
                &stderr,
            )
            .into());
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[async_trait]
impl Multiplexer for TmuxMultiplexer {
    async fn send_text(&self, session: &str, window: &str, text: &str) -> Result<SendOutcome> {
        let target = Self::target(session, window);
        let chunks = chunk_payload(text, self.chunk_size);
        let count = chunks.len();
        for chunk in chunks {
            self.run(&target, &["send-keys", "-t", &target, "-l", "--", chunk])
                .await?;
        }
        Ok(SendOutcome { chunks: count })
    }

    async fn send_key(&self, session: &str, window: &str, key: Key) -> Result<()> {
        let target = Self::target(session, window);
        self.run(&target, &["send-keys", "-t", &target, key.as_str()])
            .await?;
        Ok(())
    }

    async fn send_line(&self, session: &str, window: &str, text: &str) -> Result<()> {
        let target = Self::target(session, window);
        // Two send-keys joined by ';' run in one tmux invocation so nothing
        // can interleave between the text and the Enter.
        self.run(
            &target,
            &[
                "send-keys", "-t", &target, "-l", "--", text, ";", "send-keys", "-t", &target,
                "Enter",
            ],
        )
        .await?;
        Ok(())
    }

    async fn capture_pane(&self, session: &str, window: &str) -> Result<String> {
        let target = Self::target(session, window);
        self.run(&target, &["capture-pane", "-p", "-t", &target])
            .await
    }

    async fn foreground_command(&self, session: &str, window: &str) -> Result<String> {
        let target = Self::target(session, window);
        let out = self
            .run(
                &target,
                &[
                    "display-message",
                    "-p",
                    "-t",
                    &target,
                    "#{pane_current_command}",
                ],
            )
            .await?;
        Ok(out.trim().to_string())
    }

    async fn kill_window(&self, session: &str, window: &str) -> Result<()> {
        let target = Self::target(session, window);
        self.run(&target, &["kill-window", "-t", &target]).await?;
        Ok(())
    }
}

/// Shells that mean "the agent is not running" when seen as the pane's
/// foreground command.
pub const KNOWN_SHELLS: [&str; 8] = ["bash", "zsh", "fish", "sh", "dash", "ksh", "tcsh", "cmd"];

/// Whether a pane foreground command is a plain shell.
pub fn is_shell_command(command: &str) -> bool {
    let name = command
        .trim()
        .rsplit('/')
        .next()
        .unwrap_or(command)
        .trim_end_matches(".exe");
    KNOWN_SHELLS.contains(&name)
}

/// Split text into send-keys payloads, never inside a code point.
pub fn chunk_payload(text: &str, max_bytes: usize) -> Vec<&str> {
    if text.is_empty() {
        return vec![""];
    }
    let mut chunks = Vec::new();
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_bytes {
            chunks.push(remaining);
            break;
        }
        let mut end = max_bytes;
        while !remaining.is_char_boundary(end) {
            end -= 1;
        }
        chunks.push(&remaining[..end]);
        remaining = &remaining[end..];
    }
    chunks
}
