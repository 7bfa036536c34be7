//! Top-level error types for muxbot.

/// Crate-wide result type alias.
pub type Result<T> = std::result::Result<T, Error>;

/// Top-level error enum wrapping domain-specific errors.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Mux(#[from] MuxError),

    #[error(transparent)]
    Messaging(#[from] MessagingError),

    #[error(transparent)]
    Event(#[from] EventError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Configuration loading errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Project/instance state errors.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("instance {instance_id} not found in project {project}")]
    InstanceNotFound { project: String, instance_id: String },

    #[error("failed to load state from {path}: {reason}")]
    Load { path: String, reason: String },

    #[error("failed to persist state to {path}: {reason}")]
    Persist { path: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Terminal multiplexer errors.
///
/// `PaneMissing` is a distinct variant because the router turns it into a
/// scripted recovery message rather than a generic advisory.
#[derive(Debug, thiserror::Error)]
pub enum MuxError {
    #[error("window or pane not found: {target}")]
    PaneMissing { target: String },

    #[error("tmux invocation failed: {0}")]
    Invocation(String),

    #[error("tmux exited with {status}: {stderr}")]
    CommandFailed { status: String, stderr: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl MuxError {
    /// Classify tmux stderr output into `PaneMissing` when the target window
    /// or pane no longer exists.
    pub fn from_tmux_stderr(target: &str, status: &str, stderr: &str) -> Self {
        let lowered = stderr.to_ascii_lowercase();
        if lowered.contains("can't find window")
            || lowered.contains("can't find pane")
            || lowered.contains("can't find session")
            || lowered.contains("no such window")
        {
            MuxError::PaneMissing {
                target: target.to_string(),
            }
        } else {
            MuxError::CommandFailed {
                status: status.to_string(),
                stderr: stderr.trim().to_string(),
            }
        }
    }

    /// Whether this error means the agent pane is gone.
    pub fn is_pane_missing(&self) -> bool {
        matches!(self, MuxError::PaneMissing { .. })
    }
}

/// Chat platform errors.
#[derive(Debug, thiserror::Error)]
pub enum MessagingError {
    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("invalid channel id: {0}")]
    InvalidChannelId(String),

    #[error("platform request failed: {0}")]
    PlatformRequest(String),

    #[error("platform does not support {operation}")]
    Unsupported { operation: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Agent event ingest errors. These map to HTTP 400 responses.
#[derive(Debug, thiserror::Error)]
pub enum EventError {
    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("unknown event type: {0}")]
    UnknownType(String),

    #[error("unknown project: {0}")]
    UnknownProject(String),

    #[error("no route for event")]
    NoRoute,

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tmux_stderr_classifies_missing_window_as_pane_missing() {
        let error = MuxError::from_tmux_stderr(
            "bridge:codex-1",
            "exit status: 1",
            "can't find window: codex-1\n",
        );
        assert!(error.is_pane_missing());
    }

    #[test]
    fn tmux_stderr_keeps_other_failures_generic() {
        let error =
            MuxError::from_tmux_stderr("bridge:codex-1", "exit status: 1", "server not responding");
        assert!(!error.is_pane_missing());
        assert!(error.to_string().contains("server not responding"));
    }
}
