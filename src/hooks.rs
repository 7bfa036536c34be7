//! Event hook server: structured `session.*` ingest over loopback HTTP.

pub mod event;
pub mod progress;
pub mod runtime;
pub mod server;

pub use event::{AgentEventPayload, EventKind};
pub use runtime::HookRuntime;
pub use server::start_hook_server;
