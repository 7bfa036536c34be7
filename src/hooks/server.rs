//! HTTP server setup for the agent hook endpoints.
//!
//! Binds to loopback only: the endpoints exist for agent-side hooks running
//! on the same machine, not for the network.

use crate::error::EventError;
use crate::hooks::event::AgentEventPayload;
use crate::hooks::runtime::{HookRuntime, SendFilesError};
use crate::state::StateStore;
use crate::AgentType;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tower_http::cors::{Any, CorsLayer};

use std::net::SocketAddr;
use std::sync::Arc;

/// Shared state for the hook endpoints.
#[derive(Clone)]
pub struct HookServerState {
    pub runtime: Arc<HookRuntime>,
    pub store: Arc<dyn StateStore>,
}

/// Start the hook server on `127.0.0.1:<port>`.
pub async fn start_hook_server(
    port: u16,
    runtime: Arc<HookRuntime>,
    store: Arc<dyn StateStore>,
    shutdown_rx: tokio::sync::watch::Receiver<bool>,
) -> anyhow::Result<tokio::task::JoinHandle<()>> {
    let state = HookServerState {
        runtime: runtime.clone(),
        store,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/runtime-status", get(runtime_status))
        .route("/reload", post(reload))
        .route("/send-files", post(send_files))
        .route("/agent-event", post(agent_event))
        .route("/opencode-event", post(agent_event))
        .layer(cors)
        .with_state(state);

    let bind = SocketAddr::from(([127, 0, 0, 1], port));
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(%bind, "hook server listening");

    let handle = tokio::spawn(async move {
        let mut shutdown = shutdown_rx;
        let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
            let _ = shutdown.wait_for(|stop| *stop).await;
        });
        if let Err(error) = serve.await {
            tracing::error!(%error, "hook server exited with error");
        }
        // Drop buffered progress state once no more events can arrive.
        runtime.stop();
    });

    Ok(handle)
}

async fn runtime_status(State(state): State<HookServerState>) -> Response {
    Json(state.runtime.runtime_status()).into_response()
}

async fn reload(State(state): State<HookServerState>) -> Response {
    match state.store.reload() {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error) => {
            tracing::error!(%error, "state reload failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "reload failed").into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendFilesRequest {
    project_name: String,
    #[serde(default)]
    agent_type: Option<String>,
    #[serde(default)]
    instance_id: Option<String>,
    #[serde(default)]
    files: Vec<String>,
}

async fn send_files(
    State(state): State<HookServerState>,
    Json(request): Json<SendFilesRequest>,
) -> Response {
    let agent_type = match request.agent_type.as_deref() {
        None | Some("") => None,
        Some(tag) => match AgentType::parse(tag) {
            Some(agent_type) => Some(agent_type),
            None => {
                return (StatusCode::BAD_REQUEST, format!("unknown agent type: {tag}"))
                    .into_response();
            }
        },
    };

    match state
        .runtime
        .send_files(
            &request.project_name,
            agent_type,
            request.instance_id.as_deref(),
            &request.files,
        )
        .await
    {
        Ok(()) => StatusCode::OK.into_response(),
        Err(error @ SendFilesError::NotFound) => {
            (StatusCode::NOT_FOUND, error.to_string()).into_response()
        }
        Err(error) => (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
    }
}

async fn agent_event(
    State(state): State<HookServerState>,
    Json(payload): Json<AgentEventPayload>,
) -> Response {
    let event = match payload.validate() {
        Ok(event) => event,
        Err(error) => return (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
    };

    match state.runtime.ingest(event).await {
        // Duplicates, out-of-order, ignored, and rejected events are all
        // acknowledged; the counters are the only side effect.
        Ok(outcome) => {
            tracing::debug!(?outcome, "event ingested");
            StatusCode::OK.into_response()
        }
        Err(error @ EventError::Other(_)) => {
            tracing::error!(%error, "event ingest failed");
            (StatusCode::INTERNAL_SERVER_ERROR, "ingest failed").into_response()
        }
        Err(error) => (StatusCode::BAD_REQUEST, error.to_string()).into_response(),
    }
}
