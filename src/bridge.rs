//! Daemon wiring: ports, runtime components, and the inbound event loop.

use crate::capture::CapturePoller;
use crate::config::BridgeConfig;
use crate::hooks::{HookRuntime, start_hook_server};
use crate::messaging::discord::DiscordAdapter;
use crate::messaging::slack::SlackAdapter;
use crate::messaging::MessagingClientDyn;
use crate::mux::{Multiplexer, TmuxMultiplexer};
use crate::pending::PendingTracker;
use crate::router::MessageRouter;
use crate::routing::{RouteMemory, RouteResolver};
use crate::state::StateStore;
use crate::Platform;

use anyhow::Context as _;
use futures::StreamExt as _;
use std::sync::Arc;
use tokio::sync::watch;

/// Build the configured messaging adapter.
fn build_messaging(config: &BridgeConfig) -> anyhow::Result<Arc<dyn MessagingClientDyn>> {
    match config.platform()? {
        Platform::Discord => {
            let token = config
                .discord_token
                .clone()
                .context("discord selected but DISCORD_BOT_TOKEN unset")?;
            Ok(Arc::new(DiscordAdapter::new(token)))
        }
        Platform::Slack => {
            let bot = config
                .slack_bot_token
                .clone()
                .context("slack selected but SLACK_BOT_TOKEN unset")?;
            let app = config
                .slack_app_token
                .clone()
                .context("slack selected but SLACK_APP_TOKEN unset")?;
            Ok(Arc::new(SlackAdapter::new(bot, app)?))
        }
    }
}

/// Run the bridge until the shutdown channel flips.
///
/// Everything here is wiring; the behavior lives in the components. Only
/// catastrophic initialization errors propagate out.
pub async fn run(
    config: BridgeConfig,
    store: Arc<dyn StateStore>,
    shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let messaging = build_messaging(&config)?;
    let mux: Arc<dyn Multiplexer> =
        Arc::new(TmuxMultiplexer::new(config.dispatch.tmux_send_keys_chunk_size));

    let memory = RouteMemory::new();
    let resolver = RouteResolver::new(store.clone(), memory.clone());
    let tracker = PendingTracker::new(messaging.clone(), &config.pending);

    let router = MessageRouter::new(
        mux.clone(),
        messaging.clone(),
        tracker.clone(),
        resolver.clone(),
        memory,
        store.clone(),
        config.dispatch.clone(),
        config.capture.clone(),
    );

    let poller = CapturePoller::new(
        mux,
        messaging.clone(),
        tracker.clone(),
        store.clone(),
        config.capture.clone(),
    );
    let poller_handle = poller.spawn(shutdown_rx.clone());

    let hook_runtime = HookRuntime::new(
        messaging.clone(),
        tracker,
        resolver,
        store.clone(),
        config.events.clone(),
        config.capture.long_output_thread_threshold,
    );
    let hook_handle = start_hook_server(
        config.hook_port,
        hook_runtime,
        store.clone(),
        shutdown_rx.clone(),
    )
    .await
    .context("failed to start hook server")?;

    let mut inbound = messaging
        .start()
        .await
        .map_err(|error| anyhow::anyhow!("failed to start messaging adapter: {error}"))?;
    tracing::info!(platform = %messaging.platform(), "bridge ready");

    let mut shutdown = shutdown_rx;
    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            next = inbound.next() => {
                match next {
                    Some(message) => {
                        // One task per message: a slow pane never blocks the
                        // other instances' traffic.
                        let router = router.clone();
                        tokio::spawn(async move {
                            router.handle(&message).await;
                        });
                    }
                    None => {
                        tracing::warn!("inbound message stream closed");
                        break;
                    }
                }
            }
        }
    }

    tracing::info!("bridge shutting down");
    if let Err(error) = messaging.shutdown().await {
        tracing::warn!(%error, "messaging shutdown failed");
    }
    poller_handle.abort();
    hook_handle.abort();
    Ok(())
}
