//! Slack messaging adapter (Socket Mode via slack-morphism).
//!
//! Threads are addressed with composite channel ids of the form
//! `C0123:1712345678.000100` (channel id plus the thread root `ts`) so the
//! rest of the bridge can treat a Slack thread as just another channel.

use crate::error::{MessagingError, Result};
use crate::messaging::split::split_message_non_empty;
use crate::messaging::traits::{InboundStream, MessagingClient};
use crate::{Attachment, ChatMessage, Platform};

use anyhow::Context as _;
use slack_morphism::prelude::*;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

const SLACK_MAX_MESSAGE_LEN: usize = 4000;

/// State shared with socket mode callbacks via `SlackClientEventsUserState`.
struct SlackAdapterState {
    inbound_tx: mpsc::Sender<ChatMessage>,
    bot_user_id: String,
}

/// Slack adapter.
pub struct SlackAdapter {
    bot_token: String,
    app_token: String,
    /// Shared HTTP client — constructed once, reused across all API calls.
    /// Holds a hyper connection pool internally; allocating one per call would
    /// discard that pool on every send.
    client: Arc<SlackHyperClient>,
    /// Pre-built API token wrapping `bot_token`. Created once alongside `client`.
    token: SlackApiToken,
    shutdown_tx: Arc<RwLock<Option<mpsc::Sender<()>>>>,
}

impl SlackAdapter {
    pub fn new(bot_token: impl Into<String>, app_token: impl Into<String>) -> anyhow::Result<Self> {
        let bot_token = bot_token.into();
        let client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new().context("failed to create slack HTTP connector")?,
        ));
        let token = SlackApiToken::new(SlackApiTokenValue(bot_token.clone()));
        Ok(Self {
            bot_token,
            app_token: app_token.into(),
            client,
            token,
            shutdown_tx: Arc::new(RwLock::new(None)),
        })
    }

    /// Open a session against the cached client using the cached bot token.
    fn session(&self) -> SlackClientSession<'_, SlackClientHyperHttpsConnector> {
        self.client.open_session(&self.token)
    }

    async fn post(
        &self,
        channel: &SlackChannelId,
        thread_ts: Option<SlackTs>,
        text: &str,
    ) -> Result<SlackTs> {
        let mut req = SlackApiChatPostMessageRequest::new(
            channel.clone(),
            SlackMessageContent::new().with_text(text.to_string()),
        );
        req = req.opt_thread_ts(thread_ts);
        let response = self
            .session()
            .chat_post_message(&req)
            .await
            .context("failed to send slack message")?;
        Ok(response.ts)
    }
}

/// Split `C0123:1712.0001` composite ids into channel and thread ts.
fn parse_target(channel_id: &str) -> (SlackChannelId, Option<SlackTs>) {
    match channel_id.split_once(':') {
        Some((channel, ts)) if !ts.is_empty() => (
            SlackChannelId(channel.to_string()),
            Some(SlackTs(ts.to_string())),
        ),
        _ => (SlackChannelId(channel_id.to_string()), None),
    }
}

/// Slack reactions take shortcodes, not the unicode emoji the tracker uses.
fn reaction_name(emoji: &str) -> String {
    if let Some(parsed) = emojis::get(emoji.trim()) {
        if let Some(shortcode) = parsed.shortcode() {
            return shortcode.to_string();
        }
    }
    emoji
        .trim()
        .trim_start_matches(':')
        .trim_end_matches(':')
        .to_lowercase()
}

impl MessagingClient for SlackAdapter {
    fn platform(&self) -> Platform {
        Platform::Slack
    }

    fn max_message_len(&self) -> usize {
        SLACK_MAX_MESSAGE_LEN
    }

    fn supports_threads(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        *self.shutdown_tx.write().await = Some(shutdown_tx);

        let auth_response = self
            .session()
            .auth_test()
            .await
            .context("failed to call auth.test for bot user ID")?;
        let bot_user_id = auth_response.user_id.0.clone();
        tracing::info!(bot_user_id = %bot_user_id, "slack bot user ID resolved");

        let adapter_state = Arc::new(SlackAdapterState {
            inbound_tx,
            bot_user_id,
        });

        let callbacks = SlackSocketModeListenerCallbacks::new().with_push_events(handle_push_event);

        // The socket mode listener needs its own client — it owns a persistent
        // WebSocket connection. The shared self.client is for REST calls only.
        let listener_client = Arc::new(SlackClient::new(
            SlackClientHyperConnector::new()
                .context("failed to create slack socket mode connector")?,
        ));

        let listener_environment = Arc::new(
            SlackClientEventsListenerEnvironment::new(listener_client.clone())
                .with_error_handler(slack_error_handler)
                .with_user_state(adapter_state),
        );

        let listener = SlackClientSocketModeListener::new(
            &SlackClientSocketModeConfig::new(),
            listener_environment,
            callbacks,
        );

        let app_token = SlackApiToken::new(SlackApiTokenValue(self.app_token.clone()));

        tokio::spawn(async move {
            if let Err(error) = listener.listen_for(&app_token).await {
                tracing::error!(%error, "failed to start slack socket mode listener");
                return;
            }

            tracing::info!("slack socket mode connected");

            tokio::select! {
                exit_code = listener.serve() => {
                    tracing::info!(exit_code, "slack socket mode listener stopped");
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("slack socket mode shutting down");
                    listener.shutdown().await;
                }
            }
        });

        Ok(Box::pin(tokio_stream::wrappers::ReceiverStream::new(
            inbound_rx,
        )))
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<()> {
        let (channel, thread_ts) = parse_target(channel_id);
        for chunk in split_message_non_empty(text, SLACK_MAX_MESSAGE_LEN) {
            self.post(&channel, thread_ts.clone(), &chunk).await?;
        }
        Ok(())
    }

    async fn send_long(&self, channel_id: &str, summary: &str, text: &str) -> Result<()> {
        let (channel, thread_ts) = parse_target(channel_id);
        // Root message carries the summary; the body goes into its thread.
        let root_ts = match thread_ts {
            Some(ts) => {
                self.post(&channel, Some(ts.clone()), summary).await?;
                ts
            }
            None => self.post(&channel, None, summary).await?,
        };
        for chunk in split_message_non_empty(text, SLACK_MAX_MESSAGE_LEN) {
            self.post(&channel, Some(root_ts.clone()), &chunk).await?;
        }
        Ok(())
    }

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        let (channel, _) = parse_target(channel_id);
        let req = SlackApiReactionsAddRequest::new(
            channel,
            SlackReactionName(reaction_name(emoji)),
            SlackTs(message_id.to_string()),
        );
        self.session()
            .reactions_add(&req)
            .await
            .context("failed to add slack reaction")?;
        Ok(())
    }

    async fn remove_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        let (channel, _) = parse_target(channel_id);
        let req = SlackApiReactionsRemoveRequest::new(SlackReactionName(reaction_name(emoji)))
            .with_channel(channel)
            .with_timestamp(SlackTs(message_id.to_string()));
        self.session()
            .reactions_remove(&req)
            .await
            .context("failed to remove slack reaction")?;
        Ok(())
    }

    async fn start_typing(&self, _channel_id: &str) -> Result<()> {
        // Slack has no typing API for Socket Mode bots outside Assistant
        // threads; status is carried by reactions instead.
        Ok(())
    }

    async fn stop_typing(&self, _channel_id: &str) -> Result<()> {
        Ok(())
    }

    async fn create_thread(
        &self,
        channel_id: &str,
        source_message_id: Option<&str>,
        name: &str,
    ) -> Result<String> {
        let (channel, _) = parse_target(channel_id);
        let root_ts = match source_message_id {
            Some(ts) => SlackTs(ts.to_string()),
            None => self.post(&channel, None, name).await?,
        };
        Ok(format!("{}:{}", channel.0, root_ts.0))
    }

    async fn channel_name(&self, channel_id: &str) -> Result<String> {
        // Conversation info needs an extra scope; the id is good enough for
        // the rename-on-save flow, which archives on Slack anyway.
        Ok(channel_id.to_string())
    }

    async fn rename_channel(&self, channel_id: &str, name: &str) -> Result<()> {
        // The conversations.rename scope is admin-only; archiving preserves
        // the history, which is what the save flow is after.
        tracing::info!(%channel_id, %name, "slack rename unavailable, archiving instead");
        let (channel, _) = parse_target(channel_id);
        let req = SlackApiConversationsArchiveRequest::new(channel);
        self.session()
            .conversations_archive(&req)
            .await
            .context("failed to archive slack channel")?;
        Ok(())
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        let (channel, _) = parse_target(channel_id);
        let req = SlackApiConversationsArchiveRequest::new(channel);
        self.session()
            .conversations_archive(&req)
            .await
            .context("failed to archive slack channel")?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        self.session()
            .auth_test()
            .await
            .map_err(|error| MessagingError::PlatformRequest(error.to_string()))?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        if let Some(tx) = self.shutdown_tx.write().await.take() {
            let _ = tx.send(()).await;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Inbound event handlers (fn pointers — slack-morphism requirement)
// ---------------------------------------------------------------------------

async fn handle_push_event(
    event: SlackPushEventCallback,
    _client: Arc<SlackHyperClient>,
    states: SlackClientEventsUserState,
) -> UserCallbackResult<()> {
    let SlackEventCallbackBody::Message(msg_event) = event.event else {
        return Ok(());
    };

    // Skip message edits / deletes / bot_message subtypes
    if msg_event.subtype.is_some() {
        return Ok(());
    }

    let state_guard = states.read().await;
    let adapter_state = state_guard
        .get_user_state::<Arc<SlackAdapterState>>()
        .expect("SlackAdapterState must be in user_state");

    let Some(user_id) = msg_event.sender.user.as_ref().map(|u| u.0.clone()) else {
        return Ok(()); // system message
    };
    if user_id == adapter_state.bot_user_id {
        return Ok(()); // ignore self
    }

    let channel_id = msg_event
        .origin
        .channel
        .as_ref()
        .map(|c| c.0.clone())
        .unwrap_or_default();
    let ts = msg_event.origin.ts.0.clone();
    let thread_ts = msg_event.origin.thread_ts.as_ref().map(|t| t.0.clone());

    // Inside a thread, address the thread itself as the channel.
    let effective_channel = match &thread_ts {
        Some(root) => format!("{channel_id}:{root}"),
        None => channel_id.clone(),
    };
    let conversation_key = thread_ts
        .as_ref()
        .map(|root| format!("{channel_id}:{root}"));

    let text = msg_event
        .content
        .as_ref()
        .and_then(|content| content.text.clone())
        .unwrap_or_default();

    let attachments = msg_event
        .content
        .as_ref()
        .and_then(|content| content.files.as_ref())
        .map(|files| {
            files
                .iter()
                .map(|file| Attachment {
                    filename: file.name.clone().unwrap_or_default(),
                    mime_type: file
                        .mimetype
                        .as_ref()
                        .map(|m| m.0.clone())
                        .unwrap_or_else(|| "application/octet-stream".into()),
                    url: file
                        .url_private
                        .as_ref()
                        .map(|u| u.to_string())
                        .unwrap_or_default(),
                    size_bytes: file.size.map(|s| s as u64),
                })
                .collect()
        })
        .unwrap_or_default();

    let inbound = ChatMessage {
        id: ts,
        channel_id: effective_channel,
        sender: user_id,
        text,
        platform: Platform::Slack,
        timestamp: chrono::Utc::now(),
        attachments,
        reply_to_message_id: None,
        thread_id: conversation_key.clone(),
        conversation_key,
    };

    if let Err(error) = adapter_state.inbound_tx.send(inbound).await {
        tracing::warn!(%error, "failed to forward inbound slack message (receiver dropped)");
    }

    Ok(())
}

fn slack_error_handler(
    err: Box<dyn std::error::Error + Send + Sync>,
    _client: Arc<SlackHyperClient>,
    _states: SlackClientEventsUserState,
) -> HttpStatusCode {
    tracing::warn!(error = %err, "slack socket mode error");
    HttpStatusCode::OK
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_target_splits_thread_composite_ids() {
        let (channel, ts) = parse_target("C0123:1712345678.000100");
        assert_eq!(channel.0, "C0123");
        assert_eq!(ts.map(|t| t.0), Some("1712345678.000100".to_string()));

        let (channel, ts) = parse_target("C0123");
        assert_eq!(channel.0, "C0123");
        assert!(ts.is_none());
    }

    #[test]
    fn reaction_name_maps_unicode_to_shortcode() {
        assert_eq!(reaction_name("✅"), "white_check_mark");
        assert_eq!(reaction_name(":custom_emoji:"), "custom_emoji");
    }
}
