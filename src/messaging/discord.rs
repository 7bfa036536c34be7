//! Discord messaging adapter using serenity.

use crate::error::{MessagingError, Result};
use crate::messaging::split::split_message_non_empty;
use crate::messaging::traits::{InboundStream, MessagingClient};
use crate::{Attachment, ChatMessage, Platform};

use anyhow::Context as _;
use async_trait::async_trait;
use serenity::all::{
    ChannelId, ChannelType, Context, CreateThread, EditChannel, EventHandler, GatewayIntents,
    Http, Message, MessageId, ReactionType, Ready, ShardManager, UserId,
};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{RwLock, mpsc};

const DISCORD_MAX_MESSAGE_LEN: usize = 2000;

/// Discord adapter state.
pub struct DiscordAdapter {
    token: String,
    http: Arc<RwLock<Option<Arc<Http>>>>,
    bot_user_id: Arc<RwLock<Option<UserId>>>,
    /// Typing handles per channel. Typing stops when the handle is dropped.
    typing_tasks: Arc<RwLock<HashMap<String, serenity::http::Typing>>>,
    shard_manager: Arc<RwLock<Option<Arc<ShardManager>>>>,
}

impl DiscordAdapter {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            http: Arc::new(RwLock::new(None)),
            bot_user_id: Arc::new(RwLock::new(None)),
            typing_tasks: Arc::new(RwLock::new(HashMap::new())),
            shard_manager: Arc::new(RwLock::new(None)),
        }
    }

    async fn get_http(&self) -> anyhow::Result<Arc<Http>> {
        self.http
            .read()
            .await
            .clone()
            .context("discord not connected")
    }

    fn parse_channel(channel_id: &str) -> Result<ChannelId> {
        channel_id
            .parse::<u64>()
            .map(ChannelId::new)
            .map_err(|_| MessagingError::InvalidChannelId(channel_id.to_string()).into())
    }

    fn parse_message(message_id: &str) -> Result<MessageId> {
        message_id
            .parse::<u64>()
            .map(MessageId::new)
            .map_err(|_| {
                MessagingError::PlatformRequest(format!("invalid message id: {message_id}")).into()
            })
    }
}

impl MessagingClient for DiscordAdapter {
    fn platform(&self) -> Platform {
        Platform::Discord
    }

    fn max_message_len(&self) -> usize {
        DISCORD_MAX_MESSAGE_LEN
    }

    fn supports_threads(&self) -> bool {
        true
    }

    async fn start(&self) -> Result<InboundStream> {
        let (inbound_tx, inbound_rx) = mpsc::channel(256);

        let handler = Handler {
            inbound_tx,
            http_slot: self.http.clone(),
            bot_user_id_slot: self.bot_user_id.clone(),
        };

        let intents = GatewayIntents::GUILD_MESSAGES
            | GatewayIntents::DIRECT_MESSAGES
            | GatewayIntents::MESSAGE_CONTENT
            | GatewayIntents::GUILDS;

        let mut client = serenity::Client::builder(&self.token, intents)
            .event_handler(handler)
            .await
            .context("failed to build discord client")?;

        *self.http.write().await = Some(client.http.clone());
        *self.shard_manager.write().await = Some(client.shard_manager.clone());

        tokio::spawn(async move {
            if let Err(error) = client.start().await {
                tracing::error!(%error, "discord gateway error");
            }
        });

        let stream = tokio_stream::wrappers::ReceiverStream::new(inbound_rx);
        Ok(Box::pin(stream))
    }

    async fn send(&self, channel_id: &str, text: &str) -> Result<()> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(channel_id)?;

        self.stop_typing(channel_id).await?;

        for chunk in split_message_non_empty(text, DISCORD_MAX_MESSAGE_LEN) {
            channel
                .say(&*http, &chunk)
                .await
                .context("failed to send discord message")?;
        }
        Ok(())
    }

    async fn send_long(&self, channel_id: &str, summary: &str, text: &str) -> Result<()> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(channel_id)?;

        self.stop_typing(channel_id).await?;

        let thread_name = crate::truncate_chars(summary, 90);
        let builder = CreateThread::new(thread_name).kind(ChannelType::PublicThread);
        match channel.create_thread(&*http, builder).await {
            Ok(thread) => {
                for chunk in split_message_non_empty(text, DISCORD_MAX_MESSAGE_LEN) {
                    thread
                        .id
                        .say(&*http, &chunk)
                        .await
                        .context("failed to send message in long-output thread")?;
                }
            }
            Err(error) => {
                // Fall back to plain chunked sends if thread creation fails
                tracing::warn!(%error, %channel_id, "failed to create long-output thread, sending inline");
                for chunk in split_message_non_empty(text, DISCORD_MAX_MESSAGE_LEN) {
                    channel
                        .say(&*http, &chunk)
                        .await
                        .context("failed to send discord message")?;
                }
            }
        }
        Ok(())
    }

    async fn add_reaction(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<()> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(channel_id)?;
        let message = Self::parse_message(message_id)?;

        channel
            .create_reaction(&*http, message, ReactionType::Unicode(emoji.to_string()))
            .await
            .context("failed to add reaction")?;
        Ok(())
    }

    async fn remove_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> Result<()> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(channel_id)?;
        let message = Self::parse_message(message_id)?;

        channel
            .delete_reaction_emoji(&*http, message, ReactionType::Unicode(emoji.to_string()))
            .await
            .context("failed to remove reaction")?;
        Ok(())
    }

    async fn start_typing(&self, channel_id: &str) -> Result<()> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(channel_id)?;

        let typing = channel.start_typing(&http);
        self.typing_tasks
            .write()
            .await
            .insert(channel_id.to_string(), typing);
        Ok(())
    }

    async fn stop_typing(&self, channel_id: &str) -> Result<()> {
        self.typing_tasks.write().await.remove(channel_id);
        Ok(())
    }

    async fn create_thread(
        &self,
        channel_id: &str,
        source_message_id: Option<&str>,
        name: &str,
    ) -> Result<String> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(channel_id)?;

        let builder = CreateThread::new(crate::truncate_chars(name, 90))
            .kind(ChannelType::PublicThread);
        let thread = match source_message_id {
            Some(message_id) => {
                let message = Self::parse_message(message_id)?;
                channel
                    .create_thread_from_message(&*http, message, builder)
                    .await
            }
            None => channel.create_thread(&*http, builder).await,
        }
        .context("failed to create thread")?;

        Ok(thread.id.to_string())
    }

    async fn channel_name(&self, channel_id: &str) -> Result<String> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(channel_id)?;

        let channel = channel
            .to_channel(&*http)
            .await
            .context("failed to fetch channel")?;
        match channel.guild() {
            Some(guild_channel) => Ok(guild_channel.name),
            None => Ok(channel_id.to_string()),
        }
    }

    async fn rename_channel(&self, channel_id: &str, name: &str) -> Result<()> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(channel_id)?;

        channel
            .edit(&*http, EditChannel::new().name(crate::truncate_chars(name, 100)))
            .await
            .context("failed to rename channel")?;
        Ok(())
    }

    async fn delete_channel(&self, channel_id: &str) -> Result<()> {
        let http = self.get_http().await?;
        let channel = Self::parse_channel(channel_id)?;

        channel
            .delete(&*http)
            .await
            .context("failed to delete channel")?;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let http = self.get_http().await?;
        http.get_current_user()
            .await
            .context("discord health check failed")?;
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.typing_tasks.write().await.clear();
        if let Some(manager) = self.shard_manager.read().await.clone() {
            manager.shutdown_all().await;
        }
        Ok(())
    }
}

// -- Serenity EventHandler --

struct Handler {
    inbound_tx: mpsc::Sender<ChatMessage>,
    http_slot: Arc<RwLock<Option<Arc<Http>>>>,
    bot_user_id_slot: Arc<RwLock<Option<UserId>>>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!(bot_name = %ready.user.name, "discord connected");

        *self.http_slot.write().await = Some(ctx.http.clone());
        *self.bot_user_id_slot.write().await = Some(ready.user.id);
        tracing::info!(guild_count = ready.guilds.len(), "discord guilds available");
    }

    async fn message(&self, ctx: Context, message: Message) {
        // Always ignore our own messages to prevent self-response loops
        let bot_user_id = self.bot_user_id_slot.read().await;
        if bot_user_id.is_some_and(|id| message.author.id == id) {
            return;
        }
        drop(bot_user_id);

        if message.author.bot {
            return;
        }

        let inbound = build_chat_message(&ctx, &message).await;
        if let Err(error) = self.inbound_tx.send(inbound).await {
            tracing::warn!(
                %error,
                "failed to forward inbound discord message (receiver dropped)"
            );
        }
    }
}

async fn build_chat_message(ctx: &Context, message: &Message) -> ChatMessage {
    // For thread messages, the conversation key is the thread channel itself.
    let thread_id = match message.channel(&ctx.http).await {
        Ok(serenity::all::Channel::Guild(guild_channel))
            if guild_channel.thread_metadata.is_some() =>
        {
            Some(guild_channel.id.to_string())
        }
        _ => None,
    };

    let attachments = message
        .attachments
        .iter()
        .map(|attachment| Attachment {
            filename: attachment.filename.clone(),
            mime_type: attachment
                .content_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".into()),
            url: attachment.url.clone(),
            size_bytes: Some(attachment.size as u64),
        })
        .collect();

    ChatMessage {
        id: message.id.to_string(),
        channel_id: message.channel_id.to_string(),
        sender: message.author.name.clone(),
        text: message.content.clone(),
        platform: Platform::Discord,
        timestamp: *message.timestamp,
        attachments,
        reply_to_message_id: message
            .referenced_message
            .as_ref()
            .map(|referenced| referenced.id.to_string()),
        thread_id: thread_id.clone(),
        conversation_key: thread_id,
    }
}
