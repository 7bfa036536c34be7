//! Messaging trait and dynamic dispatch companion.

use crate::error::Result;
use crate::{ChatMessage, Platform};

use futures::Stream;
use std::pin::Pin;

/// Message stream type.
pub type InboundStream = Pin<Box<dyn Stream<Item = ChatMessage> + Send>>;

/// Static trait for chat platform adapters.
/// Use this for type-safe implementations.
pub trait MessagingClient: Send + Sync + 'static {
    /// Which platform this adapter talks to.
    fn platform(&self) -> Platform;

    /// Largest message the platform accepts in one send.
    fn max_message_len(&self) -> usize;

    /// Whether the platform supports threads for long output.
    fn supports_threads(&self) -> bool {
        false
    }

    /// Start the adapter and return the inbound message stream.
    fn start(&self) -> impl std::future::Future<Output = Result<InboundStream>> + Send;

    /// Send text to a channel, splitting to the platform limit.
    fn send(
        &self,
        channel_id: &str,
        text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Send oversized text: create a thread from a short summary and post the
    /// paginated full text inside. Platforms without threads fall back to a
    /// plain split send.
    fn send_long(
        &self,
        channel_id: &str,
        summary: &str,
        text: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Add a reaction emoji to a message.
    fn add_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Remove a reaction emoji from a message. No-op where unsupported.
    fn remove_reaction(
        &self,
        channel_id: &str,
        message_id: &str,
        emoji: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Start a typing indicator in a channel. The adapter keeps it alive
    /// until `stop_typing`.
    fn start_typing(
        &self,
        channel_id: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Stop the typing indicator for a channel.
    fn stop_typing(
        &self,
        channel_id: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Create a thread under a channel and return its id.
    fn create_thread(
        &self,
        channel_id: &str,
        source_message_id: Option<&str>,
        name: &str,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Current display name of a channel.
    fn channel_name(
        &self,
        channel_id: &str,
    ) -> impl std::future::Future<Output = Result<String>> + Send;

    /// Rename a channel. Platforms without rename may archive instead.
    fn rename_channel(
        &self,
        channel_id: &str,
        name: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Delete a channel.
    fn delete_channel(
        &self,
        channel_id: &str,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Health check.
    fn health_check(&self) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Graceful shutdown.
    fn shutdown(&self) -> impl std::future::Future<Output = Result<()>> + Send {
        async { Ok(()) }
    }
}

/// Dynamic trait for runtime polymorphism.
/// Use this when you need `Arc<dyn MessagingClientDyn>` for storing adapters.
pub trait MessagingClientDyn: Send + Sync + 'static {
    fn platform(&self) -> Platform;

    fn max_message_len(&self) -> usize;

    fn supports_threads(&self) -> bool;

    fn start<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>>;

    fn send<'a>(
        &'a self,
        channel_id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn send_long<'a>(
        &'a self,
        channel_id: &'a str,
        summary: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn add_reaction<'a>(
        &'a self,
        channel_id: &'a str,
        message_id: &'a str,
        emoji: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn remove_reaction<'a>(
        &'a self,
        channel_id: &'a str,
        message_id: &'a str,
        emoji: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn start_typing<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn stop_typing<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn create_thread<'a>(
        &'a self,
        channel_id: &'a str,
        source_message_id: Option<&'a str>,
        name: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>>;

    fn channel_name<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>>;

    fn rename_channel<'a>(
        &'a self,
        channel_id: &'a str,
        name: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn delete_channel<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn health_check<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;

    fn shutdown<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>>;
}

/// Blanket implementation: any type implementing MessagingClient automatically
/// implements MessagingClientDyn.
impl<T: MessagingClient> MessagingClientDyn for T {
    fn platform(&self) -> Platform {
        MessagingClient::platform(self)
    }

    fn max_message_len(&self) -> usize {
        MessagingClient::max_message_len(self)
    }

    fn supports_threads(&self) -> bool {
        MessagingClient::supports_threads(self)
    }

    fn start<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<InboundStream>> + Send + 'a>> {
        Box::pin(MessagingClient::start(self))
    }

    fn send<'a>(
        &'a self,
        channel_id: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(MessagingClient::send(self, channel_id, text))
    }

    fn send_long<'a>(
        &'a self,
        channel_id: &'a str,
        summary: &'a str,
        text: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(MessagingClient::send_long(self, channel_id, summary, text))
    }

    fn add_reaction<'a>(
        &'a self,
        channel_id: &'a str,
        message_id: &'a str,
        emoji: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(MessagingClient::add_reaction(
            self, channel_id, message_id, emoji,
        ))
    }

    fn remove_reaction<'a>(
        &'a self,
        channel_id: &'a str,
        message_id: &'a str,
        emoji: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(MessagingClient::remove_reaction(
            self, channel_id, message_id, emoji,
        ))
    }

    fn start_typing<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(MessagingClient::start_typing(self, channel_id))
    }

    fn stop_typing<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(MessagingClient::stop_typing(self, channel_id))
    }

    fn create_thread<'a>(
        &'a self,
        channel_id: &'a str,
        source_message_id: Option<&'a str>,
        name: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(MessagingClient::create_thread(
            self,
            channel_id,
            source_message_id,
            name,
        ))
    }

    fn channel_name<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<String>> + Send + 'a>> {
        Box::pin(MessagingClient::channel_name(self, channel_id))
    }

    fn rename_channel<'a>(
        &'a self,
        channel_id: &'a str,
        name: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(MessagingClient::rename_channel(self, channel_id, name))
    }

    fn delete_channel<'a>(
        &'a self,
        channel_id: &'a str,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(MessagingClient::delete_channel(self, channel_id))
    }

    fn health_check<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(MessagingClient::health_check(self))
    }

    fn shutdown<'a>(
        &'a self,
    ) -> Pin<Box<dyn std::future::Future<Output = Result<()>> + Send + 'a>> {
        Box::pin(MessagingClient::shutdown(self))
    }
}
