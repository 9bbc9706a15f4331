// src/rabbitmq/publisher.rs

use std::any::type_name;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use super::broker::MessageProperties;
use super::channel_provider::ChannelProvider;
use super::codec::{JsonCodec, MessageCodec};
use super::errors::{MessagingError, Result};
use super::topology::Topology;

/// Publishes typed messages to the configured exchange.
pub struct Producer<C: MessageCodec = JsonCodec> {
    channels: Arc<ChannelProvider>,
    codec: C,
    // Declare + publish on the shared channel is a multi-step exchange.
    publish_lock: Mutex<()>,
}

impl Producer<JsonCodec> {
    pub fn new(channels: Arc<ChannelProvider>) -> Self {
        Self::with_codec(channels, JsonCodec)
    }
}

impl<C: MessageCodec> Producer<C> {
    pub fn with_codec(channels: Arc<ChannelProvider>, codec: C) -> Self {
        Self {
            channels,
            codec,
            publish_lock: Mutex::new(()),
        }
    }

    /// Publishes `message` as a persistent message.
    ///
    /// `routing_key` overrides the configured default. Topology is declared
    /// before every publish. Unless publisher confirms are enabled this
    /// returns once the message is handed to the broker connection.
    pub async fn publish<T>(
        &self,
        message: &T,
        routing_key: Option<&str>,
        cancellation: Option<&CancellationToken>,
    ) -> Result<()>
    where
        T: Serialize + ?Sized,
    {
        let body = self.codec.encode(message)?;
        check_cancelled(cancellation)?;

        let options = self.channels.connection_manager().options().current();
        let topology = Topology::for_publish(&options)?;
        let routing_key = routing_key.unwrap_or(&options.routing_key);
        if routing_key.trim().is_empty() {
            return Err(MessagingError::Configuration(
                "Routing key must be provided.".to_string(),
            ));
        }

        let channel = self.channels.get_or_create_shared_channel().await?;

        let _guard = self.publish_lock.lock().await;
        check_cancelled(cancellation)?;

        topology.declare(channel.as_ref()).await?;

        let message_id = Uuid::new_v4().to_string();
        let properties = MessageProperties {
            content_type: Some(self.codec.content_type().to_string()),
            persistent: true,
            message_id: Some(message_id.clone()),
            timestamp: Some(Utc::now().timestamp() as u64),
        };

        channel
            .publish(&topology.exchange, routing_key, properties, &body)
            .await?;

        info!(
            exchange = %topology.exchange,
            routing_key = %routing_key,
            message_id = %message_id,
            message_type = type_name::<T>(),
            "Published message"
        );
        Ok(())
    }
}

fn check_cancelled(cancellation: Option<&CancellationToken>) -> Result<()> {
    match cancellation {
        Some(token) if token.is_cancelled() => Err(MessagingError::Cancelled),
        _ => Ok(()),
    }
}
