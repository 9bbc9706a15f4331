// src/rabbitmq/client.rs

use std::sync::Arc;

use tracing::info;

use super::broker::Broker;
use super::channel_provider::ChannelProvider;
use super::connection::ConnectionManager;
use super::consumer::Consumer;
use super::publisher::Producer;
use crate::options::OptionsMonitor;

/// One connection manager, one channel provider and a default producer and
/// consumer, all reading the same options monitor.
pub struct MessagingClient {
    options: OptionsMonitor,
    connections: Arc<ConnectionManager>,
    channels: Arc<ChannelProvider>,
    producer: Producer,
    consumer: Consumer,
}

impl MessagingClient {
    pub fn new(broker: Arc<dyn Broker>, options: OptionsMonitor) -> Self {
        Self::from_manager(ConnectionManager::new(broker, options))
    }

    /// Wires everything on top of an already configured connection manager.
    pub fn from_manager(connections: ConnectionManager) -> Self {
        let options = connections.options().clone();
        let connections = Arc::new(connections);
        let channels = Arc::new(ChannelProvider::new(connections.clone()));

        Self {
            options,
            producer: Producer::new(channels.clone()),
            consumer: Consumer::new(channels.clone()),
            connections,
            channels,
        }
    }

    pub fn options(&self) -> &OptionsMonitor {
        &self.options
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn channel_provider(&self) -> &Arc<ChannelProvider> {
        &self.channels
    }

    pub fn producer(&self) -> &Producer {
        &self.producer
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// An additional consumer with its own dedicated channel.
    pub fn new_consumer(&self) -> Consumer {
        Consumer::new(self.channels.clone())
    }

    /// Stops the default consumer, then disposes channels and the connection.
    pub async fn dispose(&self) {
        self.consumer.stop_consuming().await;
        self.channels.dispose().await;
        self.connections.dispose().await;
        info!("Messaging client disposed");
    }
}
