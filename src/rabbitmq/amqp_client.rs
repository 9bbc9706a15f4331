// src/rabbitmq/amqp_client.rs
// Broker collaborator implemented over lapin.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    message::Delivery,
    options::{
        BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicNackOptions,
        BasicPublishOptions, BasicQosOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
        QueueBindOptions, QueueDeclareOptions,
    },
    types::FieldTable,
    uri::{AMQPAuthority, AMQPQueryString, AMQPScheme, AMQPUri, AMQPUserInfo},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::debug;

use super::broker::{
    Broker, BrokerChannel, BrokerConnection, BrokerEndpoint, ConnectionEvent, ConnectionListener,
    DeliveryStream, Envelope, ExchangeKind, MessageProperties,
};
use super::errors::{MessagingError, Result};

const REPLY_SUCCESS: u16 = 200;
const DELIVERY_MODE_TRANSIENT: u8 = 1;
const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Opens real AMQP 0-9-1 connections.
#[derive(Clone, Default)]
pub struct LapinBroker {
    properties: ConnectionProperties,
}

impl LapinBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

pub fn amqp_uri(endpoint: &BrokerEndpoint) -> AMQPUri {
    AMQPUri {
        scheme: AMQPScheme::AMQP,
        authority: AMQPAuthority {
            userinfo: AMQPUserInfo {
                username: endpoint.username.clone(),
                password: endpoint.password.clone(),
            },
            host: endpoint.host.clone(),
            port: endpoint.port,
        },
        vhost: endpoint.virtual_host.clone(),
        query: AMQPQueryString::default(),
    }
}

#[async_trait]
impl Broker for LapinBroker {
    async fn open_connection(
        &self,
        endpoint: &BrokerEndpoint,
    ) -> Result<Arc<dyn BrokerConnection>> {
        let connection =
            Connection::connect_uri(amqp_uri(endpoint), self.properties.clone()).await?;
        Ok(Arc::new(LapinConnection::new(connection)))
    }
}

pub struct LapinConnection {
    inner: Connection,
    listeners: Arc<Mutex<Vec<ConnectionListener>>>,
}

impl LapinConnection {
    fn new(inner: Connection) -> Self {
        let listeners: Arc<Mutex<Vec<ConnectionListener>>> = Arc::new(Mutex::new(Vec::new()));

        // lapin reports a dead connection through on_error; there is no way to
        // deregister, so the closure goes through the listener list instead.
        let registered = listeners.clone();
        inner.on_error(move |err| {
            let snapshot = registered
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
            let event = ConnectionEvent::Shutdown {
                reason: err.to_string(),
            };
            for listener in snapshot {
                listener(event.clone());
            }
        });

        Self { inner, listeners }
    }
}

#[async_trait]
impl BrokerConnection for LapinConnection {
    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    fn subscribe(&self, listener: ConnectionListener) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    fn unsubscribe_all(&self) {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.inner.create_channel().await?;
        Ok(Arc::new(LapinChannel { inner: channel }))
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(REPLY_SUCCESS, "Closing connection").await?;
        Ok(())
    }
}

pub struct LapinChannel {
    inner: Channel,
}

fn lapin_kind(kind: &ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Headers => lapin::ExchangeKind::Headers,
        ExchangeKind::Custom(kind) => lapin::ExchangeKind::Custom(kind.clone()),
    }
}

fn basic_properties(properties: MessageProperties) -> BasicProperties {
    let delivery_mode = if properties.persistent {
        DELIVERY_MODE_PERSISTENT
    } else {
        DELIVERY_MODE_TRANSIENT
    };

    let mut basic = BasicProperties::default().with_delivery_mode(delivery_mode);
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    if let Some(message_id) = properties.message_id {
        basic = basic.with_message_id(message_id.into());
    }
    if let Some(timestamp) = properties.timestamp {
        basic = basic.with_timestamp(timestamp);
    }
    basic
}

fn envelope(delivery: Delivery) -> Envelope {
    let properties = MessageProperties {
        content_type: delivery
            .properties
            .content_type()
            .as_ref()
            .map(|value| value.as_str().to_string()),
        persistent: *delivery.properties.delivery_mode() == Some(DELIVERY_MODE_PERSISTENT),
        message_id: delivery
            .properties
            .message_id()
            .as_ref()
            .map(|value| value.as_str().to_string()),
        timestamp: *delivery.properties.timestamp(),
    };

    Envelope {
        delivery_tag: delivery.delivery_tag,
        redelivered: delivery.redelivered,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        properties,
        body: delivery.data,
    }
}

#[async_trait]
impl BrokerChannel for LapinChannel {
    fn id(&self) -> u16 {
        self.inner.id()
    }

    fn is_open(&self) -> bool {
        self.inner.status().connected()
    }

    async fn confirm_select(&self) -> Result<()> {
        self.inner
            .confirm_select(ConfirmSelectOptions::default())
            .await?;
        Ok(())
    }

    async fn declare_exchange(&self, name: &str, kind: &ExchangeKind, durable: bool) -> Result<()> {
        self.inner
            .exchange_declare(
                name,
                lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable,
                    auto_delete: false,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable,
                    exclusive: false,
                    auto_delete: false,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!(queue = %name, messages = queue.message_count(), "Queue declared");
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<()> {
        let confirm = self
            .inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                basic_properties(properties),
            )
            .await?;

        // Resolves immediately unless the channel is in confirm mode.
        let confirmation = confirm.await?;
        if confirmation.is_nack() {
            return Err(MessagingError::Transport(format!(
                "broker rejected message published to '{}' with routing key '{}'",
                exchange, routing_key
            )));
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions { global: false })
            .await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        Ok(consumer
            .map(|delivery| delivery.map(envelope).map_err(MessagingError::from))
            .boxed())
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.inner
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()> {
        self.inner
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn cancel(&self, consumer_tag: &str) -> Result<()> {
        self.inner
            .basic_cancel(consumer_tag, BasicCancelOptions::default())
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close(REPLY_SUCCESS, "Closing channel").await?;
        Ok(())
    }
}
