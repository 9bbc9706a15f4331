// src/rabbitmq/broker.rs
// The seam between the messaging core and a concrete broker transport.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::BoxStream;

use super::errors::{MessagingError, Result};

/// Where and as whom to connect. Built fresh from the options snapshot on
/// every connect attempt.
#[derive(Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: String,
}

impl fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}/{}", self.host, self.port, self.virtual_host)
    }
}

// Credentials never end up in logs.
impl fmt::Debug for BrokerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerEndpoint")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
    Headers,
    Custom(String),
}

impl FromStr for ExchangeKind {
    type Err = MessagingError;

    fn from_str(value: &str) -> Result<Self> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err(MessagingError::Configuration(
                "ExchangeType must be configured.".to_string(),
            ));
        }

        Ok(match trimmed.to_ascii_lowercase().as_str() {
            "direct" => ExchangeKind::Direct,
            "topic" => ExchangeKind::Topic,
            "fanout" => ExchangeKind::Fanout,
            "headers" => ExchangeKind::Headers,
            _ => ExchangeKind::Custom(trimmed.to_string()),
        })
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeKind::Direct => f.write_str("direct"),
            ExchangeKind::Topic => f.write_str("topic"),
            ExchangeKind::Fanout => f.write_str("fanout"),
            ExchangeKind::Headers => f.write_str("headers"),
            ExchangeKind::Custom(kind) => f.write_str(kind),
        }
    }
}

/// The subset of AMQP basic properties this layer sets and reads.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: Option<String>,
    /// Delivery mode 2 when set.
    pub persistent: bool,
    pub message_id: Option<String>,
    /// Unix seconds.
    pub timestamp: Option<u64>,
}

/// A single delivery as handed to the receive loop.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Vec<u8>,
}

pub type DeliveryStream = BoxStream<'static, Result<Envelope>>;

/// Notifications a connection raises on its own, outside any call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The broker (or the network) closed the connection.
    Shutdown { reason: String },
    /// A callback running inside the connection failed.
    CallbackFault { message: String },
}

/// Invoked on whichever thread the transport raises the event on.
pub type ConnectionListener = Arc<dyn Fn(ConnectionEvent) + Send + Sync>;

#[async_trait]
pub trait Broker: Send + Sync {
    async fn open_connection(&self, endpoint: &BrokerEndpoint)
        -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Health flag; flips to false on its own when the broker shuts the connection down.
    fn is_open(&self) -> bool;

    fn subscribe(&self, listener: ConnectionListener);

    fn unsubscribe_all(&self);

    async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    async fn close(&self) -> Result<()>;
}

/// A broker channel. Not safe for interleaved multi-step use without
/// external serialization.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    fn id(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Switch the channel to publisher-confirm mode.
    async fn confirm_select(&self) -> Result<()>;

    async fn declare_exchange(&self, name: &str, kind: &ExchangeKind, durable: bool) -> Result<()>;

    async fn declare_queue(&self, name: &str, durable: bool) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Resolves once the frame is written, or once the broker confirmed it
    /// when the channel is in confirm mode.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        properties: MessageProperties,
        body: &[u8],
    ) -> Result<()>;

    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Starts a consumer with manual acknowledgement.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<()>;

    async fn cancel(&self, consumer_tag: &str) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
