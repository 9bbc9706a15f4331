// src/rabbitmq/mod.rs
// RabbitMQ connection, channel, publish and consume management

pub mod errors;
pub mod broker;
pub mod guarded;
pub mod codec;
pub mod topology;
pub mod connection;
pub mod channel_provider;
pub mod publisher;
pub mod consumer;
pub mod client;

// Broker implementations
pub mod amqp_client;
pub mod memory;

// Re-export specific items to simplify imports elsewhere
pub use amqp_client::LapinBroker;
pub use broker::{Broker, BrokerChannel, BrokerConnection, BrokerEndpoint, ConnectionEvent, ExchangeKind};
pub use channel_provider::ChannelProvider;
pub use client::MessagingClient;
pub use codec::{JsonCodec, MessageCodec};
pub use connection::ConnectionManager;
pub use consumer::{Consumer, MessageHandler};
pub use errors::{MessagingError, Result};
pub use memory::InMemoryBroker;
pub use publisher::Producer;
