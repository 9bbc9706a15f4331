//! Connection, channel, producer and consumer management for RabbitMQ.
//!
//! Application code publishes with [`Producer`] and consumes with
//! [`Consumer`]; both share one lazily opened, self-repairing connection
//! owned by [`ConnectionManager`].

pub mod config;
pub mod env;
pub mod message;
pub mod options;
pub mod rabbitmq;

pub use options::{OptionsMonitor, RabbitMqOptions};
pub use rabbitmq::{
    ChannelProvider, ConnectionManager, Consumer, InMemoryBroker, LapinBroker, MessageHandler,
    MessagingClient, MessagingError, Producer, Result,
};
