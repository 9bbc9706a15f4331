// src/options.rs
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::info;

use crate::rabbitmq::broker::{BrokerEndpoint, ExchangeKind};
use crate::rabbitmq::errors::{MessagingError, Result};

/// Strongly typed configuration for RabbitMQ connectivity and topology.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "PascalCase")]
pub struct RabbitMqOptions {
    pub host_name: String,
    pub port: u16,
    pub virtual_host: String,
    pub user_name: String,
    pub password: String,
    /// Declared and published to. Required.
    pub exchange_name: String,
    /// direct, topic, fanout or headers.
    pub exchange_type: String,
    /// The queue consumers listen to. Required.
    pub queue_name: String,
    /// Default routing key for publishing and the queue binding. Required.
    pub routing_key: String,
    /// Whether failed messages go back on the queue.
    pub requeue_on_failure: bool,
    /// Wait for broker confirms on publish.
    pub publisher_confirms: bool,
}

impl Default for RabbitMqOptions {
    fn default() -> Self {
        Self {
            host_name: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            user_name: "guest".to_string(),
            password: "guest".to_string(),
            exchange_name: String::new(),
            exchange_type: "direct".to_string(),
            queue_name: String::new(),
            routing_key: String::new(),
            requeue_on_failure: true,
            publisher_confirms: false,
        }
    }
}

impl fmt::Debug for RabbitMqOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqOptions")
            .field("host_name", &self.host_name)
            .field("port", &self.port)
            .field("virtual_host", &self.virtual_host)
            .field("user_name", &self.user_name)
            .field("password", &"***")
            .field("exchange_name", &self.exchange_name)
            .field("exchange_type", &self.exchange_type)
            .field("queue_name", &self.queue_name)
            .field("routing_key", &self.routing_key)
            .field("requeue_on_failure", &self.requeue_on_failure)
            .field("publisher_confirms", &self.publisher_confirms)
            .finish()
    }
}

fn require(value: &str, name: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(MessagingError::Configuration(format!(
            "RabbitMq:{} must be provided.",
            name
        )));
    }
    Ok(())
}

impl RabbitMqOptions {
    /// Startup validation of the whole configuration surface.
    pub fn validate(&self) -> Result<()> {
        require(&self.host_name, "HostName")?;
        if self.port == 0 {
            return Err(MessagingError::Configuration(
                "RabbitMq:Port must be between 1 and 65535.".to_string(),
            ));
        }
        require(&self.exchange_name, "ExchangeName")?;
        self.exchange_kind()?;
        require(&self.routing_key, "RoutingKey")?;
        require(&self.queue_name, "QueueName")?;
        Ok(())
    }

    /// The fields a connection attempt cannot go without.
    pub fn validate_endpoint(&self) -> Result<()> {
        if self.host_name.trim().is_empty() {
            return Err(MessagingError::Configuration(
                "RabbitMQ HostName must be configured.".to_string(),
            ));
        }
        if self.exchange_name.trim().is_empty() {
            return Err(MessagingError::Configuration(
                "RabbitMQ ExchangeName must be configured.".to_string(),
            ));
        }
        Ok(())
    }

    pub fn exchange_kind(&self) -> Result<ExchangeKind> {
        self.exchange_type.parse()
    }

    pub fn endpoint(&self) -> BrokerEndpoint {
        BrokerEndpoint {
            host: self.host_name.clone(),
            port: self.port,
            virtual_host: self.virtual_host.clone(),
            username: self.user_name.clone(),
            password: self.password.clone(),
        }
    }
}

/// Holds the current options snapshot and lets callers swap in a new one.
///
/// Components read `current()` at the start of every operation, so a reload
/// takes effect on the next publish, the next consumer start or the next
/// reconnect.
#[derive(Clone)]
pub struct OptionsMonitor {
    sender: Arc<watch::Sender<RabbitMqOptions>>,
}

impl OptionsMonitor {
    pub fn new(options: RabbitMqOptions) -> Self {
        let (sender, _) = watch::channel(options);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn current(&self) -> RabbitMqOptions {
        self.sender.borrow().clone()
    }

    pub fn update(&self, options: RabbitMqOptions) {
        info!(
            host = %options.host_name,
            exchange = %options.exchange_name,
            queue = %options.queue_name,
            "RabbitMQ options reloaded"
        );
        self.sender.send_replace(options);
    }

    /// Applies `change` to a copy of the current snapshot and publishes it.
    pub fn modify(&self, change: impl FnOnce(&mut RabbitMqOptions)) {
        let mut options = self.current();
        change(&mut options);
        self.update(options);
    }

    pub fn subscribe(&self) -> watch::Receiver<RabbitMqOptions> {
        self.sender.subscribe()
    }
}

impl fmt::Debug for OptionsMonitor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("OptionsMonitor").field(&*self.sender.borrow()).finish()
    }
}
