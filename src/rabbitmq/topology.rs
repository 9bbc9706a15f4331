// src/rabbitmq/topology.rs

use tracing::debug;

use super::broker::{BrokerChannel, ExchangeKind};
use super::errors::{MessagingError, Result};
use crate::options::RabbitMqOptions;

/// Exchange, queue and binding as declared before publishing or consuming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub kind: ExchangeKind,
    /// Publishing without a configured queue only declares the exchange.
    pub queue: Option<String>,
    pub routing_key: String,
}

fn exchange_from(options: &RabbitMqOptions) -> Result<(String, ExchangeKind)> {
    if options.exchange_name.trim().is_empty() {
        return Err(MessagingError::Configuration(
            "ExchangeName must be configured.".to_string(),
        ));
    }
    Ok((options.exchange_name.clone(), options.exchange_kind()?))
}

impl Topology {
    pub fn for_publish(options: &RabbitMqOptions) -> Result<Self> {
        let (exchange, kind) = exchange_from(options)?;
        let queue = Some(options.queue_name.clone()).filter(|q| !q.trim().is_empty());

        Ok(Self {
            exchange,
            kind,
            queue,
            routing_key: options.routing_key.clone(),
        })
    }

    pub fn for_consume(options: &RabbitMqOptions, queue: &str) -> Result<Self> {
        let (exchange, kind) = exchange_from(options)?;

        Ok(Self {
            exchange,
            kind,
            queue: Some(queue.to_string()),
            routing_key: options.routing_key.clone(),
        })
    }

    /// Idempotent: the broker creates what is missing and accepts
    /// redeclarations with identical arguments.
    pub async fn declare(&self, channel: &dyn BrokerChannel) -> Result<()> {
        channel
            .declare_exchange(&self.exchange, &self.kind, true)
            .await?;

        if let Some(queue) = &self.queue {
            channel.declare_queue(queue, true).await?;
            channel
                .bind_queue(queue, &self.exchange, &self.routing_key)
                .await?;
        }

        debug!(
            exchange = %self.exchange,
            kind = %self.kind,
            queue = ?self.queue,
            routing_key = %self.routing_key,
            "Topology declared"
        );
        Ok(())
    }
}
