use std::sync::Arc;
use std::time::Duration;

use rabbitmq_messaging::rabbitmq::memory::{Acknowledgement, InMemoryBroker};
use rabbitmq_messaging::{MessagingClient, OptionsMonitor, RabbitMqOptions};

pub fn orders_options() -> RabbitMqOptions {
    RabbitMqOptions {
        exchange_name: "orders".into(),
        exchange_type: "direct".into(),
        queue_name: "orders-queue".into(),
        routing_key: "orders.created".into(),
        ..RabbitMqOptions::default()
    }
}

pub fn client(broker: &InMemoryBroker, options: RabbitMqOptions) -> MessagingClient {
    MessagingClient::new(Arc::new(broker.clone()), OptionsMonitor::new(options))
}

/// Polls until the broker has recorded at least `count` acks/nacks.
pub async fn wait_for_acknowledgements(
    broker: &InMemoryBroker,
    count: usize,
) -> Vec<Acknowledgement> {
    for _ in 0..400 {
        let acks = broker.acknowledgements();
        if acks.len() >= count {
            return acks;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!(
        "timed out waiting for {} acknowledgements; have {:?}",
        count,
        broker.acknowledgements()
    );
}
