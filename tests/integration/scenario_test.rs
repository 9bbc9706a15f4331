use std::sync::{Arc, Mutex};

use rabbitmq_messaging::message::DemoMessage;
use rabbitmq_messaging::rabbitmq::memory::{AckOutcome, InMemoryBroker};
use rabbitmq_messaging::rabbitmq::{JsonCodec, MessageCodec};
use tokio_util::sync::CancellationToken;

use crate::common::{client, orders_options, wait_for_acknowledgements};

#[tokio::test]
async fn test_orders_are_consumed_in_order_and_acked() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, orders_options());

    let sent: Vec<DemoMessage> = ["order-1", "order-2", "order-3"]
        .into_iter()
        .map(DemoMessage::new)
        .collect();
    for message in &sent {
        client
            .producer()
            .publish(message, Some("orders.created"), None)
            .await
            .unwrap();
    }
    assert_eq!(broker.ready_count("orders-queue"), 3);

    let received: Arc<Mutex<Vec<DemoMessage>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = received.clone();
    client
        .consumer()
        .start_consuming(
            move |message: DemoMessage, _: CancellationToken| {
                sink.lock().unwrap().push(message);
                async { anyhow::Ok(()) }
            },
            Some("orders-queue"),
        )
        .await
        .unwrap();

    let acks = wait_for_acknowledgements(&broker, 3).await;
    client.dispose().await;

    assert_eq!(*received.lock().unwrap(), sent);
    assert!(acks.iter().all(|ack| ack.outcome == AckOutcome::Ack));
    let tags: Vec<u64> = acks.iter().map(|ack| ack.delivery_tag).collect();
    assert_eq!(tags, vec![1, 2, 3]);

    let bodies: Vec<DemoMessage> = acks
        .iter()
        .map(|ack| JsonCodec.decode(&ack.body).unwrap())
        .collect();
    assert_eq!(bodies, sent);
}

#[tokio::test]
async fn test_consumer_resumes_after_broker_restart() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, orders_options());

    client
        .producer()
        .publish(&DemoMessage::new("before restart"), None, None)
        .await
        .unwrap();
    broker.shutdown("CONNECTION_FORCED - broker restart");

    // A consumer started after the restart transparently gets a new connection
    client
        .consumer()
        .start_consuming(
            |_: DemoMessage, _: CancellationToken| async { anyhow::Ok(()) },
            None,
        )
        .await
        .unwrap();

    let acks = wait_for_acknowledgements(&broker, 1).await;
    client.dispose().await;

    assert_eq!(acks[0].outcome, AckOutcome::Ack);
    assert_eq!(broker.connections_opened(), 2);
}
