use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use rabbitmq_messaging::message::DemoMessage;
use rabbitmq_messaging::rabbitmq::memory::{AckOutcome, InMemoryBroker};
use rabbitmq_messaging::{MessagingError, RabbitMqOptions};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::common::{client, orders_options, wait_for_acknowledgements};

async fn succeed(_: DemoMessage, _: CancellationToken) -> anyhow::Result<()> {
    Ok(())
}

async fn fail(_: DemoMessage, _: CancellationToken) -> anyhow::Result<()> {
    Err(anyhow!("order could not be processed"))
}

#[tokio::test]
async fn test_second_start_fails_and_keeps_consuming() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, orders_options());

    client.consumer().start_consuming(succeed, None).await.unwrap();
    let err = client
        .consumer()
        .start_consuming(succeed, None)
        .await
        .unwrap_err();

    assert!(matches!(err, MessagingError::InvalidState(_)));
    assert!(client.consumer().is_consuming().await);
    assert_eq!(broker.consumer_count("orders-queue"), 1);

    client.dispose().await;
}

#[tokio::test]
async fn test_success_acks_exactly_once() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, orders_options());

    client.consumer().start_consuming(succeed, None).await.unwrap();
    client
        .producer()
        .publish(&DemoMessage::new("ok"), None, None)
        .await
        .unwrap();

    let acks = wait_for_acknowledgements(&broker, 1).await;
    client.consumer().stop_consuming().await;

    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].outcome, AckOutcome::Ack);
    assert_eq!(broker.acknowledgements().len(), 1);
    assert_eq!(broker.unacked_count(), 0);
}

#[tokio::test]
async fn test_failure_with_requeue_disabled_drops_message() {
    let broker = InMemoryBroker::new();
    let client = client(
        &broker,
        RabbitMqOptions {
            requeue_on_failure: false,
            ..orders_options()
        },
    );

    client.consumer().start_consuming(fail, None).await.unwrap();
    client
        .producer()
        .publish(&DemoMessage::new("bad"), None, None)
        .await
        .unwrap();

    let acks = wait_for_acknowledgements(&broker, 1).await;
    client.consumer().stop_consuming().await;

    assert_eq!(acks[0].outcome, AckOutcome::Nack { requeue: false });
    assert_eq!(broker.acknowledgements().len(), 1);
    assert_eq!(broker.ready_count("orders-queue"), 0);
}

#[tokio::test]
async fn test_failure_with_requeue_enabled_requeues() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, orders_options());
    let attempts = Arc::new(AtomicUsize::new(0));

    let counter = attempts.clone();
    client
        .consumer()
        .start_consuming(
            move |_: DemoMessage, _: CancellationToken| {
                let attempt = counter.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt == 0 {
                        Err(anyhow!("transient failure"))
                    } else {
                        Ok(())
                    }
                }
            },
            None,
        )
        .await
        .unwrap();
    client
        .producer()
        .publish(&DemoMessage::new("retry me"), None, None)
        .await
        .unwrap();

    let acks = wait_for_acknowledgements(&broker, 2).await;
    client.consumer().stop_consuming().await;

    assert_eq!(acks[0].outcome, AckOutcome::Nack { requeue: true });
    assert_eq!(acks[1].outcome, AckOutcome::Ack);
    assert_eq!(acks[0].body, acks[1].body);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_stop_twice_is_a_no_op() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, orders_options());

    client.consumer().start_consuming(succeed, None).await.unwrap();
    client.consumer().stop_consuming().await;
    client.consumer().stop_consuming().await;

    assert!(!client.consumer().is_consuming().await);
    assert_eq!(broker.consumer_count("orders-queue"), 0);

    // Idle again, so it can be restarted
    client.consumer().start_consuming(succeed, None).await.unwrap();
    assert!(client.consumer().is_consuming().await);
    client.dispose().await;
}

#[tokio::test]
async fn test_stop_while_handling_nacks_with_requeue() {
    let broker = InMemoryBroker::new();
    let client = client(
        &broker,
        RabbitMqOptions {
            requeue_on_failure: false,
            ..orders_options()
        },
    );
    let started = Arc::new(Notify::new());

    let signal = started.clone();
    client
        .consumer()
        .start_consuming(
            move |_: DemoMessage, cancellation: CancellationToken| {
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    cancellation.cancelled().await;
                    anyhow::Result::<()>::Err(MessagingError::Cancelled.into())
                }
            },
            None,
        )
        .await
        .unwrap();
    client
        .producer()
        .publish(&DemoMessage::new("slow"), None, None)
        .await
        .unwrap();

    started.notified().await;
    client.consumer().stop_consuming().await;

    let acks = broker.acknowledgements();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].outcome, AckOutcome::Nack { requeue: true });
    assert_eq!(broker.ready_count("orders-queue"), 1);
}

#[tokio::test]
async fn test_stuck_handler_is_abandoned_after_grace_period() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, orders_options());
    let consumer = client
        .new_consumer()
        .with_shutdown_grace(Duration::from_millis(50));
    let started = Arc::new(Notify::new());

    let signal = started.clone();
    consumer
        .start_consuming(
            move |_: DemoMessage, _: CancellationToken| {
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    // ignores cancellation
                    tokio::time::sleep(Duration::from_secs(60)).await;
                    anyhow::Ok(())
                }
            },
            None,
        )
        .await
        .unwrap();
    client
        .producer()
        .publish(&DemoMessage::new("stuck"), None, None)
        .await
        .unwrap();

    started.notified().await;
    tokio::time::timeout(Duration::from_secs(2), consumer.stop_consuming())
        .await
        .unwrap();

    assert!(!consumer.is_consuming().await);
    // Closing the channel hands the unacked delivery back to the queue
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.ready_count("orders-queue"), 1);
}

#[tokio::test]
async fn test_handler_does_not_outlive_stop_after_grace_period() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, orders_options());
    let consumer = client
        .new_consumer()
        .with_shutdown_grace(Duration::from_millis(50));
    let started = Arc::new(Notify::new());
    let completions = Arc::new(AtomicUsize::new(0));

    let signal = started.clone();
    let finished = completions.clone();
    consumer
        .start_consuming(
            move |_: DemoMessage, _: CancellationToken| {
                let signal = signal.clone();
                let finished = finished.clone();
                async move {
                    signal.notify_one();
                    tokio::time::sleep(Duration::from_millis(300)).await;
                    finished.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            },
            None,
        )
        .await
        .unwrap();
    client
        .producer()
        .publish(&DemoMessage::new("slow"), None, None)
        .await
        .unwrap();

    started.notified().await;
    consumer.stop_consuming().await;
    assert!(!consumer.is_consuming().await);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(completions.load(Ordering::SeqCst), 0);
    assert!(broker.acknowledgements().is_empty());
}

#[tokio::test]
async fn test_settling_on_torn_down_channel_is_skipped() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, orders_options());
    let started = Arc::new(Notify::new());
    let release = Arc::new(Notify::new());

    let signal = started.clone();
    let gate = release.clone();
    client
        .consumer()
        .start_consuming(
            move |_: DemoMessage, _: CancellationToken| {
                let signal = signal.clone();
                let gate = gate.clone();
                async move {
                    signal.notify_one();
                    gate.notified().await;
                    anyhow::Ok(())
                }
            },
            None,
        )
        .await
        .unwrap();
    client
        .producer()
        .publish(&DemoMessage::new("in flight"), None, None)
        .await
        .unwrap();

    started.notified().await;
    broker.shutdown("CONNECTION_FORCED - broker restart");
    release.notify_one();
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert!(broker.acknowledgements().is_empty());
    assert_eq!(broker.unacked_count(), 0);
    assert_eq!(broker.ready_count("orders-queue"), 1);

    // Cleanup against the dead channel only logs
    client.consumer().stop_consuming().await;
    assert!(!client.consumer().is_consuming().await);
}

#[tokio::test]
async fn test_plain_error_after_cancellation_requeues() {
    let broker = InMemoryBroker::new();
    let client = client(
        &broker,
        RabbitMqOptions {
            requeue_on_failure: false,
            ..orders_options()
        },
    );
    let started = Arc::new(Notify::new());

    let signal = started.clone();
    client
        .consumer()
        .start_consuming(
            move |_: DemoMessage, cancellation: CancellationToken| {
                let signal = signal.clone();
                async move {
                    signal.notify_one();
                    cancellation.cancelled().await;
                    anyhow::Result::<()>::Err(anyhow!("gave up"))
                }
            },
            None,
        )
        .await
        .unwrap();
    client
        .producer()
        .publish(&DemoMessage::new("interrupted"), None, None)
        .await
        .unwrap();

    started.notified().await;
    client.consumer().stop_consuming().await;

    let acks = broker.acknowledgements();
    assert_eq!(acks.len(), 1);
    assert_eq!(acks[0].outcome, AckOutcome::Nack { requeue: true });
    assert_eq!(broker.ready_count("orders-queue"), 1);
}

#[tokio::test]
async fn test_consumers_get_separate_channels() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, orders_options());
    let second = client.new_consumer();

    client.consumer().start_consuming(succeed, None).await.unwrap();
    second
        .start_consuming(succeed, Some("orders-audit"))
        .await
        .unwrap();

    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(broker.channels_opened(), 2);
    assert_eq!(broker.consumer_count("orders-queue"), 1);
    assert_eq!(broker.consumer_count("orders-audit"), 1);

    second.stop_consuming().await;
    client.dispose().await;
}
