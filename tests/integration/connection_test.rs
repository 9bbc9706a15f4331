use std::sync::Arc;
use std::time::Duration;

use rabbitmq_messaging::rabbitmq::memory::InMemoryBroker;
use rabbitmq_messaging::rabbitmq::{ChannelProvider, ConnectionEvent};
use rabbitmq_messaging::{ConnectionManager, MessagingError, OptionsMonitor};

use crate::common::orders_options;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_first_use_opens_one_connection() {
    let broker = InMemoryBroker::new();
    broker.set_connect_delay(Duration::from_millis(50));
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        OptionsMonitor::new(orders_options()),
    ));

    let mut tasks = Vec::new();
    for _ in 0..10 {
        let manager = manager.clone();
        tasks.push(tokio::spawn(async move { manager.get_connection().await }));
    }

    let mut connections = Vec::new();
    for task in tasks {
        connections.push(task.await.unwrap().unwrap());
    }

    assert_eq!(broker.connections_opened(), 1);
    assert!(connections.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
}

#[tokio::test]
async fn test_reconnect_after_shutdown_uses_latest_credentials() {
    let broker = InMemoryBroker::new();
    let monitor = OptionsMonitor::new(orders_options());
    let manager = ConnectionManager::new(Arc::new(broker.clone()), monitor.clone());

    manager.get_connection().await.unwrap();
    monitor.modify(|options| {
        options.user_name = "rotated-user".into();
        options.password = "rotated-password".into();
    });

    broker.shutdown("CONNECTION_FORCED - broker forced connection closure");
    assert!(!manager.is_connected());

    let connection = manager.get_connection().await.unwrap();
    assert!(connection.is_open());

    let endpoints = broker.endpoints();
    assert_eq!(endpoints.len(), 2);
    assert_eq!(endpoints[0].username, "guest");
    assert_eq!(endpoints[1].username, "rotated-user");
    assert_eq!(endpoints[1].password, "rotated-password");
}

#[tokio::test]
async fn test_events_are_forwarded_to_subscribers() {
    let broker = InMemoryBroker::new();
    let manager = ConnectionManager::new(
        Arc::new(broker.clone()),
        OptionsMonitor::new(orders_options()),
    );
    let mut events = manager.subscribe_events();

    manager.get_connection().await.unwrap();
    broker.raise_callback_fault("handler threw");
    broker.shutdown("gone");

    assert_eq!(
        events.recv().await.unwrap(),
        ConnectionEvent::CallbackFault {
            message: "handler threw".into()
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        ConnectionEvent::Shutdown {
            reason: "gone".into()
        }
    );
}

#[tokio::test]
async fn test_callback_fault_does_not_close_connection() {
    let broker = InMemoryBroker::new();
    let manager = ConnectionManager::new(
        Arc::new(broker.clone()),
        OptionsMonitor::new(orders_options()),
    );

    let first = manager.get_connection().await.unwrap();
    broker.raise_callback_fault("listener failed");

    let second = manager.get_connection().await.unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(broker.connections_opened(), 1);
}

#[tokio::test]
async fn test_shared_channel_recreated_when_closed() {
    let broker = InMemoryBroker::new();
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        OptionsMonitor::new(orders_options()),
    ));
    let channels = ChannelProvider::new(manager.clone());

    let first = channels.get_or_create_shared_channel().await.unwrap();
    first.close().await.unwrap();
    assert!(manager.is_connected());

    let second = channels.get_or_create_shared_channel().await.unwrap();
    assert!(second.is_open());
    assert_eq!(broker.connections_opened(), 1);
    assert_eq!(broker.channels_opened(), 2);
}

#[tokio::test]
async fn test_use_after_dispose_fails() {
    let broker = InMemoryBroker::new();
    let manager = Arc::new(ConnectionManager::new(
        Arc::new(broker.clone()),
        OptionsMonitor::new(orders_options()),
    ));
    let channels = ChannelProvider::new(manager.clone());
    channels.get_or_create_shared_channel().await.unwrap();

    channels.dispose().await;
    manager.dispose().await;

    assert!(matches!(
        channels.get_or_create_shared_channel().await.err(),
        Some(MessagingError::Disposed("ChannelProvider"))
    ));
    assert!(matches!(
        manager.get_connection().await.err(),
        Some(MessagingError::Disposed("ConnectionManager"))
    ));
    assert_eq!(broker.open_connections(), 0);
}

#[tokio::test]
#[ignore] // Requires a running RabbitMQ instance
async fn test_connects_to_local_rabbitmq() {
    let manager = ConnectionManager::new(
        Arc::new(rabbitmq_messaging::LapinBroker::new()),
        OptionsMonitor::new(orders_options()),
    );

    let connection = manager.get_connection().await.unwrap();
    assert!(connection.is_open());
    manager.dispose().await;
}
