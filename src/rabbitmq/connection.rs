// src/rabbitmq/connection.rs
// Owns the process-wide broker connection.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use super::broker::{Broker, BrokerConnection, ConnectionEvent, ConnectionListener};
use super::errors::{MessagingError, Result};
use super::guarded::GuardedSlot;
use crate::options::OptionsMonitor;

const MAX_RECONNECT_DELAY_MS: u64 = 30_000;
const EVENT_CAPACITY: usize = 16;

/// Lazily opens one connection and transparently replaces it once the broker
/// reports it closed.
///
/// Endpoint and credentials are read from the options monitor on every
/// (re)connect, so rotated credentials are picked up without a restart.
pub struct ConnectionManager {
    broker: Arc<dyn Broker>,
    options: OptionsMonitor,
    slot: GuardedSlot<dyn BrokerConnection>,
    disposed: AtomicBool,
    events: broadcast::Sender<ConnectionEvent>,
    max_reconnect_attempts: u32,
    reconnect_delay_ms: u64,
}

impl ConnectionManager {
    pub fn new(broker: Arc<dyn Broker>, options: OptionsMonitor) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        ConnectionManager {
            broker,
            options,
            slot: GuardedSlot::new(),
            disposed: AtomicBool::new(false),
            events,
            max_reconnect_attempts: 1,
            reconnect_delay_ms: 1000,
        }
    }

    /// Retry failed connects up to `max_attempts` times in total, doubling the
    /// delay between attempts.
    pub fn with_reconnect_policy(mut self, max_attempts: u32, initial_delay_ms: u64) -> Self {
        self.max_reconnect_attempts = max_attempts.max(1);
        self.reconnect_delay_ms = initial_delay_ms.min(MAX_RECONNECT_DELAY_MS);
        self
    }

    pub fn options(&self) -> &OptionsMonitor {
        &self.options
    }

    /// Shutdown and callback-fault notifications from the current connection.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        !self.disposed.load(Ordering::SeqCst) && self.slot.current_if(|c| c.is_open()).is_some()
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MessagingError::Disposed("ConnectionManager"));
        }
        Ok(())
    }

    pub async fn get_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        self.ensure_not_disposed()?;
        self.options.current().validate_endpoint()?;

        self.slot
            .get_or_create(
                |connection| connection.is_open(),
                |stale| async move {
                    // dispose may have won the gate first
                    self.ensure_not_disposed()?;
                    if let Some(stale) = stale {
                        info!("RabbitMQ connection is no longer open; reconnecting");
                        release(stale).await;
                    }
                    self.establish_connection().await
                },
            )
            .await
    }

    async fn establish_connection(&self) -> Result<Arc<dyn BrokerConnection>> {
        let options = self.options.current();
        options.validate_endpoint()?;
        let endpoint = options.endpoint();

        let mut attempts = 0;
        let mut delay = self.reconnect_delay_ms;

        loop {
            info!(%endpoint, "Attempting to connect to RabbitMQ");

            match self.broker.open_connection(&endpoint).await {
                Ok(connection) => {
                    connection.subscribe(self.listener());
                    info!(%endpoint, "Successfully connected to RabbitMQ");
                    return Ok(connection);
                }
                Err(err) => {
                    attempts += 1;
                    error!(
                        %endpoint,
                        attempt = attempts,
                        max_attempts = self.max_reconnect_attempts,
                        error = %err,
                        "Failed to connect to RabbitMQ"
                    );

                    if attempts >= self.max_reconnect_attempts {
                        return Err(err);
                    }

                    // Exponential backoff with ±15% jitter
                    let jitter = (rand::random::<f64>() * 0.3 - 0.15) * delay as f64;
                    let sleep_time = (delay as f64 + jitter).max(0.0) as u64;
                    debug!(sleep_ms = sleep_time, "Waiting before next connect attempt");
                    sleep(Duration::from_millis(sleep_time)).await;

                    delay = delay.saturating_mul(2).min(MAX_RECONNECT_DELAY_MS);
                }
            }
        }
    }

    fn listener(&self) -> ConnectionListener {
        let events = self.events.clone();
        Arc::new(move |event: ConnectionEvent| {
            match &event {
                ConnectionEvent::Shutdown { reason } => {
                    warn!(%reason, "RabbitMQ connection shut down");
                }
                ConnectionEvent::CallbackFault { message } => {
                    error!(%message, "RabbitMQ connection callback fault");
                }
            }
            // no subscribers is fine
            let _ = events.send(event);
        })
    }

    /// Closes the connection. Every later call fails with `Disposed`.
    pub async fn dispose(&self) {
        let (_gate, current) = self.slot.lock_and_take().await;
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(connection) = current {
            release(connection).await;
        }
        info!("RabbitMQ connection manager disposed");
    }
}

async fn release(connection: Arc<dyn BrokerConnection>) {
    connection.unsubscribe_all();
    if !connection.is_open() {
        debug!("Dropping closed RabbitMQ connection");
        return;
    }
    if let Err(err) = connection.close().await {
        warn!(error = %err, "Failed to close RabbitMQ connection");
    }
}
