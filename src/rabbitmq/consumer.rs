// src/rabbitmq/consumer.rs

use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use tokio::sync::Mutex;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::broker::{BrokerChannel, DeliveryStream, Envelope};
use super::channel_provider::ChannelProvider;
use super::codec::{JsonCodec, MessageCodec};
use super::errors::{MessagingError, Result};
use super::topology::Topology;
use crate::options::OptionsMonitor;

const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(5);
const PREFETCH_COUNT: u16 = 1;

/// Application code invoked once per delivered message.
///
/// Returning `Ok` acks the delivery; an error nacks it. The token is cancelled
/// when the consumer is stopping; a handler that gives up because of it should
/// return [`MessagingError::Cancelled`] so the message is requeued.
#[async_trait]
pub trait MessageHandler<T>: Send + Sync + 'static {
    async fn handle(&self, message: T, cancellation: CancellationToken) -> anyhow::Result<()>;
}

#[async_trait]
impl<T, F, Fut> MessageHandler<T> for F
where
    T: Send + 'static,
    F: Fn(T, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: T, cancellation: CancellationToken) -> anyhow::Result<()> {
        (self)(message, cancellation).await
    }
}

struct ActiveConsumer {
    channel: Arc<dyn BrokerChannel>,
    consumer_tag: String,
    queue: String,
    cancellation: CancellationToken,
    receive_loop: JoinHandle<()>,
}

enum ConsumerState {
    Idle,
    Consuming(ActiveConsumer),
}

/// Consumes one queue on a dedicated channel with manual acknowledgement.
///
/// Deliveries are handled one at a time (prefetch 1), so acks go out in
/// delivery order.
pub struct Consumer<C: MessageCodec = JsonCodec> {
    channels: Arc<ChannelProvider>,
    codec: Arc<C>,
    state: Mutex<ConsumerState>,
    shutdown_grace: Duration,
}

impl Consumer<JsonCodec> {
    pub fn new(channels: Arc<ChannelProvider>) -> Self {
        Self::with_codec(channels, JsonCodec)
    }
}

impl<C: MessageCodec> Consumer<C> {
    pub fn with_codec(channels: Arc<ChannelProvider>, codec: C) -> Self {
        Self {
            channels,
            codec: Arc::new(codec),
            state: Mutex::new(ConsumerState::Idle),
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }

    /// How long `stop_consuming` waits for an in-flight message before
    /// aborting the receive loop.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    pub async fn is_consuming(&self) -> bool {
        matches!(*self.state.lock().await, ConsumerState::Consuming(_))
    }

    /// Starts delivering messages from `queue` (or the configured queue) to
    /// `handler`.
    ///
    /// Fails with `InvalidState` if this consumer is already running. On any
    /// failure the dedicated channel is closed again and the consumer stays
    /// idle.
    pub async fn start_consuming<T, H>(&self, handler: H, queue: Option<&str>) -> Result<()>
    where
        T: DeserializeOwned + Send + 'static,
        H: MessageHandler<T>,
    {
        let mut state = self.state.lock().await;
        if let ConsumerState::Consuming(active) = &*state {
            return Err(MessagingError::InvalidState(format!(
                "consumer already started on queue '{}'",
                active.queue
            )));
        }

        let monitor = self.channels.connection_manager().options().clone();
        let options = monitor.current();
        let queue = queue.unwrap_or(&options.queue_name).to_string();
        if queue.trim().is_empty() {
            return Err(MessagingError::Configuration(
                "QueueName must be configured before starting the consumer.".to_string(),
            ));
        }
        let topology = Topology::for_consume(&options, &queue)?;

        let channel = self.channels.create_channel().await?;
        let consumer_tag = format!("consumer-{}", Uuid::new_v4());

        let deliveries = match open_consumer(channel.as_ref(), &topology, &consumer_tag).await {
            Ok(deliveries) => deliveries,
            Err(err) => {
                if let Err(close_err) = channel.close().await {
                    debug!(error = %close_err, "Failed to close channel after failed start");
                }
                return Err(err);
            }
        };

        let cancellation = CancellationToken::new();
        let receive_loop = ReceiveLoop {
            channel: channel.clone(),
            codec: self.codec.clone(),
            handler: Arc::new(handler),
            options: monitor,
            queue: queue.clone(),
            cancellation: cancellation.clone(),
            _message: PhantomData,
        };
        let receive_loop = tokio::spawn(receive_loop.run(deliveries));

        info!(
            queue = %queue,
            consumer_tag = %consumer_tag,
            channel = channel.id(),
            "Started consuming"
        );

        *state = ConsumerState::Consuming(ActiveConsumer {
            channel,
            consumer_tag,
            queue,
            cancellation,
            receive_loop,
        });
        Ok(())
    }

    /// Stops the consumer. Calling it while idle does nothing.
    ///
    /// Cleanup failures are logged; the consumer always ends up idle.
    pub async fn stop_consuming(&self) {
        let mut state = self.state.lock().await;
        let ConsumerState::Consuming(active) = &mut *state else {
            return;
        };

        active.cancellation.cancel();

        if let Err(err) = active.channel.cancel(&active.consumer_tag).await {
            warn!(
                queue = %active.queue,
                consumer_tag = %active.consumer_tag,
                error = %err,
                "Failed to cancel consumer"
            );
        }

        match timeout(self.shutdown_grace, &mut active.receive_loop).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                warn!(queue = %active.queue, error = %err, "Receive loop ended abnormally");
            }
            Err(elapsed) => {
                let err = MessagingError::from(elapsed);
                warn!(
                    queue = %active.queue,
                    grace_ms = self.shutdown_grace.as_millis() as u64,
                    error = %err,
                    "Receive loop did not finish in time; aborting"
                );
                // Awaiting the aborted loop drops its handler task with it
                active.receive_loop.abort();
                let _ = (&mut active.receive_loop).await;
            }
        }

        if active.channel.is_open() {
            if let Err(err) = active.channel.close().await {
                warn!(queue = %active.queue, error = %err, "Failed to close consumer channel");
            }
        }

        info!(queue = %active.queue, "Stopped consuming");
        *state = ConsumerState::Idle;
    }
}

impl<C: MessageCodec> Drop for Consumer<C> {
    fn drop(&mut self) {
        if let ConsumerState::Consuming(active) = self.state.get_mut() {
            active.cancellation.cancel();
            active.receive_loop.abort();
        }
    }
}

async fn open_consumer(
    channel: &dyn BrokerChannel,
    topology: &Topology,
    consumer_tag: &str,
) -> Result<DeliveryStream> {
    topology.declare(channel).await?;
    channel.set_prefetch(PREFETCH_COUNT).await?;

    let queue = topology.queue.as_deref().unwrap_or_default();
    channel.consume(queue, consumer_tag).await
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Settlement {
    Ack,
    Nack { requeue: bool },
}

struct ReceiveLoop<T, C> {
    channel: Arc<dyn BrokerChannel>,
    codec: Arc<C>,
    handler: Arc<dyn MessageHandler<T>>,
    options: OptionsMonitor,
    queue: String,
    cancellation: CancellationToken,
    _message: PhantomData<fn() -> T>,
}

impl<T, C> ReceiveLoop<T, C>
where
    T: DeserializeOwned + Send + 'static,
    C: MessageCodec,
{
    async fn run(self, mut deliveries: DeliveryStream) {
        loop {
            let next = tokio::select! {
                biased;
                _ = self.cancellation.cancelled() => break,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(envelope)) => self.handle_delivery(envelope).await,
                Some(Err(err)) => {
                    warn!(queue = %self.queue, error = %err, "Delivery stream failed");
                    break;
                }
                None => {
                    debug!(queue = %self.queue, "Delivery stream ended");
                    break;
                }
            }
        }
    }

    async fn handle_delivery(&self, envelope: Envelope) {
        let delivery_tag = envelope.delivery_tag;

        if self.cancellation.is_cancelled() {
            self.settle(delivery_tag, Settlement::Nack { requeue: true })
                .await;
            return;
        }

        debug!(
            queue = %self.queue,
            delivery_tag,
            redelivered = envelope.redelivered,
            exchange = %envelope.exchange,
            routing_key = %envelope.routing_key,
            content_type = ?envelope.properties.content_type,
            "Received message"
        );

        let requeue_on_failure = self.options.current().requeue_on_failure;
        let settlement = match self.codec.decode::<T>(&envelope.body) {
            Ok(message) => self.dispatch(message, delivery_tag, requeue_on_failure).await,
            Err(err) => {
                error!(
                    queue = %self.queue,
                    delivery_tag,
                    error = %err,
                    "Failed to deserialize message"
                );
                Settlement::Nack {
                    requeue: requeue_on_failure,
                }
            }
        };

        self.settle(delivery_tag, settlement).await;
    }

    async fn dispatch(&self, message: T, delivery_tag: u64, requeue_on_failure: bool) -> Settlement {
        let handler = self.handler.clone();
        let token = self.cancellation.clone();
        // Owned by this future: dropping the loop aborts the handler too
        let mut tasks = JoinSet::new();
        tasks.spawn(async move { handler.handle(message, token).await });

        match tasks.join_next().await {
            Some(Ok(Ok(()))) => Settlement::Ack,
            Some(Ok(Err(err))) if self.cancellation.is_cancelled() || is_cancellation(&err) => {
                info!(queue = %self.queue, delivery_tag, "Message processing cancelled");
                Settlement::Nack { requeue: true }
            }
            Some(Ok(Err(err))) => {
                let err = MessagingError::Handler(format!("{:#}", err));
                error!(queue = %self.queue, delivery_tag, error = %err, "Message handler failed");
                Settlement::Nack {
                    requeue: requeue_on_failure,
                }
            }
            Some(Err(join_err)) if join_err.is_panic() => {
                error!(queue = %self.queue, delivery_tag, "Message handler panicked");
                Settlement::Nack {
                    requeue: requeue_on_failure,
                }
            }
            Some(Err(_)) | None => Settlement::Nack { requeue: true },
        }
    }

    async fn settle(&self, delivery_tag: u64, settlement: Settlement) {
        if !self.channel.is_open() {
            debug!(
                queue = %self.queue,
                delivery_tag,
                ?settlement,
                "Channel already closed; skipping acknowledgement"
            );
            return;
        }

        let result = match settlement {
            Settlement::Ack => self.channel.ack(delivery_tag).await,
            Settlement::Nack { requeue } => self.channel.nack(delivery_tag, requeue).await,
        };

        match result {
            Ok(()) => debug!(queue = %self.queue, delivery_tag, ?settlement, "Message settled"),
            Err(err) if !self.channel.is_open() => {
                debug!(queue = %self.queue, delivery_tag, error = %err, "Channel closed during acknowledgement");
            }
            Err(err) => {
                warn!(queue = %self.queue, delivery_tag, error = %err, "Failed to acknowledge message");
            }
        }
    }
}

fn is_cancellation(err: &anyhow::Error) -> bool {
    err.downcast_ref::<MessagingError>()
        .map_or(false, MessagingError::is_cancellation)
}
