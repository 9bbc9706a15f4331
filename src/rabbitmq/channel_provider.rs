// src/rabbitmq/channel_provider.rs

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::broker::BrokerChannel;
use super::connection::ConnectionManager;
use super::errors::{MessagingError, Result};
use super::guarded::GuardedSlot;

/// Hands out channels on the managed connection.
///
/// The shared channel is for publishing only. Consumers get their own
/// channel from [`ChannelProvider::create_channel`] so one consumer's prefetch
/// window and channel errors never affect another.
pub struct ChannelProvider {
    connections: Arc<ConnectionManager>,
    shared: GuardedSlot<dyn BrokerChannel>,
    disposed: AtomicBool,
}

impl ChannelProvider {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self {
            connections,
            shared: GuardedSlot::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn connection_manager(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    fn ensure_not_disposed(&self) -> Result<()> {
        if self.disposed.load(Ordering::SeqCst) {
            return Err(MessagingError::Disposed("ChannelProvider"));
        }
        Ok(())
    }

    pub async fn get_or_create_shared_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.ensure_not_disposed()?;

        self.shared
            .get_or_create(
                |channel| channel.is_open(),
                |stale| async move {
                    self.ensure_not_disposed()?;
                    if let Some(stale) = stale {
                        debug!(channel = stale.id(), "Shared channel closed; recreating");
                    }

                    let channel = self.open().await?;
                    if self.connections.options().current().publisher_confirms {
                        if let Err(err) = channel.confirm_select().await {
                            close_quietly(channel.as_ref()).await;
                            return Err(err);
                        }
                    }

                    debug!(channel = channel.id(), "Shared channel created");
                    Ok(channel)
                },
            )
            .await
    }

    /// A fresh channel owned by the caller, who must close it.
    pub async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        self.ensure_not_disposed()?;

        let channel = self.open().await?;
        debug!(channel = channel.id(), "Dedicated channel created");
        Ok(channel)
    }

    async fn open(&self) -> Result<Arc<dyn BrokerChannel>> {
        let connection = self.connections.get_connection().await?;
        connection.open_channel().await
    }

    /// Closes the shared channel. Dedicated channels are left to their owners.
    pub async fn dispose(&self) {
        let (_gate, shared) = self.shared.lock_and_take().await;
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(channel) = shared {
            if channel.is_open() {
                if let Err(err) = channel.close().await {
                    warn!(channel = channel.id(), error = %err, "Failed to close shared channel");
                }
            }
        }
        info!("Channel provider disposed");
    }
}

async fn close_quietly(channel: &dyn BrokerChannel) {
    if let Err(err) = channel.close().await {
        debug!(channel = channel.id(), error = %err, "Failed to close channel");
    }
}
