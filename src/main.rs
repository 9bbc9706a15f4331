use std::sync::Arc;

use anyhow::{Context, Result};
use rabbitmq_messaging::config::load_options;
use rabbitmq_messaging::message::DemoMessage;
use rabbitmq_messaging::rabbitmq::Broker;
use rabbitmq_messaging::{InMemoryBroker, LapinBroker, MessagingClient, OptionsMonitor};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let options = load_options().context("Failed to load RabbitMQ options")?;
    info!(?options, "Loaded RabbitMQ options");

    // RABBITMQ_IN_MEMORY=1 runs the sample without a broker
    let broker: Arc<dyn Broker> = match std::env::var("RABBITMQ_IN_MEMORY").as_deref() {
        Ok("1") | Ok("true") => {
            warn!("Using the in-memory broker");
            Arc::new(InMemoryBroker::new())
        }
        _ => Arc::new(LapinBroker::new()),
    };

    let client = MessagingClient::new(broker, OptionsMonitor::new(options));

    for content in ["first", "second", "third"] {
        client
            .producer()
            .publish(&DemoMessage::new(content), None, None)
            .await
            .context("Failed to publish demo message")?;
    }

    client
        .consumer()
        .start_consuming(handle_demo_message, None)
        .await
        .context("Failed to start consumer")?;

    info!("Service running. Press Ctrl+C to exit.");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    client.dispose().await;
    Ok(())
}

async fn handle_demo_message(message: DemoMessage, _cancellation: CancellationToken) -> Result<()> {
    info!(
        id = %message.id,
        content = %message.content,
        created_at = %message.created_at,
        "Received demo message"
    );
    Ok(())
}
