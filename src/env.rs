use std::env;
use std::str::FromStr;

use dotenv::dotenv;

use crate::options::RabbitMqOptions;
use crate::rabbitmq::errors::{MessagingError, Result};

pub const HOST: &str = "RABBITMQ_HOST";
pub const PORT: &str = "RABBITMQ_PORT";
pub const VHOST: &str = "RABBITMQ_VHOST";
pub const USERNAME: &str = "RABBITMQ_USERNAME";
pub const PASSWORD: &str = "RABBITMQ_PASSWORD";
pub const EXCHANGE: &str = "RABBITMQ_EXCHANGE";
pub const EXCHANGE_KIND: &str = "RABBITMQ_EXCHANGE_KIND";
pub const QUEUE: &str = "RABBITMQ_QUEUE";
pub const ROUTING_KEY: &str = "RABBITMQ_ROUTING_KEY";
pub const REQUEUE_ON_FAILURE: &str = "RABBITMQ_REQUEUE_ON_FAILURE";
pub const PUBLISHER_CONFIRMS: &str = "RABBITMQ_PUBLISHER_CONFIRMS";

/// Loads `.env` if present, then overlays process environment variables.
pub fn apply_env_overrides(options: &mut RabbitMqOptions) -> Result<()> {
    dotenv().ok();
    apply_overrides(options, |key| env::var(key).ok())
}

/// Overlays every variable `lookup` knows about onto `options`.
pub fn apply_overrides<F>(options: &mut RabbitMqOptions, lookup: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    let text = |key: &str, target: &mut String| {
        if let Some(value) = lookup(key) {
            *target = value;
        }
    };

    text(HOST, &mut options.host_name);
    text(VHOST, &mut options.virtual_host);
    text(USERNAME, &mut options.user_name);
    text(PASSWORD, &mut options.password);
    text(EXCHANGE, &mut options.exchange_name);
    text(EXCHANGE_KIND, &mut options.exchange_type);
    text(QUEUE, &mut options.queue_name);
    text(ROUTING_KEY, &mut options.routing_key);

    if let Some(value) = lookup(PORT) {
        options.port = parse(PORT, &value)?;
    }
    if let Some(value) = lookup(REQUEUE_ON_FAILURE) {
        options.requeue_on_failure = parse_flag(REQUEUE_ON_FAILURE, &value)?;
    }
    if let Some(value) = lookup(PUBLISHER_CONFIRMS) {
        options.publisher_confirms = parse_flag(PUBLISHER_CONFIRMS, &value)?;
    }

    Ok(())
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value.trim().parse().map_err(|e: T::Err| {
        MessagingError::Configuration(format!("{} has invalid value '{}': {}", key, value, e))
    })
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(MessagingError::Configuration(format!(
            "{} has invalid value '{}': expected true or false",
            key, value
        ))),
    }
}
