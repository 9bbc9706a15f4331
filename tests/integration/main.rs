// Integration tests run against the in-memory broker; no RabbitMQ instance is needed.

mod common;

mod connection_test;
mod consumer_test;
mod scenario_test;
