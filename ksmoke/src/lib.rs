//! ksmoke - Kafka smoke-test producer
//!
//! Publishes `TIMES` sequential integer messages to `TOPIC_NAME` and waits for a
//! delivery acknowledgment for every one of them before returning.

pub mod args;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod kafka_client;
pub mod message;
#[cfg(test)]
mod mock_broker;
pub mod producer;

// Re-export commonly used types
pub use config::{BootstrapAddress, Settings};
pub use coordinator::DeliverySummary;
pub use error::{DeliveryError, Error, Result};
pub use message::{Event, OutboundMessage, TopicPartition};
pub use producer::{ProducerHandle, ProducerOptions};
