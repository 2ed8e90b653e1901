//! Messages handed to the producer and events it reports back

use crate::error::DeliveryError;
use bytes::Bytes;
use std::fmt;

/// A message waiting in the producer's send queue
///
/// Carries no partition: the producer picks one when the message is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Bytes,
}

impl OutboundMessage {
    /// Message addressed to any partition of `topic`
    pub fn to_any(topic: &str, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.to_string(),
            payload: payload.into(),
        }
    }
}

/// Broker-assigned offset, unset until the broker acknowledges the write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offset {
    Unset,
    At(i64),
}

impl fmt::Display for Offset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Offset::Unset => write!(f, "unset"),
            Offset::At(offset) => write!(f, "{}", offset),
        }
    }
}

/// Where a message ended up, and whether it got there
///
/// Displays as `topic[partition]@offset`, with `(error)` appended on failure.
/// A message that never got a partition shows partition `-1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicPartition {
    pub topic: String,
    pub partition: i32,
    pub offset: Offset,
    pub error: Option<DeliveryError>,
}

impl TopicPartition {
    pub fn delivered(topic: &str, partition: i32, offset: i64) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset: Offset::At(offset),
            error: None,
        }
    }

    pub fn failed(topic: &str, partition: i32, error: DeliveryError) -> Self {
        Self {
            topic: topic.to_string(),
            partition,
            offset: Offset::Unset,
            error: Some(error),
        }
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}[{}]@{}", self.topic, self.partition, self.offset)?;
        if let Some(error) = &self.error {
            write!(f, "({})", error)?;
        }
        Ok(())
    }
}

/// Event emitted on the producer's event stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Delivery report for exactly one enqueued message
    Delivery(TopicPartition),
    /// Client-level error not tied to a single message
    ClientError(String),
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Delivery(tp) => write!(f, "Delivery({})", tp),
            Event::ClientError(e) => write!(f, "ClientError({})", e),
        }
    }
}
