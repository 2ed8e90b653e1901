//! Error types for ksmoke
//!
//! Startup failures are fatal and surface as [`Error`]. Per-message failures
//! are reported asynchronously as [`DeliveryError`] inside delivery events
//! and never propagate.

use std::num::ParseIntError;
use thiserror::Error;

/// Fatal errors raised while configuring, connecting or coordinating
#[derive(Debug, Error)]
pub enum Error {
    /// An integer setting holds text that is not a base-10 integer
    #[error("Failed to parse {name}={value:?} as an integer: {source}")]
    ConfigParse {
        name: String,
        value: String,
        #[source]
        source: ParseIntError,
    },

    /// The producer rejected its configuration or could not be constructed
    #[error("Invalid producer configuration: {0}")]
    ConnectionConfig(String),

    /// A message was enqueued after the producer stopped accepting them
    #[error("Producer send queue is closed")]
    QueueClosed,

    /// The delivery event stream ended before every acknowledgment arrived
    #[error("Delivery event stream closed after {observed} of {expected} acknowledgments")]
    EventStreamClosed { observed: u64, expected: u64 },
}

pub type Result<T> = std::result::Result<T, Error>;

/// Per-message delivery failure reported by the producer
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DeliveryError {
    /// The broker answered with a non-zero error code
    #[error("{}", broker_code_name(.code))]
    Broker { code: i16 },

    /// The request never got a usable answer
    #[error("{0}")]
    Transport(String),
}

fn broker_code_name(code: &i16) -> String {
    error_code_name(*code)
}

/// Maps a Kafka error code to its protocol name
pub fn error_code_name(code: i16) -> String {
    match code {
        0 => "NONE".to_string(),
        1 => "OFFSET_OUT_OF_RANGE".to_string(),
        2 => "CORRUPT_MESSAGE".to_string(),
        3 => "UNKNOWN_TOPIC_OR_PARTITION".to_string(),
        5 => "LEADER_NOT_AVAILABLE".to_string(),
        6 => "NOT_LEADER_FOR_PARTITION".to_string(),
        7 => "REQUEST_TIMED_OUT".to_string(),
        10 => "MESSAGE_TOO_LARGE".to_string(),
        17 => "INVALID_TOPIC_EXCEPTION".to_string(),
        19 => "NOT_ENOUGH_REPLICAS".to_string(),
        20 => "NOT_ENOUGH_REPLICAS_AFTER_APPEND".to_string(),
        21 => "INVALID_REQUIRED_ACKS".to_string(),
        29 => "TOPIC_AUTHORIZATION_FAILED".to_string(),
        35 => "UNSUPPORTED_VERSION".to_string(),
        43 => "UNSUPPORTED_FOR_MESSAGE_FORMAT".to_string(),
        87 => "INVALID_RECORD".to_string(),
        code => format!("UNKNOWN_ERROR_CODE_{}", code),
    }
}
