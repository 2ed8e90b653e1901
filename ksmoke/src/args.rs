//! Command-line arguments for ksmoke
//!
//! The message count, topic and broker come from the environment (see
//! [`crate::config`]). The flags here tune the producer; each can also be set
//! through the environment variable named next to it.

use crate::kafka_client::ClientOptions;
use crate::producer::ProducerOptions;
use clap::Parser;

/// Producer tuning options
#[derive(Parser, Debug)]
#[command(name = "ksmoke")]
#[command(about = "Send TIMES messages to TOPIC_NAME and wait for every acknowledgment")]
pub struct Args {
    /// Messages the send queue holds before enqueueing waits
    #[arg(long, env = "QUEUE_CAPACITY", default_value = "100000", value_parser = clap::value_parser!(u32).range(1..))]
    pub queue_capacity: u32,

    /// Produce acks: -1 waits for all in-sync replicas, 1 for the leader only
    #[arg(long, env = "ACKS", default_value = "-1", allow_negative_numbers = true, value_parser = parse_acks)]
    pub acks: i16,

    /// TCP connect attempts to the bootstrap broker, one second apart
    #[arg(long, env = "CONNECT_ATTEMPTS", default_value = "3", value_parser = clap::value_parser!(u32).range(1..))]
    pub connect_attempts: u32,

    /// Metadata lookups per topic while its partition leaders are not yet known, one second apart
    #[arg(long, env = "METADATA_ATTEMPTS", default_value = "5", value_parser = clap::value_parser!(u32).range(1..))]
    pub metadata_attempts: u32,

    /// Client id sent to the broker
    #[arg(long, env = "CLIENT_ID", default_value = "ksmoke")]
    pub client_id: String,

    /// Only log errors
    #[arg(short, long, default_value = "false")]
    pub quiet: bool,
}

impl Args {
    pub fn producer_options(&self) -> ProducerOptions {
        ProducerOptions {
            client: ClientOptions {
                client_id: self.client_id.clone(),
                connect_attempts: self.connect_attempts,
            },
            queue_capacity: self.queue_capacity as usize,
            acks: self.acks,
            metadata_attempts: self.metadata_attempts,
            ..ProducerOptions::default()
        }
    }
}

/// Accepts -1 and 1; acks=0 yields no acknowledgment to wait for
fn parse_acks(s: &str) -> Result<i16, String> {
    match s.parse::<i16>() {
        Ok(acks @ (-1 | 1)) => Ok(acks),
        Ok(0) => Err("acks=0 sends no acknowledgments to wait for".to_string()),
        Ok(other) => Err(format!("unsupported acks value {}, expected -1 or 1", other)),
        Err(e) => Err(e.to_string()),
    }
}
