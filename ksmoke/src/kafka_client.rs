//! Kafka Client Implementation
//!
//! This module provides a low-level Kafka client that talks to one broker using the
//! Kafka protocol. It handles connection management, API version negotiation, topic
//! metadata lookup and single-record produce requests. A client connected to the
//! bootstrap broker can open further clients to the other brokers of its cluster.

use anyhow::{anyhow, Result};
use bytes::Bytes;
use kafka_protocol::{
    messages::{
        api_versions_request::ApiVersionsRequest,
        api_versions_response::ApiVersionsResponse,
        metadata_request::{MetadataRequest, MetadataRequestTopic},
        metadata_response::MetadataResponse,
        produce_request::{PartitionProduceData, ProduceRequest, TopicProduceData},
        produce_response::ProduceResponse,
        ApiKey, RequestHeader, ResponseHeader, TopicName,
    },
    protocol::{Decodable, Encodable, StrBytes},
    records::{Compression, Record, RecordBatchEncoder, RecordEncodeOptions, TimestampType},
};
use std::{
    collections::HashMap,
    sync::atomic::{AtomicU64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::Mutex,
    time::{sleep, Duration},
};
use tracing::{debug, info, warn};

/// Largest response frame accepted from the broker
const MAX_RESPONSE_SIZE: usize = 100 * 1024 * 1024;

/// Broker-side timeout for produce requests
const PRODUCE_TIMEOUT_MS: i32 = 30000;

/// Connection settings for [`KafkaClient`]
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Client id sent in every request header
    pub client_id: String,
    /// TCP connect attempts, one second apart
    pub connect_attempts: u32,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_id: "ksmoke".to_string(),
            connect_attempts: 3,
        }
    }
}

/// A partition and the broker currently leading it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLeader {
    pub partition: i32,
    /// Node id of the leader, -1 while the partition has none
    pub leader: i32,
}

/// Topic metadata as seen by the bootstrap broker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TopicMetadata {
    Partitions {
        /// Sorted by partition id
        partitions: Vec<PartitionLeader>,
        /// `host:port` of every broker in the cluster, by node id
        brokers: HashMap<i32, String>,
    },
    /// Topic-level error code (e.g. 3 for an unknown topic)
    Error(i16),
}

/// Outcome of a produce request for one partition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionAck {
    pub partition: i32,
    pub error_code: i16,
    pub base_offset: i64,
}

/// Low-level Kafka client for direct broker communication
///
/// This client maintains a persistent TCP connection to a Kafka broker and handles:
/// - Protocol message encoding/decoding
/// - API version negotiation and compatibility
/// - Request correlation
pub struct KafkaClient {
    /// Requests and responses are strictly paired on one connection,
    /// so the stream is held for the whole round trip
    stream: Mutex<TcpStream>,

    /// Monotonically increasing correlation ID for request/response matching
    correlation_id: AtomicU64,

    client_id: String,

    /// Supported API versions discovered from the broker
    /// Maps API key (i16) to (min_version, max_version) tuple
    api_versions: HashMap<i16, (i16, i16)>,
}

impl KafkaClient {
    /// Establishes a connection to a Kafka broker and discovers supported API versions
    ///
    /// # Arguments
    /// * `broker` - Broker address in "host:port" format (e.g., "localhost:9092")
    /// * `options` - Client id and connect attempts
    ///
    /// # Returns
    /// * `Ok(KafkaClient)` - Fully initialized client ready for operations
    /// * `Err(anyhow::Error)` - If connection or version discovery fails
    pub async fn connect(broker: &str, options: &ClientOptions) -> Result<Self> {
        info!("Connecting to Kafka broker at {}", broker);

        let stream = Self::connect_with_retry(broker, options.connect_attempts).await?;

        info!("Successfully connected to Kafka broker");

        let mut client = KafkaClient {
            stream: Mutex::new(stream),
            correlation_id: AtomicU64::new(1),
            client_id: options.client_id.clone(),
            api_versions: HashMap::new(),
        };

        client.discover_api_versions().await?;

        Ok(client)
    }

    /// Connects to another broker of the same cluster
    ///
    /// Reuses the API versions and client id negotiated on this connection, so
    /// the version handshake is skipped. Connects once, without retrying.
    pub async fn connect_peer(&self, broker: &str) -> Result<Self> {
        debug!(
            "Connecting to Kafka broker at {} (using pre-discovered API versions)",
            broker
        );

        let stream = TcpStream::connect(broker)
            .await
            .map_err(|e| anyhow!("Failed to connect to Kafka broker at {}: {}", broker, e))?;

        Ok(KafkaClient {
            stream: Mutex::new(stream),
            correlation_id: AtomicU64::new(1),
            client_id: self.client_id.clone(),
            api_versions: self.api_versions.clone(),
        })
    }

    /// Attempts to establish TCP connection, retrying every second
    async fn connect_with_retry(broker: &str, max_attempts: u32) -> Result<TcpStream> {
        let max_attempts = max_attempts.max(1);
        let retry_interval = Duration::from_secs(1);
        let mut attempt = 1;

        loop {
            match TcpStream::connect(broker).await {
                Ok(stream) => {
                    if attempt > 1 {
                        info!(
                            "Successfully connected to Kafka broker on attempt {}",
                            attempt
                        );
                    }
                    return Ok(stream);
                }
                Err(e) if attempt >= max_attempts => {
                    return Err(anyhow!(
                        "Failed to connect to Kafka broker at {} after {} attempts: {}",
                        broker,
                        max_attempts,
                        e
                    ));
                }
                Err(e) => {
                    warn!(
                        "Connection attempt {} failed, retrying in 1 second: {}",
                        attempt, e
                    );
                    sleep(retry_interval).await;
                    attempt += 1;
                }
            }
        }
    }

    /// Sends a Kafka protocol request and returns the raw response bytes
    ///
    /// The request is framed with a 4-byte big-endian length prefix. The response
    /// is read back on the same connection before the lock is released.
    pub async fn send_request<T: Encodable + std::fmt::Debug>(
        &self,
        api_key: ApiKey,
        request: &T,
        version: i16,
    ) -> Result<Bytes> {
        let correlation_id = self.correlation_id.fetch_add(1, Ordering::SeqCst) as i32;

        debug!(
            "Sending {:?} request (correlation_id: {}, version: {})",
            api_key, correlation_id, version
        );

        let message = encode_request(api_key, request, version, correlation_id, &self.client_id)?;

        let mut stream = self.stream.lock().await;
        stream
            .write_all(&message)
            .await
            .map_err(|e| anyhow!("Failed to write request to stream: {}", e))?;

        let mut size_buf = [0u8; 4];
        stream.read_exact(&mut size_buf).await
            .map_err(|e| anyhow!("Failed to read response size: {} (this could indicate the broker closed the connection)", e))?;

        let response_size = i32::from_be_bytes(size_buf);
        if response_size < 0 || response_size as usize > MAX_RESPONSE_SIZE {
            return Err(anyhow!("Invalid response size: {} bytes", response_size));
        }

        let mut response_buf = vec![0u8; response_size as usize];
        stream
            .read_exact(&mut response_buf)
            .await
            .map_err(|e| anyhow!("Failed to read response body: {}", e))?;

        debug!("Received {} byte response", response_size);
        Ok(Bytes::from(response_buf))
    }

    /// Discovers and caches the broker's supported API versions
    async fn discover_api_versions(&mut self) -> Result<()> {
        debug!("Discovering supported API versions...");

        // Version 0 is universally supported
        let request = ApiVersionsRequest::default();
        let response_bytes = self.send_request(ApiKey::ApiVersions, &request, 0).await?;

        let mut cursor = std::io::Cursor::new(response_bytes.as_ref());
        let _response_header = ResponseHeader::decode(&mut cursor, 0)
            .map_err(|e| anyhow!("Failed to decode response header: {}", e))?;
        let response = ApiVersionsResponse::decode(&mut cursor, 0)
            .map_err(|e| anyhow!("Failed to decode ApiVersions response: {}", e))?;

        if response.error_code != 0 {
            return Err(anyhow!(
                "ApiVersions rejected by broker with error code {}",
                response.error_code
            ));
        }

        for api_version in response.api_keys {
            self.api_versions.insert(
                api_version.api_key,
                (api_version.min_version, api_version.max_version),
            );
        }

        debug!("Discovered {} supported APIs", self.api_versions.len());
        Ok(())
    }

    /// Selects a compatible protocol version for the given API
    ///
    /// Uses `preferred_version` when the broker supports it, the broker's maximum
    /// otherwise, and falls back to `preferred_version` for undiscovered APIs.
    pub fn get_supported_version(&self, api_key: ApiKey, preferred_version: i16) -> i16 {
        select_version(&self.api_versions, api_key, preferred_version)
    }

    /// Looks up the partitions of `topic`, their leaders and the cluster's brokers
    ///
    /// Auto topic creation is requested, so a fresh topic may show up as
    /// `LEADER_NOT_AVAILABLE` on the first call and with partitions on a later one.
    pub async fn fetch_partitions(&self, topic: &str) -> Result<TopicMetadata> {
        let version = self.get_supported_version(ApiKey::Metadata, 4);
        let request = metadata_request(topic);

        let response_bytes = self
            .send_request(ApiKey::Metadata, &request, version)
            .await
            .map_err(|e| anyhow!("Failed to fetch metadata for '{}': {}", topic, e))?;

        let mut cursor = std::io::Cursor::new(response_bytes.as_ref());
        let header_version = ApiKey::Metadata.response_header_version(version);
        let _response_header = ResponseHeader::decode(&mut cursor, header_version)
            .map_err(|e| anyhow!("Failed to decode response header: {}", e))?;
        let response = MetadataResponse::decode(&mut cursor, version)
            .map_err(|e| anyhow!("Failed to decode metadata response: {}", e))?;

        topic_metadata(&response, topic)
    }

    /// Produces a single record to `topic`/`partition`
    ///
    /// # Returns
    /// * `Ok(PartitionAck)` - The broker's answer for the partition, which may carry an error code
    /// * `Err(anyhow::Error)` - If encoding, network I/O, or response decoding fails
    pub async fn produce(
        &self,
        topic: &str,
        partition: i32,
        payload: Bytes,
        acks: i16,
    ) -> Result<PartitionAck> {
        let version = self.get_supported_version(ApiKey::Produce, 3);
        let request = produce_request(topic, partition, payload, acks)?;

        let response_bytes = self
            .send_request(ApiKey::Produce, &request, version)
            .await?;

        let mut cursor = std::io::Cursor::new(response_bytes.as_ref());
        let header_version = ApiKey::Produce.response_header_version(version);
        let _response_header = ResponseHeader::decode(&mut cursor, header_version)
            .map_err(|e| anyhow!("Failed to decode produce response header: {}", e))?;
        let response = ProduceResponse::decode(&mut cursor, version)
            .map_err(|e| anyhow!("Failed to decode produce response: {}", e))?;

        response
            .responses
            .iter()
            .flat_map(|topic_response| topic_response.partition_responses.iter())
            .find(|p| p.index == partition)
            .map(|p| PartitionAck {
                partition: p.index,
                error_code: p.error_code,
                base_offset: p.base_offset,
            })
            .ok_or_else(|| {
                anyhow!(
                    "Produce response for '{}' has no entry for partition {}",
                    topic,
                    partition
                )
            })
    }
}

/// Encodes header and body into one length-prefixed frame
fn encode_request<T: Encodable>(
    api_key: ApiKey,
    request: &T,
    version: i16,
    correlation_id: i32,
    client_id: &str,
) -> Result<Vec<u8>> {
    let mut header = RequestHeader::default();
    header.request_api_key = api_key as i16;
    header.request_api_version = version;
    header.correlation_id = correlation_id;
    header.client_id = Some(StrBytes::from_string(client_id.to_string()));

    let header_version = api_key.request_header_version(version);

    let mut buf = Vec::new();
    header
        .encode(&mut buf, header_version)
        .map_err(|e| anyhow!("Failed to encode request header: {}", e))?;
    request
        .encode(&mut buf, version)
        .map_err(|e| anyhow!("Failed to encode request body: {}", e))?;

    let mut message = Vec::with_capacity(4 + buf.len());
    message.extend_from_slice(&(buf.len() as i32).to_be_bytes());
    message.extend_from_slice(&buf);
    Ok(message)
}

fn select_version(
    api_versions: &HashMap<i16, (i16, i16)>,
    api_key: ApiKey,
    preferred_version: i16,
) -> i16 {
    match api_versions.get(&(api_key as i16)) {
        Some((min_version, max_version))
            if preferred_version >= *min_version && preferred_version <= *max_version =>
        {
            preferred_version
        }
        Some((min_version, max_version)) => {
            debug!(
                "Preferred version {} for {:?} not supported (range: {}-{}), using {}",
                preferred_version, api_key, min_version, max_version, max_version
            );
            *max_version
        }
        None => {
            warn!(
                "API {:?} not found in version discovery, using version {}",
                api_key, preferred_version
            );
            preferred_version
        }
    }
}

fn metadata_request(topic: &str) -> MetadataRequest {
    let mut metadata_topic = MetadataRequestTopic::default();
    metadata_topic.name = Some(TopicName(StrBytes::from_string(topic.to_string())));

    let mut request = MetadataRequest::default();
    request.topics = Some(vec![metadata_topic]);
    request.allow_auto_topic_creation = true;
    request
}

fn topic_metadata(response: &MetadataResponse, topic: &str) -> Result<TopicMetadata> {
    let entry = response
        .topics
        .iter()
        .find(|t| t.name.as_ref().map(|n| n.0.as_str()) == Some(topic))
        .ok_or_else(|| anyhow!("Metadata response has no entry for topic '{}'", topic))?;

    if entry.error_code != 0 {
        return Ok(TopicMetadata::Error(entry.error_code));
    }

    let mut partitions: Vec<PartitionLeader> = entry
        .partitions
        .iter()
        .map(|p| PartitionLeader {
            partition: p.partition_index,
            leader: p.leader_id.0,
        })
        .collect();
    partitions.sort_unstable_by_key(|p| p.partition);

    let brokers = response
        .brokers
        .iter()
        .map(|b| (b.node_id.0, format!("{}:{}", b.host.as_str(), b.port)))
        .collect();

    Ok(TopicMetadata::Partitions {
        partitions,
        brokers,
    })
}

/// Builds a produce request carrying one record
///
/// Idempotence is disabled (producer id -1) and the broker assigns the offset.
fn produce_request(
    topic: &str,
    partition: i32,
    payload: Bytes,
    acks: i16,
) -> Result<ProduceRequest> {
    let timestamp = SystemTime::now().duration_since(UNIX_EPOCH)?.as_millis() as i64;
    let record = Record {
        transactional: false,
        control: false,
        partition_leader_epoch: 0,
        producer_id: -1,
        producer_epoch: -1,
        timestamp_type: TimestampType::Creation,
        offset: 0,
        sequence: -1,
        timestamp,
        key: None,
        value: Some(payload),
        headers: indexmap::IndexMap::new(),
    };

    let options = RecordEncodeOptions {
        version: 2,
        compression: Compression::None,
    };
    let records = vec![record];
    let mut batch_buf = bytes::BytesMut::new();
    RecordBatchEncoder::encode(&mut batch_buf, records.iter().collect::<Vec<_>>(), &options)?;

    let mut partition_data = PartitionProduceData::default();
    partition_data.index = partition;
    partition_data.records = Some(batch_buf.freeze());

    let mut topic_data = TopicProduceData::default();
    topic_data.name = TopicName(StrBytes::from_string(topic.to_string()));
    topic_data.partition_data.push(partition_data);

    let mut request = ProduceRequest::default();
    request.acks = acks;
    request.timeout_ms = PRODUCE_TIMEOUT_MS;
    request.topic_data.push(topic_data);
    Ok(request)
}
