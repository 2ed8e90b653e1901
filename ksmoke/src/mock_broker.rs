//! In-process Kafka broker for tests
//!
//! Answers ApiVersions, Metadata and Produce with encoded responses. What it
//! answers is scripted through [`BrokerState`].

use anyhow::{anyhow, bail, Result};
use kafka_protocol::{
    messages::{
        api_versions_response::ApiVersionsResponse,
        metadata_request::MetadataRequest,
        metadata_response::{
            MetadataResponse, MetadataResponseBroker, MetadataResponsePartition,
            MetadataResponseTopic,
        },
        produce_request::ProduceRequest,
        produce_response::{PartitionProduceResponse, ProduceResponse, TopicProduceResponse},
        ApiKey, BrokerId, RequestHeader, ResponseHeader,
    },
    protocol::{Decodable, Encodable, StrBytes},
};
use std::collections::VecDeque;
use std::io::Cursor;
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, trace};

use crate::config::BootstrapAddress;

/// What the broker reports and what it has seen
#[derive(Default)]
pub(crate) struct BrokerState {
    /// `(node id, port)` of every broker listed in metadata
    pub brokers: Mutex<Vec<(i32, u16)>>,
    /// `(partition, leader node id)` of every partition
    pub partitions: Mutex<Vec<(i32, i32)>>,
    /// Topic error codes for upcoming Metadata requests; 0 once exhausted
    pub metadata_errors: Mutex<VecDeque<i16>>,
    /// Partition error codes for upcoming Produce requests; 0 once exhausted
    pub produce_errors: Mutex<VecDeque<i16>>,
    /// Produce requests to hang up on instead of answering
    pub hang_ups: AtomicUsize,
    pub metadata_requests: AtomicUsize,
    /// Partition of every Produce request received
    pub produced: Mutex<Vec<i32>>,
    next_offset: AtomicI64,
}

pub(crate) struct MockBroker {
    pub node_id: i32,
    pub port: u16,
    pub state: Arc<BrokerState>,
    listener: Option<TcpListener>,
}

impl MockBroker {
    pub async fn bind(node_id: i32) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        Self {
            node_id,
            port,
            state: Arc::new(BrokerState::default()),
            listener: Some(listener),
        }
    }

    /// A lone broker leading partitions `0..partitions`
    pub async fn single(partitions: i32) -> Self {
        let mut broker = Self::bind(1).await;
        broker.lists(&[&broker]);
        *broker.state.partitions.lock().unwrap() = (0..partitions).map(|p| (p, 1)).collect();
        broker.serve();
        broker
    }

    /// Sets the brokers this one lists in metadata
    pub fn lists(&self, brokers: &[&MockBroker]) {
        *self.state.brokers.lock().unwrap() = brokers.iter().map(|b| (b.node_id, b.port)).collect();
    }

    pub fn address(&self) -> BootstrapAddress {
        BootstrapAddress::new("127.0.0.1", self.port as i64).unwrap()
    }

    /// Starts accepting connections
    pub fn serve(&mut self) {
        let Some(listener) = self.listener.take() else {
            return;
        };
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Ok((conn, addr)) = listener.accept().await {
                debug!("Accepted a connection from {:?}", addr);
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(conn, state).await {
                        debug!("Mock broker connection ended: {}", e);
                    }
                });
            }
        });
    }
}

async fn handle_connection(mut conn: TcpStream, state: Arc<BrokerState>) -> Result<()> {
    loop {
        let mut size = [0u8; 4];
        if conn.read_exact(&mut size).await.is_err() {
            return Ok(());
        }
        let mut frame = vec![0u8; i32::from_be_bytes(size) as usize];
        conn.read_exact(&mut frame).await?;

        let api_key = ApiKey::try_from(i16::from_be_bytes([frame[0], frame[1]]))
            .map_err(|_| anyhow!("unknown api key"))?;
        let version = i16::from_be_bytes([frame[2], frame[3]]);

        let mut cursor = Cursor::new(frame.as_slice());
        let header = RequestHeader::decode(&mut cursor, api_key.request_header_version(version))?;
        trace!("Received {:?} v{}", api_key, version);

        let mut response_header = ResponseHeader::default();
        response_header.correlation_id = header.correlation_id;
        let mut body = Vec::new();
        response_header.encode(&mut body, api_key.response_header_version(version))?;

        match api_key {
            ApiKey::ApiVersions => serve_api_versions(&mut body, version)?,
            ApiKey::Metadata => {
                let request = MetadataRequest::decode(&mut cursor, version)?;
                serve_metadata(&request, &state, &mut body, version)?;
            }
            ApiKey::Produce => {
                let request = ProduceRequest::decode(&mut cursor, version)?;
                let hang_up = state
                    .hang_ups
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if hang_up {
                    bail!("hanging up on produce request");
                }
                serve_produce(&request, &state, &mut body, version)?;
            }
            other => bail!("unexpected {:?} request", other),
        }

        conn.write_all(&(body.len() as i32).to_be_bytes()).await?;
        conn.write_all(&body).await?;
    }
}

/// Lists no APIs, so the client falls back to its preferred versions
fn serve_api_versions(body: &mut Vec<u8>, version: i16) -> Result<()> {
    ApiVersionsResponse::default().encode(body, version)?;
    Ok(())
}

fn serve_metadata(
    request: &MetadataRequest,
    state: &BrokerState,
    body: &mut Vec<u8>,
    version: i16,
) -> Result<()> {
    state.metadata_requests.fetch_add(1, Ordering::SeqCst);
    let error_code = state.metadata_errors.lock().unwrap().pop_front().unwrap_or(0);

    let mut response = MetadataResponse::default();
    for (node_id, port) in state.brokers.lock().unwrap().iter() {
        let mut broker = MetadataResponseBroker::default();
        broker.node_id = BrokerId(*node_id);
        broker.host = StrBytes::from_static_str("127.0.0.1");
        broker.port = *port as i32;
        response.brokers.push(broker);
    }

    for requested in request.topics.iter().flatten() {
        let mut topic = MetadataResponseTopic::default();
        topic.name = requested.name.clone();
        topic.error_code = error_code;
        if error_code == 0 {
            for (index, leader) in state.partitions.lock().unwrap().iter() {
                let mut partition = MetadataResponsePartition::default();
                partition.partition_index = *index;
                partition.leader_id = BrokerId(*leader);
                topic.partitions.push(partition);
            }
        }
        response.topics.push(topic);
    }

    response.encode(body, version)?;
    Ok(())
}

fn serve_produce(
    request: &ProduceRequest,
    state: &BrokerState,
    body: &mut Vec<u8>,
    version: i16,
) -> Result<()> {
    let mut response = ProduceResponse::default();
    for topic_data in &request.topic_data {
        let mut topic = TopicProduceResponse::default();
        topic.name = topic_data.name.clone();
        for partition_data in &topic_data.partition_data {
            state.produced.lock().unwrap().push(partition_data.index);
            let error_code = state.produce_errors.lock().unwrap().pop_front().unwrap_or(0);

            let mut partition = PartitionProduceResponse::default();
            partition.index = partition_data.index;
            partition.error_code = error_code;
            if error_code == 0 {
                partition.base_offset = state.next_offset.fetch_add(1, Ordering::SeqCst);
            }
            topic.partition_responses.push(partition);
        }
        response.responses.push(topic);
    }

    response.encode(body, version)?;
    Ok(())
}
