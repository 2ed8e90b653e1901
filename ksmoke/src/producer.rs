//! Kafka message producer with a bounded send queue and a delivery event stream
//!
//! Messages go into a bounded queue and are drained by a single dispatcher task.
//! Every dequeued message yields exactly one [`Event::Delivery`] on the event
//! stream. Sending awaits while the queue is full, which is the only flow
//! control the producer applies.
//!
//! The dispatcher keeps one produce request in flight at a time and sends one
//! record per request, so throughput is bounded by the broker round trip.
//!
//! [`KafkaDispatch`] routes each message to the leader of a randomly picked
//! partition, opening one connection per leader on first use.

use crate::config::BootstrapAddress;
use crate::error::{DeliveryError, Error, Result};
use crate::kafka_client::{ClientOptions, KafkaClient, PartitionLeader, TopicMetadata};
use crate::message::{Event, OutboundMessage, TopicPartition};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};

/// Receiving end of the producer's event stream
pub type EventStream = mpsc::UnboundedReceiver<Event>;

/// Topic or partition without a leader yet, typically right after auto-creation
const LEADER_NOT_AVAILABLE: i16 = 5;

/// Delivers one message and reports where it went
///
/// Failures are part of the report, never an `Err`: the dispatcher must emit
/// exactly one delivery event per message whatever happens on the wire.
pub trait Dispatch: Send + Sync + 'static {
    fn deliver(&self, message: OutboundMessage) -> impl Future<Output = TopicPartition> + Send;
}

/// Producer settings beyond the bootstrap address
#[derive(Debug, Clone)]
pub struct ProducerOptions {
    pub client: ClientOptions,
    /// Messages the send queue holds before `send` starts waiting
    pub queue_capacity: usize,
    /// Produce acks (-1 all in-sync replicas, 1 leader only)
    pub acks: i16,
    /// Metadata lookups per topic while its leaders are not yet known
    pub metadata_attempts: u32,
    /// Pause between those lookups
    pub retry_backoff: Duration,
}

impl Default for ProducerOptions {
    fn default() -> Self {
        Self {
            client: ClientOptions::default(),
            queue_capacity: 100_000,
            acks: -1,
            metadata_attempts: 5,
            retry_backoff: Duration::from_secs(1),
        }
    }
}

/// Cluster layout learned from metadata
#[derive(Default)]
struct Routes {
    /// Partitions per topic, cached once every partition has a leader
    topics: HashMap<String, Vec<PartitionLeader>>,
    /// `host:port` by node id
    brokers: HashMap<i32, String>,
    /// Open connections by leader node id
    leaders: HashMap<i32, Arc<KafkaClient>>,
}

/// [`Dispatch`] over live broker connections
///
/// Metadata comes from the bootstrap connection; records go to the leader of
/// the chosen partition.
pub struct KafkaDispatch {
    bootstrap: KafkaClient,
    acks: i16,
    metadata_attempts: u32,
    retry_backoff: Duration,
    routes: Mutex<Routes>,
}

impl KafkaDispatch {
    pub fn new(bootstrap: KafkaClient, options: &ProducerOptions) -> Self {
        Self {
            bootstrap,
            acks: options.acks,
            metadata_attempts: options.metadata_attempts.max(1),
            retry_backoff: options.retry_backoff,
            routes: Mutex::new(Routes::default()),
        }
    }

    /// Partitions of `topic` that have a reachable leader
    ///
    /// Looks the topic up while it is not cached. `LEADER_NOT_AVAILABLE` and
    /// leaderless partitions are retried up to `metadata_attempts` times. If some
    /// partitions still lack a leader after that, the ones that have one are
    /// used without caching them.
    async fn partitions_for(
        &self,
        topic: &str,
    ) -> std::result::Result<Vec<PartitionLeader>, DeliveryError> {
        if let Some(partitions) = self.routes.lock().await.topics.get(topic) {
            return Ok(partitions.clone());
        }

        let mut attempt = 1;
        loop {
            let pending = match self.bootstrap.fetch_partitions(topic).await {
                Ok(TopicMetadata::Partitions {
                    partitions,
                    brokers,
                }) => {
                    let mut routes = self.routes.lock().await;
                    routes.brokers.extend(brokers);

                    let total = partitions.len();
                    let led: Vec<PartitionLeader> = partitions
                        .into_iter()
                        .filter(|p| routes.brokers.contains_key(&p.leader))
                        .collect();

                    if !led.is_empty() && led.len() == total {
                        debug!("Topic '{}' has {} partitions", topic, total);
                        routes.topics.insert(topic.to_string(), led.clone());
                        return Ok(led);
                    }
                    if !led.is_empty() && attempt >= self.metadata_attempts {
                        warn!(
                            "Topic '{}': only {} of {} partitions have a leader",
                            topic,
                            led.len(),
                            total
                        );
                        return Ok(led);
                    }
                    DeliveryError::Broker {
                        code: LEADER_NOT_AVAILABLE,
                    }
                }
                Ok(TopicMetadata::Error(LEADER_NOT_AVAILABLE)) => DeliveryError::Broker {
                    code: LEADER_NOT_AVAILABLE,
                },
                Ok(TopicMetadata::Error(code)) => return Err(DeliveryError::Broker { code }),
                Err(e) => return Err(DeliveryError::Transport(e.to_string())),
            };

            if attempt >= self.metadata_attempts {
                return Err(pending);
            }
            info!(
                "Topic '{}' not ready ({}), retrying in {:?}",
                topic, pending, self.retry_backoff
            );
            sleep(self.retry_backoff).await;
            attempt += 1;
        }
    }

    /// Connection to broker `node_id`, opened on first use
    async fn leader(&self, node_id: i32) -> std::result::Result<Arc<KafkaClient>, DeliveryError> {
        let mut routes = self.routes.lock().await;
        if let Some(client) = routes.leaders.get(&node_id) {
            return Ok(client.clone());
        }

        let address = routes.brokers.get(&node_id).cloned().ok_or_else(|| {
            DeliveryError::Transport(format!("No address known for broker {}", node_id))
        })?;
        let client = self
            .bootstrap
            .connect_peer(&address)
            .await
            .map(Arc::new)
            .map_err(|e| DeliveryError::Transport(e.to_string()))?;
        routes.leaders.insert(node_id, client.clone());
        Ok(client)
    }

    /// Drops what is known about `topic` so the next message looks it up again
    async fn forget_topic(&self, topic: &str) {
        self.routes.lock().await.topics.remove(topic);
    }

    /// Drops a broken leader connection and the topic routed through it
    async fn forget_leader(&self, node_id: i32, topic: &str) {
        let mut routes = self.routes.lock().await;
        routes.leaders.remove(&node_id);
        routes.topics.remove(topic);
    }
}

fn pick_partition(partitions: &[PartitionLeader]) -> PartitionLeader {
    partitions[rand::random::<usize>() % partitions.len()]
}

impl Dispatch for KafkaDispatch {
    async fn deliver(&self, message: OutboundMessage) -> TopicPartition {
        let target = match self.partitions_for(&message.topic).await {
            Ok(partitions) => pick_partition(&partitions),
            Err(error) => return TopicPartition::failed(&message.topic, -1, error),
        };

        let client = match self.leader(target.leader).await {
            Ok(client) => client,
            Err(error) => {
                self.forget_topic(&message.topic).await;
                return TopicPartition::failed(&message.topic, target.partition, error);
            }
        };

        match client
            .produce(&message.topic, target.partition, message.payload, self.acks)
            .await
        {
            Ok(ack) if ack.error_code == 0 => {
                TopicPartition::delivered(&message.topic, ack.partition, ack.base_offset)
            }
            Ok(ack) => {
                // Stale leadership or a deleted topic: look the topic up again next time
                self.forget_topic(&message.topic).await;
                TopicPartition::failed(
                    &message.topic,
                    ack.partition,
                    DeliveryError::Broker {
                        code: ack.error_code,
                    },
                )
            }
            Err(e) => {
                self.forget_leader(target.leader, &message.topic).await;
                TopicPartition::failed(
                    &message.topic,
                    target.partition,
                    DeliveryError::Transport(e.to_string()),
                )
            }
        }
    }
}

/// Handle to a running producer
///
/// The event stream stays open until the dispatcher exits, which happens
/// only after [`ProducerHandle::close`] and once the queue is drained.
pub struct ProducerHandle {
    queue: mpsc::Sender<OutboundMessage>,
    events: Option<EventStream>,
    dispatcher: JoinHandle<()>,
}

impl ProducerHandle {
    /// Connects to the bootstrap broker and starts the dispatcher
    pub async fn connect(address: &BootstrapAddress, options: &ProducerOptions) -> Result<Self> {
        let client = KafkaClient::connect(&address.to_string(), &options.client)
            .await
            .map_err(|e| Error::ConnectionConfig(format!("{:#}", e)))?;

        Ok(Self::spawn(
            KafkaDispatch::new(client, options),
            options.queue_capacity,
        ))
    }

    /// Starts a dispatcher task over `dispatch`
    ///
    /// Must be called within a tokio runtime.
    pub fn spawn<D: Dispatch>(dispatch: D, queue_capacity: usize) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel(queue_capacity.max(1));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let dispatcher = tokio::spawn(run_dispatcher(dispatch, queue_rx, events_tx));

        Self {
            queue: queue_tx,
            events: Some(events_rx),
            dispatcher,
        }
    }

    /// Enqueues a message, waiting while the queue is full
    pub async fn send(&self, message: OutboundMessage) -> Result<()> {
        self.queue.send(message).await.map_err(|_| Error::QueueClosed)
    }

    /// The delivery event stream; `None` once taken
    pub fn take_events(&mut self) -> Option<EventStream> {
        self.events.take()
    }

    /// Stops accepting messages, waits for queued ones to be dispatched
    pub async fn close(self) {
        let ProducerHandle {
            queue,
            events,
            dispatcher,
        } = self;
        drop(queue);
        drop(events);

        if let Err(e) = dispatcher.await {
            warn!("Producer dispatcher ended abnormally: {}", e);
        }
        debug!("Producer closed");
    }
}

async fn run_dispatcher<D: Dispatch>(
    dispatch: D,
    mut queue: mpsc::Receiver<OutboundMessage>,
    events: mpsc::UnboundedSender<Event>,
) {
    while let Some(message) = queue.recv().await {
        let report = dispatch.deliver(message).await;

        if let Some(DeliveryError::Transport(reason)) = &report.error {
            let _ = events.send(Event::ClientError(reason.clone()));
        }
        if events.send(Event::Delivery(report)).is_err() {
            debug!("Event stream dropped, delivery report discarded");
        }
    }
    debug!("Send queue closed, dispatcher exiting");
}
