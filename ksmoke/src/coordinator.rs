//! Send/acknowledge coordination
//!
//! The sender enqueues `count` messages on the calling task while a drain task
//! counts delivery events. Acknowledgments are counted, never matched to
//! payloads, so their order does not matter. The drain task fires a one-shot
//! [`CompletionSignal`] after the last expected acknowledgment and stops reading.

use crate::error::{Error, Result};
use crate::message::{Event, OutboundMessage};
use crate::producer::{EventStream, ProducerHandle};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// What the drain task observed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeliverySummary {
    pub delivered: u64,
    pub failed: u64,
    /// Events that were not delivery reports
    pub unrecognized: u64,
}

impl DeliverySummary {
    /// Delivery reports seen, successful or not
    pub fn acknowledged(&self) -> u64 {
        self.delivered + self.failed
    }
}

/// Fires at most once, however many times it is asked to
pub struct CompletionSignal {
    fired: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<DeliverySummary>>>,
}

/// Creates a signal and the receiver the main task waits on
pub fn completion() -> (CompletionSignal, oneshot::Receiver<DeliverySummary>) {
    let (tx, rx) = oneshot::channel();
    let signal = CompletionSignal {
        fired: AtomicBool::new(false),
        sender: Mutex::new(Some(tx)),
    };
    (signal, rx)
}

impl CompletionSignal {
    /// Fires the signal; returns `false` if it had already fired
    pub fn signal(&self, summary: DeliverySummary) -> bool {
        if self
            .fired
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        let sender = self
            .sender
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sender) = sender {
            if sender.send(summary).is_err() {
                debug!("Completion receiver already gone");
            }
        }
        true
    }
}

/// Counts delivery events until `expected` have been seen
///
/// With `expected <= 0` the signal fires at once and no event is read. Events
/// other than delivery reports are logged and skipped. If the stream ends
/// early the signal is dropped unfired, which the waiting side observes as a
/// closed channel.
pub async fn drain_events(
    events: &mut EventStream,
    expected: i64,
    signal: CompletionSignal,
) -> DeliverySummary {
    let mut summary = DeliverySummary::default();

    if expected <= 0 {
        signal.signal(summary);
        return summary;
    }

    let mut remaining = expected as u64;
    while let Some(event) = events.recv().await {
        match event {
            Event::Delivery(tp) => {
                if tp.error.is_some() {
                    error!("Delivery failed: {}", tp);
                    summary.failed += 1;
                } else {
                    info!("Delivered message to {}", tp);
                    summary.delivered += 1;
                }

                remaining -= 1;
                if remaining == 0 {
                    signal.signal(summary);
                    return summary;
                }
            }
            other => {
                warn!("Ignored unrecognized event: {}", other);
                summary.unrecognized += 1;
            }
        }
    }

    warn!(
        "Event stream closed with {} of {} acknowledgments outstanding",
        remaining, expected
    );
    summary
}

/// Enqueues `count` messages whose payloads are `0`, `1`, ... `count - 1`
pub async fn send_messages(producer: &ProducerHandle, topic: &str, count: i64) -> Result<u64> {
    let mut sent = 0;
    for i in 0..count.max(0) {
        producer
            .send(OutboundMessage::to_any(topic, i.to_string()))
            .await?;
        sent += 1;
    }
    debug!("Enqueued {} messages for '{}'", sent, topic);
    Ok(sent)
}

/// Sends `count` messages, waits for every acknowledgment, then closes the producer
pub async fn run(mut producer: ProducerHandle, topic: &str, count: i64) -> Result<DeliverySummary> {
    let expected = count.max(0) as u64;
    let Some(mut events) = producer.take_events() else {
        producer.close().await;
        return Err(Error::EventStreamClosed {
            observed: 0,
            expected,
        });
    };

    let (signal, completed) = completion();
    let drain = tokio::spawn(async move { drain_events(&mut events, count, signal).await });

    if let Err(e) = send_messages(&producer, topic, count).await {
        drain.abort();
        producer.close().await;
        return Err(e);
    }

    let outcome = match completed.await {
        Ok(summary) => {
            debug!("All {} acknowledgments observed", expected);
            Ok(summary)
        }
        Err(_) => {
            let observed = match drain.await {
                Ok(summary) => summary.acknowledged(),
                Err(e) => {
                    warn!("Drain task failed: {}", e);
                    0
                }
            };
            Err(Error::EventStreamClosed { observed, expected })
        }
    };

    producer.close().await;
    outcome
}
