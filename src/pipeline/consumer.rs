//! Kafka Consumer Harness
//!
//! One fetch/decode/dispatch/commit loop shared by the three processors.
//! Offsets commit after the processor accepts the message in memory, not
//! after the durable write; at-least-once delivery is therefore the
//! contract, and every downstream writer tolerates duplicates.
//!
//! Malformed payloads and processor errors are logged and committed:
//! redelivering them would head-of-line block the partition, and recovery
//! runs through re-ingest instead.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::metrics::Metrics;

/// A stream processor fed by one consumer group
#[async_trait]
pub trait Processor: Send + Sync {
    /// Message type carried on the processor's topic
    type Msg: DeserializeOwned + Send;

    fn name(&self) -> &'static str;

    /// Accept one decoded message; must return quickly and never block on
    /// the network beyond buffered writes
    async fn process(&self, msg: Self::Msg) -> Result<()>;

    /// Drain in-memory buffers; called on the flush tick and at shutdown
    async fn flush(&self) -> Result<()>;
}

/// Consumer loop binding one topic + group to a processor
pub struct EventConsumer<P: Processor> {
    consumer: StreamConsumer,
    processor: Arc<P>,
    metrics: Arc<Metrics>,
    topic: String,
}

impl<P: Processor> EventConsumer<P> {
    pub fn new(
        brokers: &str,
        group_id: &str,
        topic: &str,
        processor: Arc<P>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        let consumer: StreamConsumer = ClientConfig::new()
            .set("group.id", group_id)
            .set("bootstrap.servers", brokers)
            .set("enable.auto.commit", "false")
            .set("auto.offset.reset", "earliest")
            .set("session.timeout.ms", "30000")
            .set("heartbeat.interval.ms", "3000")
            .set("max.poll.interval.ms", "300000")
            .set("enable.partition.eof", "false")
            .create()?;

        consumer.subscribe(&[topic])?;
        info!(
            "Consumer group {} subscribed to {} for {} processing",
            group_id,
            topic,
            processor.name()
        );

        Ok(Self {
            consumer,
            processor,
            metrics,
            topic: topic.to_string(),
        })
    }

    /// Fetch until shutdown, then drain the processor
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        info!("Starting {} consumer loop", self.processor.name());

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                received = self.consumer.recv() => match received {
                    Ok(message) => self.handle_message(&message).await,
                    Err(e) => {
                        error!("Kafka consumer error on {}: {}", self.topic, e);
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        }

        info!("Stopping {} consumer, draining buffers", self.processor.name());
        if let Err(e) = self.processor.flush().await {
            warn!("Final flush of {} failed: {}", self.processor.name(), e);
        }
        Ok(())
    }

    async fn handle_message(&self, message: &BorrowedMessage<'_>) {
        debug!(
            "Message on {} partition {} offset {}",
            message.topic(),
            message.partition(),
            message.offset()
        );

        match message.payload() {
            None => {
                self.metrics
                    .events_dropped
                    .with_label_values(&["decode"])
                    .inc();
                warn!("Empty payload on {}, skipping", self.topic);
            }
            Some(payload) => match serde_json::from_slice::<P::Msg>(payload) {
                Ok(decoded) => {
                    if let Err(e) = self.processor.process(decoded).await {
                        self.metrics
                            .events_dropped
                            .with_label_values(&["process"])
                            .inc();
                        error!(
                            "{} processor rejected message at offset {}: {}",
                            self.processor.name(),
                            message.offset(),
                            e
                        );
                    }
                }
                Err(e) => {
                    self.metrics
                        .events_dropped
                        .with_label_values(&["decode"])
                        .inc();
                    warn!("Undecodable message on {}, skipping: {}", self.topic, e);
                }
            },
        }

        // Commit even on failure: the message was accepted or consciously
        // skipped, and must not block the partition
        if let Err(e) = self.consumer.commit_message(message, CommitMode::Async) {
            warn!("Offset commit failed on {}: {}", self.topic, e);
        }
    }
}
