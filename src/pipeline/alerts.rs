//! Alert publication
//!
//! Every stored insight is mirrored as a lightweight message on the alerts
//! topic, keyed by project so downstream delivery fans out per project.
//! Publication is fire-and-forget: the insight's store write never waits on
//! or fails with the publish.

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Result, StreamError};
use crate::schemas::insights::AlertMessage;

/// Sink for alert messages; the Kafka producer in production, a collector
/// in tests
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn publish(&self, alert: AlertMessage) -> Result<()>;

    /// Drain anything buffered; called once at shutdown
    fn close(&self);
}

/// Kafka-backed alert sink with asynchronous batching in the producer
pub struct KafkaAlertSink {
    producer: FutureProducer,
    topic: String,
}

impl KafkaAlertSink {
    pub fn new(brokers: &str, topic: impl Into<String>) -> Result<Self> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .set("compression.type", "lz4")
            .set("linger.ms", "100")
            .set("acks", "1")
            .set("client.id", "gosight-alerts")
            .create()?;

        Ok(Self {
            producer,
            topic: topic.into(),
        })
    }
}

#[async_trait]
impl AlertSink for KafkaAlertSink {
    async fn publish(&self, alert: AlertMessage) -> Result<()> {
        let payload = serde_json::to_vec(&alert)?;
        let key = alert.project_id.clone();

        let record = FutureRecord::to(&self.topic).key(&key).payload(&payload);

        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| StreamError::Kafka(e))?;

        Ok(())
    }

    fn close(&self) {
        if let Err(e) = self.producer.flush(Duration::from_secs(5)) {
            warn!("Alert producer did not drain cleanly: {}", e);
        } else {
            info!("Alert producer drained");
        }
    }
}
