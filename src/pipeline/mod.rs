//! Event Processing Pipeline
//!
//! Wires the three consumer groups, their processors, the flush tickers,
//! and the HTTP surface into one runnable unit with coordinated shutdown.

pub mod alerts;
pub mod buffer;
pub mod cache;
pub mod consumer;
pub mod event_processor;
pub mod http;
pub mod replay_processor;
pub mod session_aggregator;
pub mod storage;

pub use consumer::{EventConsumer, Processor};
pub use event_processor::EventProcessor;
pub use replay_processor::ReplayProcessor;
pub use session_aggregator::SessionAggregator;
pub use storage::StorageManager;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::common::config::AppConfig;
use crate::error::Result;
use crate::insights::InsightProcessor;
use crate::metrics::Metrics;
use crate::pipeline::alerts::{AlertSink, KafkaAlertSink};
use crate::pipeline::cache::{RedisSessionStore, SessionStore};

/// Grace period for draining tasks at shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(15);

/// Interval of the dead-click expiry / stale-cell sweep
const DETECTOR_TICK: Duration = Duration::from_millis(500);

/// The assembled stream-processing core
pub struct Pipeline {
    config: AppConfig,
    metrics: Arc<Metrics>,
    storage: Arc<StorageManager>,
    aggregator: Arc<SessionAggregator>,
    event_processor: Arc<EventProcessor>,
    insight_processor: Arc<InsightProcessor>,
    replay_processor: Arc<ReplayProcessor>,
}

impl Pipeline {
    /// Connect the external collaborators and assemble the processors
    pub async fn new(config: AppConfig) -> Result<Self> {
        let metrics = Arc::new(Metrics::new()?);

        let storage = Arc::new(StorageManager::new(&config.database).await?);
        storage.initialize_schema().await?;

        let sessions: Arc<dyn SessionStore> =
            Arc::new(RedisSessionStore::new(&config.redis.url).await?);

        let alerts: Arc<dyn AlertSink> = Arc::new(KafkaAlertSink::new(
            &config.kafka.brokers,
            config.kafka.topics.alerts.clone(),
        )?);

        let aggregator = Arc::new(SessionAggregator::new(
            config.session.clone(),
            Arc::clone(&sessions),
            storage.clone(),
            metrics.clone(),
        ));

        let event_processor = Arc::new(EventProcessor::new(
            &config.batch,
            storage.clone(),
            aggregator.clone(),
            metrics.clone(),
        ));

        let insight_processor = Arc::new(InsightProcessor::new(
            config.insights.clone(),
            storage.clone(),
            alerts,
            sessions,
            metrics.clone(),
        ));

        let replay_processor = Arc::new(ReplayProcessor::new(
            config.replay.clone(),
            storage.clone(),
            metrics.clone(),
        ));

        Ok(Self {
            config,
            metrics,
            storage,
            aggregator,
            event_processor,
            insight_processor,
            replay_processor,
        })
    }

    /// Run consumers, tickers, and the HTTP surface until SIGINT, then
    /// drain within the shutdown grace period
    pub async fn run(&self) -> Result<()> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();

        let kafka = &self.config.kafka;

        let event_consumer = EventConsumer::new(
            &kafka.brokers,
            &kafka.group_id("events"),
            &kafka.topics.events,
            self.event_processor.clone(),
            self.metrics.clone(),
        )?;
        let insight_consumer = EventConsumer::new(
            &kafka.brokers,
            &kafka.group_id("insights"),
            &kafka.topics.events,
            self.insight_processor.clone(),
            self.metrics.clone(),
        )?;
        let replay_consumer = EventConsumer::new(
            &kafka.brokers,
            &kafka.group_id("replay"),
            &kafka.topics.replay,
            self.replay_processor.clone(),
            self.metrics.clone(),
        )?;

        for (name, consumer_loop) in [
            ("event-consumer", spawn_consumer(event_consumer, shutdown_rx.clone())),
            ("insight-consumer", spawn_consumer(insight_consumer, shutdown_rx.clone())),
            ("replay-consumer", spawn_consumer(replay_consumer, shutdown_rx.clone())),
        ] {
            tasks.push((name, consumer_loop));
        }

        tasks.push((
            "event-flush",
            self.spawn_ticker(
                Duration::from_secs(self.config.batch.flush_interval_secs.max(1)),
                shutdown_rx.clone(),
                {
                    let processor = self.event_processor.clone();
                    move || {
                        let processor = processor.clone();
                        async move {
                            processor.flush().await.ok();
                        }
                    }
                },
            ),
        ));

        tasks.push((
            "insight-flush",
            self.spawn_ticker(
                Duration::from_secs(self.insight_processor.flush_interval_secs()),
                shutdown_rx.clone(),
                {
                    let processor = self.insight_processor.clone();
                    move || {
                        let processor = processor.clone();
                        async move {
                            processor.flush().await.ok();
                        }
                    }
                },
            ),
        ));

        tasks.push((
            "detector-tick",
            self.spawn_ticker(DETECTOR_TICK, shutdown_rx.clone(), {
                let processor = self.insight_processor.clone();
                move || {
                    let processor = processor.clone();
                    async move {
                        processor.tick(chrono::Utc::now().timestamp_millis()).await;
                    }
                }
            }),
        ));

        tasks.push((
            "session-scan",
            self.spawn_ticker(
                Duration::from_secs(self.config.session.scan_interval_secs.max(1)),
                shutdown_rx.clone(),
                {
                    let aggregator = self.aggregator.clone();
                    move || {
                        let aggregator = aggregator.clone();
                        async move {
                            if let Err(e) =
                                aggregator.flush_idle(chrono::Utc::now().timestamp_millis()).await
                            {
                                warn!("Idle session scan failed: {}", e);
                            }
                        }
                    }
                },
            ),
        ));

        tasks.push((
            "replay-sweep",
            self.spawn_ticker(
                Duration::from_secs((self.config.replay.idle_timeout_secs / 3).max(1)),
                shutdown_rx.clone(),
                {
                    let processor = self.replay_processor.clone();
                    move || {
                        let processor = processor.clone();
                        async move {
                            processor.sweep_idle().await.ok();
                        }
                    }
                },
            ),
        ));

        let http_state = http::HttpState {
            metrics: self.metrics.clone(),
            storage: self.storage.clone(),
        };
        let http_port = self.config.http.port;
        let http_shutdown = shutdown_rx.clone();
        tasks.push((
            "http",
            tokio::spawn(async move {
                if let Err(e) = http::serve(http_port, http_state, http_shutdown).await {
                    error!("HTTP surface failed: {}", e);
                }
            }),
        ));

        info!("Pipeline running; press Ctrl-C to stop");
        tokio::signal::ctrl_c()
            .await
            .map_err(|e| crate::error::StreamError::Config(format!("signal handler: {}", e)))?;

        info!("Shutdown requested, draining");
        shutdown_tx.send(true).ok();

        for (name, task) in tasks {
            match tokio::time::timeout(SHUTDOWN_GRACE, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!("Task {} panicked: {}", name, e),
                Err(_) => warn!("Task {} did not drain within the grace period", name),
            }
        }

        // Consumers already flushed their processors; what remains is the
        // live session state and the alert producer
        if let Err(e) = self.aggregator.flush_all().await {
            warn!("Final session flush failed: {}", e);
        }
        self.insight_processor.shutdown().await;

        info!("Pipeline shutdown complete");
        Ok(())
    }

    fn spawn_ticker<F, Fut>(
        &self,
        period: Duration,
        mut shutdown: watch::Receiver<bool>,
        mut work: F,
    ) -> JoinHandle<()>
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: std::future::Future<Output = ()> + Send,
    {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = ticker.tick() => work().await,
                }
            }
        })
    }
}

fn spawn_consumer<P: Processor + 'static>(
    consumer: EventConsumer<P>,
    shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = consumer.run(shutdown).await {
            error!("Consumer loop ended with error: {}", e);
        }
    })
}
