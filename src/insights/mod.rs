//! Insight Processor
//!
//! Coordinates the six behavioural detectors over the event stream. Each
//! detector only sees the event types it cares about; everything they emit
//! funnels through one store path that batches rows for the `insights`
//! table and mirrors each insight as a fire-and-forget alert message.

pub mod dead_click;
pub mod error_click;
pub mod rage_click;
pub mod slow_page;
pub mod thrashed_cursor;
pub mod u_turn;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Result;
use crate::metrics::Metrics;
use crate::pipeline::alerts::AlertSink;
use crate::pipeline::buffer::TableBuffer;
use crate::pipeline::cache::SessionStore;
use crate::schemas::events::{Event, EventType};
use crate::schemas::insights::{AlertMessage, Insight, InsightType};

pub use dead_click::{DeadClickConfig, DeadClickDetector};
pub use error_click::{ErrorClickConfig, ErrorClickDetector};
pub use rage_click::{RageClickConfig, RageClickDetector};
pub use slow_page::{SlowPageConfig, SlowPageDetector};
pub use thrashed_cursor::{ThrashedCursorConfig, ThrashedCursorDetector};
pub use u_turn::{UTurnConfig, UTurnDetector};

/// Per-detector configuration plus the shared output path tuning
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct InsightsConfig {
    pub rage_click: RageClickConfig,
    pub dead_click: DeadClickConfig,
    pub error_click: ErrorClickConfig,
    pub thrashed_cursor: ThrashedCursorConfig,
    pub u_turn: UTurnConfig,
    pub slow_page: SlowPageConfig,

    /// Insights buffered before a size-triggered flush
    pub buffer_size: usize,

    /// Periodic flush tick
    pub flush_interval_secs: u64,
}

impl Default for InsightsConfig {
    fn default() -> Self {
        Self {
            rage_click: RageClickConfig::default(),
            dead_click: DeadClickConfig::default(),
            error_click: ErrorClickConfig::default(),
            thrashed_cursor: ThrashedCursorConfig::default(),
            u_turn: UTurnConfig::default(),
            slow_page: SlowPageConfig::default(),
            buffer_size: 100,
            flush_interval_secs: 5,
        }
    }
}

impl InsightsConfig {
    fn buffer_size_or_default(&self) -> usize {
        if self.buffer_size == 0 {
            100
        } else {
            self.buffer_size
        }
    }
}

/// Destination for insight batches; the storage manager in production, a
/// collector in tests
#[async_trait]
pub trait InsightWriter: Send + Sync {
    async fn write_insights(&self, insights: &[Insight]) -> Result<()>;
}

/// Detector coordinator consuming the raw event stream
pub struct InsightProcessor {
    config: InsightsConfig,

    rage_click: RageClickDetector,
    dead_click: DeadClickDetector,
    error_click: ErrorClickDetector,
    thrashed_cursor: ThrashedCursorDetector,
    u_turn: UTurnDetector,
    slow_page: SlowPageDetector,

    buffer: TableBuffer<Insight>,
    writer: Arc<dyn InsightWriter>,
    alerts: Arc<dyn AlertSink>,
    sessions: Arc<dyn SessionStore>,
    metrics: Arc<Metrics>,
}

impl InsightProcessor {
    pub fn new(
        config: InsightsConfig,
        writer: Arc<dyn InsightWriter>,
        alerts: Arc<dyn AlertSink>,
        sessions: Arc<dyn SessionStore>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let buffer_size = config.buffer_size_or_default();

        Self {
            rage_click: RageClickDetector::new(config.rage_click.clone()),
            dead_click: DeadClickDetector::new(config.dead_click.clone()),
            error_click: ErrorClickDetector::new(config.error_click.clone()),
            thrashed_cursor: ThrashedCursorDetector::new(config.thrashed_cursor.clone()),
            u_turn: UTurnDetector::new(config.u_turn.clone()),
            slow_page: SlowPageDetector::new(config.slow_page.clone()),
            buffer: TableBuffer::new("insights", buffer_size, buffer_size * 10),
            config,
            writer,
            alerts,
            sessions,
            metrics,
        }
    }

    /// Dispatch one event to the detectors interested in its type
    pub async fn handle_event(&self, event: &Event) -> Result<()> {
        event.validate()?;

        // Pending dead clicks watch every subsequent event of the session;
        // the detector's matching rules decide what actually resolves
        if self.config.dead_click.enabled {
            self.dead_click.observe(event);
        }

        match event.event_type {
            EventType::Click => {
                if self.config.rage_click.enabled {
                    if let Some(insight) = self.rage_click.on_click(event) {
                        self.store_insight(insight).await;
                    }
                }
                if self.config.error_click.enabled {
                    self.error_click.on_click(event);
                }
            }
            EventType::JsError => {
                if self.config.error_click.enabled {
                    if let Some(insight) = self.error_click.on_error(event) {
                        self.store_insight(insight).await;
                    }
                }
            }
            EventType::MouseMove => {
                if self.config.thrashed_cursor.enabled {
                    if let Some(insight) = self.thrashed_cursor.on_mouse_move(event) {
                        self.store_insight(insight).await;
                    }
                }
            }
            EventType::PageView => {
                if self.config.u_turn.enabled {
                    if let Some(insight) = self.u_turn.on_page_view(event) {
                        self.store_insight(insight).await;
                    }
                }
            }
            EventType::WebVitals | EventType::PageLoad => {
                if self.config.slow_page.enabled {
                    if let Some(insight) = self.slow_page.on_vitals(event) {
                        self.store_insight(insight).await;
                    }
                }
            }
            _ => {}
        }

        self.metrics
            .events_processed
            .with_label_values(&["insight"])
            .inc();
        Ok(())
    }

    /// Timer pass: expire pending dead clicks and evict stale rage cells
    pub async fn tick(&self, now_ms: i64) {
        if self.config.dead_click.enabled {
            for insight in self.dead_click.expire(now_ms) {
                self.store_insight(insight).await;
            }
        }
        if self.config.rage_click.enabled {
            self.rage_click.sweep(now_ms);
        }
    }

    /// Buffer the insight, mark session flags, and mirror it as an alert.
    ///
    /// The alert publish is spawned and never fails the insight write.
    async fn store_insight(&self, insight: Insight) {
        debug!(
            insight_type = insight.insight_type.as_str(),
            session_id = %insight.session_id,
            "insight emitted"
        );

        self.metrics
            .insights_emitted
            .with_label_values(&[insight.insight_type.as_str()])
            .inc();

        let flag = match insight.insight_type {
            InsightType::RageClick => Some("has_rage_click"),
            InsightType::DeadClick => Some("has_dead_click"),
            _ => None,
        };
        if let Some(flag) = flag {
            if let Err(e) = self.sessions.set_flag(insight.session_id, flag).await {
                warn!("Failed to set session flag {}: {}", flag, e);
            }
        }

        let alert = AlertMessage::from_insight(&insight);

        let outcome = self.buffer.push(insight);
        if outcome.dropped_oldest > 0 {
            self.metrics
                .events_dropped
                .with_label_values(&["insight_overflow"])
                .inc_by(outcome.dropped_oldest as u64);
        }
        if outcome.at_capacity {
            if let Err(e) = self.flush().await {
                warn!("Size-triggered insight flush failed: {}", e);
            }
        }

        let alerts = Arc::clone(&self.alerts);
        let published = self.metrics.alerts_published.clone();
        tokio::spawn(async move {
            match alerts.publish(alert).await {
                Ok(()) => published.inc(),
                Err(e) => warn!("Alert publish failed: {}", e),
            }
        });
    }

    /// Drain the insights buffer into the store; a failed batch is
    /// requeued and retried on the next flush
    pub async fn flush(&self) -> Result<()> {
        let batch = self.buffer.take();
        if batch.is_empty() {
            return Ok(());
        }

        let timer = self
            .metrics
            .flush_duration
            .with_label_values(&["insights"])
            .start_timer();
        let result = self.writer.write_insights(&batch).await;
        timer.observe_duration();

        match result {
            Ok(()) => {
                self.metrics
                    .rows_written
                    .with_label_values(&["insights"])
                    .inc_by(batch.len() as u64);
                Ok(())
            }
            Err(e) => {
                self.metrics
                    .flush_failures
                    .with_label_values(&["insights"])
                    .inc();
                let outcome = self.buffer.requeue(batch);
                if outcome.dropped_oldest > 0 {
                    self.metrics
                        .events_dropped
                        .with_label_values(&["insight_overflow"])
                        .inc_by(outcome.dropped_oldest as u64);
                }
                Err(e)
            }
        }
    }

    /// Final drain: flush the buffer and close the alert producer
    pub async fn shutdown(&self) {
        if let Err(e) = self.flush().await {
            warn!("Insight flush on shutdown failed: {}", e);
        }
        self.alerts.close();
    }

    /// Rows currently waiting for a flush
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn flush_interval_secs(&self) -> u64 {
        if self.config.flush_interval_secs == 0 {
            5
        } else {
            self.config.flush_interval_secs
        }
    }
}

#[async_trait]
impl crate::pipeline::consumer::Processor for InsightProcessor {
    type Msg = Event;

    fn name(&self) -> &'static str {
        "insight"
    }

    async fn process(&self, msg: Event) -> Result<()> {
        self.handle_event(&msg).await
    }

    async fn flush(&self) -> Result<()> {
        InsightProcessor::flush(self).await
    }
}
