//! Event Processor
//!
//! Turns each wire event into typed rows for the columnar store and feeds
//! the live session aggregates. Rows buffer per table and flush on size,
//! on the periodic tick, and at shutdown; the inserts tolerate duplicate
//! delivery, so committing the bus offset before the durable write is
//! safe.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

use crate::common::config::BatchConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::models::rows::{
    ErrorRow, EventRow, PageViewRow, PageViewUpdate, WebVitalsRow,
};
use crate::pipeline::buffer::{PushOutcome, TableBuffer};
use crate::pipeline::session_aggregator::SessionAggregator;
use crate::pipeline::storage::StorageManager;
use crate::schemas::events::{Event, EventType};

/// The page a session currently has open, pending its dwell time
#[derive(Debug, Clone)]
struct OpenPage {
    event_id: Uuid,
    timestamp: i64,
    max_scroll_depth: i16,
}

/// Per-session open-page state.
///
/// A page_view row is written with zero dwell; when the next page_view (or
/// a page_exit) closes the page, the tracker produces the update that
/// fills in `time_on_page_ms` and the deepest scroll reached.
#[derive(Default)]
pub struct PageTracker {
    open: DashMap<Uuid, OpenPage>,
}

impl PageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_page_view(&self, event: &Event) -> Option<PageViewUpdate> {
        let next = OpenPage {
            event_id: event.event_id,
            timestamp: event.timestamp,
            max_scroll_depth: 0,
        };
        self.open
            .insert(event.session_id, next)
            .map(|previous| PageViewUpdate {
                event_id: previous.event_id,
                time_on_page_ms: (event.timestamp - previous.timestamp).max(0),
                scroll_depth: previous.max_scroll_depth,
            })
    }

    pub fn on_scroll(&self, event: &Event) {
        let Some(depth) = event.scroll_depth else {
            return;
        };
        let depth = depth.round().clamp(0.0, 100.0) as i16;
        if let Some(mut open) = self.open.get_mut(&event.session_id) {
            open.max_scroll_depth = open.max_scroll_depth.max(depth);
        }
    }

    pub fn on_page_exit(&self, event: &Event) -> Option<PageViewUpdate> {
        self.open
            .remove(&event.session_id)
            .map(|(_, previous)| PageViewUpdate {
                event_id: previous.event_id,
                time_on_page_ms: (event.timestamp - previous.timestamp).max(0),
                scroll_depth: previous.max_scroll_depth,
            })
    }
}

/// Transforms events into batched writes across five tables
pub struct EventProcessor {
    storage: Arc<StorageManager>,
    aggregator: Arc<SessionAggregator>,
    metrics: Arc<Metrics>,

    events: TableBuffer<EventRow>,
    page_views: TableBuffer<PageViewRow>,
    page_view_updates: TableBuffer<PageViewUpdate>,
    web_vitals: TableBuffer<WebVitalsRow>,
    errors: TableBuffer<ErrorRow>,

    pages: PageTracker,
}

impl EventProcessor {
    pub fn new(
        config: &BatchConfig,
        storage: Arc<StorageManager>,
        aggregator: Arc<SessionAggregator>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let factor = config.max_buffer_factor.max(1);
        let events_cap = config.events_size.max(1);
        let default_cap = config.default_size.max(1);

        Self {
            storage,
            aggregator,
            metrics,
            events: TableBuffer::new("events", events_cap, events_cap * factor),
            page_views: TableBuffer::new("page_views", default_cap, default_cap * factor),
            page_view_updates: TableBuffer::new(
                "page_view_updates",
                default_cap,
                default_cap * factor,
            ),
            web_vitals: TableBuffer::new("web_vitals", default_cap, default_cap * factor),
            errors: TableBuffer::new("errors", default_cap, default_cap * factor),
            pages: PageTracker::new(),
        }
    }

    /// Accept one event: build rows, update session aggregates. Returns
    /// quickly; inserts only happen when a buffer filled up.
    pub async fn handle_event(&self, event: &Event) -> Result<()> {
        event.validate()?;

        let flush_events = self.track(self.events.push(EventRow::from_event(event)), "events");
        let mut flush_page_views = false;
        let mut flush_updates = false;
        let mut flush_vitals = false;
        let mut flush_errors = false;

        match event.event_type {
            EventType::PageView => {
                if let Some(update) = self.pages.on_page_view(event) {
                    flush_updates =
                        self.track(self.page_view_updates.push(update), "page_view_updates");
                }
                flush_page_views =
                    self.track(self.page_views.push(PageViewRow::from_event(event)), "page_views");
            }
            EventType::PageExit => {
                if let Some(update) = self.pages.on_page_exit(event) {
                    flush_updates =
                        self.track(self.page_view_updates.push(update), "page_view_updates");
                }
            }
            EventType::Scroll => {
                self.pages.on_scroll(event);
            }
            EventType::WebVitals => {
                flush_vitals =
                    self.track(self.web_vitals.push(WebVitalsRow::from_event(event)), "web_vitals");
            }
            EventType::PageLoad => {
                let row = WebVitalsRow::from_event(event);
                if row.lcp.is_some() || row.ttfb.is_some() || row.fcp.is_some() {
                    flush_vitals = self.track(self.web_vitals.push(row), "web_vitals");
                }
            }
            EventType::JsError => {
                flush_errors =
                    self.track(self.errors.push(ErrorRow::from_event(event)), "errors");
            }
            _ => {}
        }

        // Session aggregation is fire-and-forget: a cache hiccup must not
        // reject the event
        if let Err(e) = self.aggregator.observe(event).await {
            warn!("Session aggregation failed: {}", e);
        }

        self.metrics
            .events_processed
            .with_label_values(&["event"])
            .inc();

        if flush_events {
            self.flush_events().await.ok();
        }
        if flush_page_views {
            self.flush_page_views().await.ok();
        }
        if flush_updates {
            self.flush_page_view_updates().await.ok();
        }
        if flush_vitals {
            self.flush_web_vitals().await.ok();
        }
        if flush_errors {
            self.flush_errors().await.ok();
        }

        Ok(())
    }

    fn track(&self, outcome: PushOutcome, table: &str) -> bool {
        if outcome.dropped_oldest > 0 {
            warn!(
                "Buffer for {} overflowed, dropped {} oldest rows",
                table, outcome.dropped_oldest
            );
            self.metrics
                .events_dropped
                .with_label_values(&["overflow"])
                .inc_by(outcome.dropped_oldest as u64);
        }
        outcome.at_capacity
    }

    async fn flush_events(&self) -> Result<()> {
        let batch = self.events.take();
        if batch.is_empty() {
            return Ok(());
        }
        let result = self.timed("events", self.storage.insert_events(&batch)).await;
        self.settle(&self.events, batch, result)
    }

    async fn flush_page_views(&self) -> Result<()> {
        let batch = self.page_views.take();
        if batch.is_empty() {
            return Ok(());
        }
        let result = self
            .timed("page_views", self.storage.insert_page_views(&batch))
            .await;
        self.settle(&self.page_views, batch, result)
    }

    async fn flush_page_view_updates(&self) -> Result<()> {
        let batch = self.page_view_updates.take();
        if batch.is_empty() {
            return Ok(());
        }
        let result = self
            .timed(
                "page_view_updates",
                self.storage.apply_page_view_updates(&batch),
            )
            .await;
        self.settle(&self.page_view_updates, batch, result)
    }

    async fn flush_web_vitals(&self) -> Result<()> {
        let batch = self.web_vitals.take();
        if batch.is_empty() {
            return Ok(());
        }
        let result = self
            .timed("web_vitals", self.storage.insert_web_vitals(&batch))
            .await;
        self.settle(&self.web_vitals, batch, result)
    }

    async fn flush_errors(&self) -> Result<()> {
        let batch = self.errors.take();
        if batch.is_empty() {
            return Ok(());
        }
        let result = self.timed("errors", self.storage.insert_errors(&batch)).await;
        self.settle(&self.errors, batch, result)
    }

    async fn timed<F>(&self, table: &str, insert: F) -> Result<()>
    where
        F: std::future::Future<Output = Result<()>>,
    {
        let timer = self
            .metrics
            .flush_duration
            .with_label_values(&[table])
            .start_timer();
        let result = insert.await;
        timer.observe_duration();
        result
    }

    /// Count a successful flush or requeue the batch for the next one
    fn settle<T>(
        &self,
        buffer: &TableBuffer<T>,
        batch: Vec<T>,
        result: Result<()>,
    ) -> Result<()> {
        match result {
            Ok(()) => {
                self.metrics
                    .rows_written
                    .with_label_values(&[buffer.name()])
                    .inc_by(batch.len() as u64);
                Ok(())
            }
            Err(e) => {
                warn!("Flush of {} failed, batch requeued: {}", buffer.name(), e);
                self.metrics
                    .flush_failures
                    .with_label_values(&[buffer.name()])
                    .inc();
                let outcome = buffer.requeue(batch);
                if outcome.dropped_oldest > 0 {
                    self.metrics
                        .events_dropped
                        .with_label_values(&["overflow"])
                        .inc_by(outcome.dropped_oldest as u64);
                }
                Err(e)
            }
        }
    }

    /// Drain every buffer; called on the flush tick and at shutdown
    pub async fn flush(&self) -> Result<()> {
        self.flush_events().await?;
        self.flush_page_views().await?;
        self.flush_page_view_updates().await?;
        self.flush_web_vitals().await?;
        self.flush_errors().await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::pipeline::consumer::Processor for EventProcessor {
    type Msg = Event;

    fn name(&self) -> &'static str {
        "event"
    }

    async fn process(&self, msg: Event) -> Result<()> {
        self.handle_event(&msg).await
    }

    async fn flush(&self) -> Result<()> {
        EventProcessor::flush(self).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page_view(session: Uuid, ts: i64) -> Event {
        Event::new(EventType::PageView, "p1", session, ts)
            .with_page("https://shop.test/home", "/home")
    }

    #[test]
    fn test_first_page_view_produces_no_update() {
        let tracker = PageTracker::new();
        assert!(tracker.on_page_view(&page_view(Uuid::new_v4(), 1000)).is_none());
    }

    #[test]
    fn test_next_page_view_closes_previous_page() {
        let tracker = PageTracker::new();
        let session = Uuid::new_v4();

        let first = page_view(session, 1000);
        tracker.on_page_view(&first);

        let mut scroll = Event::new(EventType::Scroll, "p1", session, 3000);
        scroll.scroll_depth = Some(65.0);
        tracker.on_scroll(&scroll);

        let update = tracker.on_page_view(&page_view(session, 6000)).unwrap();
        assert_eq!(update.event_id, first.event_id);
        assert_eq!(update.time_on_page_ms, 5000);
        assert_eq!(update.scroll_depth, 65);
    }

    #[test]
    fn test_scroll_keeps_maximum_depth() {
        let tracker = PageTracker::new();
        let session = Uuid::new_v4();
        tracker.on_page_view(&page_view(session, 1000));

        for depth in [30.0, 80.0, 50.0] {
            let mut scroll = Event::new(EventType::Scroll, "p1", session, 2000);
            scroll.scroll_depth = Some(depth);
            tracker.on_scroll(&scroll);
        }

        let update = tracker
            .on_page_exit(&Event::new(EventType::PageExit, "p1", session, 4000))
            .unwrap();
        assert_eq!(update.scroll_depth, 80);
    }

    #[test]
    fn test_page_exit_clears_open_page() {
        let tracker = PageTracker::new();
        let session = Uuid::new_v4();
        tracker.on_page_view(&page_view(session, 1000));

        let exit = Event::new(EventType::PageExit, "p1", session, 2500);
        let update = tracker.on_page_exit(&exit).unwrap();
        assert_eq!(update.time_on_page_ms, 1500);

        // Nothing left to close
        assert!(tracker.on_page_exit(&exit).is_none());
    }

    #[test]
    fn test_scroll_without_open_page_is_harmless() {
        let tracker = PageTracker::new();
        let mut scroll = Event::new(EventType::Scroll, "p1", Uuid::new_v4(), 2000);
        scroll.scroll_depth = Some(50.0);
        tracker.on_scroll(&scroll);
    }
}
