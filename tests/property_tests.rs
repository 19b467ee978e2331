//! Property-based tests using proptest
//!
//! These verify detector and buffering laws over arbitrary inputs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use proptest::prelude::*;
use uuid::Uuid;

use gosight_stream::common::config::SessionConfig;
use gosight_stream::error::Result;
use gosight_stream::insights::rage_click::{RageClickConfig, RageClickDetector};
use gosight_stream::metrics::Metrics;
use gosight_stream::models::rows::SessionRow;
use gosight_stream::pipeline::buffer::TableBuffer;
use gosight_stream::pipeline::cache::MemorySessionStore;
use gosight_stream::pipeline::session_aggregator::{SessionAggregator, SessionWriter};
use gosight_stream::schemas::events::{Event, EventType};

// ============================================================================
// RAGE-CLICK EMISSION LAWS
// ============================================================================

fn click_stream() -> impl Strategy<Value = Vec<(f64, f64, i64)>> {
    prop::collection::vec(
        (0.0f64..800.0, 0.0f64..600.0, 0i64..20_000),
        1..60,
    )
}

proptest! {
    #[test]
    fn rage_click_emissions_satisfy_the_spec(mut clicks in click_stream()) {
        clicks.sort_by_key(|(_, _, ts)| *ts);

        let config = RageClickConfig::default();
        let detector = RageClickDetector::new(config.clone());
        let session = Uuid::new_v4();

        let mut events: HashMap<Uuid, (f64, f64, i64)> = HashMap::new();

        for (x, y, ts) in clicks {
            let event = Event::new(EventType::Click, "p1", session, ts.max(1))
                .with_position(x, y);
            events.insert(event.event_id, (x, y, ts.max(1)));

            if let Some(insight) = detector.on_click(&event) {
                // Enough contributing clicks
                prop_assert!(insight.related_event_ids.len() >= config.min_clicks);

                let points: Vec<(f64, f64, i64)> = insight
                    .related_event_ids
                    .iter()
                    .map(|id| events[id])
                    .collect();

                // All within the time window of the newest one
                let newest = points.iter().map(|p| p.2).max().unwrap();
                for p in &points {
                    prop_assert!(newest - p.2 <= config.time_window_ms);
                }

                // All within radius_px of the centroid
                let n = points.len() as f64;
                let cx = points.iter().map(|p| p.0).sum::<f64>() / n;
                let cy = points.iter().map(|p| p.1).sum::<f64>() / n;
                for p in &points {
                    let dist = ((p.0 - cx).powi(2) + (p.1 - cy).powi(2)).sqrt();
                    prop_assert!(dist <= config.radius_px + 1e-9);
                }
            }
        }
    }
}

// ============================================================================
// BUFFER BOUND LAWS
// ============================================================================

proptest! {
    #[test]
    fn buffer_never_exceeds_hard_bound(
        capacity in 1usize..50,
        factor in 1usize..5,
        ops in prop::collection::vec(prop::bool::weighted(0.8), 1..200),
    ) {
        let hard = capacity * factor;
        let buffer = TableBuffer::new("events", capacity, hard);

        let mut pushed = 0u64;
        let mut dropped = 0u64;
        let mut taken = 0u64;

        for is_push in ops {
            if is_push {
                let outcome = buffer.push(pushed);
                pushed += 1;
                dropped += outcome.dropped_oldest as u64;
            } else {
                taken += buffer.take().len() as u64;
            }
            prop_assert!(buffer.len() <= hard.max(capacity));
        }

        // Every pushed row is accounted for exactly once
        prop_assert_eq!(pushed, dropped + taken + buffer.len() as u64);
    }
}

// ============================================================================
// SESSION ROW CONVERGENCE
// ============================================================================

#[derive(Default)]
struct CollectingWriter {
    rows: Mutex<Vec<SessionRow>>,
}

#[async_trait]
impl SessionWriter for CollectingWriter {
    async fn write_sessions(&self, rows: &[SessionRow]) -> Result<()> {
        self.rows.lock().extend_from_slice(rows);
        Ok(())
    }
}

fn event_kind() -> impl Strategy<Value = EventType> {
    prop_oneof![
        Just(EventType::PageView),
        Just(EventType::Click),
        Just(EventType::Scroll),
        Just(EventType::JsError),
        Just(EventType::Custom),
    ]
}

fn session_stream() -> impl Strategy<Value = Vec<(EventType, i64)>> {
    prop::collection::vec((event_kind(), 1i64..1_000_000), 1..40)
}

proptest! {
    #[test]
    fn duplicate_delivery_converges(mut spec in session_stream()) {
        // The partition key guarantees in-order delivery per session
        spec.sort_by_key(|(_, ts)| *ts);

        let session = Uuid::new_v4();
        let events: Vec<Event> = spec
            .iter()
            .enumerate()
            .map(|(i, (kind, ts))| {
                let mut event = Event::new(*kind, "p1", session, *ts);
                if *kind == EventType::PageView {
                    event = event.with_page(
                        format!("https://shop.test/p{}", i),
                        format!("/p{}", i),
                    );
                }
                event
            })
            .collect();

        let run = |events: Vec<Event>| {
            tokio_test::block_on(async move {
                let writer = Arc::new(CollectingWriter::default());
                let aggregator = SessionAggregator::new(
                    SessionConfig::default(),
                    Arc::new(MemorySessionStore::new()),
                    writer.clone(),
                    Arc::new(Metrics::new().unwrap()),
                );

                // Deliver twice with an intermediate flush: the replaying
                // store keeps only the newest row per session
                for event in &events {
                    aggregator.observe(event).await.unwrap();
                }
                aggregator.flush_all().await.unwrap();
                for event in &events {
                    aggregator.observe(event).await.unwrap();
                }
                aggregator.flush_all().await.unwrap();

                let rows = writer.rows.lock().clone();
                rows
            })
        };

        let rows = run(events.clone());
        prop_assert_eq!(rows.len(), 2);

        let (first, last) = (&rows[0], &rows[1]);
        prop_assert_eq!(first.events_count, last.events_count);
        prop_assert_eq!(first.events_count, events.len() as i64);
        prop_assert_eq!(first.page_views, last.page_views);
        prop_assert_eq!(first.duration_ms, last.duration_ms);
        prop_assert_eq!(&first.entry_page, &last.entry_page);
        prop_assert_eq!(&first.exit_page, &last.exit_page);
        prop_assert_eq!(first.is_bounced, last.is_bounced);
        prop_assert_eq!(first.has_error, last.has_error);

        // Derived invariants hold on every flushed row
        for row in &rows {
            let min_ts = events.iter().map(|e| e.timestamp).min().unwrap();
            let max_ts = events.iter().map(|e| e.timestamp).max().unwrap();
            prop_assert_eq!(row.duration_ms, max_ts - min_ts);
            prop_assert_eq!(row.is_bounced, row.page_views <= 1);
            prop_assert_eq!(row.has_error, row.errors_count > 0);
        }
    }
}
