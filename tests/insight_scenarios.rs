//! End-to-end insight scenarios
//!
//! Drives the insight coordinator with realistic event streams and checks
//! the emitted insights, the alert mirror, and the session flags.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use tokio::sync::mpsc;
use uuid::Uuid;

use gosight_stream::error::Result;
use gosight_stream::insights::{InsightProcessor, InsightWriter, InsightsConfig};
use gosight_stream::metrics::Metrics;
use gosight_stream::pipeline::alerts::AlertSink;
use gosight_stream::pipeline::cache::{MemorySessionStore, SessionStore};
use gosight_stream::schemas::events::{Event, EventType};
use gosight_stream::schemas::insights::{AlertMessage, Insight, InsightType};

// ============================================================================
// HARNESS
// ============================================================================

#[derive(Default)]
struct CollectingWriter {
    insights: Mutex<Vec<Insight>>,
}

#[async_trait]
impl InsightWriter for CollectingWriter {
    async fn write_insights(&self, insights: &[Insight]) -> Result<()> {
        self.insights.lock().extend_from_slice(insights);
        Ok(())
    }
}

struct ChannelAlertSink {
    tx: mpsc::UnboundedSender<AlertMessage>,
}

#[async_trait]
impl AlertSink for ChannelAlertSink {
    async fn publish(&self, alert: AlertMessage) -> Result<()> {
        self.tx.send(alert).ok();
        Ok(())
    }

    fn close(&self) {}
}

struct Harness {
    processor: InsightProcessor,
    writer: Arc<CollectingWriter>,
    sessions: Arc<MemorySessionStore>,
    alerts: mpsc::UnboundedReceiver<AlertMessage>,
}

impl Harness {
    fn new() -> Self {
        let writer = Arc::new(CollectingWriter::default());
        let sessions = Arc::new(MemorySessionStore::new());
        let (tx, alerts) = mpsc::unbounded_channel();

        let processor = InsightProcessor::new(
            InsightsConfig::default(),
            writer.clone(),
            Arc::new(ChannelAlertSink { tx }),
            sessions.clone(),
            Arc::new(Metrics::new().unwrap()),
        );

        Self {
            processor,
            writer,
            sessions,
            alerts,
        }
    }

    async fn feed(&self, events: &[Event]) {
        for event in events {
            self.processor.handle_event(event).await.unwrap();
        }
    }

    async fn stored_insights(&self) -> Vec<Insight> {
        self.processor.flush().await.unwrap();
        self.writer.insights.lock().clone()
    }
}

fn click_at(session: Uuid, x: f64, y: f64, ts: i64) -> Event {
    Event::new(EventType::Click, "proj-web", session, ts)
        .with_position(x, y)
        .with_page("https://shop.test/checkout", "/checkout")
}

// ============================================================================
// SCENARIO 1: RAGE CLICK
// ============================================================================

#[tokio::test]
async fn scenario_rage_click() {
    let mut h = Harness::new();
    let session = Uuid::new_v4();

    let clicks = vec![
        click_at(session, 100.0, 200.0, 1000),
        click_at(session, 103.0, 198.0, 1200),
        click_at(session, 101.0, 205.0, 1400),
        click_at(session, 98.0, 201.0, 1600),
        click_at(session, 102.0, 203.0, 1800),
    ];
    let click_ids: Vec<Uuid> = clicks.iter().map(|c| c.event_id).collect();

    h.feed(&clicks).await;

    let insights = h.stored_insights().await;
    assert_eq!(insights.len(), 1);

    let insight = &insights[0];
    assert_eq!(insight.insight_type, InsightType::RageClick);
    assert_eq!(insight.session_id, session);
    assert_eq!(insight.details["click_count"], 5);

    let mut related = insight.related_event_ids.clone();
    let mut expected = click_ids.clone();
    related.sort();
    expected.sort();
    assert_eq!(related, expected);

    // Centroid lands within 5 px of the cluster anchor
    let dx = insight.x.unwrap() - 100.0;
    let dy = insight.y.unwrap() - 200.0;
    assert!((dx * dx + dy * dy).sqrt() < 5.0);

    // The session flag is visible to the aggregator's next flush
    let state = h.sessions.snapshot(session).await.unwrap().unwrap();
    assert_eq!(state["has_rage_click"], "1");

    // And the alert mirror went out
    let alert = h.alerts.recv().await.unwrap();
    assert_eq!(alert.insight_id, insight.insight_id);
    assert_eq!(alert.project_id, "proj-web");
}

// ============================================================================
// SCENARIO 2: DEAD CLICK RESOLVED
// ============================================================================

#[tokio::test]
async fn scenario_dead_click_resolved() {
    let h = Harness::new();
    let session = Uuid::new_v4();

    let mut click = click_at(session, 50.0, 50.0, 5000);
    click.target_tag = Some("button".to_string());
    click.target_id = Some("go".to_string());

    h.feed(&[
        click,
        Event::new(EventType::DomMutation, "proj-web", session, 5400),
    ])
    .await;

    // Even well past the window, nothing fires
    h.processor.tick(20_000).await;
    assert!(h.stored_insights().await.is_empty());
}

// ============================================================================
// SCENARIO 3: DEAD CLICK UNRESOLVED
// ============================================================================

#[tokio::test]
async fn scenario_dead_click_unresolved() {
    let h = Harness::new();
    let session = Uuid::new_v4();

    let mut click = click_at(session, 50.0, 50.0, 10_000);
    click.target_tag = Some("button".to_string());

    let mouse = Event::new(EventType::MouseMove, "proj-web", session, 10_200)
        .with_position(60.0, 60.0);
    let mut scroll = Event::new(EventType::Scroll, "proj-web", session, 10_800);
    scroll.scroll_depth = Some(40.0);

    h.feed(&[click.clone(), mouse, scroll]).await;

    // Before the observation window closes: still pending
    h.processor.tick(10_900).await;
    assert!(h.stored_insights().await.is_empty());

    h.processor.tick(11_000).await;
    let insights = h.stored_insights().await;
    assert_eq!(insights.len(), 1);
    assert_eq!(insights[0].insight_type, InsightType::DeadClick);
    assert_eq!(insights[0].details["expected_behavior"], "handle");
    assert_eq!(insights[0].related_event_ids, vec![click.event_id]);

    let state = h.sessions.snapshot(session).await.unwrap().unwrap();
    assert_eq!(state["has_dead_click"], "1");
}

// ============================================================================
// SCENARIO 4: ERROR CLICK
// ============================================================================

#[tokio::test]
async fn scenario_error_click() {
    let h = Harness::new();
    let session = Uuid::new_v4();

    let click = click_at(session, 10.0, 10.0, 20_000);
    let error = Event::new(EventType::JsError, "proj-web", session, 20_500)
        .with_error("undefined is not a function", "TypeError");

    h.feed(&[click.clone(), error.clone()]).await;

    let insights = h.stored_insights().await;
    assert_eq!(insights.len(), 1);

    let insight = &insights[0];
    assert_eq!(insight.insight_type, InsightType::ErrorClick);
    assert_eq!(insight.details["time_to_error"], 500);
    assert_eq!(
        insight.details["error_message"],
        "undefined is not a function"
    );
    assert_eq!(
        insight.related_event_ids,
        vec![click.event_id, error.event_id]
    );
}

// ============================================================================
// SCENARIO 5: U-TURN
// ============================================================================

#[tokio::test]
async fn scenario_u_turn() {
    let h = Harness::new();
    let session = Uuid::new_v4();

    h.feed(&[
        Event::new(EventType::PageView, "proj-web", session, 30_000)
            .with_page("https://shop.test/home", "/home"),
        Event::new(EventType::PageView, "proj-web", session, 31_000)
            .with_page("https://shop.test/pricing", "/pricing"),
        Event::new(EventType::PageView, "proj-web", session, 35_000)
            .with_page("https://shop.test/home", "/home"),
    ])
    .await;

    let insights = h.stored_insights().await;
    assert_eq!(insights.len(), 1);

    let insight = &insights[0];
    assert_eq!(insight.insight_type, InsightType::UTurn);
    assert_eq!(insight.details["original_page"], "/home");
    assert_eq!(insight.details["navigated_to"], "/pricing");
    assert_eq!(insight.details["time_away_ms"], 4000);
    assert_eq!(insight.related_event_ids.len(), 3);
}

// ============================================================================
// SCENARIO 6: SLOW PAGE
// ============================================================================

#[tokio::test]
async fn scenario_slow_page() {
    let h = Harness::new();
    let session = Uuid::new_v4();

    let vitals = Event::new(EventType::WebVitals, "proj-web", session, 40_000)
        .with_page("https://shop.test/landing", "/landing")
        .with_vitals(Some(3500.0), Some(600.0));

    h.feed(&[vitals]).await;

    let insights = h.stored_insights().await;
    assert_eq!(insights.len(), 1);

    let insight = &insights[0];
    assert_eq!(insight.insight_type, InsightType::SlowPage);
    assert_eq!(insight.details["reasons"], serde_json::json!(["lcp"]));
    assert_eq!(insight.details["load_time_ms"], 3500.0);
}

// ============================================================================
// CROSS-CUTTING BEHAVIOUR
// ============================================================================

#[tokio::test]
async fn disabled_detector_stays_silent() {
    let writer = Arc::new(CollectingWriter::default());
    let (tx, _rx) = mpsc::unbounded_channel();

    let mut config = InsightsConfig::default();
    config.slow_page.enabled = false;

    let processor = InsightProcessor::new(
        config,
        writer.clone(),
        Arc::new(ChannelAlertSink { tx }),
        Arc::new(MemorySessionStore::new()),
        Arc::new(Metrics::new().unwrap()),
    );

    let vitals = Event::new(EventType::WebVitals, "proj-web", Uuid::new_v4(), 40_000)
        .with_vitals(Some(9000.0), Some(5000.0));
    processor.handle_event(&vitals).await.unwrap();
    processor.flush().await.unwrap();

    assert!(writer.insights.lock().is_empty());
}

#[tokio::test]
async fn duplicate_dead_click_delivery_emits_once() {
    let h = Harness::new();
    let session = Uuid::new_v4();

    let mut click = click_at(session, 50.0, 50.0, 1000);
    click.target_tag = Some("button".to_string());

    // At-least-once delivery replays the same click
    h.feed(&[click.clone(), click.clone()]).await;

    h.processor.tick(2000).await;
    h.processor.tick(2500).await;

    let insights = h.stored_insights().await;
    assert_eq!(insights.len(), 1);
}

#[tokio::test]
async fn related_event_ids_stay_in_session() {
    let h = Harness::new();
    let s1 = Uuid::new_v4();
    let s2 = Uuid::new_v4();

    // Interleave two sessions; every emitted insight must only reference
    // events of its own session
    let mut events = Vec::new();
    for i in 0..5 {
        events.push(click_at(s1, 100.0, 100.0, 1000 + i * 100));
        events.push(click_at(s2, 300.0, 300.0, 1050 + i * 100));
    }
    h.feed(&events).await;

    let insights = h.stored_insights().await;
    assert_eq!(insights.len(), 2);

    for insight in &insights {
        let own: Vec<Uuid> = events
            .iter()
            .filter(|e| e.session_id == insight.session_id)
            .map(|e| e.event_id)
            .collect();
        for id in &insight.related_event_ids {
            assert!(own.contains(id));
        }
    }
}
