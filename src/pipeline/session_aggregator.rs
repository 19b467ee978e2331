//! Session Aggregator
//!
//! Live per-session counters in the keyed store, composed into a
//! `sessions` row when the session goes idle or the core shuts down.
//! Events within a session arrive in order from one partition worker, so
//! every per-field operation here is last-writer-wins or a plain
//! increment; flushes are idempotent because the sessions table upserts.

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::common::config::SessionConfig;
use crate::error::Result;
use crate::metrics::Metrics;
use crate::models::rows::SessionRow;
use crate::pipeline::cache::{SessionStore, SessionUpdate};
use crate::schemas::events::{Event, EventType};

/// Destination for flushed session rows
#[async_trait]
pub trait SessionWriter: Send + Sync {
    async fn write_sessions(&self, rows: &[SessionRow]) -> Result<()>;
}

pub struct SessionAggregator {
    config: SessionConfig,
    store: Arc<dyn SessionStore>,
    writer: Arc<dyn SessionWriter>,
    metrics: Arc<Metrics>,
}

impl SessionAggregator {
    pub fn new(
        config: SessionConfig,
        store: Arc<dyn SessionStore>,
        writer: Arc<dyn SessionWriter>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            config,
            store,
            writer,
            metrics,
        }
    }

    /// Fold one event into its session's live state
    pub async fn observe(&self, event: &Event) -> Result<()> {
        let mut update = SessionUpdate {
            session_id: event.session_id,
            ttl_secs: self.config.ttl_secs,
            ..SessionUpdate::default()
        };

        update.init.push(("project_id", event.project_id.clone()));
        update.init.push(("started_at", event.timestamp.to_string()));
        if let Some(user_id) = &event.user_id {
            update.init.push(("user_id", user_id.clone()));
        }
        for (field, value) in [
            ("browser", &event.browser),
            ("os", &event.os),
            ("device_type", &event.device_type),
            ("country", &event.country),
            ("city", &event.city),
        ] {
            if let Some(value) = value {
                update.init.push((field, value.clone()));
            }
        }

        update.set.push(("ended_at", event.timestamp.to_string()));
        update.incr.push(("events_count", 1));

        match event.event_type {
            EventType::PageView => {
                update.incr.push(("page_views", 1));
                if let Some(path) = &event.path {
                    update.init.push(("entry_page", path.clone()));
                    update.set.push(("exit_page", path.clone()));
                }
            }
            EventType::Click => {
                update.incr.push(("click_count", 1));
            }
            EventType::JsError => {
                update.incr.push(("errors_count", 1));
            }
            _ => {}
        }

        self.store.record_event(&update).await
    }

    /// Scan pass: flush every session idle longer than the threshold
    pub async fn flush_idle(&self, now_ms: i64) -> Result<usize> {
        let idle_cutoff = now_ms - (self.config.idle_timeout_secs as i64) * 1000;
        self.flush_matching(Some(idle_cutoff)).await
    }

    /// Shutdown pass: flush everything that still has live state
    pub async fn flush_all(&self) -> Result<usize> {
        self.flush_matching(None).await
    }

    async fn flush_matching(&self, idle_cutoff: Option<i64>) -> Result<usize> {
        let mut rows = Vec::new();
        let mut flushed_ids = Vec::new();

        let session_ids = self.store.active_sessions().await?;
        let snapshots = futures::future::join_all(
            session_ids.iter().map(|id| self.store.snapshot(*id)),
        )
        .await;

        for (session_id, snapshot) in session_ids.into_iter().zip(snapshots) {
            let Some(fields) = snapshot? else {
                // Hash expired out from under the index; drop the stale entry
                self.store.remove(session_id).await.ok();
                continue;
            };

            if let Some(cutoff) = idle_cutoff {
                let ended_at = parse_i64(&fields, "ended_at");
                if ended_at >= cutoff {
                    continue;
                }
            }

            match compose_row(session_id, &fields) {
                Some(row) => {
                    rows.push(row);
                    flushed_ids.push(session_id);
                }
                None => {
                    warn!(%session_id, "Discarding unparseable session state");
                    self.store.remove(session_id).await.ok();
                }
            }
        }

        if rows.is_empty() {
            return Ok(0);
        }

        // Keyed entries are deleted only after the upsert lands, so a
        // failed write is retried on the next scan
        self.writer.write_sessions(&rows).await?;

        for session_id in &flushed_ids {
            self.store.remove(*session_id).await?;
        }

        self.metrics.sessions_flushed.inc_by(rows.len() as u64);
        debug!("Flushed {} sessions", rows.len());
        Ok(rows.len())
    }
}

fn parse_i64(fields: &HashMap<String, String>, key: &str) -> i64 {
    fields.get(key).and_then(|v| v.parse().ok()).unwrap_or(0)
}

fn millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}

/// Derive the final `sessions` row from a session's hash fields
pub fn compose_row(session_id: Uuid, fields: &HashMap<String, String>) -> Option<SessionRow> {
    let project_id = fields.get("project_id")?.clone();
    let started_at = parse_i64(fields, "started_at");
    let ended_at = parse_i64(fields, "ended_at");
    if started_at == 0 || ended_at == 0 {
        return None;
    }

    let page_views = parse_i64(fields, "page_views");
    let errors_count = parse_i64(fields, "errors_count");

    Some(SessionRow {
        session_id,
        project_id,
        user_id: fields.get("user_id").cloned(),
        started_at: millis(started_at),
        ended_at: millis(ended_at),
        duration_ms: ended_at - started_at,
        page_views,
        events_count: parse_i64(fields, "events_count"),
        errors_count,
        click_count: parse_i64(fields, "click_count"),
        entry_page: fields.get("entry_page").cloned(),
        exit_page: fields.get("exit_page").cloned(),
        has_error: errors_count > 0,
        has_rage_click: fields.get("has_rage_click").map(String::as_str) == Some("1"),
        has_dead_click: fields.get("has_dead_click").map(String::as_str) == Some("1"),
        is_bounced: page_views <= 1,
        browser: fields.get("browser").cloned(),
        os: fields.get("os").cloned(),
        device_type: fields.get("device_type").cloned(),
        country: fields.get("country").cloned(),
        city: fields.get("city").cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::cache::MemorySessionStore;
    use parking_lot::Mutex;

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

    fn aggregator() -> (
        SessionAggregator,
        Arc<MemorySessionStore>,
        Arc<CollectingWriter>,
    ) {
        let store = Arc::new(MemorySessionStore::new());
        let writer = Arc::new(CollectingWriter::default());
        let aggregator = SessionAggregator::new(
            SessionConfig::default(),
            store.clone(),
            writer.clone(),
            Arc::new(Metrics::new().unwrap()),
        );
        (aggregator, store, writer)
    }

    fn page_view(session: Uuid, path: &str, ts: i64) -> Event {
        let mut event = Event::new(EventType::PageView, "p1", session, ts)
            .with_page(format!("https://shop.test{}", path), path);
        event.browser = Some("Firefox".to_string());
        event
    }

    #[tokio::test]
    async fn test_counters_and_navigation() {
        let (aggregator, _, writer) = aggregator();
        let session = Uuid::new_v4();

        aggregator
            .observe(&page_view(session, "/home", 1000))
            .await
            .unwrap();
        aggregator
            .observe(
                &Event::new(EventType::Click, "p1", session, 2000).with_position(10.0, 10.0),
            )
            .await
            .unwrap();
        aggregator
            .observe(&page_view(session, "/pricing", 3000))
            .await
            .unwrap();
        aggregator
            .observe(&Event::new(EventType::JsError, "p1", session, 4000))
            .await
            .unwrap();

        let flushed = aggregator.flush_all().await.unwrap();
        assert_eq!(flushed, 1);

        let rows = writer.rows.lock();
        let row = &rows[0];
        assert_eq!(row.events_count, 4);
        assert_eq!(row.page_views, 2);
        assert_eq!(row.click_count, 1);
        assert_eq!(row.errors_count, 1);
        assert_eq!(row.duration_ms, 3000);
        assert_eq!(row.entry_page.as_deref(), Some("/home"));
        assert_eq!(row.exit_page.as_deref(), Some("/pricing"));
        assert!(row.has_error);
        assert!(!row.is_bounced);
        assert_eq!(row.browser.as_deref(), Some("Firefox"));
    }

    #[tokio::test]
    async fn test_single_page_session_is_bounced() {
        let (aggregator, _, writer) = aggregator();
        let session = Uuid::new_v4();

        aggregator
            .observe(&page_view(session, "/home", 1000))
            .await
            .unwrap();
        aggregator.flush_all().await.unwrap();

        let rows = writer.rows.lock();
        assert!(rows[0].is_bounced);
        assert_eq!(rows[0].duration_ms, 0);
    }

    #[tokio::test]
    async fn test_idle_scan_skips_active_sessions() {
        let (aggregator, store, writer) = aggregator();
        let idle = Uuid::new_v4();
        let active = Uuid::new_v4();

        aggregator.observe(&page_view(idle, "/a", 1_000_000)).await.unwrap();
        aggregator
            .observe(&page_view(active, "/b", 3_000_000))
            .await
            .unwrap();

        // Default idle timeout is 1800 s; "now" makes only the first stale
        let now = 1_000_000 + 1800 * 1000 + 1;
        let flushed = aggregator.flush_idle(now).await.unwrap();
        assert_eq!(flushed, 1);
        assert_eq!(writer.rows.lock()[0].session_id, idle);

        // The active session still holds live state
        assert!(store.snapshot(active).await.unwrap().is_some());
        assert!(store.snapshot(idle).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_flush_is_idempotent_under_replay() {
        let (aggregator, _, writer) = aggregator();
        let session = Uuid::new_v4();

        for ts in [1000, 2000, 3000] {
            aggregator
                .observe(&page_view(session, "/home", ts))
                .await
                .unwrap();
        }
        aggregator.flush_all().await.unwrap();

        // Same events delivered again (at-least-once), flushed again
        for ts in [1000, 2000, 3000] {
            aggregator
                .observe(&page_view(session, "/home", ts))
                .await
                .unwrap();
        }
        aggregator.flush_all().await.unwrap();

        let rows = writer.rows.lock();
        assert_eq!(rows.len(), 2);
        // Upserts with identical derived state converge in the store
        assert_eq!(rows[0].events_count, rows[1].events_count);
        assert_eq!(rows[0].duration_ms, rows[1].duration_ms);
    }

    #[tokio::test]
    async fn test_flag_set_by_insight_processor_lands_in_row() {
        let (aggregator, store, writer) = aggregator();
        let session = Uuid::new_v4();

        aggregator
            .observe(&page_view(session, "/home", 1000))
            .await
            .unwrap();
        store.set_flag(session, "has_rage_click").await.unwrap();

        aggregator.flush_all().await.unwrap();
        assert!(writer.rows.lock()[0].has_rage_click);
    }
}
