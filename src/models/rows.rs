//! Row models for the columnar store
//!
//! Typed projections of wire events onto the store tables. The event
//! processor builds these; `pipeline::storage` binds them into batched
//! prepared inserts.

use chrono::{DateTime, Utc};
use sqlx::FromRow;
use uuid::Uuid;

use crate::schemas::events::{Event, EventType};
use crate::schemas::replay::ReplayChunkMessage;

/// Clamp a pointer coordinate into the store's SMALLINT column
fn coord(value: Option<f64>) -> Option<i16> {
    value.map(|v| v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16)
}

/// Clamp a scroll depth percentage into 0..=100
fn depth(value: Option<f64>) -> Option<i16> {
    value.map(|v| v.round().clamp(0.0, 100.0) as i16)
}

/// One row in the append-only `events` table
#[derive(Debug, Clone, FromRow)]
pub struct EventRow {
    pub event_id: Uuid,
    pub project_id: String,
    pub session_id: Uuid,
    pub user_id: Option<String>,
    pub event_type: String,
    pub timestamp: DateTime<Utc>,

    pub url: Option<String>,
    pub path: Option<String>,
    pub title: Option<String>,
    pub referrer: Option<String>,

    pub click_x: Option<i16>,
    pub click_y: Option<i16>,
    pub target_selector: Option<String>,
    pub target_tag: Option<String>,
    pub target_text: Option<String>,

    pub scroll_depth: Option<i16>,

    pub error_message: Option<String>,
    pub error_type: Option<String>,

    pub lcp: Option<f64>,
    pub fid: Option<f64>,
    pub cls: Option<f64>,
    pub ttfb: Option<f64>,

    /// Free-form payload serialized as a JSON string
    pub payload: Option<String>,

    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
    pub viewport_width: Option<i32>,
    pub viewport_height: Option<i32>,

    pub country: Option<String>,
    pub city: Option<String>,
}

impl EventRow {
    /// Project a wire event onto the events table, keeping only the payload
    /// columns relevant to its type
    pub fn from_event(event: &Event) -> Self {
        let is_click = event.event_type == EventType::Click;
        let is_error = event.event_type == EventType::JsError;
        let is_vitals = matches!(
            event.event_type,
            EventType::WebVitals | EventType::PageLoad
        );

        Self {
            event_id: event.event_id,
            project_id: event.project_id.clone(),
            session_id: event.session_id,
            user_id: event.user_id.clone(),
            event_type: event.event_type.as_str().to_string(),
            timestamp: event.occurred_at(),
            url: event.url.clone(),
            path: event.path.clone(),
            title: event.title.clone(),
            referrer: event.referrer.clone(),
            click_x: if is_click { coord(event.x) } else { None },
            click_y: if is_click { coord(event.y) } else { None },
            target_selector: if is_click {
                event.target_selector.clone()
            } else {
                None
            },
            target_tag: if is_click {
                event.target_tag.clone()
            } else {
                None
            },
            target_text: if is_click {
                event.target_text.clone()
            } else {
                None
            },
            scroll_depth: if event.event_type == EventType::Scroll {
                depth(event.scroll_depth)
            } else {
                None
            },
            error_message: if is_error {
                event.error_message.clone()
            } else {
                None
            },
            error_type: if is_error {
                event.error_type.clone()
            } else {
                None
            },
            lcp: if is_vitals { event.lcp_ms() } else { None },
            fid: if is_vitals { event.fid } else { None },
            cls: if is_vitals { event.cls } else { None },
            ttfb: if is_vitals { event.ttfb_ms() } else { None },
            payload: if event.properties.is_null() {
                None
            } else {
                Some(event.properties.to_string())
            },
            browser: event.browser.clone(),
            os: event.os.clone(),
            device_type: event.device_type.clone(),
            viewport_width: event.viewport_width,
            viewport_height: event.viewport_height,
            country: event.country.clone(),
            city: event.city.clone(),
        }
    }
}

/// One row in the `page_views` projection.
///
/// `time_on_page` and `scroll_depth` are 0 on entry; the processor issues a
/// [`PageViewUpdate`] when the next page_view (or a page_exit) closes the
/// page.
#[derive(Debug, Clone, FromRow)]
pub struct PageViewRow {
    pub event_id: Uuid,
    pub project_id: String,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub url: Option<String>,
    pub path: Option<String>,
    pub title: Option<String>,
    pub referrer: Option<String>,
    pub time_on_page_ms: i64,
    pub scroll_depth: i16,
}

impl PageViewRow {
    pub fn from_event(event: &Event) -> Self {
        Self {
            event_id: event.event_id,
            project_id: event.project_id.clone(),
            session_id: event.session_id,
            timestamp: event.occurred_at(),
            url: event.url.clone(),
            path: event.path.clone(),
            title: event.title.clone(),
            referrer: event.referrer.clone(),
            time_on_page_ms: 0,
            scroll_depth: 0,
        }
    }
}

/// Late correction of a page_view row, produced when its page is left
#[derive(Debug, Clone)]
pub struct PageViewUpdate {
    pub event_id: Uuid,
    pub time_on_page_ms: i64,
    pub scroll_depth: i16,
}

/// One row in the `web_vitals` projection
#[derive(Debug, Clone, FromRow)]
pub struct WebVitalsRow {
    pub event_id: Uuid,
    pub project_id: String,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub url: Option<String>,
    pub path: Option<String>,
    pub lcp: Option<f64>,
    pub fid: Option<f64>,
    pub cls: Option<f64>,
    pub ttfb: Option<f64>,
    pub fcp: Option<f64>,
    pub inp: Option<f64>,
}

impl WebVitalsRow {
    /// Decode either the combined form (all metrics on the event) or the
    /// `{metric, value}` single-metric form
    pub fn from_event(event: &Event) -> Self {
        let mut row = Self {
            event_id: event.event_id,
            project_id: event.project_id.clone(),
            session_id: event.session_id,
            timestamp: event.occurred_at(),
            url: event.url.clone(),
            path: event.path.clone(),
            lcp: event.lcp,
            fid: event.fid,
            cls: event.cls,
            ttfb: event.ttfb,
            fcp: event.fcp,
            inp: event.inp,
        };

        if let (Some(metric), Some(value)) = (event.metric.as_deref(), event.value) {
            match metric.to_ascii_lowercase().as_str() {
                "lcp" => row.lcp = row.lcp.or(Some(value)),
                "fid" => row.fid = row.fid.or(Some(value)),
                "cls" => row.cls = row.cls.or(Some(value)),
                "ttfb" => row.ttfb = row.ttfb.or(Some(value)),
                "fcp" => row.fcp = row.fcp.or(Some(value)),
                "inp" => row.inp = row.inp.or(Some(value)),
                _ => {}
            }
        }

        row
    }
}

/// One row in the `errors` projection
#[derive(Debug, Clone, FromRow)]
pub struct ErrorRow {
    pub event_id: Uuid,
    pub project_id: String,
    pub session_id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub url: Option<String>,
    pub path: Option<String>,
    pub message: Option<String>,
    pub stack: Option<String>,
    pub source: Option<String>,
    pub line: Option<i32>,
    pub col: Option<i32>,
    pub error_type: Option<String>,
}

impl ErrorRow {
    pub fn from_event(event: &Event) -> Self {
        Self {
            event_id: event.event_id,
            project_id: event.project_id.clone(),
            session_id: event.session_id,
            timestamp: event.occurred_at(),
            url: event.url.clone(),
            path: event.path.clone(),
            message: event.error_message.clone(),
            stack: event.error_stack.clone(),
            source: event.error_source.clone(),
            line: event.error_line,
            col: event.error_col,
            error_type: event.error_type.clone(),
        }
    }
}

/// One row in the `sessions` table.
///
/// The table is keyed on `session_id` and upserted with replacing
/// semantics, so repeated flushes of the same session converge to the
/// latest state.
#[derive(Debug, Clone, FromRow)]
pub struct SessionRow {
    pub session_id: Uuid,
    pub project_id: String,
    pub user_id: Option<String>,

    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: i64,

    pub page_views: i64,
    pub events_count: i64,
    pub errors_count: i64,
    pub click_count: i64,

    pub entry_page: Option<String>,
    pub exit_page: Option<String>,

    pub has_error: bool,
    pub has_rage_click: bool,
    pub has_dead_click: bool,
    pub is_bounced: bool,

    pub browser: Option<String>,
    pub os: Option<String>,
    pub device_type: Option<String>,
    pub country: Option<String>,
    pub city: Option<String>,
}

/// One row in the append-only `replay_chunks` table
#[derive(Debug, Clone, FromRow)]
pub struct ReplayChunkRow {
    pub session_id: Uuid,
    pub project_id: String,
    pub chunk_index: i32,
    pub timestamp_start: DateTime<Utc>,
    pub timestamp_end: DateTime<Utc>,
    pub data: Vec<u8>,
    pub data_size: i64,
    pub event_count: i32,
    pub has_full_snapshot: bool,
}

impl ReplayChunkRow {
    pub fn from_message(msg: &ReplayChunkMessage) -> Self {
        use chrono::TimeZone;

        let at = |ms: i64| Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now);

        Self {
            session_id: msg.session_id,
            project_id: msg.project_id.clone(),
            chunk_index: msg.chunk_index as i32,
            timestamp_start: at(msg.timestamp_start),
            timestamp_end: at(msg.timestamp_end),
            data: msg.data.clone(),
            data_size: msg.data.len() as i64,
            event_count: msg.event_count as i32,
            has_full_snapshot: msg.has_full_snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::events::{Event, EventType};

    fn session() -> Uuid {
        Uuid::new_v4()
    }

    #[test]
    fn test_click_event_row_carries_position_and_target() {
        let event = Event::new(EventType::Click, "p1", session(), 1700000000000)
            .with_position(100.4, 200.6)
            .with_target("button", "#go");

        let row = EventRow::from_event(&event);
        assert_eq!(row.event_type, "click");
        assert_eq!(row.click_x, Some(100));
        assert_eq!(row.click_y, Some(201));
        assert_eq!(row.target_tag.as_deref(), Some("button"));
        assert!(row.error_message.is_none());
    }

    #[test]
    fn test_non_click_event_row_has_no_click_columns() {
        let event = Event::new(EventType::MouseMove, "p1", session(), 1700000000000)
            .with_position(10.0, 20.0);

        let row = EventRow::from_event(&event);
        assert_eq!(row.click_x, None);
        assert_eq!(row.click_y, None);
    }

    #[test]
    fn test_scroll_depth_clamped_to_percentage() {
        let mut event = Event::new(EventType::Scroll, "p1", session(), 1700000000000);
        event.scroll_depth = Some(140.0);

        let row = EventRow::from_event(&event);
        assert_eq!(row.scroll_depth, Some(100));
    }

    #[test]
    fn test_page_view_row_starts_with_zero_dwell() {
        let event = Event::new(EventType::PageView, "p1", session(), 1700000000000)
            .with_page("https://example.com/home", "/home");

        let row = PageViewRow::from_event(&event);
        assert_eq!(row.time_on_page_ms, 0);
        assert_eq!(row.scroll_depth, 0);
        assert_eq!(row.path.as_deref(), Some("/home"));
    }

    #[test]
    fn test_web_vitals_combined_form() {
        let event = Event::new(EventType::WebVitals, "p1", session(), 1700000000000)
            .with_vitals(Some(3500.0), Some(600.0));

        let row = WebVitalsRow::from_event(&event);
        assert_eq!(row.lcp, Some(3500.0));
        assert_eq!(row.ttfb, Some(600.0));
        assert_eq!(row.cls, None);
    }

    #[test]
    fn test_web_vitals_single_metric_form() {
        let mut event = Event::new(EventType::WebVitals, "p1", session(), 1700000000000);
        event.metric = Some("INP".to_string());
        event.value = Some(220.0);

        let row = WebVitalsRow::from_event(&event);
        assert_eq!(row.inp, Some(220.0));
        assert_eq!(row.lcp, None);
    }

    #[test]
    fn test_error_row_from_event() {
        let mut event = Event::new(EventType::JsError, "p1", session(), 1700000000000)
            .with_error("boom", "TypeError");
        event.error_line = Some(42);

        let row = ErrorRow::from_event(&event);
        assert_eq!(row.message.as_deref(), Some("boom"));
        assert_eq!(row.error_type.as_deref(), Some("TypeError"));
        assert_eq!(row.line, Some(42));
    }

    #[test]
    fn test_replay_chunk_row_records_size() {
        let msg = ReplayChunkMessage {
            session_id: session(),
            project_id: "p1".to_string(),
            chunk_index: 7,
            timestamp_start: 1000,
            timestamp_end: 2000,
            data: vec![1, 2, 3, 4, 5],
            event_count: 9,
            has_full_snapshot: true,
        };

        let row = ReplayChunkRow::from_message(&msg);
        assert_eq!(row.chunk_index, 7);
        assert_eq!(row.data_size, 5);
        assert!(row.has_full_snapshot);
    }
}
