//! Interaction Event Schema
//!
//! Wire model for messages on the raw event topic. One struct accommodates
//! every event type emitted by the browser SDK; type-dependent payload
//! fields are optional and absent for other types.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::StreamError;

/// Closed set of event types produced by the SDK.
///
/// The transport is inconsistent about spelling: some producers send the
/// short form (`click`), others the enum form (`EVENT_TYPE_CLICK`). Both
/// are accepted. Anything unrecognised decodes as [`EventType::Custom`].
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PageView,
    Click,
    Scroll,
    InputChange,
    MouseMove,
    JsError,
    WebVitals,
    PageLoad,
    DomMutation,
    Identify,
    PageExit,
    Custom,
}

impl EventType {
    /// Stable snake_case name, used for store columns and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PageView => "page_view",
            EventType::Click => "click",
            EventType::Scroll => "scroll",
            EventType::InputChange => "input_change",
            EventType::MouseMove => "mouse_move",
            EventType::JsError => "js_error",
            EventType::WebVitals => "web_vitals",
            EventType::PageLoad => "page_load",
            EventType::DomMutation => "dom_mutation",
            EventType::Identify => "identify",
            EventType::PageExit => "page_exit",
            EventType::Custom => "custom",
        }
    }

    /// Accept both transport spellings
    pub fn from_wire(value: &str) -> Self {
        match value {
            "page_view" | "EVENT_TYPE_PAGE_VIEW" => EventType::PageView,
            "click" | "EVENT_TYPE_CLICK" => EventType::Click,
            "scroll" | "EVENT_TYPE_SCROLL" => EventType::Scroll,
            "input_change" | "EVENT_TYPE_INPUT_CHANGE" => EventType::InputChange,
            "mouse_move" | "EVENT_TYPE_MOUSE_MOVE" => EventType::MouseMove,
            "js_error" | "EVENT_TYPE_JS_ERROR" => EventType::JsError,
            "web_vitals" | "EVENT_TYPE_WEB_VITALS" => EventType::WebVitals,
            "page_load" | "EVENT_TYPE_PAGE_LOAD" => EventType::PageLoad,
            "dom_mutation" | "EVENT_TYPE_DOM_MUTATION" => EventType::DomMutation,
            "identify" | "EVENT_TYPE_IDENTIFY" => EventType::Identify,
            "page_exit" | "EVENT_TYPE_PAGE_EXIT" => EventType::PageExit,
            _ => EventType::Custom,
        }
    }
}

impl<'de> Deserialize<'de> for EventType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(EventType::from_wire(&value))
    }
}

/// One interaction event decoded from the `events.raw` topic.
///
/// Events within a session arrive in non-decreasing timestamp order (the
/// topic is partitioned by project+session).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier for this event
    #[serde(default = "Uuid::new_v4")]
    pub event_id: Uuid,

    /// Project this event belongs to
    pub project_id: String,

    /// Session this event belongs to
    pub session_id: Uuid,

    /// Identified user, if the SDK has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,

    /// Event classification
    #[serde(rename = "type", alias = "event_type")]
    pub event_type: EventType,

    /// Source-assigned time, milliseconds since epoch
    pub timestamp: i64,

    // Page context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,

    // Device context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browser: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub os: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_width: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub viewport_height: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_width: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screen_height: Option<i32>,

    // Geo context, populated upstream at the ingest edge
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,

    // Pointer position: click location or mouse_move sample
    #[serde(default, alias = "click_x", skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, alias = "click_y", skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,

    // Click target metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_tag: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_classes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_href: Option<String>,

    // Scroll payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scroll_depth: Option<f64>,

    // Error payload
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stack: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_line: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_col: Option<i32>,

    // Web-vitals payload, combined form
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lcp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cls: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttfb: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fcp: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inp: Option<f64>,

    // Web-vitals payload, single-metric form: {"metric": "lcp", "value": 3500}
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<f64>,

    /// Free-form properties for custom events
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub properties: serde_json::Value,
}

impl Event {
    /// Minimal event for a session; payload fields are filled by `with_*`
    pub fn new(
        event_type: EventType,
        project_id: impl Into<String>,
        session_id: Uuid,
        timestamp: i64,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            project_id: project_id.into(),
            session_id,
            user_id: None,
            event_type,
            timestamp,
            url: None,
            path: None,
            title: None,
            referrer: None,
            browser: None,
            os: None,
            device_type: None,
            viewport_width: None,
            viewport_height: None,
            screen_width: None,
            screen_height: None,
            country: None,
            city: None,
            x: None,
            y: None,
            target_selector: None,
            target_tag: None,
            target_id: None,
            target_classes: None,
            target_text: None,
            target_role: None,
            target_href: None,
            scroll_depth: None,
            error_message: None,
            error_type: None,
            error_stack: None,
            error_source: None,
            error_line: None,
            error_col: None,
            lcp: None,
            fid: None,
            cls: None,
            ttfb: None,
            fcp: None,
            inp: None,
            metric: None,
            value: None,
            properties: serde_json::Value::Null,
        }
    }

    pub fn with_page(mut self, url: impl Into<String>, path: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self.path = Some(path.into());
        self
    }

    pub fn with_position(mut self, x: f64, y: f64) -> Self {
        self.x = Some(x);
        self.y = Some(y);
        self
    }

    pub fn with_target(mut self, tag: impl Into<String>, selector: impl Into<String>) -> Self {
        self.target_tag = Some(tag.into());
        self.target_selector = Some(selector.into());
        self
    }

    pub fn with_error(mut self, message: impl Into<String>, error_type: impl Into<String>) -> Self {
        self.error_message = Some(message.into());
        self.error_type = Some(error_type.into());
        self
    }

    pub fn with_vitals(mut self, lcp: Option<f64>, ttfb: Option<f64>) -> Self {
        self.lcp = lcp;
        self.ttfb = ttfb;
        self
    }

    /// Reject events that cannot be attributed or ordered
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.project_id.is_empty() {
            return Err(StreamError::InvalidEvent("empty project_id".to_string()));
        }
        if self.session_id.is_nil() {
            return Err(StreamError::InvalidEvent("nil session_id".to_string()));
        }
        if self.timestamp <= 0 {
            return Err(StreamError::InvalidEvent(format!(
                "non-positive timestamp {}",
                self.timestamp
            )));
        }
        Ok(())
    }

    /// Event time as a UTC datetime; an out-of-range source timestamp
    /// falls back to the wall clock
    pub fn occurred_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.timestamp)
            .single()
            .unwrap_or_else(Utc::now)
    }

    /// Effective LCP for slow-page checks, from either vitals form
    pub fn lcp_ms(&self) -> Option<f64> {
        self.lcp.or_else(|| self.named_metric("lcp"))
    }

    /// Effective TTFB for slow-page checks, from either vitals form
    pub fn ttfb_ms(&self) -> Option<f64> {
        self.ttfb.or_else(|| self.named_metric("ttfb"))
    }

    fn named_metric(&self, name: &str) -> Option<f64> {
        match self.metric.as_deref() {
            Some(m) if m.eq_ignore_ascii_case(name) => self.value,
            _ => None,
        }
    }
}
