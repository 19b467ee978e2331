//! Error-click detection
//!
//! A JavaScript error shortly after a click in the same session. A small
//! global ring of recent clicks is enough: the scan is linear but the ring
//! is bounded, so contention and cost stay flat.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use uuid::Uuid;

use crate::schemas::events::Event;
use crate::schemas::insights::{Insight, InsightType};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ErrorClickConfig {
    pub enabled: bool,
    pub error_window_ms: i64,
}

impl Default for ErrorClickConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            error_window_ms: 1000,
        }
    }
}

/// Clicks kept in the ring
const RING_CAPACITY: usize = 100;

#[derive(Debug, Clone)]
struct ClickRecord {
    session_id: Uuid,
    event_id: Uuid,
    timestamp: i64,
    x: Option<f64>,
    y: Option<f64>,
    target_selector: Option<String>,
}

pub struct ErrorClickDetector {
    config: ErrorClickConfig,
    ring: Mutex<VecDeque<ClickRecord>>,
}

impl ErrorClickDetector {
    pub fn new(config: ErrorClickConfig) -> Self {
        Self {
            config,
            ring: Mutex::new(VecDeque::with_capacity(RING_CAPACITY)),
        }
    }

    pub fn on_click(&self, event: &Event) {
        let mut ring = self.ring.lock();
        ring.push_back(ClickRecord {
            session_id: event.session_id,
            event_id: event.event_id,
            timestamp: event.timestamp,
            x: event.x,
            y: event.y,
            target_selector: event.target_selector.clone(),
        });
        while ring.len() > RING_CAPACITY {
            ring.pop_front();
        }
    }

    /// On a js_error, find the most recent same-session click inside
    /// `[error.timestamp - window, error.timestamp)`
    pub fn on_error(&self, event: &Event) -> Option<Insight> {
        let earliest = event.timestamp - self.config.error_window_ms;

        let ring = self.ring.lock();
        let click = ring.iter().rev().find(|c| {
            c.session_id == event.session_id
                && c.timestamp >= earliest
                && c.timestamp < event.timestamp
        })?;

        let mut insight = Insight::new(
            InsightType::ErrorClick,
            event.project_id.clone(),
            event.session_id,
            event.timestamp,
        );
        insight.url = event.url.clone();
        insight.path = event.path.clone();
        insight.x = click.x;
        insight.y = click.y;
        insight.target_selector = click.target_selector.clone();
        insight.details = json!({
            "error_message": event.error_message,
            "error_type": event.error_type,
            "time_to_error": event.timestamp - click.timestamp,
        });
        insight.related_event_ids = vec![click.event_id, event.event_id];

        Some(insight)
    }
}
