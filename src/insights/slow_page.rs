//! Slow-page detection
//!
//! Stateless threshold check on web-vitals and page-load events.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::schemas::events::Event;
use crate::schemas::insights::{Insight, InsightType};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SlowPageConfig {
    pub enabled: bool,
    pub lcp_threshold_ms: f64,
    pub ttfb_threshold_ms: f64,
}

impl Default for SlowPageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            lcp_threshold_ms: 3000.0,
            ttfb_threshold_ms: 800.0,
        }
    }
}

pub struct SlowPageDetector {
    config: SlowPageConfig,
}

impl SlowPageDetector {
    pub fn new(config: SlowPageConfig) -> Self {
        Self { config }
    }

    pub fn on_vitals(&self, event: &Event) -> Option<Insight> {
        let lcp = event.lcp_ms();
        let ttfb = event.ttfb_ms();

        let mut reasons = Vec::new();
        if matches!(lcp, Some(v) if v > self.config.lcp_threshold_ms) {
            reasons.push("lcp");
        }
        if matches!(ttfb, Some(v) if v > self.config.ttfb_threshold_ms) {
            reasons.push("ttfb");
        }
        if reasons.is_empty() {
            return None;
        }

        let mut insight = Insight::new(
            InsightType::SlowPage,
            event.project_id.clone(),
            event.session_id,
            event.timestamp,
        );
        insight.url = event.url.clone();
        insight.path = event.path.clone();
        insight.details = json!({
            "reasons": reasons,
            "lcp": lcp,
            "ttfb": ttfb,
            "load_time_ms": if reasons.contains(&"lcp") { lcp } else { ttfb },
        });
        insight.related_event_ids = vec![event.event_id];

        Some(insight)
    }
}
