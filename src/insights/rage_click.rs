//! Rage-click detection
//!
//! Repeated clicks in a small area within a short window. Clicks bucket
//! into a grid of `radius_px`-sized cells per session, which makes the
//! spatial lookup cheap; a centroid distance check on the candidate set
//! rejects near-cell-boundary false positives.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::schemas::events::Event;
use crate::schemas::insights::{Insight, InsightType};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RageClickConfig {
    pub enabled: bool,
    pub min_clicks: usize,
    pub time_window_ms: i64,
    pub radius_px: f64,
}

impl Default for RageClickConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_clicks: 5,
            time_window_ms: 2000,
            radius_px: 50.0,
        }
    }
}

#[derive(Debug, Clone)]
struct ClickPoint {
    x: f64,
    y: f64,
    timestamp: i64,
    event_id: Uuid,
}

/// Grid cell a click falls into: (session, floor(x/radius), floor(y/radius))
type CellKey = (Uuid, i64, i64);

pub struct RageClickDetector {
    config: RageClickConfig,
    cells: DashMap<CellKey, Vec<ClickPoint>>,
}

impl RageClickDetector {
    pub fn new(config: RageClickConfig) -> Self {
        Self {
            config,
            cells: DashMap::new(),
        }
    }

    /// Record a click; emits when enough recent clicks around the click's
    /// cell all sit within `radius_px` of their centroid.
    ///
    /// A burst can straddle a cell edge, so the candidate set is the 3x3
    /// neighbourhood of the click's cell; the centroid check still bounds
    /// the cluster to `radius_px`.
    pub fn on_click(&self, event: &Event) -> Option<Insight> {
        let (x, y) = (event.x?, event.y?);

        let col = (x / self.config.radius_px).floor() as i64;
        let row = (y / self.config.radius_px).floor() as i64;
        let cutoff = event.timestamp - self.config.time_window_ms;

        {
            let mut points = self.cells.entry((event.session_id, col, row)).or_default();
            points.push(ClickPoint {
                x,
                y,
                timestamp: event.timestamp,
                event_id: event.event_id,
            });
            points.retain(|p| p.timestamp >= cutoff);
        }

        let mut gathered: Vec<ClickPoint> = Vec::new();
        for dc in -1..=1 {
            for dr in -1..=1 {
                if let Some(mut points) =
                    self.cells.get_mut(&(event.session_id, col + dc, row + dr))
                {
                    points.retain(|p| p.timestamp >= cutoff);
                    gathered.extend(points.iter().cloned());
                }
            }
        }

        if gathered.len() < self.config.min_clicks {
            return None;
        }

        let n = gathered.len() as f64;
        let cx = gathered.iter().map(|p| p.x).sum::<f64>() / n;
        let cy = gathered.iter().map(|p| p.y).sum::<f64>() / n;

        let all_within = gathered
            .iter()
            .all(|p| ((p.x - cx).powi(2) + (p.y - cy).powi(2)).sqrt() <= self.config.radius_px);
        if !all_within {
            return None;
        }

        let mut insight = Insight::new(
            InsightType::RageClick,
            event.project_id.clone(),
            event.session_id,
            event.timestamp,
        );
        insight.url = event.url.clone();
        insight.path = event.path.clone();
        insight.x = Some(cx);
        insight.y = Some(cy);
        insight.target_selector = event.target_selector.clone();
        insight.details = json!({
            "click_count": gathered.len(),
            "time_window_ms": self.config.time_window_ms,
        });
        gathered.sort_by_key(|p| p.timestamp);
        insight.related_event_ids = gathered.iter().map(|p| p.event_id).collect();

        for dc in -1..=1 {
            for dr in -1..=1 {
                self.cells.remove(&(event.session_id, col + dc, row + dr));
            }
        }

        Some(insight)
    }

    /// Drop cells whose newest click aged out; called on the flush tick
    pub fn sweep(&self, now_ms: i64) {
        let cutoff = now_ms - 2 * self.config.time_window_ms;
        self.cells
            .retain(|_, points| points.iter().any(|p| p.timestamp >= cutoff));
    }
}
