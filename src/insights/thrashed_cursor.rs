//! Thrashed-cursor detection
//!
//! Fast, erratic mouse movement: many sharp direction changes at high
//! average velocity over a sliding window of samples. Per-session state
//! only; a session's samples come from one partition worker.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use std::f64::consts::{FRAC_PI_2, PI};
use uuid::Uuid;

use crate::schemas::events::Event;
use crate::schemas::insights::{Insight, InsightType};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ThrashedCursorConfig {
    pub enabled: bool,
    pub min_duration_ms: i64,
    pub min_direction_changes: u32,
    /// Average speed over the window, px/s
    pub min_velocity: f64,
}

impl Default for ThrashedCursorConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_duration_ms: 2000,
            min_direction_changes: 10,
            min_velocity: 500.0,
        }
    }
}

#[derive(Debug, Default)]
struct CursorState {
    points: VecDeque<(f64, f64, i64)>,
    last_direction: Option<f64>,
    direction_changes: u32,
    path_length: f64,
}

pub struct ThrashedCursorDetector {
    config: ThrashedCursorConfig,
    sessions: DashMap<Uuid, CursorState>,
}

impl ThrashedCursorDetector {
    pub fn new(config: ThrashedCursorConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
        }
    }

    pub fn on_mouse_move(&self, event: &Event) -> Option<Insight> {
        let (x, y) = (event.x?, event.y?);
        let ts = event.timestamp;

        let mut state = self.sessions.entry(event.session_id).or_default();

        if let Some(&(px, py, pts)) = state.points.back() {
            if ts < pts {
                // Out-of-order sample; skip it rather than corrupt the window
                return None;
            }

            let (dx, dy) = (x - px, y - py);
            let direction = dy.atan2(dx);

            if let Some(previous) = state.last_direction {
                let mut delta = (direction - previous).abs();
                if delta > PI {
                    delta = 2.0 * PI - delta;
                }
                if delta > FRAC_PI_2 {
                    state.direction_changes += 1;
                }
            }
            state.last_direction = Some(direction);
            state.path_length += (dx * dx + dy * dy).sqrt();
        }

        state.points.push_back((x, y, ts));

        // Sliding window: drop samples older than the detection span. The
        // dropped segments leave the path length with them.
        let cutoff = ts - self.config.min_duration_ms;
        while let Some(&(fx, fy, fts)) = state.points.front() {
            if fts >= cutoff {
                break;
            }
            state.points.pop_front();
            if let Some(&(nx, ny, _)) = state.points.front() {
                let seg = ((nx - fx).powi(2) + (ny - fy).powi(2)).sqrt();
                state.path_length = (state.path_length - seg).max(0.0);
            }
        }

        if state.points.len() < 2 {
            return None;
        }

        let span_ms = state.points.back()?.2 - state.points.front()?.2;
        if span_ms < self.config.min_duration_ms {
            return None;
        }
        if state.direction_changes < self.config.min_direction_changes {
            return None;
        }

        let avg_velocity = state.path_length / (span_ms as f64 / 1000.0);
        if avg_velocity < self.config.min_velocity {
            return None;
        }

        let n = state.points.len() as f64;
        let cx = state.points.iter().map(|p| p.0).sum::<f64>() / n;
        let cy = state.points.iter().map(|p| p.1).sum::<f64>() / n;
        let direction_changes = state.direction_changes;

        let mut insight = Insight::new(
            InsightType::ThrashedCursor,
            event.project_id.clone(),
            event.session_id,
            ts,
        );
        insight.url = event.url.clone();
        insight.path = event.path.clone();
        insight.x = Some(cx);
        insight.y = Some(cy);
        insight.details = json!({
            "direction_changes": direction_changes,
            "duration_ms": span_ms,
            "avg_velocity": avg_velocity,
        });
        insight.related_event_ids = vec![event.event_id];

        drop(state);
        // Full reset, including the running direction
        self.sessions.remove(&event.session_id);

        Some(insight)
    }

    pub fn tracked_sessions(&self) -> usize {
        self.sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schemas::events::EventType;

    fn mouse(session: Uuid, x: f64, y: f64, ts: i64) -> Event {
        Event::new(EventType::MouseMove, "p1", session, ts).with_position(x, y)
    }

    fn detector() -> ThrashedCursorDetector {
        ThrashedCursorDetector::new(ThrashedCursorConfig::default())
    }

    /// Horizontal zigzag: every segment reverses direction (delta = pi),
    /// sampled every 100 ms, 100 px per segment = 1000 px/s
    fn zigzag(session: Uuid, count: usize, start_ts: i64) -> Vec<Event> {
        (0..count)
            .map(|i| {
                let x = if i % 2 == 0 { 0.0 } else { 100.0 };
                mouse(session, x, 50.0, start_ts + (i as i64) * 100)
            })
            .collect()
    }

    #[test]
    fn test_zigzag_over_full_window_emits() {
        let d = detector();
        let session = Uuid::new_v4();

        // 21 samples spanning exactly 2000 ms, 20 reversals
        let events = zigzag(session, 21, 10_000);
        let mut emitted = None;
        for event in &events {
            if let Some(insight) = d.on_mouse_move(event) {
                emitted = Some(insight);
            }
        }

        let insight = emitted.expect("thrashing should be detected");
        assert_eq!(insight.insight_type, InsightType::ThrashedCursor);
        assert!(insight.details["direction_changes"].as_u64().unwrap() >= 10);
        assert!(insight.details["avg_velocity"].as_f64().unwrap() >= 500.0);

        // State fully reset after emission
        assert_eq!(d.tracked_sessions(), 0);
    }

    #[test]
    fn test_slow_movement_does_not_emit() {
        let d = detector();
        let session = Uuid::new_v4();

        // Same zigzag shape but 10 px segments: 100 px/s, below the gate
        for i in 0..25 {
            let x = if i % 2 == 0 { 0.0 } else { 10.0 };
            let event = mouse(session, x, 50.0, 10_000 + (i as i64) * 100);
            assert!(d.on_mouse_move(&event).is_none());
        }
    }

    #[test]
    fn test_straight_fast_movement_does_not_emit() {
        let d = detector();
        let session = Uuid::new_v4();

        // Fast but straight: no direction changes
        for i in 0..25 {
            let event = mouse(session, (i as f64) * 100.0, 50.0, 10_000 + (i as i64) * 100);
            assert!(d.on_mouse_move(&event).is_none());
        }
    }

    #[test]
    fn test_short_burst_does_not_emit() {
        let d = detector();
        let session = Uuid::new_v4();

        // Violent thrashing, but only 900 ms of it
        let events = zigzag(session, 10, 10_000);
        for event in &events {
            assert!(d.on_mouse_move(event).is_none());
        }
    }

    #[test]
    fn test_out_of_order_sample_is_skipped() {
        let d = detector();
        let session = Uuid::new_v4();

        assert!(d.on_mouse_move(&mouse(session, 0.0, 0.0, 1000)).is_none());
        assert!(d.on_mouse_move(&mouse(session, 50.0, 0.0, 500)).is_none());
    }

    #[test]
    fn test_samples_without_position_are_ignored() {
        let d = detector();
        let event = Event::new(EventType::MouseMove, "p1", Uuid::new_v4(), 1000);
        assert!(d.on_mouse_move(&event).is_none());
    }
}
