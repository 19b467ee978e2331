//! Dead-click detection
//!
//! A click on something that looks interactive but produces no response.
//! Each qualifying click goes into a pending table; later events in the
//! same session resolve it, and a sweep pass emits whatever is still
//! pending once its observation window elapsed. Resolution and expiry both
//! go through an atomic remove, so a pending click resolves exactly once
//! even under duplicate delivery.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::schemas::events::{Event, EventType};
use crate::schemas::insights::{Insight, InsightType};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DeadClickConfig {
    pub enabled: bool,
    pub observation_window_ms: i64,
}

impl Default for DeadClickConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            observation_window_ms: 1000,
        }
    }
}

/// What a click on this target should have caused
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedBehavior {
    /// `<a href>`: a navigation
    Navigate,
    /// Buttons and inputs: a handler firing
    Handle,
    /// Anything else interactive-looking: a DOM change
    Mutate,
}

impl ExpectedBehavior {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpectedBehavior::Navigate => "navigate",
            ExpectedBehavior::Handle => "handle",
            ExpectedBehavior::Mutate => "mutate",
        }
    }
}

#[derive(Debug, Clone)]
struct PendingClick {
    project_id: String,
    session_id: Uuid,
    event_id: Uuid,
    timestamp: i64,
    expires_at: i64,
    expected: ExpectedBehavior,
    url: Option<String>,
    path: Option<String>,
    x: Option<f64>,
    y: Option<f64>,
    target_selector: Option<String>,
    target_tag: Option<String>,
}

pub struct DeadClickDetector {
    config: DeadClickConfig,
    pending: DashMap<(Uuid, Uuid), PendingClick>,
}

const INTERACTIVE_TAGS: [&str; 5] = ["a", "button", "input", "select", "textarea"];
const INTERACTIVE_CLASSES: [&str; 5] = ["btn", "button", "link", "clickable", "interactive"];
const INTERACTIVE_ROLES: [&str; 2] = ["button", "link"];

/// Does the click target look like something that should respond?
fn looks_interactive(event: &Event) -> bool {
    if let Some(tag) = event.target_tag.as_deref() {
        if INTERACTIVE_TAGS.contains(&tag.to_ascii_lowercase().as_str()) {
            return true;
        }
    }
    if let Some(classes) = event.target_classes.as_deref() {
        let classes = classes.to_ascii_lowercase();
        if INTERACTIVE_CLASSES.iter().any(|c| classes.contains(c)) {
            return true;
        }
    }
    if let Some(role) = event.target_role.as_deref() {
        if INTERACTIVE_ROLES.contains(&role.to_ascii_lowercase().as_str()) {
            return true;
        }
    }
    false
}

fn expected_behavior(event: &Event) -> ExpectedBehavior {
    match event.target_tag.as_deref().map(str::to_ascii_lowercase) {
        Some(ref tag) if tag == "a" && event.target_href.is_some() => ExpectedBehavior::Navigate,
        Some(ref tag) if tag == "button" || tag == "input" => ExpectedBehavior::Handle,
        _ => ExpectedBehavior::Mutate,
    }
}

/// Does this event count as the response the pending click was waiting for?
fn resolves(expected: ExpectedBehavior, event_type: EventType) -> bool {
    match expected {
        ExpectedBehavior::Navigate => event_type == EventType::PageView,
        ExpectedBehavior::Mutate => event_type == EventType::DomMutation,
        ExpectedBehavior::Handle => {
            !matches!(event_type, EventType::MouseMove | EventType::Scroll)
        }
    }
}

impl DeadClickDetector {
    pub fn new(config: DeadClickConfig) -> Self {
        Self {
            config,
            pending: DashMap::new(),
        }
    }

    /// Feed one event: resolve pending clicks it answers, then register it
    /// as pending if it is an interactive-looking click
    pub fn observe(&self, event: &Event) {
        self.resolve_pending(event);

        if event.event_type == EventType::Click && looks_interactive(event) {
            let pending = PendingClick {
                project_id: event.project_id.clone(),
                session_id: event.session_id,
                event_id: event.event_id,
                timestamp: event.timestamp,
                expires_at: event.timestamp + self.config.observation_window_ms,
                expected: expected_behavior(event),
                url: event.url.clone(),
                path: event.path.clone(),
                x: event.x,
                y: event.y,
                target_selector: event.target_selector.clone(),
                target_tag: event.target_tag.clone(),
            };
            self.pending
                .insert((event.session_id, event.event_id), pending);
        }
    }

    fn resolve_pending(&self, event: &Event) {
        let resolved: Vec<(Uuid, Uuid)> = self
            .pending
            .iter()
            .filter(|entry| {
                let p = entry.value();
                p.session_id == event.session_id
                    && event.event_id != p.event_id
                    && event.timestamp > p.timestamp
                    && event.timestamp - p.timestamp <= self.config.observation_window_ms
                    && resolves(p.expected, event.event_type)
            })
            .map(|entry| *entry.key())
            .collect();

        for key in resolved {
            // load-and-delete: a concurrent expiry cannot double-handle it
            self.pending.remove(&key);
        }
    }

    /// Emit an insight for every pending click whose window elapsed
    pub fn expire(&self, now_ms: i64) -> Vec<Insight> {
        let expired: Vec<(Uuid, Uuid)> = self
            .pending
            .iter()
            .filter(|entry| entry.value().expires_at <= now_ms)
            .map(|entry| *entry.key())
            .collect();

        let mut insights = Vec::new();
        for key in expired {
            if let Some((_, p)) = self.pending.remove(&key) {
                let mut insight = Insight::new(
                    InsightType::DeadClick,
                    p.project_id.clone(),
                    p.session_id,
                    p.timestamp,
                );
                insight.url = p.url.clone();
                insight.path = p.path.clone();
                insight.x = p.x;
                insight.y = p.y;
                insight.target_selector = p.target_selector.clone();
                insight.details = json!({
                    "expected_behavior": p.expected.as_str(),
                    "target_tag": p.target_tag,
                    "observation_window_ms": self.config.observation_window_ms,
                });
                insight.related_event_ids = vec![p.event_id];
                insights.push(insight);
            }
        }
        insights
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn button_click(session: Uuid, ts: i64) -> Event {
        let mut event = Event::new(EventType::Click, "p1", session, ts)
            .with_position(40.0, 60.0)
            .with_target("button", "#go");
        event.url = Some("https://shop.test/checkout".to_string());
        event.path = Some("/checkout".to_string());
        event
    }

    fn detector() -> DeadClickDetector {
        DeadClickDetector::new(DeadClickConfig::default())
    }

    #[test]
    fn test_dom_mutation_resolves_pending_click() {
        let d = detector();
        let session = Uuid::new_v4();

        let mut click = button_click(session, 5000);
        click.target_tag = Some("div".to_string());
        click.target_classes = Some("btn primary".to_string());
        d.observe(&click);
        assert_eq!(d.pending_count(), 1);

        d.observe(&Event::new(EventType::DomMutation, "p1", session, 5400));
        assert_eq!(d.pending_count(), 0);
        assert!(d.expire(10_000).is_empty());
    }

    #[test]
    fn test_mouse_move_and_scroll_do_not_resolve() {
        let d = detector();
        let session = Uuid::new_v4();

        d.observe(&button_click(session, 10_000));

        d.observe(
            &Event::new(EventType::MouseMove, "p1", session, 10_200).with_position(5.0, 5.0),
        );
        let mut scroll = Event::new(EventType::Scroll, "p1", session, 10_800);
        scroll.scroll_depth = Some(30.0);
        d.observe(&scroll);

        let insights = d.expire(11_000);
        assert_eq!(insights.len(), 1);
        assert_eq!(insights[0].insight_type, InsightType::DeadClick);
        assert_eq!(insights[0].details["expected_behavior"], "handle");
        assert_eq!(insights[0].timestamp, 10_000);
    }

    #[test]
    fn test_any_event_resolves_handle_click() {
        let d = detector();
        let session = Uuid::new_v4();

        d.observe(&button_click(session, 5000));
        let mut input = Event::new(EventType::InputChange, "p1", session, 5300);
        input.target_tag = Some("input".to_string());
        d.observe(&input);

        // Resolved, and non-click events never pend themselves
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn test_navigate_click_only_resolved_by_page_view() {
        let d = detector();
        let session = Uuid::new_v4();

        let mut link = button_click(session, 1000);
        link.target_tag = Some("a".to_string());
        link.target_href = Some("/pricing".to_string());
        d.observe(&link);

        // A dom_mutation is not a navigation
        d.observe(&Event::new(EventType::DomMutation, "p1", session, 1200));
        assert_eq!(d.pending_count(), 1);

        let pv = Event::new(EventType::PageView, "p1", session, 1400)
            .with_page("https://shop.test/pricing", "/pricing");
        d.observe(&pv);
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn test_response_after_window_does_not_resolve() {
        let d = detector();
        let session = Uuid::new_v4();

        d.observe(&button_click(session, 1000));
        d.observe(&Event::new(EventType::DomMutation, "p1", session, 2400));

        let insights = d.expire(2400);
        assert_eq!(insights.len(), 1);
    }

    #[test]
    fn test_non_interactive_click_never_pends() {
        let d = detector();
        let session = Uuid::new_v4();

        let mut click = Event::new(EventType::Click, "p1", session, 1000).with_position(5.0, 5.0);
        click.target_tag = Some("p".to_string());
        d.observe(&click);
        assert_eq!(d.pending_count(), 0);
    }

    #[test]
    fn test_duplicate_delivery_emits_once() {
        let d = detector();
        let session = Uuid::new_v4();

        let click = button_click(session, 1000);
        d.observe(&click);
        d.observe(&click);
        assert_eq!(d.pending_count(), 1);

        let first = d.expire(2001);
        assert_eq!(first.len(), 1);
        assert!(d.expire(2001).is_empty());
    }

    #[test]
    fn test_role_marks_target_interactive() {
        let mut click = Event::new(EventType::Click, "p1", Uuid::new_v4(), 1000);
        click.target_tag = Some("span".to_string());
        click.target_role = Some("button".to_string());
        assert!(looks_interactive(&click));

        click.target_role = Some("tooltip".to_string());
        assert!(!looks_interactive(&click));
    }
}
