//! U-turn detection
//!
//! A navigation that immediately bounces back: the user goes A -> B -> A
//! with only a short stay on B. Keeps a bounded history of page visits per
//! session.

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::VecDeque;
use uuid::Uuid;

use crate::schemas::events::Event;
use crate::schemas::insights::{Insight, InsightType};

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UTurnConfig {
    pub enabled: bool,
    pub max_time_away_ms: i64,
}

impl Default for UTurnConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_time_away_ms: 10_000,
        }
    }
}

/// Visits remembered per session
const HISTORY_LIMIT: usize = 20;

#[derive(Debug, Clone)]
struct PageVisit {
    path: String,
    timestamp: i64,
    event_id: Uuid,
}

pub struct UTurnDetector {
    config: UTurnConfig,
    history: DashMap<Uuid, VecDeque<PageVisit>>,
}

impl UTurnDetector {
    pub fn new(config: UTurnConfig) -> Self {
        Self {
            config,
            history: DashMap::new(),
        }
    }

    pub fn on_page_view(&self, event: &Event) -> Option<Insight> {
        let path = event.path.clone()?;

        let mut visits = self.history.entry(event.session_id).or_default();

        let mut insight = None;
        if visits.len() >= 2 {
            let last = &visits[visits.len() - 1];
            let prev = &visits[visits.len() - 2];
            let time_away = event.timestamp - last.timestamp;

            if path == prev.path && time_away > 0 && time_away <= self.config.max_time_away_ms {
                let mut i = Insight::new(
                    InsightType::UTurn,
                    event.project_id.clone(),
                    event.session_id,
                    event.timestamp,
                );
                i.url = event.url.clone();
                i.path = Some(path.clone());
                i.details = json!({
                    "original_page": prev.path,
                    "navigated_to": last.path,
                    "time_away_ms": time_away,
                });
                i.related_event_ids = vec![prev.event_id, last.event_id, event.event_id];
                insight = Some(i);
            }
        }

        visits.push_back(PageVisit {
            path,
            timestamp: event.timestamp,
            event_id: event.event_id,
        });
        while visits.len() > HISTORY_LIMIT {
            visits.pop_front();
        }

        insight
    }

    pub fn tracked_sessions(&self) -> usize {
        self.history.len()
    }
}
