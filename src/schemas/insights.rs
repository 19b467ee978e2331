//! Insight and Alert Schemas
//!
//! An insight is a server-derived behavioural observation. Insights are
//! written to the `insights` table and mirrored as lightweight alert
//! messages on the alerts topic.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Behavioural insight categories emitted by the detectors
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    RageClick,
    DeadClick,
    ErrorClick,
    ThrashedCursor,
    UTurn,
    SlowPage,
}

impl InsightType {
    /// Stable snake_case name, used for store columns and metric labels
    pub fn as_str(&self) -> &'static str {
        match self {
            InsightType::RageClick => "rage_click",
            InsightType::DeadClick => "dead_click",
            InsightType::ErrorClick => "error_click",
            InsightType::ThrashedCursor => "thrashed_cursor",
            InsightType::UTurn => "u_turn",
            InsightType::SlowPage => "slow_page",
        }
    }
}

/// A derived behavioural observation tied to one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Insight {
    /// Assigned when the insight enters the store path
    #[serde(default = "Uuid::new_v4")]
    pub insight_id: Uuid,

    pub insight_type: InsightType,
    pub project_id: String,
    pub session_id: Uuid,

    /// Time of the triggering event, milliseconds since epoch
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Location on the page, where the insight has one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_selector: Option<String>,

    /// Detector-specific fields, free-form
    #[serde(default)]
    pub details: serde_json::Value,

    /// Events that contributed to this insight; every id belongs to the
    /// same session as the insight
    #[serde(default)]
    pub related_event_ids: Vec<Uuid>,
}

impl Insight {
    pub fn new(
        insight_type: InsightType,
        project_id: impl Into<String>,
        session_id: Uuid,
        timestamp: i64,
    ) -> Self {
        Self {
            insight_id: Uuid::new_v4(),
            insight_type,
            project_id: project_id.into(),
            session_id,
            timestamp,
            url: None,
            path: None,
            x: None,
            y: None,
            target_selector: None,
            details: serde_json::Value::Null,
            related_event_ids: Vec::new(),
        }
    }
}

/// Alert message published to the alerts topic, keyed by project_id.
///
/// Publication is fire-and-forget: a failed publish never blocks or drops
/// the insight's store write.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertMessage {
    pub insight_id: Uuid,

    #[serde(rename = "type")]
    pub insight_type: InsightType,

    pub project_id: String,
    pub session_id: Uuid,
    pub timestamp: i64,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    #[serde(default)]
    pub details: serde_json::Value,

    /// Wall-clock publish time
    pub published_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_selector: Option<String>,
}

impl AlertMessage {
    /// Build the alert mirror of an insight
    pub fn from_insight(insight: &Insight) -> Self {
        Self {
            insight_id: insight.insight_id,
            insight_type: insight.insight_type,
            project_id: insight.project_id.clone(),
            session_id: insight.session_id,
            timestamp: insight.timestamp,
            url: insight.url.clone(),
            path: insight.path.clone(),
            details: insight.details.clone(),
            published_at: Utc::now(),
            x: insight.x,
            y: insight.y,
            target_selector: insight.target_selector.clone(),
        }
    }
}
