//! GoSight Stream-Processing Core
//!
//! Consumes the raw interaction-event stream produced by the GoSight browser
//! SDK and turns it into analytical rows, live session aggregates, derived
//! behavioural insights, and alert signals.
//!
//! # Overview
//!
//! Three consumer groups share the partitioned event topic (partition key =
//! project+session, so events within a session arrive in order):
//!
//! - **Event Processor**: typed rows batched into the columnar store
//!   (`events`, `page_views`, `web_vitals`, `errors`) plus live session
//!   aggregation.
//! - **Insight Processor**: six detectors (rage click, dead click, error
//!   click, thrashed cursor, U-turn, slow page) writing `insights` rows and
//!   publishing alert messages.
//! - **Replay Processor**: per-session rrweb chunk buffering into
//!   `replay_chunks`.
//!
//! # Example
//!
//! ```rust,no_run
//! use gosight_stream::common::config::AppConfig;
//! use gosight_stream::pipeline::Pipeline;
//!
//! # async fn run() -> anyhow::Result<()> {
//! let config = AppConfig::load()?;
//! let pipeline = Pipeline::new(config).await?;
//! pipeline.run().await?;
//! # Ok(())
//! # }
//! ```

pub mod common {
    //! Configuration and shared helpers

    pub mod config;
}

pub mod schemas {
    //! Wire schemas for bus messages

    pub mod events;
    pub mod insights;
    pub mod replay;
}

pub mod models {
    //! Row models for the columnar store

    pub mod rows;
}

pub mod error;
pub mod insights;
pub mod metrics;
pub mod pipeline;

// Re-export commonly used types at the crate root
pub use common::config::AppConfig;
pub use error::{Result, StreamError};
pub use insights::InsightProcessor;
pub use metrics::Metrics;
pub use pipeline::event_processor::EventProcessor;
pub use pipeline::replay_processor::ReplayProcessor;
pub use pipeline::session_aggregator::SessionAggregator;
pub use pipeline::Pipeline;
pub use schemas::events::{Event, EventType};
pub use schemas::insights::{AlertMessage, Insight, InsightType};
pub use schemas::replay::ReplayChunkMessage;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
