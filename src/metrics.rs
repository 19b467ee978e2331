//! Prometheus metrics
//!
//! One bundle of counters and histograms shared by every processor,
//! registered on a dedicated registry and served by the HTTP surface.

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts, Registry,
};

use crate::error::Result;

/// Metric bundle for the stream core
pub struct Metrics {
    registry: Registry,

    /// Events accepted per processor
    pub events_processed: IntCounterVec,

    /// Events dropped, by reason (decode, overflow, invalid)
    pub events_dropped: IntCounterVec,

    /// Insights emitted per insight type
    pub insights_emitted: IntCounterVec,

    /// Rows written per table
    pub rows_written: IntCounterVec,

    /// Failed batch flushes per table
    pub flush_failures: IntCounterVec,

    /// Flush latency per table
    pub flush_duration: HistogramVec,

    /// Alert messages handed to the producer
    pub alerts_published: IntCounter,

    /// Sessions flushed to the sessions table
    pub sessions_flushed: IntCounter,
}

impl Metrics {
    pub fn new() -> Result<Self> {
        let registry = Registry::new_custom(Some("gosight".to_string()), None)?;

        let events_processed = IntCounterVec::new(
            Opts::new("events_processed_total", "Events accepted per processor"),
            &["processor"],
        )?;
        let events_dropped = IntCounterVec::new(
            Opts::new("events_dropped_total", "Events dropped, by reason"),
            &["reason"],
        )?;
        let insights_emitted = IntCounterVec::new(
            Opts::new("insights_emitted_total", "Insights emitted per type"),
            &["type"],
        )?;
        let rows_written = IntCounterVec::new(
            Opts::new("rows_written_total", "Rows written per table"),
            &["table"],
        )?;
        let flush_failures = IntCounterVec::new(
            Opts::new("flush_failures_total", "Failed batch flushes per table"),
            &["table"],
        )?;
        let flush_duration = HistogramVec::new(
            HistogramOpts::new("flush_duration_seconds", "Flush latency per table"),
            &["table"],
        )?;
        let alerts_published = IntCounter::new(
            "alerts_published_total",
            "Alert messages handed to the producer",
        )?;
        let sessions_flushed = IntCounter::new(
            "sessions_flushed_total",
            "Sessions flushed to the sessions table",
        )?;

        registry.register(Box::new(events_processed.clone()))?;
        registry.register(Box::new(events_dropped.clone()))?;
        registry.register(Box::new(insights_emitted.clone()))?;
        registry.register(Box::new(rows_written.clone()))?;
        registry.register(Box::new(flush_failures.clone()))?;
        registry.register(Box::new(flush_duration.clone()))?;
        registry.register(Box::new(alerts_published.clone()))?;
        registry.register(Box::new(sessions_flushed.clone()))?;

        Ok(Self {
            registry,
            events_processed,
            events_dropped,
            insights_emitted,
            rows_written,
            flush_failures,
            flush_duration,
            alerts_published,
            sessions_flushed,
        })
    }

    /// Registry backing the `/metrics` endpoint
    pub fn registry(&self) -> &Registry {
        &self.registry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_register_and_count() {
        let metrics = Metrics::new().unwrap();

        metrics.events_processed.with_label_values(&["event"]).inc();
        metrics
            .insights_emitted
            .with_label_values(&["rage_click"])
            .inc_by(3);

        assert_eq!(
            metrics
                .events_processed
                .with_label_values(&["event"])
                .get(),
            1
        );
        assert_eq!(
            metrics
                .insights_emitted
                .with_label_values(&["rage_click"])
                .get(),
            3
        );

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "gosight_events_processed_total"));
    }

    #[test]
    fn test_two_bundles_do_not_collide() {
        // Dedicated registries keep tests and embedded uses independent
        let a = Metrics::new().unwrap();
        let b = Metrics::new().unwrap();
        a.alerts_published.inc();
        assert_eq!(b.alerts_published.get(), 0);
    }
}
