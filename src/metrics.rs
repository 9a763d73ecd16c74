//! Prometheus export, behind the `metrics-export` feature.
//!
//! The rest of the crate emits through the `metrics` facade and works with
//! any recorder. This module is for deployments that scrape Prometheus
//! directly: it owns typed collectors for the engine's key series and can
//! render them in the text exposition format.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounterVec, IntGauge, Opts, Registry, TextEncoder,
};

use crate::error::Result;

/// Typed collectors for the engine's Prometheus series.
#[derive(Clone)]
pub struct VolleyMetrics {
    /// Backend calls currently executing.
    pub items_in_flight: IntGauge,
    /// Settled items by outcome (`succeeded`, `failed`, `cancelled`).
    pub items_total: IntCounterVec,
    /// Batches by terminal status.
    pub batches_total: IntCounterVec,
    /// Items touched by the stale-lease reclaim sweep.
    pub reclaims_total: IntCounterVec,
    /// Wall time from claim to recorded outcome, in seconds.
    pub item_duration_seconds: Histogram,
}

impl VolleyMetrics {
    /// Create the collectors and register them with `registry`.
    pub fn register(registry: &Registry) -> Result<Self> {
        let items_in_flight = IntGauge::new(
            "volley_items_in_flight",
            "Number of backend calls currently executing",
        )
        .map_err(anyhow::Error::from)?;

        let items_total = IntCounterVec::new(
            Opts::new("volley_items_total", "Settled items by outcome"),
            &["outcome"],
        )
        .map_err(anyhow::Error::from)?;

        let batches_total = IntCounterVec::new(
            Opts::new("volley_batches_total", "Batches by terminal status"),
            &["status"],
        )
        .map_err(anyhow::Error::from)?;

        let reclaims_total = IntCounterVec::new(
            Opts::new(
                "volley_reclaims_total",
                "Items reclaimed from expired leases, by disposition",
            ),
            &["disposition"],
        )
        .map_err(anyhow::Error::from)?;

        let item_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "volley_item_duration_seconds",
                "Wall time from item claim to recorded outcome",
            )
            .buckets(vec![
                0.1, 0.5, 1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 3600.0,
            ]),
        )
        .map_err(anyhow::Error::from)?;

        registry
            .register(Box::new(items_in_flight.clone()))
            .map_err(anyhow::Error::from)?;
        registry
            .register(Box::new(items_total.clone()))
            .map_err(anyhow::Error::from)?;
        registry
            .register(Box::new(batches_total.clone()))
            .map_err(anyhow::Error::from)?;
        registry
            .register(Box::new(reclaims_total.clone()))
            .map_err(anyhow::Error::from)?;
        registry
            .register(Box::new(item_duration_seconds.clone()))
            .map_err(anyhow::Error::from)?;

        Ok(Self {
            items_in_flight,
            items_total,
            batches_total,
            reclaims_total,
            item_duration_seconds,
        })
    }
}

/// Render everything in `registry` in the Prometheus text format.
pub fn render(registry: &Registry) -> Result<String> {
    let metric_families = registry.gather();
    let mut buffer = Vec::new();
    TextEncoder::new()
        .encode(&metric_families, &mut buffer)
        .map_err(anyhow::Error::from)?;
    String::from_utf8(buffer).map_err(|e| anyhow::Error::from(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_and_render() {
        let registry = Registry::new();
        let metrics = VolleyMetrics::register(&registry).unwrap();

        metrics.items_in_flight.set(3);
        metrics.items_total.with_label_values(&["succeeded"]).inc();
        metrics.batches_total.with_label_values(&["completed"]).inc();
        metrics
            .reclaims_total
            .with_label_values(&["requeued"])
            .inc();
        metrics.item_duration_seconds.observe(1.25);

        let rendered = render(&registry).unwrap();
        assert!(rendered.contains("volley_items_in_flight 3"));
        assert!(rendered.contains("volley_items_total{outcome=\"succeeded\"} 1"));
        assert!(rendered.contains("volley_item_duration_seconds_count 1"));
    }

    #[test]
    fn test_double_registration_rejected() {
        let registry = Registry::new();
        VolleyMetrics::register(&registry).unwrap();
        assert!(VolleyMetrics::register(&registry).is_err());
    }
}
