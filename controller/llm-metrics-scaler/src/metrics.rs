//! Observability for the scaler
//!
//! Values go through the `metrics` facade (a no-op until an exporter installs
//! a recorder) and are mirrored as structured debug logs. Degraded serving is
//! only ever reported here, never through the scaler protocol.

use metrics::{counter, gauge, histogram};
use std::time::Duration;
use tracing::{debug, warn};

use crate::model::{MetricName, MetricsSnapshot, MonitorKey};

/// Metrics recorder for the scaler service
#[derive(Clone, Copy, Debug, Default)]
pub struct Metrics;

impl Metrics {
    /// Record the outcome of one fetch against the metrics source
    pub fn record_fetch(&self, key: &MonitorKey, outcome: &str, elapsed: Duration) {
        counter!("llm_scaler_fetch_total", 1,
            "component" => key.component_name.clone(),
            "endpoint" => key.endpoint_name.clone(),
            "outcome" => outcome.to_string()
        );
        histogram!("llm_scaler_fetch_duration_ms", elapsed.as_secs_f64() * 1000.0,
            "component" => key.component_name.clone(),
            "endpoint" => key.endpoint_name.clone()
        );
        debug!(
            component = %key.component_name,
            endpoint = %key.endpoint_name,
            outcome = %outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "Recorded metrics fetch"
        );
    }

    /// Record that a stale snapshot was served in place of a fresh one
    pub fn record_degraded(&self, key: &MonitorKey, age: Duration) {
        counter!("llm_scaler_degraded_total", 1,
            "component" => key.component_name.clone(),
            "endpoint" => key.endpoint_name.clone()
        );
        warn!(
            component = %key.component_name,
            endpoint = %key.endpoint_name,
            age_ms = age.as_millis() as u64,
            "Serving degraded metrics snapshot"
        );
    }

    /// Record an activation edge published to stream subscribers
    pub fn record_edge(&self, key: &MonitorKey, active: bool) {
        let direction = if active { "rising" } else { "falling" };
        counter!("llm_scaler_activation_edges_total", 1,
            "component" => key.component_name.clone(),
            "endpoint" => key.endpoint_name.clone(),
            "direction" => direction.to_string()
        );
        debug!(
            component = %key.component_name,
            endpoint = %key.endpoint_name,
            direction = %direction,
            "Recorded activation edge"
        );
    }

    /// Update the open stream count for a key
    pub fn set_subscribers(&self, key: &MonitorKey, count: usize) {
        gauge!("llm_scaler_stream_subscribers", count as f64,
            "component" => key.component_name.clone(),
            "endpoint" => key.endpoint_name.clone()
        );
    }

    /// Publish the latest snapshot values as gauges
    pub fn update_gauges(&self, key: &MonitorKey, snapshot: &MetricsSnapshot) {
        for name in MetricName::ALL {
            gauge!(name.as_str(), snapshot.value(name),
                "component" => key.component_name.clone(),
                "endpoint" => key.endpoint_name.clone()
            );
        }
        debug!(
            component = %key.component_name,
            endpoint = %key.endpoint_name,
            load_average = snapshot.load_average,
            kv_blocks_usage_percent = snapshot.kv_blocks_usage_percent,
            request_slots_usage_percent = snapshot.request_slots_usage_percent,
            workers = snapshot.worker_count,
            "Updated metrics gauges"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_recording() {
        let metrics = Metrics;
        let key = MonitorKey::new("llm-worker", "kv-router");

        // No recorder installed; these must not panic
        metrics.record_fetch(&key, "ok", Duration::from_millis(12));
        metrics.record_degraded(&key, Duration::from_secs(7));
        metrics.record_edge(&key, true);
        metrics.set_subscribers(&key, 2);
        metrics.update_gauges(&key, &MetricsSnapshot::new(0.5, 0.2, 0.1));
    }
}
