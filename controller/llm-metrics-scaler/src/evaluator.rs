//! Threshold evaluation - maps a snapshot and thresholds to an activation decision

use std::collections::BTreeMap;

use crate::model::{MetricName, MetricsSnapshot};
use crate::threshold::ThresholdConfig;

/// Result of evaluating one snapshot
#[derive(Debug, Clone, PartialEq)]
pub struct Evaluation {
    /// True when any single metric reached its threshold
    pub active: bool,
    /// All raw values, regardless of which one triggered
    pub metrics: BTreeMap<MetricName, f64>,
    /// Metrics at or above their threshold
    pub triggered: Vec<MetricName>,
}

impl Evaluation {
    /// Human readable summary of the triggering metrics, for logs
    pub fn reason(&self, config: &ThresholdConfig) -> String {
        if self.triggered.is_empty() {
            return "all metrics below threshold".to_string();
        }
        self.triggered
            .iter()
            .map(|name| {
                format!(
                    "{} {:.3} >= {:.3}",
                    name,
                    self.metrics.get(name).copied().unwrap_or_default(),
                    config.for_metric(*name)
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

/// Evaluate `snapshot` against `config` with OR semantics across metrics
pub fn evaluate(snapshot: &MetricsSnapshot, config: &ThresholdConfig) -> Evaluation {
    let metrics: BTreeMap<MetricName, f64> = MetricName::ALL
        .into_iter()
        .map(|name| (name, snapshot.value(name)))
        .collect();

    let triggered: Vec<MetricName> = MetricName::ALL
        .into_iter()
        .filter(|name| snapshot.value(*name) >= config.for_metric(*name))
        .collect();

    Evaluation {
        active: !triggered.is_empty(),
        metrics,
        triggered,
    }
}
