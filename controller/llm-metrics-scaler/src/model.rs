//! Domain types shared by the cache, collector and scaler service

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifies one logical worker group being scaled
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MonitorKey {
    pub component_name: String,
    pub endpoint_name: String,
}

impl MonitorKey {
    pub fn new(component_name: impl Into<String>, endpoint_name: impl Into<String>) -> Self {
        Self {
            component_name: component_name.into(),
            endpoint_name: endpoint_name.into(),
        }
    }
}

impl fmt::Display for MonitorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.component_name, self.endpoint_name)
    }
}

impl FromStr for MonitorKey {
    type Err = String;

    /// Parses `component/endpoint`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((component, endpoint))
                if !component.trim().is_empty()
                    && !endpoint.trim().is_empty()
                    && !endpoint.contains('/') =>
            {
                Ok(Self::new(component.trim(), endpoint.trim()))
            }
            _ => Err(format!(
                "invalid monitor key '{}', expected <component>/<endpoint>",
                s
            )),
        }
    }
}

/// Aggregated utilization of a worker group at one point in time.
///
/// Snapshots are immutable; a refresh replaces the cached snapshot wholesale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub load_average: f64,
    pub kv_blocks_usage_percent: f64,
    pub request_slots_usage_percent: f64,
    pub observed_at: DateTime<Utc>,
    /// Number of workers that contributed to this aggregate
    #[serde(default)]
    pub worker_count: usize,
}

impl MetricsSnapshot {
    pub fn new(
        load_average: f64,
        kv_blocks_usage_percent: f64,
        request_slots_usage_percent: f64,
    ) -> Self {
        Self {
            load_average,
            kv_blocks_usage_percent,
            request_slots_usage_percent,
            observed_at: Utc::now(),
            worker_count: 0,
        }
    }

    pub fn with_worker_count(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn value(&self, name: MetricName) -> f64 {
        match name {
            MetricName::LoadAvg => self.load_average,
            MetricName::KvBlocksUsage => self.kv_blocks_usage_percent,
            MetricName::RequestSlotsUsage => self.request_slots_usage_percent,
        }
    }
}

/// Metrics exported to the autoscaler
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum MetricName {
    LoadAvg,
    KvBlocksUsage,
    RequestSlotsUsage,
}

impl MetricName {
    pub const ALL: [MetricName; 3] = [
        MetricName::LoadAvg,
        MetricName::KvBlocksUsage,
        MetricName::RequestSlotsUsage,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoadAvg => "llm_load_avg",
            Self::KvBlocksUsage => "llm_kv_blocks_usage_percent",
            Self::RequestSlotsUsage => "llm_request_slots_usage_percent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|name| name.as_str() == s)
    }
}

impl fmt::Display for MetricName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An activation edge detected by the collector
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationEvent {
    pub key: MonitorKey,
    pub active: bool,
    pub triggered_at: DateTime<Utc>,
}

impl ActivationEvent {
    pub fn new(key: MonitorKey, active: bool) -> Self {
        Self {
            key,
            active,
            triggered_at: Utc::now(),
        }
    }
}
