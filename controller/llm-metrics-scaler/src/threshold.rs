//! Per-call activation thresholds and the scaler metadata they are read from

use std::collections::HashMap;
use std::sync::RwLock;
use tracing::warn;

use crate::model::{MetricName, MonitorKey};

pub const DEFAULT_THRESHOLD: f64 = 0.7;

/// Uniform override applied to all three thresholds
pub const THRESHOLD_KEY: &str = "threshold";
pub const LOAD_AVG_THRESHOLD_KEY: &str = "loadAvgThreshold";
pub const KV_BLOCKS_THRESHOLD_KEY: &str = "kvBlocksThreshold";
pub const REQUEST_SLOTS_THRESHOLD_KEY: &str = "requestSlotsThreshold";

pub const COMPONENT_NAME_KEY: &str = "componentName";
pub const ENDPOINT_NAME_KEY: &str = "endpointName";
pub const METRIC_NAME_KEY: &str = "metricName";

/// Activation thresholds; a metric at or above its threshold activates the group
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdConfig {
    pub load_avg_threshold: f64,
    pub kv_blocks_threshold: f64,
    pub request_slots_threshold: f64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self::uniform(DEFAULT_THRESHOLD)
    }
}

impl ThresholdConfig {
    pub fn uniform(threshold: f64) -> Self {
        Self {
            load_avg_threshold: threshold,
            kv_blocks_threshold: threshold,
            request_slots_threshold: threshold,
        }
    }

    /// Build a config from scaler metadata, starting from `defaults`.
    ///
    /// `threshold` applies first, the metric-specific keys win over it.
    /// Unknown keys are ignored; malformed values keep the default.
    pub fn from_metadata(metadata: &HashMap<String, String>, defaults: ThresholdConfig) -> Self {
        let mut config = defaults;

        if let Some(value) = parse_threshold(metadata, THRESHOLD_KEY) {
            config = Self::uniform(value);
        }
        if let Some(value) = parse_threshold(metadata, LOAD_AVG_THRESHOLD_KEY) {
            config.load_avg_threshold = value;
        }
        if let Some(value) = parse_threshold(metadata, KV_BLOCKS_THRESHOLD_KEY) {
            config.kv_blocks_threshold = value;
        }
        if let Some(value) = parse_threshold(metadata, REQUEST_SLOTS_THRESHOLD_KEY) {
            config.request_slots_threshold = value;
        }

        config
    }

    pub fn for_metric(&self, name: MetricName) -> f64 {
        match name {
            MetricName::LoadAvg => self.load_avg_threshold,
            MetricName::KvBlocksUsage => self.kv_blocks_threshold,
            MetricName::RequestSlotsUsage => self.request_slots_threshold,
        }
    }
}

fn parse_threshold(metadata: &HashMap<String, String>, key: &str) -> Option<f64> {
    let raw = metadata.get(key)?;
    match raw.trim().parse::<f64>() {
        Ok(value) if value.is_finite() && value > 0.0 => Some(value),
        _ => {
            warn!(key = %key, value = %raw, "Ignoring invalid threshold in scaler metadata");
            None
        }
    }
}

/// Resolve the monitor key addressed by scaler metadata, falling back to `default_key`
pub fn key_from_metadata(metadata: &HashMap<String, String>, default_key: &MonitorKey) -> MonitorKey {
    let component = metadata
        .get(COMPONENT_NAME_KEY)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(&default_key.component_name);
    let endpoint = metadata
        .get(ENDPOINT_NAME_KEY)
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .unwrap_or(&default_key.endpoint_name);
    MonitorKey::new(component, endpoint)
}

/// Metric selected through `metricName`; `Err` carries the unrecognized name
pub fn metric_from_metadata(
    metadata: &HashMap<String, String>,
) -> Result<Option<MetricName>, String> {
    match metadata.get(METRIC_NAME_KEY).map(|s| s.trim()) {
        None | Some("") => Ok(None),
        Some(name) => MetricName::parse(name).map(Some).ok_or_else(|| name.to_string()),
    }
}

/// Last threshold configuration supplied by a query, per key.
///
/// The collector evaluates proactive refreshes with these so its edges agree
/// with what the autoscaler last asked about.
pub struct ThresholdBook {
    defaults: ThresholdConfig,
    last_used: RwLock<HashMap<MonitorKey, ThresholdConfig>>,
}

impl ThresholdBook {
    pub fn new(defaults: ThresholdConfig) -> Self {
        Self {
            defaults,
            last_used: RwLock::new(HashMap::new()),
        }
    }

    pub fn defaults(&self) -> ThresholdConfig {
        self.defaults
    }

    pub fn record(&self, key: &MonitorKey, config: ThresholdConfig) {
        let mut last_used = self
            .last_used
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        last_used.insert(key.clone(), config);
    }

    pub fn forget(&self, key: &MonitorKey) {
        self.last_used
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key);
    }

    /// Drop remembered configs for keys no longer monitored
    pub fn retain(&self, keys: &[MonitorKey]) {
        self.last_used
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .retain(|key, _| keys.contains(key));
    }

    pub fn len(&self) -> usize {
        self.last_used
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: &MonitorKey) -> ThresholdConfig {
        self.last_used
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .copied()
            .unwrap_or(self.defaults)
    }
}
