//! Error taxonomy for metrics lookups and scaler queries

use std::time::Duration;
use thiserror::Error;

use crate::model::MonitorKey;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ScalerError {
    #[error("Metrics source unavailable for {key}: {reason}")]
    SourceUnavailable { key: MonitorKey, reason: String },

    #[error("No metrics available for {key}")]
    NoDataAvailable { key: MonitorKey },

    #[error("Unknown monitor key: {key}")]
    InvalidKey { key: MonitorKey },

    #[error("Metrics for {key} are stale ({age:?} old)")]
    StaleData { key: MonitorKey, age: Duration },

    #[error("Unknown metric: {name}")]
    UnknownMetric { name: String },
}

impl ScalerError {
    pub fn source_unavailable(key: &MonitorKey, reason: impl Into<String>) -> Self {
        Self::SourceUnavailable {
            key: key.clone(),
            reason: reason.into(),
        }
    }

    /// Short label used for log fields and metric labels
    pub fn kind(&self) -> &'static str {
        match self {
            Self::SourceUnavailable { .. } => "source_unavailable",
            Self::NoDataAvailable { .. } => "no_data_available",
            Self::InvalidKey { .. } => "invalid_key",
            Self::StaleData { .. } => "stale_data",
            Self::UnknownMetric { .. } => "unknown_metric",
        }
    }
}

impl From<ScalerError> for tonic::Status {
    fn from(err: ScalerError) -> Self {
        let message = err.to_string();
        match err {
            ScalerError::InvalidKey { .. } => tonic::Status::not_found(message),
            ScalerError::UnknownMetric { .. } => tonic::Status::invalid_argument(message),
            ScalerError::SourceUnavailable { .. }
            | ScalerError::NoDataAvailable { .. }
            | ScalerError::StaleData { .. } => tonic::Status::unavailable(message),
        }
    }
}
