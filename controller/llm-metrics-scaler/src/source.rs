//! Metrics source trait
//!
//! The cache pulls aggregated worker metrics through this seam. The production
//! implementation scrapes the worker fleet over NATS (see `nats_source`);
//! tests plug in scripted sources.

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::ScalerError;
use crate::model::{MetricsSnapshot, MonitorKey};

#[async_trait]
pub trait MetricsSource: Send + Sync {
    /// Fetch current aggregated metrics for `key`.
    ///
    /// Transport, timeout and remote failures are reported as
    /// [`ScalerError::SourceUnavailable`].
    async fn fetch(&self, key: &MonitorKey) -> Result<MetricsSnapshot, ScalerError>;
}

#[async_trait]
impl<S: MetricsSource + ?Sized> MetricsSource for Arc<S> {
    async fn fetch(&self, key: &MonitorKey) -> Result<MetricsSnapshot, ScalerError> {
        (**self).fetch(key).await
    }
}
