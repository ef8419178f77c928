//! Scaler service - protocol-neutral handlers behind the external scaler API
//!
//! Serves activation decisions and metric values from the shared cache and
//! owns the stream subscriber registry that the collector publishes into.

use futures_util::Stream;
use std::collections::{BTreeMap, HashMap};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::cache::{CacheLookup, MetricsCache};
use crate::collector::Collector;
use crate::error::ScalerError;
use crate::evaluator::{evaluate, Evaluation};
use crate::model::{ActivationEvent, MetricName, MonitorKey};
use crate::registry::{SubscriberRegistry, Subscription};
use crate::threshold::{key_from_metadata, ThresholdBook, ThresholdConfig};

/// Activation decision plus the evaluation it came from
#[derive(Debug, Clone)]
pub struct ActivationCheck {
    pub active: bool,
    pub evaluation: Evaluation,
    pub degraded: bool,
    /// True when the snapshot was older than the staleness ceiling and the
    /// decision was forced to inactive
    pub expired: bool,
}

pub struct ScalerService {
    cache: Arc<MetricsCache>,
    registry: SubscriberRegistry,
    thresholds: Arc<ThresholdBook>,
    default_key: MonitorKey,
    staleness_ceiling: Duration,
}

impl ScalerService {
    pub fn new(
        cache: Arc<MetricsCache>,
        thresholds: ThresholdConfig,
        default_key: MonitorKey,
        staleness_ceiling: Duration,
    ) -> Self {
        cache.register(default_key.clone());
        Self {
            cache,
            registry: SubscriberRegistry::new(),
            thresholds: Arc::new(ThresholdBook::new(thresholds)),
            default_key,
            staleness_ceiling,
        }
    }

    pub fn default_key(&self) -> &MonitorKey {
        &self.default_key
    }

    pub fn default_thresholds(&self) -> ThresholdConfig {
        self.thresholds.defaults()
    }

    pub fn cache(&self) -> &Arc<MetricsCache> {
        &self.cache
    }

    pub fn registry(&self) -> &SubscriberRegistry {
        &self.registry
    }

    /// Monitor an additional key
    pub fn monitor(&self, key: MonitorKey) {
        self.cache.register(key);
    }

    /// Stop monitoring `key` and forget the thresholds last used for it
    pub fn unmonitor(&self, key: &MonitorKey) -> bool {
        self.thresholds.forget(key);
        self.cache.deregister(key)
    }

    /// Key addressed by scaler metadata
    pub fn resolve_key(&self, metadata: &HashMap<String, String>) -> MonitorKey {
        key_from_metadata(metadata, &self.default_key)
    }

    /// Thresholds addressed by scaler metadata
    pub fn resolve_thresholds(&self, metadata: &HashMap<String, String>) -> ThresholdConfig {
        ThresholdConfig::from_metadata(metadata, self.thresholds.defaults())
    }

    /// Build the collector that keeps this service's cache warm and feeds its streams
    pub fn collector(&self, check_interval: Duration) -> Collector {
        Collector::new(
            self.cache.clone(),
            self.registry.clone(),
            self.thresholds.clone(),
            check_interval,
            self.staleness_ceiling,
        )
    }

    /// Target values for the exported metrics; never touches the cache
    pub fn get_metric_spec(
        &self,
        key: &MonitorKey,
        config: &ThresholdConfig,
        only: Option<MetricName>,
    ) -> Result<Vec<(MetricName, f64)>, ScalerError> {
        self.ensure_known(key)?;

        let specs = MetricName::ALL
            .into_iter()
            .filter(|name| only.map_or(true, |only| only == *name))
            .map(|name| (name, config.for_metric(name)))
            .collect();

        debug!(
            component = %key.component_name,
            endpoint = %key.endpoint_name,
            "Providing metric specs"
        );
        Ok(specs)
    }

    pub async fn is_active(
        &self,
        key: &MonitorKey,
        config: &ThresholdConfig,
    ) -> Result<bool, ScalerError> {
        Ok(self.check(key, config).await?.active)
    }

    /// Evaluate the current activation state of `key`.
    ///
    /// A degraded snapshot still yields its activation value until it is
    /// older than the staleness ceiling; past that the answer is inactive.
    pub async fn check(
        &self,
        key: &MonitorKey,
        config: &ThresholdConfig,
    ) -> Result<ActivationCheck, ScalerError> {
        let lookup = self.cache.get(key, false).await?;
        self.thresholds.record(key, *config);
        let evaluation = evaluate(&lookup.snapshot, config);
        let expired = self.is_expired(&lookup);

        if expired && evaluation.active {
            warn!(
                component = %key.component_name,
                endpoint = %key.endpoint_name,
                age_ms = lookup.age.as_millis() as u64,
                "Snapshot past staleness ceiling, reporting inactive"
            );
        }

        let active = evaluation.active && !expired;
        debug!(
            component = %key.component_name,
            endpoint = %key.endpoint_name,
            active = active,
            degraded = lookup.degraded,
            reason = %evaluation.reason(config),
            "Evaluated activation"
        );

        Ok(ActivationCheck {
            active,
            evaluation,
            degraded: lookup.degraded,
            expired,
        })
    }

    /// Raw metric values for the autoscaler's replica math.
    ///
    /// `only` restricts the answer to one metric.
    pub async fn get_metrics(
        &self,
        key: &MonitorKey,
        config: &ThresholdConfig,
        only: Option<MetricName>,
    ) -> Result<BTreeMap<MetricName, f64>, ScalerError> {
        let lookup = self.cache.get(key, false).await?;
        self.thresholds.record(key, *config);

        if self.is_expired(&lookup) {
            return Err(ScalerError::StaleData {
                key: key.clone(),
                age: lookup.age,
            });
        }

        let mut metrics = evaluate(&lookup.snapshot, config).metrics;
        if let Some(only) = only {
            metrics.retain(|name, _| *name == only);
        }
        Ok(metrics)
    }

    /// Open an activation stream for `key`.
    ///
    /// The first item is the current state; later items are edges detected by
    /// the collector. Dropping the stream releases the registration.
    pub async fn stream_is_active(
        &self,
        key: &MonitorKey,
        config: &ThresholdConfig,
    ) -> Result<ActivationStream, ScalerError> {
        self.ensure_known(key)?;

        // Subscribe before reading the state so no edge falls in between
        let subscription = self.registry.subscribe(key);
        let active = self.is_active(key, config).await?;

        info!(
            component = %key.component_name,
            endpoint = %key.endpoint_name,
            active = active,
            subscribers = self.registry.subscriber_count(key),
            "Activation stream opened"
        );

        Ok(ActivationStream {
            initial: Some(ActivationEvent::new(key.clone(), active)),
            subscription,
        })
    }

    /// End all open streams; the collector is stopped separately
    pub fn shutdown(&self) {
        self.registry.close();
    }

    fn ensure_known(&self, key: &MonitorKey) -> Result<(), ScalerError> {
        if self.cache.accepts(key) {
            Ok(())
        } else {
            Err(ScalerError::InvalidKey { key: key.clone() })
        }
    }

    fn is_expired(&self, lookup: &CacheLookup) -> bool {
        lookup.degraded && lookup.age > self.staleness_ceiling
    }
}

/// Current activation state followed by activation edges
pub struct ActivationStream {
    initial: Option<ActivationEvent>,
    subscription: Subscription,
}

impl ActivationStream {
    pub fn key(&self) -> &MonitorKey {
        self.subscription.key()
    }
}

impl Stream for ActivationStream {
    type Item = ActivationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(initial) = self.initial.take() {
            return Poll::Ready(Some(initial));
        }
        Pin::new(&mut self.subscription).poll_next(cx)
    }
}
