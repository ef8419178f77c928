//! Background collector
//!
//! Every check interval the collector force-refreshes all registered keys,
//! evaluates them with the thresholds the autoscaler last asked for, and
//! publishes activation edges to stream subscribers.

use futures_util::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::cache::MetricsCache;
use crate::edge::{ActivationState, EdgeTracker};
use crate::evaluator::evaluate;
use crate::metrics::Metrics;
use crate::model::{ActivationEvent, MonitorKey};
use crate::registry::SubscriberRegistry;
use crate::threshold::ThresholdBook;

pub struct Collector {
    cache: Arc<MetricsCache>,
    registry: SubscriberRegistry,
    thresholds: Arc<ThresholdBook>,
    check_interval: Duration,
    staleness_ceiling: Duration,
    edges: HashMap<MonitorKey, EdgeTracker>,
    metrics: Metrics,
}

impl Collector {
    pub fn new(
        cache: Arc<MetricsCache>,
        registry: SubscriberRegistry,
        thresholds: Arc<ThresholdBook>,
        check_interval: Duration,
        staleness_ceiling: Duration,
    ) -> Self {
        Self {
            cache,
            registry,
            thresholds,
            check_interval,
            staleness_ceiling,
            edges: HashMap::new(),
            metrics: Metrics,
        }
    }

    pub fn edge_state(&self, key: &MonitorKey) -> ActivationState {
        self.edges
            .get(key)
            .map(|tracker| tracker.state())
            .unwrap_or_default()
    }

    /// Refresh every registered key once and publish detected edges.
    ///
    /// A failed key keeps its edge state and does not affect the others.
    pub async fn tick(&mut self) -> Vec<ActivationEvent> {
        let keys = self.cache.keys();
        self.edges.retain(|key, _| keys.contains(key));
        self.thresholds.retain(&keys);

        let cache = &self.cache;
        let lookups = join_all(keys.iter().map(|key| cache.get(key, true))).await;

        let mut events = Vec::new();
        for (key, lookup) in keys.into_iter().zip(lookups) {
            let lookup = match lookup {
                Ok(lookup) => lookup,
                Err(e) => {
                    warn!(
                        component = %key.component_name,
                        endpoint = %key.endpoint_name,
                        error = %e,
                        "Collector refresh failed; will retry next interval"
                    );
                    continue;
                }
            };

            let active = if lookup.degraded {
                if lookup.age <= self.staleness_ceiling {
                    debug!(
                        component = %key.component_name,
                        endpoint = %key.endpoint_name,
                        "Source unavailable, leaving edge state unchanged"
                    );
                    continue;
                }
                false
            } else {
                let config = self.thresholds.get(&key);
                evaluate(&lookup.snapshot, &config).active
            };

            let tracker = self.edges.entry(key.clone()).or_default();
            let first_observation = tracker.state() == ActivationState::Unknown;
            if first_observation {
                // Not an edge, but streams opened before this point got their
                // state from a query that may disagree with it
                let event = ActivationEvent::new(key.clone(), active);
                let delivered = self.registry.publish(&event);
                if delivered > 0 {
                    debug!(
                        component = %key.component_name,
                        endpoint = %key.endpoint_name,
                        active = active,
                        subscribers = delivered,
                        "Published first observed state to open streams"
                    );
                }
            }
            if let Some(active) = tracker.observe(active) {
                let event = ActivationEvent::new(key.clone(), active);
                let delivered = self.registry.publish(&event);
                self.metrics.record_edge(&key, active);
                info!(
                    component = %key.component_name,
                    endpoint = %key.endpoint_name,
                    active = active,
                    subscribers = delivered,
                    "Activation edge detected"
                );
                events.push(event);
            }
        }

        events
    }

    /// Run the collection loop until `shutdown` changes
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.check_interval.as_secs_f64(),
            "Metrics collector started"
        );

        let mut interval = tokio::time::interval(self.check_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    let events = self.tick().await;
                    if !events.is_empty() {
                        debug!(edges = events.len(), "Collector pass published edges");
                    }
                }
                _ = shutdown.changed() => {
                    info!("Metrics collector shutting down");
                    break;
                }
            }
        }
    }
}
