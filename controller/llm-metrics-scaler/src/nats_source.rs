//! NATS-backed metrics source
//!
//! Workers expose their forward-pass metrics as custom endpoint stats on the
//! NATS service API. A fetch sends one `$SRV.STATS.<service>` request,
//! collects every reply that arrives within the scrape window and aggregates
//! the endpoints belonging to the monitored component/endpoint pair.

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, info, trace, warn};

use crate::error::ScalerError;
use crate::model::{MetricsSnapshot, MonitorKey};
use crate::source::MetricsSource;

/// Per-worker stats as published by the inference workers
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerLoad {
    pub worker_stats: WorkerStats,
    pub kv_stats: KvStats,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct WorkerStats {
    pub request_active_slots: u64,
    pub request_total_slots: u64,
    pub num_requests_waiting: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct KvStats {
    pub kv_active_blocks: u64,
    pub kv_total_blocks: u64,
}

#[derive(Debug, Deserialize)]
struct ServiceStats {
    #[serde(default)]
    endpoints: Vec<EndpointStats>,
}

#[derive(Debug, Deserialize)]
struct EndpointStats {
    subject: String,
    #[serde(default)]
    data: Option<serde_json::Value>,
}

/// Metrics source that scrapes the worker fleet through the NATS service API
pub struct NatsMetricsSource {
    client: async_nats::Client,
    namespace: String,
    scrape_window: Duration,
}

impl NatsMetricsSource {
    pub fn new(client: async_nats::Client, namespace: String, scrape_window: Duration) -> Self {
        Self {
            client,
            namespace,
            scrape_window,
        }
    }

    /// Connect to NATS, using a credentials file when one is configured
    pub async fn connect(
        nats_url: &str,
        creds_path: Option<&str>,
        namespace: String,
        scrape_window: Duration,
    ) -> Result<Self> {
        info!("Connecting to NATS at {}", nats_url);

        let client = if let Some(creds_path) = creds_path {
            info!("Using credentials file: {}", creds_path);
            async_nats::ConnectOptions::new()
                .credentials_file(creds_path)
                .await
                .context("Failed to load NATS credentials")?
                .connect(nats_url)
                .await
                .context("Failed to connect to NATS with credentials")?
        } else {
            warn!("No NATS credentials provided, connecting without auth");
            async_nats::connect(nats_url)
                .await
                .context("Failed to connect to NATS")?
        };

        info!("Successfully connected to NATS");
        Ok(Self::new(client, namespace, scrape_window))
    }

    fn service_name(&self, key: &MonitorKey) -> String {
        format!("{}_{}", self.namespace, key.component_name)
    }

    fn endpoint_prefix(&self, key: &MonitorKey) -> String {
        format!("{}.{}", self.service_name(key), key.endpoint_name)
    }

    async fn scrape(&self, key: &MonitorKey) -> Result<Vec<WorkerLoad>, ScalerError> {
        let subject = format!("$SRV.STATS.{}", self.service_name(key));
        let prefix = self.endpoint_prefix(key);
        let inbox = self.client.new_inbox();

        let mut replies = self
            .client
            .subscribe(inbox.clone())
            .await
            .map_err(|e| ScalerError::source_unavailable(key, format!("subscribe failed: {}", e)))?;

        self.client
            .publish_with_reply(subject.clone(), inbox, Vec::<u8>::new().into())
            .await
            .map_err(|e| ScalerError::source_unavailable(key, format!("stats request failed: {}", e)))?;
        self.client
            .flush()
            .await
            .map_err(|e| ScalerError::source_unavailable(key, format!("flush failed: {}", e)))?;

        let deadline = tokio::time::Instant::now() + self.scrape_window;
        let mut workers = Vec::new();

        while let Ok(Some(message)) = tokio::time::timeout_at(deadline, replies.next()).await {
            if message.payload.is_empty() {
                // Workers answer with an empty body until their stats handler is up
                trace!(subject = %subject, "Empty stats reply");
                continue;
            }
            match parse_stats_reply(&message.payload, &prefix) {
                Ok(mut loads) => workers.append(&mut loads),
                Err(e) => {
                    debug!(
                        subject = %subject,
                        error = %e,
                        "Skipping undecodable stats reply"
                    );
                }
            }
        }

        Ok(workers)
    }
}

#[async_trait]
impl MetricsSource for NatsMetricsSource {
    async fn fetch(&self, key: &MonitorKey) -> Result<MetricsSnapshot, ScalerError> {
        let workers = self.scrape(key).await?;

        debug!(
            component = %key.component_name,
            endpoint = %key.endpoint_name,
            workers = workers.len(),
            "Scraped worker stats"
        );

        aggregate_worker_loads(&workers)
            .ok_or_else(|| ScalerError::source_unavailable(key, "no workers reported metrics"))
    }
}

/// Decode one `$SRV.STATS` reply, keeping endpoints whose subject starts with `prefix`
pub fn parse_stats_reply(payload: &[u8], prefix: &str) -> serde_json::Result<Vec<WorkerLoad>> {
    let stats: ServiceStats = serde_json::from_slice(payload)?;

    Ok(stats
        .endpoints
        .into_iter()
        .filter(|endpoint| endpoint.subject.starts_with(prefix))
        .filter_map(|endpoint| {
            let data = endpoint.data?;
            match serde_json::from_value::<WorkerLoad>(data) {
                Ok(load) => Some(load),
                Err(e) => {
                    debug!(
                        subject = %endpoint.subject,
                        error = %e,
                        "Endpoint stats are not forward-pass metrics"
                    );
                    None
                }
            }
        })
        .collect())
}

/// Aggregate per-worker stats into one snapshot.
///
/// Load average is the mean of `(active + waiting) / total` request slots;
/// KV block and request slot usage are fleet-wide ratios. Returns `None` when
/// no worker reports any capacity.
pub fn aggregate_worker_loads(workers: &[WorkerLoad]) -> Option<MetricsSnapshot> {
    let loads: Vec<f64> = workers
        .iter()
        .filter(|w| w.worker_stats.request_total_slots > 0)
        .map(|w| {
            (w.worker_stats.request_active_slots + w.worker_stats.num_requests_waiting) as f64
                / w.worker_stats.request_total_slots as f64
        })
        .collect();

    let total_blocks: u64 = workers.iter().map(|w| w.kv_stats.kv_total_blocks).sum();
    let total_slots: u64 = workers
        .iter()
        .map(|w| w.worker_stats.request_total_slots)
        .sum();

    if loads.is_empty() && total_blocks == 0 {
        return None;
    }

    let active_blocks: u64 = workers.iter().map(|w| w.kv_stats.kv_active_blocks).sum();
    let active_slots: u64 = workers
        .iter()
        .map(|w| w.worker_stats.request_active_slots)
        .sum();

    let load_average = if loads.is_empty() {
        0.0
    } else {
        loads.iter().sum::<f64>() / loads.len() as f64
    };

    Some(
        MetricsSnapshot::new(
            load_average,
            ratio(active_blocks, total_blocks),
            ratio(active_slots, total_slots),
        )
        .with_worker_count(workers.len()),
    )
}

fn ratio(used: u64, total: u64) -> f64 {
    if total == 0 {
        0.0
    } else {
        used as f64 / total as f64
    }
}
