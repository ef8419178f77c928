//! Configuration for the LLM metrics scaler

use anyhow::{bail, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::time::Duration;

use crate::model::MonitorKey;
use crate::threshold::ThresholdConfig;

/// Configuration for the LLM metrics scaler
#[derive(Debug, Clone, Parser)]
#[command(name = "llm-metrics-scaler")]
#[command(about = "KEDA external scaler driven by LLM worker utilization")]
pub struct Config {
    /// Component name of the default monitored worker group
    #[arg(long, env, default_value = "llm-worker")]
    pub component_name: String,

    /// Endpoint name of the default monitored worker group
    #[arg(long, env, default_value = "kv-router")]
    pub endpoint_name: String,

    /// Additional keys to monitor, as component/endpoint
    #[arg(long, env = "MONITOR_KEYS", value_delimiter = ',')]
    pub monitor: Vec<String>,

    /// Monitor keys on first query instead of rejecting unknown keys
    #[arg(long, env)]
    pub dynamic_keys: bool,

    /// gRPC listen host
    #[arg(long, env, default_value = "0.0.0.0")]
    pub host: String,

    /// gRPC listen port
    #[arg(long, env, default_value_t = 9090)]
    pub port: u16,

    /// Default activation threshold for every metric
    #[arg(long, env, default_value_t = 0.7)]
    pub threshold: f64,

    /// Collector refresh interval in seconds
    #[arg(long, env, default_value_t = 5)]
    pub check_interval: u64,

    /// Maximum snapshot age served to on-demand queries, in seconds
    #[arg(long, env, default_value_t = 5)]
    pub cache_ttl: u64,

    /// Per-fetch timeout in milliseconds (defaults to the check interval)
    #[arg(long, env)]
    pub fetch_timeout_ms: Option<u64>,

    /// Degraded snapshots older than this many TTLs report inactive
    #[arg(long, env, default_value_t = 4)]
    pub staleness_ceiling_factor: u32,

    /// NATS server URL
    #[arg(long, env, default_value = "nats://localhost:4222")]
    pub nats_url: String,

    /// Path to NATS credentials file
    #[arg(long, env)]
    pub nats_creds_path: Option<String>,

    /// Namespace the worker components are registered under
    #[arg(long, env, default_value = "dynamo")]
    pub namespace: String,

    /// How long to collect stats replies per scrape, in milliseconds
    #[arg(long, env, default_value_t = 300)]
    pub scrape_window_ms: u64,

    /// Output logs in JSON format
    #[arg(long, env)]
    pub log_json: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            component_name: "llm-worker".to_string(),
            endpoint_name: "kv-router".to_string(),
            monitor: Vec::new(),
            dynamic_keys: false,
            host: "0.0.0.0".to_string(),
            port: 9090,
            threshold: 0.7,
            check_interval: 5,
            cache_ttl: 5,
            fetch_timeout_ms: None,
            staleness_ceiling_factor: 4,
            nats_url: "nats://localhost:4222".to_string(),
            nats_creds_path: None,
            namespace: "dynamo".to_string(),
            scrape_window_ms: 300,
            log_json: false,
        }
    }
}

impl Config {
    /// Parse configuration from command-line args and environment variables
    pub fn parse_config() -> Self {
        Config::parse()
    }

    /// Check that the settings can run a scaler
    pub fn validate(&self) -> Result<()> {
        if !self.threshold.is_finite() || self.threshold <= 0.0 {
            bail!("threshold must be a positive number, got {}", self.threshold);
        }
        if self.check_interval == 0 {
            bail!("check_interval must be at least 1 second");
        }
        if self.cache_ttl == 0 {
            bail!("cache_ttl must be at least 1 second");
        }
        if self.fetch_timeout_ms == Some(0) {
            bail!("fetch_timeout_ms must be greater than zero");
        }
        if self.staleness_ceiling_factor < 1 {
            bail!("staleness_ceiling_factor must be at least 1");
        }
        self.monitor_keys()?;
        Ok(())
    }

    pub fn bind_addr(&self) -> Result<SocketAddr> {
        let addr = format!("{}:{}", self.host, self.port);
        addr.parse()
            .map_err(|e| anyhow::anyhow!("invalid listen address '{}': {}", addr, e))
    }

    pub fn default_key(&self) -> MonitorKey {
        MonitorKey::new(self.component_name.clone(), self.endpoint_name.clone())
    }

    /// Every key to monitor at startup, default key first, without duplicates
    pub fn monitor_keys(&self) -> Result<Vec<MonitorKey>> {
        let mut keys = vec![self.default_key()];
        for raw in self.monitor.iter().filter(|raw| !raw.trim().is_empty()) {
            let key: MonitorKey = raw.parse().map_err(anyhow::Error::msg)?;
            if !keys.contains(&key) {
                keys.push(key);
            }
        }
        Ok(keys)
    }

    pub fn default_thresholds(&self) -> ThresholdConfig {
        ThresholdConfig::uniform(self.threshold)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval)
    }

    pub fn fetch_timeout(&self) -> Duration {
        self.fetch_timeout_ms
            .map(Duration::from_millis)
            .unwrap_or_else(|| self.check_interval())
    }

    pub fn staleness_ceiling(&self) -> Duration {
        self.cache_ttl() * self.staleness_ceiling_factor
    }

    pub fn scrape_window(&self) -> Duration {
        Duration::from_millis(self.scrape_window_ms)
    }
}
