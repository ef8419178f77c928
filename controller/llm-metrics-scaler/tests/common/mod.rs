//! Scripted metrics source shared by the integration specs

#![allow(dead_code)]

use async_trait::async_trait;
use llm_metrics_scaler::{
    MetricsCache, MetricsSnapshot, MetricsSource, MonitorKey, ScalerError, ScalerService,
    ThresholdConfig,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const TTL: Duration = Duration::from_secs(5);
pub const FETCH_TIMEOUT: Duration = Duration::from_secs(2);
pub const CEILING: Duration = Duration::from_secs(20);

pub fn default_key() -> MonitorKey {
    MonitorKey::new("llm-worker", "kv-router")
}

pub fn snapshot(load: f64, kv: f64, slots: f64) -> MetricsSnapshot {
    MetricsSnapshot::new(load, kv, slots)
}

pub fn idle() -> MetricsSnapshot {
    snapshot(0.1, 0.1, 0.1)
}

pub fn busy() -> MetricsSnapshot {
    snapshot(0.9, 0.1, 0.1)
}

/// In-memory source whose answer per key can be changed between calls
#[derive(Default)]
pub struct ScriptedSource {
    answers: Mutex<HashMap<MonitorKey, Option<MetricsSnapshot>>>,
    delay: Mutex<Duration>,
    calls: AtomicUsize,
    completed: AtomicUsize,
}

impl ScriptedSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set(&self, key: &MonitorKey, snapshot: MetricsSnapshot) {
        self.answers
            .lock()
            .unwrap()
            .insert(key.clone(), Some(snapshot));
    }

    /// Make every fetch for `key` fail until the next `set`
    pub fn fail(&self, key: &MonitorKey) {
        self.answers.lock().unwrap().insert(key.clone(), None);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Fetches that ran to the end, including those nobody waited for
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MetricsSource for ScriptedSource {
    async fn fetch(&self, key: &MonitorKey) -> Result<MetricsSnapshot, ScalerError> {
        self.calls.fetch_add(1, Ordering::SeqCst);

        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let answer = self.answers.lock().unwrap().get(key).cloned().flatten();
        self.completed.fetch_add(1, Ordering::SeqCst);
        answer.ok_or_else(|| ScalerError::source_unavailable(key, "scripted failure"))
    }
}

pub fn cache(source: Arc<ScriptedSource>) -> Arc<MetricsCache> {
    Arc::new(MetricsCache::new(source, TTL, FETCH_TIMEOUT))
}

pub fn service(source: Arc<ScriptedSource>) -> Arc<ScalerService> {
    Arc::new(ScalerService::new(
        cache(source),
        ThresholdConfig::default(),
        default_key(),
        CEILING,
    ))
}
