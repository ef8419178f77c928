//! Stream subscriber registry
//!
//! Maps each monitor key to its open activation streams. Guarded by its own
//! lock, independent of the metrics cache, so subscription churn never waits
//! behind a refresh. A [`Subscription`] deregisters itself when dropped.

use futures_util::Stream;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::metrics::Metrics;
use crate::model::{ActivationEvent, MonitorKey};

type Senders = HashMap<u64, mpsc::UnboundedSender<ActivationEvent>>;

struct RegistryInner {
    subscribers: Mutex<HashMap<MonitorKey, Senders>>,
    next_id: AtomicU64,
    closed: AtomicBool,
    metrics: Metrics,
}

impl RegistryInner {
    fn remove(&self, key: &MonitorKey, id: u64) {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|p| p.into_inner());
        let remaining = match subscribers.get_mut(key) {
            Some(senders) => {
                senders.remove(&id);
                senders.len()
            }
            None => return,
        };
        if remaining == 0 {
            subscribers.remove(key);
        }
        drop(subscribers);

        self.metrics.set_subscribers(key, remaining);
        debug!(
            component = %key.component_name,
            endpoint = %key.endpoint_name,
            subscription = id,
            remaining = remaining,
            "Stream subscription released"
        );
    }
}

/// Shared registry of activation stream subscribers
#[derive(Clone)]
pub struct SubscriberRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for SubscriberRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
                metrics: Metrics,
            }),
        }
    }

    /// Register a new subscriber for `key`.
    ///
    /// After [`close`](Self::close) the returned subscription ends immediately.
    pub fn subscribe(&self, key: &MonitorKey) -> Subscription {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();

        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if !self.inner.closed.load(Ordering::SeqCst) {
            let senders = subscribers.entry(key.clone()).or_default();
            senders.insert(id, tx);
            self.inner.metrics.set_subscribers(key, senders.len());
            debug!(
                component = %key.component_name,
                endpoint = %key.endpoint_name,
                subscription = id,
                "Stream subscription registered"
            );
        }
        drop(subscribers);

        Subscription {
            id,
            key: key.clone(),
            rx,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Deliver `event` to every subscriber of its key, in call order.
    ///
    /// Subscribers whose receiving side is gone are pruned. Returns the
    /// number of subscribers the event reached.
    pub fn publish(&self, event: &ActivationEvent) -> usize {
        let mut subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        let Some(senders) = subscribers.get_mut(&event.key) else {
            return 0;
        };

        senders.retain(|_, tx| tx.send(event.clone()).is_ok());
        let delivered = senders.len();
        if delivered == 0 {
            subscribers.remove(&event.key);
        }
        drop(subscribers);

        self.inner.metrics.set_subscribers(&event.key, delivered);
        delivered
    }

    pub fn subscriber_count(&self, key: &MonitorKey) -> usize {
        let subscribers = self
            .inner
            .subscribers
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        subscribers.get(key).map(|s| s.len()).unwrap_or(0)
    }

    /// Drop every subscriber so all open streams end; later subscriptions end immediately
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
        let drained: Vec<(MonitorKey, Senders)> = {
            let mut subscribers = self
                .inner
                .subscribers
                .lock()
                .unwrap_or_else(|p| p.into_inner());
            subscribers.drain().collect()
        };

        let total: usize = drained.iter().map(|(_, senders)| senders.len()).sum();
        for (key, _) in &drained {
            self.inner.metrics.set_subscribers(key, 0);
        }
        info!(closed = total, "Subscriber registry closed");
    }
}

/// One open activation stream, bound to a monitor key
pub struct Subscription {
    id: u64,
    key: MonitorKey,
    rx: mpsc::UnboundedReceiver<ActivationEvent>,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    pub fn key(&self) -> &MonitorKey {
        &self.key
    }

    /// Wait for the next edge event; `None` once the registry closed
    pub async fn recv(&mut self) -> Option<ActivationEvent> {
        self.rx.recv().await
    }
}

impl Stream for Subscription {
    type Item = ActivationEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.remove(&self.key, self.id);
        }
    }
}
