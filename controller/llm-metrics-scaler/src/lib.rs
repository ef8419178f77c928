//! LLM Metrics Scaler - KEDA external scaler for LLM worker fleets
//!
//! Aggregates worker utilization (load average, KV cache blocks, request
//! slots) per monitored key, caches it behind a single-flight refresh, and
//! answers the autoscaler's activation and metric queries over gRPC. A
//! background collector refreshes every key on a fixed interval and pushes
//! activation edges to streaming subscribers.

pub mod cache;
pub mod collector;
pub mod config;
pub mod edge;
pub mod error;
pub mod evaluator;
pub mod grpc;
pub mod metrics;
pub mod model;
pub mod nats_source;
pub mod registry;
pub mod service;
pub mod source;
pub mod threshold;

pub use cache::{CacheLookup, MetricsCache};
pub use collector::Collector;
pub use config::Config;
pub use error::ScalerError;
pub use evaluator::{evaluate, Evaluation};
pub use grpc::ExternalScalerGrpc;
pub use metrics::Metrics;
pub use model::{ActivationEvent, MetricName, MetricsSnapshot, MonitorKey};
pub use nats_source::NatsMetricsSource;
pub use registry::{SubscriberRegistry, Subscription};
pub use service::{ActivationStream, ScalerService};
pub use source::MetricsSource;
pub use threshold::ThresholdConfig;
