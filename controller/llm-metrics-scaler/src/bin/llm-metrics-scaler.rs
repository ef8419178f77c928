//! LLM Metrics Scaler binary - serves the KEDA external scaler API

use anyhow::Context;
use llm_metrics_scaler::{
    Config, ExternalScalerGrpc, MetricsCache, MetricsSource, NatsMetricsSource, ScalerService,
};
use std::sync::Arc;
use tokio::sync::watch;
use tonic::transport::Server;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse configuration
    let config = Config::parse_config();

    // Initialize logging
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    if config.log_json {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    config.validate().context("Invalid configuration")?;
    let addr = config.bind_addr()?;
    let keys = config.monitor_keys()?;

    info!("Starting LLM Metrics Scaler");
    info!("Configuration:");
    info!("  Listen address: {}", addr);
    info!("  NATS URL: {}", config.nats_url);
    info!("  Namespace: {}", config.namespace);
    info!("  Default key: {}", config.default_key());
    info!("  Threshold: {}", config.threshold);
    info!("  Check interval: {:?}", config.check_interval());
    info!("  Cache TTL: {:?}", config.cache_ttl());
    info!("  Staleness ceiling: {:?}", config.staleness_ceiling());
    info!("  Dynamic keys: {}", config.dynamic_keys);

    let source: Arc<dyn MetricsSource> = Arc::new(
        NatsMetricsSource::connect(
            &config.nats_url,
            config.nats_creds_path.as_deref(),
            config.namespace.clone(),
            config.scrape_window(),
        )
        .await
        .context("Failed to create metrics source")?,
    );

    let cache = Arc::new(
        MetricsCache::new(source, config.cache_ttl(), config.fetch_timeout())
            .with_dynamic_keys(config.dynamic_keys),
    );
    let service = Arc::new(ScalerService::new(
        cache,
        config.default_thresholds(),
        config.default_key(),
        config.staleness_ceiling(),
    ));
    for key in keys {
        service.monitor(key);
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let collector = tokio::spawn(
        service
            .collector(config.check_interval())
            .run(shutdown_rx),
    );

    info!("External scaler listening on {}", addr);
    let grpc = ExternalScalerGrpc::new(service.clone());
    let shutdown_service = service.clone();
    Server::builder()
        .add_service(grpc.into_service())
        .serve_with_shutdown(addr, async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing activation streams");
            // Open streams never finish on their own; end them so the server can drain
            shutdown_service.shutdown();
            shutdown_tx.send(true).ok();
        })
        .await
        .context("gRPC server failed")?;

    collector.await.context("Collector task panicked")?;
    info!("LLM Metrics Scaler stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.ok();
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
