//! Integration tests for the background collector and edge delivery

mod common;

use common::*;
use futures_util::StreamExt;
use llm_metrics_scaler::edge::ActivationState;
use llm_metrics_scaler::{MonitorKey, ThresholdConfig};
use std::time::Duration;
use tokio::sync::watch;

const INTERVAL: Duration = Duration::from_secs(5);

#[tokio::test]
async fn test_edges_detected_once_per_transition() {
    // Given: A collector over one key
    let source = ScriptedSource::new();
    let service = service(source.clone());
    let mut collector = service.collector(INTERVAL);

    // When: Ticking through inactive, inactive, active, active, inactive
    let mut events = Vec::new();
    for snapshot in [idle(), idle(), busy(), busy(), idle()] {
        source.set(&default_key(), snapshot);
        events.extend(collector.tick().await);
    }

    // Then: Exactly one rising and one falling edge
    let edges: Vec<bool> = events.iter().map(|e| e.active).collect();
    assert_eq!(edges, vec![true, false], "expected rising then falling edge");
    assert_eq!(source.calls(), 5, "every tick must force a refresh");
}

#[tokio::test]
async fn test_subscriber_receives_initial_state_then_edges() {
    let source = ScriptedSource::new();
    source.set(&default_key(), idle());
    let service = service(source.clone());
    let mut collector = service.collector(INTERVAL);
    collector.tick().await;

    let mut stream = service
        .stream_is_active(&default_key(), &ThresholdConfig::default())
        .await
        .unwrap();
    assert!(!stream.next().await.unwrap().active, "initial state first");

    source.set(&default_key(), busy());
    collector.tick().await;
    source.set(&default_key(), busy());
    collector.tick().await;
    source.set(&default_key(), idle());
    collector.tick().await;

    assert!(stream.next().await.unwrap().active);
    assert!(!stream.next().await.unwrap().active);
}

#[tokio::test]
async fn test_failed_refresh_leaves_edge_state_unchanged() {
    // Given: A key known to be active
    let source = ScriptedSource::new();
    source.set(&default_key(), busy());
    let service = service(source.clone());
    let mut collector = service.collector(INTERVAL);
    collector.tick().await;
    assert_eq!(collector.edge_state(&default_key()), ActivationState::Active);

    // When: The source fails within the staleness ceiling
    source.fail(&default_key());
    let events = collector.tick().await;

    // Then: No event, state kept
    assert!(events.is_empty());
    assert_eq!(collector.edge_state(&default_key()), ActivationState::Active);
}

#[tokio::test]
async fn test_failure_without_data_keeps_state_unknown() {
    let source = ScriptedSource::new();
    source.fail(&default_key());
    let service = service(source.clone());
    let mut collector = service.collector(INTERVAL);

    assert!(collector.tick().await.is_empty());
    assert_eq!(collector.edge_state(&default_key()), ActivationState::Unknown);
}

#[tokio::test(start_paused = true)]
async fn test_expired_snapshot_produces_falling_edge() {
    // Given: An active key whose source goes down
    let source = ScriptedSource::new();
    source.set(&default_key(), busy());
    let service = service(source.clone());
    let mut collector = service.collector(INTERVAL);
    collector.tick().await;
    source.fail(&default_key());

    // When: The outage outlasts the staleness ceiling
    tokio::time::advance(CEILING + Duration::from_secs(1)).await;
    let events = collector.tick().await;

    // Then: Subscribers hear the same falling edge IsActive reports
    assert_eq!(events.len(), 1);
    assert!(!events[0].active);
    assert!(!service
        .is_active(&default_key(), &ThresholdConfig::default())
        .await
        .unwrap());
}

#[tokio::test]
async fn test_one_failing_key_does_not_block_others() {
    let source = ScriptedSource::new();
    let other = MonitorKey::new("prefill", "generate");
    let service = service(source.clone());
    service.monitor(other.clone());
    let mut collector = service.collector(INTERVAL);

    source.fail(&default_key());
    source.set(&other, idle());
    collector.tick().await;
    source.set(&other, busy());
    let events = collector.tick().await;

    assert_eq!(events.len(), 1);
    assert_eq!(events[0].key, other);
    assert!(events[0].active);
}

#[tokio::test]
async fn test_collector_uses_last_queried_thresholds() {
    // Given: A load that is below the default threshold but above a lenient one
    let source = ScriptedSource::new();
    source.set(&default_key(), snapshot(0.5, 0.1, 0.1));
    let service = service(source.clone());
    let mut collector = service.collector(INTERVAL);
    collector.tick().await;
    assert_eq!(collector.edge_state(&default_key()), ActivationState::Inactive);

    // When: The autoscaler queries with a lenient threshold
    let lenient = ThresholdConfig::uniform(0.4);
    assert!(service.is_active(&default_key(), &lenient).await.unwrap());
    let events = collector.tick().await;

    // Then: The collector agrees with the autoscaler's view
    assert_eq!(events.len(), 1);
    assert!(events[0].active);
}

#[tokio::test(start_paused = true)]
async fn test_run_ticks_until_shutdown() {
    let source = ScriptedSource::new();
    source.set(&default_key(), idle());
    let service = service(source.clone());
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let handle = tokio::spawn(service.collector(INTERVAL).run(shutdown_rx));

    // First tick fires immediately, then once per interval
    tokio::time::sleep(INTERVAL * 2 + Duration::from_millis(10)).await;
    assert_eq!(source.calls(), 3);

    shutdown_tx.send(true).unwrap();
    handle.await.unwrap();

    tokio::time::sleep(INTERVAL * 2).await;
    assert_eq!(source.calls(), 3, "no ticks after shutdown");
}

#[tokio::test]
async fn test_stream_opened_before_first_observation_is_resynced() {
    // Given: A stream opened before the collector has ever observed the key
    let source = ScriptedSource::new();
    source.set(&default_key(), idle());
    let service = service(source.clone());
    let mut collector = service.collector(INTERVAL);
    let mut stream = service
        .stream_is_active(&default_key(), &ThresholdConfig::default())
        .await
        .unwrap();
    assert!(!stream.next().await.unwrap().active);

    // When: The first collector pass sees a different state
    source.set(&default_key(), busy());
    let edges = collector.tick().await;

    // Then: It is not counted as an edge, but the subscriber is brought up to date
    assert!(edges.is_empty());
    assert!(stream.next().await.unwrap().active);
    assert_eq!(collector.edge_state(&default_key()), ActivationState::Active);
}
