//! End-to-end tests for the external scaler gRPC API

mod common;

use common::*;
use llm_metrics_scaler::grpc::proto::external_scaler_client::ExternalScalerClient;
use llm_metrics_scaler::grpc::proto::{GetMetricsRequest, ScaledObjectRef};
use llm_metrics_scaler::{ExternalScalerGrpc, MonitorKey, ScalerService};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::transport::{Channel, Server};
use tonic::Code;

async fn start_server(service: Arc<ScalerService>) -> ExternalScalerClient<Channel> {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        Server::builder()
            .add_service(ExternalScalerGrpc::new(service).into_service())
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    ExternalScalerClient::connect(format!("http://{}", addr))
        .await
        .unwrap()
}

fn scaled_object(metadata: &[(&str, &str)]) -> ScaledObjectRef {
    ScaledObjectRef {
        name: "llm-worker".to_string(),
        namespace: "default".to_string(),
        scaler_metadata: metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect::<HashMap<_, _>>(),
    }
}

#[tokio::test]
async fn test_is_active_over_grpc() {
    let source = ScriptedSource::new();
    source.set(&default_key(), snapshot(0.1, 0.8, 0.1));
    let mut client = start_server(service(source)).await;

    let response = client.is_active(scaled_object(&[])).await.unwrap();
    assert!(response.into_inner().result);

    // A per-call threshold above the hot metric turns it off
    let response = client
        .is_active(scaled_object(&[("kvBlocksThreshold", "0.9")]))
        .await
        .unwrap();
    assert!(!response.into_inner().result);
}

#[tokio::test]
async fn test_get_metric_spec_over_grpc() {
    let source = ScriptedSource::new();
    let mut client = start_server(service(source)).await;

    let specs = client
        .get_metric_spec(scaled_object(&[("threshold", "0.6")]))
        .await
        .unwrap()
        .into_inner()
        .metric_specs;
    let names: Vec<&str> = specs.iter().map(|s| s.metric_name.as_str()).collect();
    assert_eq!(
        names,
        vec![
            "llm_load_avg",
            "llm_kv_blocks_usage_percent",
            "llm_request_slots_usage_percent"
        ]
    );
    assert!(specs.iter().all(|s| s.target_size_float == 0.6));

    let specs = client
        .get_metric_spec(scaled_object(&[("metricName", "llm_load_avg")]))
        .await
        .unwrap()
        .into_inner()
        .metric_specs;
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].target_size_float, 0.7);
}

#[tokio::test]
async fn test_get_metrics_over_grpc() {
    let source = ScriptedSource::new();
    source.set(&default_key(), snapshot(0.8, 0.25, 0.4));
    let mut client = start_server(service(source)).await;

    let values = client
        .get_metrics(GetMetricsRequest {
            scaled_object_ref: Some(scaled_object(&[])),
            metric_name: "llm_kv_blocks_usage_percent".to_string(),
        })
        .await
        .unwrap()
        .into_inner()
        .metric_values;
    assert_eq!(values.len(), 1);
    assert_eq!(values[0].metric_name, "llm_kv_blocks_usage_percent");
    assert_eq!(values[0].metric_value_float, 0.25);

    let all = client
        .get_metrics(GetMetricsRequest {
            scaled_object_ref: Some(scaled_object(&[])),
            metric_name: String::new(),
        })
        .await
        .unwrap()
        .into_inner()
        .metric_values;
    assert_eq!(all.len(), 3);

    let status = client
        .get_metrics(GetMetricsRequest {
            scaled_object_ref: Some(scaled_object(&[])),
            metric_name: "gpu_temperature".to_string(),
        })
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::InvalidArgument);
}

#[tokio::test]
async fn test_error_statuses_over_grpc() {
    let source = ScriptedSource::new();
    let other = MonitorKey::new("prefill", "generate");
    source.fail(&default_key());
    let mut client = start_server(service(source)).await;

    // Unknown key
    let status = client
        .is_active(scaled_object(&[
            ("componentName", other.component_name.as_str()),
            ("endpointName", other.endpoint_name.as_str()),
        ]))
        .await
        .unwrap_err();
    assert_eq!(status.code(), Code::NotFound);

    // Monitored key, nothing ever fetched
    let status = client.is_active(scaled_object(&[])).await.unwrap_err();
    assert_eq!(status.code(), Code::Unavailable);
}

#[tokio::test]
async fn test_stream_is_active_over_grpc() {
    let source = ScriptedSource::new();
    source.set(&default_key(), idle());
    let service = service(source.clone());
    let mut collector = service.collector(Duration::from_secs(5));
    collector.tick().await;
    let mut client = start_server(service.clone()).await;

    let mut stream = client
        .stream_is_active(scaled_object(&[]))
        .await
        .unwrap()
        .into_inner();

    let first = stream.message().await.unwrap().unwrap();
    assert!(!first.result, "initial state first");

    source.set(&default_key(), busy());
    collector.tick().await;
    let edge = stream.message().await.unwrap().unwrap();
    assert!(edge.result);

    service.shutdown();
    assert!(stream.message().await.unwrap().is_none(), "stream ends on shutdown");
}
