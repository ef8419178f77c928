//! KEDA external scaler gRPC front end
//!
//! Translates `externalscaler.ExternalScaler` requests into [`ScalerService`]
//! calls. The monitor key and thresholds travel in the ScaledObject's scaler
//! metadata.

use futures_util::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tonic::{Request, Response, Status};
use tracing::debug;

use crate::error::ScalerError;
use crate::model::MetricName;
use crate::service::ScalerService;
use crate::threshold::metric_from_metadata;

/// Protobuf messages of the `externalscaler` package and the generated service.
pub mod proto {
    use std::collections::HashMap;

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct ScaledObjectRef {
        #[prost(string, tag = "1")]
        pub name: String,
        #[prost(string, tag = "2")]
        pub namespace: String,
        #[prost(map = "string, string", tag = "3")]
        pub scaler_metadata: HashMap<String, String>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct IsActiveResponse {
        #[prost(bool, tag = "1")]
        pub result: bool,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetMetricSpecResponse {
        #[prost(message, repeated, tag = "1")]
        pub metric_specs: Vec<MetricSpec>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MetricSpec {
        #[prost(string, tag = "1")]
        pub metric_name: String,
        /// Deprecated by KEDA in favour of `target_size_float`
        #[prost(int64, tag = "2")]
        pub target_size: i64,
        #[prost(double, tag = "3")]
        pub target_size_float: f64,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetMetricsRequest {
        #[prost(message, optional, tag = "1")]
        pub scaled_object_ref: Option<ScaledObjectRef>,
        #[prost(string, tag = "2")]
        pub metric_name: String,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct GetMetricsResponse {
        #[prost(message, repeated, tag = "1")]
        pub metric_values: Vec<MetricValue>,
    }

    #[derive(Clone, PartialEq, ::prost::Message)]
    pub struct MetricValue {
        #[prost(string, tag = "1")]
        pub metric_name: String,
        /// Deprecated by KEDA in favour of `metric_value_float`
        #[prost(int64, tag = "2")]
        pub metric_value: i64,
        #[prost(double, tag = "3")]
        pub metric_value_float: f64,
    }

    include!(concat!(env!("OUT_DIR"), "/externalscaler.ExternalScaler.rs"));
}

use proto::external_scaler_server::{ExternalScaler, ExternalScalerServer};

/// gRPC implementation of the external scaler service
#[derive(Clone)]
pub struct ExternalScalerGrpc {
    service: Arc<ScalerService>,
}

impl ExternalScalerGrpc {
    pub fn new(service: Arc<ScalerService>) -> Self {
        Self { service }
    }

    /// Get the tonic service for mounting on a gRPC server.
    pub fn into_service(self) -> ExternalScalerServer<Self> {
        ExternalScalerServer::new(self)
    }
}

fn metric_filter(name: &str) -> Result<Option<MetricName>, Status> {
    if name.trim().is_empty() {
        return Ok(None);
    }
    MetricName::parse(name.trim()).map(Some).ok_or_else(|| {
        ScalerError::UnknownMetric {
            name: name.to_string(),
        }
        .into()
    })
}

#[tonic::async_trait]
impl ExternalScaler for ExternalScalerGrpc {
    async fn is_active(
        &self,
        request: Request<proto::ScaledObjectRef>,
    ) -> Result<Response<proto::IsActiveResponse>, Status> {
        let scaled_obj = request.into_inner();
        let key = self.service.resolve_key(&scaled_obj.scaler_metadata);
        let config = self.service.resolve_thresholds(&scaled_obj.scaler_metadata);

        let result = self.service.is_active(&key, &config).await?;

        debug!(
            namespace = %scaled_obj.namespace,
            name = %scaled_obj.name,
            key = %key,
            result = result,
            "IsActive"
        );
        Ok(Response::new(proto::IsActiveResponse { result }))
    }

    type StreamIsActiveStream =
        Pin<Box<dyn Stream<Item = Result<proto::IsActiveResponse, Status>> + Send + 'static>>;

    async fn stream_is_active(
        &self,
        request: Request<proto::ScaledObjectRef>,
    ) -> Result<Response<Self::StreamIsActiveStream>, Status> {
        let scaled_obj = request.into_inner();
        let key = self.service.resolve_key(&scaled_obj.scaler_metadata);
        let config = self.service.resolve_thresholds(&scaled_obj.scaler_metadata);

        debug!(
            namespace = %scaled_obj.namespace,
            name = %scaled_obj.name,
            key = %key,
            "StreamIsActive"
        );

        // Dropping the stream (client disconnect or server shutdown) releases
        // the subscription
        let stream = self
            .service
            .stream_is_active(&key, &config)
            .await?
            .map(|event| Ok(proto::IsActiveResponse {
                result: event.active,
            }));

        Ok(Response::new(Box::pin(stream)))
    }

    async fn get_metric_spec(
        &self,
        request: Request<proto::ScaledObjectRef>,
    ) -> Result<Response<proto::GetMetricSpecResponse>, Status> {
        let scaled_obj = request.into_inner();
        let metadata = &scaled_obj.scaler_metadata;
        let key = self.service.resolve_key(metadata);
        let config = self.service.resolve_thresholds(metadata);
        let only = metric_from_metadata(metadata)
            .map_err(|name| Status::from(ScalerError::UnknownMetric { name }))?;

        let metric_specs = self
            .service
            .get_metric_spec(&key, &config, only)?
            .into_iter()
            .map(|(name, target)| proto::MetricSpec {
                metric_name: name.as_str().to_string(),
                target_size: 0,
                target_size_float: target,
            })
            .collect();

        Ok(Response::new(proto::GetMetricSpecResponse { metric_specs }))
    }

    async fn get_metrics(
        &self,
        request: Request<proto::GetMetricsRequest>,
    ) -> Result<Response<proto::GetMetricsResponse>, Status> {
        let request = request.into_inner();
        let only = metric_filter(&request.metric_name)?;
        let scaled_obj = request.scaled_object_ref.unwrap_or_default();
        let key = self.service.resolve_key(&scaled_obj.scaler_metadata);
        let config = self.service.resolve_thresholds(&scaled_obj.scaler_metadata);

        let metric_values = self
            .service
            .get_metrics(&key, &config, only)
            .await?
            .into_iter()
            .map(|(name, value)| proto::MetricValue {
                metric_name: name.as_str().to_string(),
                metric_value: 0,
                metric_value_float: value,
            })
            .collect();

        Ok(Response::new(proto::GetMetricsResponse { metric_values }))
    }
}
