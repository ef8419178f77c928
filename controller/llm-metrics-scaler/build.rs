//! Generates the KEDA external scaler gRPC service stubs.
//!
//! Message types are hand-written prost structs in `src/grpc.rs`, so only the
//! service is generated here and no `protoc` is needed at build time.

use tonic_build::manual::{Builder, Method, Service};

const MESSAGES: &str = "crate::grpc::proto";

fn method(name: &str, route: &str, input: &str, output: &str) -> tonic_build::manual::MethodBuilder {
    Method::builder()
        .name(name)
        .route_name(route)
        .input_type(format!("{MESSAGES}::{input}"))
        .output_type(format!("{MESSAGES}::{output}"))
        .codec_path("tonic::codec::ProstCodec")
}

fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    let service = Service::builder()
        .name("ExternalScaler")
        .package("externalscaler")
        .method(method("is_active", "IsActive", "ScaledObjectRef", "IsActiveResponse").build())
        .method(
            method(
                "stream_is_active",
                "StreamIsActive",
                "ScaledObjectRef",
                "IsActiveResponse",
            )
            .server_streaming()
            .build(),
        )
        .method(
            method(
                "get_metric_spec",
                "GetMetricSpec",
                "ScaledObjectRef",
                "GetMetricSpecResponse",
            )
            .build(),
        )
        .method(
            method(
                "get_metrics",
                "GetMetrics",
                "GetMetricsRequest",
                "GetMetricsResponse",
            )
            .build(),
        )
        .build();

    Builder::new().compile(&[service]);
}
