//! Liveness and metrics-exposition bodies, shared by both listeners.

use bytes::Bytes;
use http_body_util::{BodyExt, Full, combinators::BoxBody};
use hyper::{Response, StatusCode};
use std::convert::Infallible;

use crate::metrics::Metrics;

pub type GatewayBody = BoxBody<Bytes, Infallible>;

pub fn boxed(body: impl Into<Bytes>) -> GatewayBody {
    Full::new(body.into()).map_err(|never| match never {}).boxed()
}

pub fn healthz() -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(boxed(r#"{"status":"ok"}"#))
        .expect("build healthz response")
}

pub fn metrics(metrics: &Metrics) -> Response<GatewayBody> {
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "text/plain; version=0.0.4")
        .body(boxed(metrics.encode()))
        .expect("build metrics response")
}
