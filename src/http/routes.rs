//! Route dispatch: admission -> engine dispatch -> accounting for the public
//! generation routes, plus bearer-gated operator routes for ban/unban/
//! rate-limit/ranking.

use std::convert::Infallible;
use std::net::IpAddr;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use http_body_util::{BodyExt, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::{Method, Request, Response, StatusCode};
use serde_json::Value;

use crate::error::{AdmissionError, ClientError, UpstreamError, UserFacingError};
use crate::ip_admission::{AdmissionOutcome, IpStatus};
use crate::AppState;

use super::health::{self, GatewayBody};

pub async fn route(
    req: Request<Incoming>,
    peer: IpAddr,
    state: Arc<AppState>,
) -> Result<Response<GatewayBody>, Infallible> {
    let ip = resolve_client_ip(&req, peer);
    let path = req.uri().path().to_owned();
    let method = req.method().clone();

    let response = match (&method, path.as_str()) {
        (&Method::GET, "/healthz") => health::healthz(),
        (&Method::GET, "/metrics") => health::metrics(&state.metrics),
        (&Method::POST, "/v1internal:generateContent") => {
            generate(req, ip, state, false).await
        }
        (&Method::POST, "/v1internal:streamGenerateContent") => {
            generate(req, ip, state, true).await
        }
        (&Method::POST, p) if p.starts_with("/operator/ips/") && p.ends_with("/ban") => {
            set_status(req, ip, p, &state, IpStatus::Banned).await
        }
        (&Method::POST, p) if p.starts_with("/operator/ips/") && p.ends_with("/unban") => {
            set_status(req, ip, p, &state, IpStatus::Active).await
        }
        (&Method::POST, p) if p.starts_with("/operator/ips/") && p.ends_with("/rate_limit") => {
            set_status(req, ip, p, &state, IpStatus::RateLimited).await
        }
        (&Method::GET, "/operator/ips/ranking") => ranking(&req, &state),
        (&Method::GET, "/operator/ips/summary") => summary(&req, &state),
        _ => json_error(StatusCode::NOT_FOUND, "not found"),
    };

    Ok(response)
}

async fn generate(
    req: Request<Incoming>,
    ip: IpAddr,
    state: Arc<AppState>,
    streaming: bool,
) -> Response<GatewayBody> {
    match state.ip_manager.admission_outcome(ip).await {
        AdmissionOutcome::Allowed => {}
        AdmissionOutcome::Banned => return user_facing_error(&AdmissionError::Banned),
        AdmissionOutcome::RateLimited => return user_facing_error(&AdmissionError::RateLimited),
    }

    let user_agent = req
        .headers()
        .get(hyper::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);

    let body = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "failed to read request body"),
    };
    let parsed: Value = match serde_json::from_slice(&body) {
        Ok(v) => v,
        Err(_) => return json_error(StatusCode::BAD_REQUEST, "request body was not valid JSON"),
    };
    let Some(model) = parsed.get("model").and_then(Value::as_str).map(str::to_owned) else {
        return json_error(StatusCode::BAD_REQUEST, "missing required field `model`");
    };
    let request_body = parsed.get("request").cloned().unwrap_or(Value::Object(Default::default()));
    let endpoint = if streaming { "streamGenerateContent" } else { "generateContent" };

    state
        .ip_manager
        .record(ip, endpoint, user_agent.as_deref(), Some(&model))
        .await;

    if streaming {
        match state.engine.dispatch_stream(&model, request_body).await {
            Ok(stream) => Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "text/event-stream")
                .body(stream_body(stream))
                .expect("build streaming response"),
            Err(e) => user_facing_error(&e),
        }
    } else {
        match state.engine.dispatch_unary(&model, request_body).await {
            Ok(value) => Response::builder()
                .status(StatusCode::OK)
                .header("content-type", "application/json")
                .body(health::boxed(value.to_string()))
                .expect("build unary response"),
            Err(e) => user_facing_error(&e),
        }
    }
}

fn stream_body(
    upstream: futures::stream::BoxStream<'static, Result<Bytes, UpstreamError>>,
) -> GatewayBody {
    let frames = async_stream::stream! {
        let mut upstream = upstream;
        while let Some(item) = upstream.next().await {
            match item {
                Ok(bytes) => yield Ok::<_, Infallible>(Frame::data(bytes)),
                Err(e) => {
                    let frame = e.to_client_error().to_sse_frame();
                    yield Ok::<_, Infallible>(Frame::data(Bytes::from(frame)));
                    break;
                }
            }
        }
    };
    StreamBody::new(frames).boxed()
}

async fn set_status(
    req: Request<Incoming>,
    operator_ip: IpAddr,
    path: &str,
    state: &AppState,
    status: IpStatus,
) -> Response<GatewayBody> {
    if !authorize_operator(&req, state) {
        return json_error(StatusCode::FORBIDDEN, "operator token missing or invalid");
    }
    let Some(ip) = extract_path_ip(path) else {
        return json_error(StatusCode::BAD_REQUEST, "invalid IP in path");
    };

    let mut rate_limit_seconds = None;
    if status == IpStatus::RateLimited {
        if let Ok(collected) = req.into_body().collect().await {
            if let Ok(parsed) = serde_json::from_slice::<Value>(&collected.to_bytes()) {
                rate_limit_seconds = parsed.get("rate_limit_seconds").and_then(Value::as_u64);
            }
        }
    }

    match state
        .ip_manager
        .set_status(ip, status, rate_limit_seconds, Some(operator_ip))
        .await
    {
        Ok(()) => Response::builder()
            .status(StatusCode::OK)
            .header("content-type", "application/json")
            .body(health::boxed(r#"{"ok":true}"#))
            .expect("build set_status response"),
        Err(e) => user_facing_error(&e),
    }
}

fn ranking(req: &Request<Incoming>, state: &AppState) -> Response<GatewayBody> {
    if !authorize_operator(req, state) {
        return json_error(StatusCode::FORBIDDEN, "operator token missing or invalid");
    }
    let params = query_params(req);
    let rank_by_today = params.get("rank_by").map(String::as_str) != Some("total");
    let page: usize = params.get("page").and_then(|p| p.parse().ok()).unwrap_or(1);
    let page_size: usize = params.get("page_size").and_then(|p| p.parse().ok()).unwrap_or(20);
    let include_banned = params.get("include_banned").map(String::as_str) == Some("true");

    let page = state.ip_manager.ranking(rank_by_today, page, page_size, include_banned);
    let body = serde_json::to_string(&page).unwrap_or_else(|_| "{}".to_owned());
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(health::boxed(body))
        .expect("build ranking response")
}

fn summary(req: &Request<Incoming>, state: &AppState) -> Response<GatewayBody> {
    if !authorize_operator(req, state) {
        return json_error(StatusCode::FORBIDDEN, "operator token missing or invalid");
    }
    let summary = state.ip_manager.summary();
    let body = serde_json::to_string(&summary).unwrap_or_else(|_| "{}".to_owned());
    Response::builder()
        .status(StatusCode::OK)
        .header("content-type", "application/json")
        .body(health::boxed(body))
        .expect("build summary response")
}

fn authorize_operator(req: &Request<Incoming>, state: &AppState) -> bool {
    let Some(expected) = state.config.operator_token.as_deref() else {
        return false;
    };
    req.headers()
        .get(hyper::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .is_some_and(|token| token == expected)
}

fn extract_path_ip(path: &str) -> Option<IpAddr> {
    path.strip_prefix("/operator/ips/")?
        .split('/')
        .next()?
        .parse()
        .ok()
}

/// Prefers proxy-forwarded headers over the raw TCP peer, matching a
/// reverse-proxy deployment where `peer` is the load balancer itself.
fn resolve_client_ip(req: &Request<Incoming>, peer: IpAddr) -> IpAddr {
    for header in ["x-forwarded-for", "x-real-ip", "cf-connecting-ip"] {
        if let Some(value) = req.headers().get(header).and_then(|v| v.to_str().ok()) {
            if let Some(candidate) = value.split(',').next().map(str::trim) {
                if let Ok(ip) = candidate.parse() {
                    return ip;
                }
            }
        }
    }
    peer
}

fn query_params(req: &Request<Incoming>) -> std::collections::HashMap<String, String> {
    req.uri()
        .query()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

fn user_facing_error(error: &impl UserFacingError) -> Response<GatewayBody> {
    let client_error = error.to_client_error();
    json_body(client_error.code, &client_error)
}

fn json_error(status: StatusCode, message: &str) -> Response<GatewayBody> {
    let client_error = ClientError::new(message, status.as_u16());
    json_body(status.as_u16(), &client_error)
}

fn json_body(status: u16, client_error: &ClientError) -> Response<GatewayBody> {
    let body = client_error.to_envelope().to_string();
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header("content-type", "application/json")
        .body(health::boxed(body))
        .expect("build error response")
}
