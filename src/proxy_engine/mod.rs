//! Upstream proxy engine (C5): payload assembly, the retry/rotate/refresh/ban
//! state machine, and the unary and streaming call lifecycles built on top of
//! it.

pub mod payload;

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use futures::stream::{BoxStream, StreamExt};
use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::RuntimeConfig;
use crate::credentials::{CredentialHandle, CredentialPool};
use crate::error::{CouldRetry, UpstreamError};
use crate::metrics::Metrics;
use payload::AssembledRequest;

const USER_AGENT: &str = "aigateway/1.0";
const MAX_ERROR_SNIPPET: usize = 500;

/// Which bucket an upstream status falls into, independent of any I/O —
/// kept pure so the decision table is unit-testable on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusFamily {
    Success,
    RateLimited,
    ServerError,
    RefreshableAuth,
    AutoBan,
    Other,
}

pub fn classify_status(status: u16, config: &RuntimeConfig) -> StatusFamily {
    if (200..300).contains(&status) {
        StatusFamily::Success
    } else if status == 429 {
        StatusFamily::RateLimited
    } else if (500..600).contains(&status) {
        StatusFamily::ServerError
    } else if config.is_refreshable_auth_status(status) {
        StatusFamily::RefreshableAuth
    } else if config.is_auto_ban_status(status) {
        StatusFamily::AutoBan
    } else {
        StatusFamily::Other
    }
}

pub fn has_retry_budget(attempt: u32, max_retries: u32) -> bool {
    attempt < max_retries
}

pub fn backoff(base: Duration, attempt: u32) -> Duration {
    base.mul_f64(2f64.powi(attempt as i32))
}

pub struct ProxyEngine {
    pool: Arc<CredentialPool>,
    config: Arc<RuntimeConfig>,
    client: Client,
    metrics: Arc<Metrics>,
}

impl ProxyEngine {
    pub fn new(pool: Arc<CredentialPool>, config: Arc<RuntimeConfig>, metrics: Arc<Metrics>) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("build upstream http client");
        Self {
            pool,
            config,
            client,
            metrics,
        }
    }

    fn build_url(&self, action: &str, streaming: bool) -> String {
        let mut url = format!("{}/v1internal:{action}", self.config.base_endpoint);
        if streaming {
            url.push_str("?alt=sse");
        }
        url
    }

    pub async fn dispatch_unary(&self, model: &str, request: Value) -> Result<Value, UpstreamError> {
        let assembled = payload::assemble(model, request, &self.config);
        let url = self.build_url("generateContent", false);
        let (response, _cred) = self.execute(&url, &assembled, false).await?;
        let body_text = response.text().await.map_err(UpstreamError::Transport)?;
        let value: Value = serde_json::from_str(&body_text).map_err(|_| UpstreamError::MalformedBody)?;
        Ok(payload::unwrap_envelope(value))
    }

    pub async fn dispatch_stream(
        &self,
        model: &str,
        request: Value,
    ) -> Result<BoxStream<'static, Result<Bytes, UpstreamError>>, UpstreamError> {
        let assembled = payload::assemble(model, request, &self.config);
        let url = self.build_url("streamGenerateContent", true);
        let (response, cred) = self.execute(&url, &assembled, true).await?;
        Ok(stream_frames(response, cred.id, self.pool.clone()).boxed())
    }

    /// Drives one logical client call through as many upstream attempts as
    /// the retry policy allows, returning the first successful response's
    /// headers (body not yet consumed) together with the credential that
    /// served it.
    /// `streaming` controls who gets to call `pool.record(true, ..)` for a
    /// successful attempt: the unary caller records here, on the headers;
    /// the streaming caller defers to `stream_frames`'s first-data-frame
    /// check, since headers alone don't prove the upstream produced output.
    async fn execute(
        &self,
        url: &str,
        assembled: &AssembledRequest,
        streaming: bool,
    ) -> Result<(reqwest::Response, CredentialHandle), UpstreamError> {
        let max_retries = self.config.retry_429_max_retries;
        let mut last_status = None;
        let mut refreshed_this_attempt_chain = false;

        for attempt in 0..=max_retries {
            let Some(cred) = self.pool.borrow() else {
                return Err(UpstreamError::PoolExhausted { last_status });
            };

            let body = payload::envelope(assembled, &cred.project);
            let started = Instant::now();
            let sent = self
                .client
                .post(url)
                .bearer_auth(&cred.token)
                .header(reqwest::header::USER_AGENT, USER_AGENT)
                .json(&body)
                .send()
                .await;

            let response = match sent {
                Ok(r) => r,
                Err(e) => {
                    self.pool.record(&cred.id, false, None);
                    self.observe(started, "transport_error");
                    if e.could_retry() && has_retry_budget(attempt, max_retries) {
                        tokio::time::sleep(backoff(self.config.retry_429_interval, attempt)).await;
                        continue;
                    }
                    return Err(UpstreamError::Transport(e));
                }
            };

            let status = response.status().as_u16();
            last_status = Some(status);
            let family = classify_status(status, &self.config);

            if family == StatusFamily::Success {
                if !streaming {
                    self.pool.record(&cred.id, true, None);
                }
                self.observe(started, "success");
                return Ok((response, cred));
            }

            self.pool.record(&cred.id, false, Some(status));
            self.observe(started, "error");

            match family {
                StatusFamily::RateLimited => {
                    self.pool.rotate();
                    if self.config.retry_429_enabled && has_retry_budget(attempt, max_retries) {
                        tokio::time::sleep(backoff(self.config.retry_429_interval, attempt)).await;
                        continue;
                    }
                }
                StatusFamily::ServerError => {
                    if has_retry_budget(attempt, max_retries) {
                        tokio::time::sleep(backoff(self.config.retry_429_interval, attempt)).await;
                        continue;
                    }
                }
                StatusFamily::RefreshableAuth => {
                    if !refreshed_this_attempt_chain {
                        refreshed_this_attempt_chain = true;
                        if self.pool.refresh_current(&cred.id).await {
                            tokio::time::sleep(self.config.credential_refresh_delay).await;
                            continue;
                        }
                    }
                    warn!(credential_id = %cred.id, status, "disabling credential after failed refresh");
                    self.pool.disable(&cred.id).await;
                    self.pool.rotate();
                    refreshed_this_attempt_chain = false;
                    if has_retry_budget(attempt, max_retries) {
                        tokio::time::sleep(self.config.credential_refresh_delay).await;
                        continue;
                    }
                }
                StatusFamily::AutoBan => {
                    warn!(credential_id = %cred.id, status, "disabling credential, auto-ban status");
                    self.pool.disable(&cred.id).await;
                    self.pool.rotate();
                    if has_retry_budget(attempt, max_retries) {
                        tokio::time::sleep(self.config.credential_refresh_delay).await;
                        continue;
                    }
                }
                StatusFamily::Other | StatusFamily::Success => {}
            }

            let body_snippet = read_snippet(response).await;
            return Err(UpstreamError::Status { status, body_snippet });
        }

        Err(UpstreamError::PoolExhausted { last_status })
    }

    fn observe(&self, started: Instant, outcome: &str) {
        self.metrics
            .upstream_attempts
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());
    }
}

async fn read_snippet(response: reqwest::Response) -> String {
    match response.text().await {
        Ok(body) => body.chars().take(MAX_ERROR_SNIPPET).collect(),
        Err(_) => String::new(),
    }
}

/// Re-frames the upstream SSE body: each `data: {...}` frame is parsed,
/// unwrapped, and re-emitted; frames that fail to parse are dropped rather
/// than tearing down the whole stream.
fn stream_frames(
    response: reqwest::Response,
    credential_id: String,
    pool: Arc<CredentialPool>,
) -> impl futures::Stream<Item = Result<Bytes, UpstreamError>> + Send + 'static {
    async_stream::try_stream! {
        let _teardown = scopeguard::guard(credential_id.clone(), |id| {
            debug!(credential_id = %id, "stream context torn down");
        });
        let mut upstream = response.bytes_stream();
        let mut buffer = BytesMut::new();
        let mut recorded_success = false;

        while let Some(chunk) = upstream.next().await {
            let chunk = chunk.map_err(UpstreamError::Transport)?;
            buffer.extend_from_slice(&chunk);

            while let Some(frame) = split_frame(&mut buffer) {
                if let Some(reframed) = reframe_sse(&frame) {
                    if !recorded_success {
                        pool.record(&credential_id, true, None);
                        recorded_success = true;
                    }
                    yield Bytes::from(reframed);
                }
                tokio::task::yield_now().await;
            }
        }
    }
}

fn split_frame(buffer: &mut BytesMut) -> Option<Bytes> {
    let pos = buffer.windows(2).position(|w| w == b"\n\n")?;
    let frame = buffer.split_to(pos).freeze();
    buffer.advance(2);
    Some(frame)
}

fn reframe_sse(frame: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(frame).ok()?;
    let data: String = text
        .lines()
        .filter_map(|line| line.strip_prefix("data: ").or_else(|| line.strip_prefix("data:")))
        .collect::<Vec<_>>()
        .join("\n");
    if data.is_empty() {
        return None;
    }
    if data.trim() == "[DONE]" {
        return Some(format!("data: {data}\n\n"));
    }
    let value: Value = serde_json::from_str(&data).ok()?;
    let unwrapped = payload::unwrap_envelope(value);
    Some(format!("data: {unwrapped}\n\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn config(auto_ban_codes: &[u16], retry_429_enabled: bool, max_retries: u32) -> RuntimeConfig {
        RuntimeConfig {
            base_endpoint: "https://x".into(),
            operator_token: None,
            retry_429_enabled,
            retry_429_max_retries: max_retries,
            retry_429_interval: Duration::from_millis(10),
            auto_ban_enabled: true,
            auto_ban_error_codes: auto_ban_codes.iter().copied().collect::<HashSet<_>>(),
            public_api_models: Default::default(),
            default_safety_settings: vec![],
            credential_refresh_delay: Duration::from_millis(5),
            ban_duration: Duration::from_secs(86_400),
            ban_operation_window: Duration::from_secs(3600),
            ban_operation_max: 3,
            ban_min_today_requests: 80,
            ip_store_flush_period: Duration::from_secs(60),
            ip_sweep_period: Duration::from_secs(1800),
        }
    }

    #[test]
    fn classifies_success_and_rate_limit() {
        let cfg = config(&[400, 401, 403, 404], true, 3);
        assert_eq!(classify_status(200, &cfg), StatusFamily::Success);
        assert_eq!(classify_status(429, &cfg), StatusFamily::RateLimited);
        assert_eq!(classify_status(503, &cfg), StatusFamily::ServerError);
    }

    #[test]
    fn refreshable_auth_takes_priority_over_plain_auto_ban() {
        let cfg = config(&[400, 401, 403, 404], true, 3);
        assert_eq!(classify_status(401, &cfg), StatusFamily::RefreshableAuth);
        assert_eq!(classify_status(400, &cfg), StatusFamily::RefreshableAuth);
        assert_eq!(classify_status(404, &cfg), StatusFamily::RefreshableAuth);
        assert_eq!(classify_status(403, &cfg), StatusFamily::AutoBan);
    }

    #[test]
    fn auto_ban_disabled_leaves_those_codes_as_other() {
        let mut cfg = config(&[400, 401, 403, 404], true, 3);
        cfg.auto_ban_enabled = false;
        assert_eq!(classify_status(401, &cfg), StatusFamily::Other);
        assert_eq!(classify_status(403, &cfg), StatusFamily::Other);
    }

    #[test]
    fn codes_outside_the_configured_set_are_other() {
        let cfg = config(&[403], true, 3);
        assert_eq!(classify_status(404, &cfg), StatusFamily::Other);
    }

    #[test]
    fn retry_budget_is_exhausted_at_max_retries() {
        assert!(has_retry_budget(0, 3));
        assert!(has_retry_budget(2, 3));
        assert!(!has_retry_budget(3, 3));
    }

    #[test]
    fn backoff_doubles_each_attempt() {
        let base = Duration::from_millis(100);
        assert_eq!(backoff(base, 0), Duration::from_millis(100));
        assert_eq!(backoff(base, 1), Duration::from_millis(200));
        assert_eq!(backoff(base, 2), Duration::from_millis(400));
    }

    #[test]
    fn reframe_unwraps_response_envelope() {
        let frame = b"data: {\"response\":{\"text\":\"hi\"}}";
        let framed = reframe_sse(frame).unwrap();
        assert_eq!(framed, "data: {\"text\":\"hi\"}\n\n");
    }

    #[test]
    fn reframe_passes_done_marker_through() {
        let frame = b"data: [DONE]";
        assert_eq!(reframe_sse(frame).unwrap(), "data: [DONE]\n\n");
    }

    #[test]
    fn reframe_drops_unparseable_frames() {
        let frame = b"data: not json";
        assert!(reframe_sse(frame).is_none());
    }

    #[test]
    fn split_frame_consumes_up_to_and_including_the_blank_line() {
        let mut buffer = BytesMut::from(&b"data: a\n\ndata: b\n\n"[..]);
        let first = split_frame(&mut buffer).unwrap();
        assert_eq!(&first[..], b"data: a");
        let second = split_frame(&mut buffer).unwrap();
        assert_eq!(&second[..], b"data: b");
        assert!(split_frame(&mut buffer).is_none());
    }
}
