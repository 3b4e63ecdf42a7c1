//! Error taxonomy shared by every component.
//!
//! Three traits, each serving one consumer: `ReportableError` classifies an
//! error for metrics and logging, `UserFacingError` renders the envelope
//! handed back to clients, and `CouldRetry` is consulted directly by the
//! upstream state machine.

use thiserror::Error;

/// Coarse classification used to label metrics and decide log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller did something wrong (bad request shape, unknown model, ...).
    User,
    /// Refused by our own admission control (banned / rate-limited IP).
    RateLimit,
    /// Upstream told us to slow down (429).
    ServiceRateLimit,
    /// Upstream quota exhausted in a way retrying won't fix.
    Quota,
    /// Upstream is misbehaving (5xx, malformed body, transport failure).
    Upstream,
    /// Every credential in the pool is disabled.
    PoolExhausted,
}

/// The JSON envelope returned to clients, matching the upstream vendor's
/// own error shape so passthrough clients don't need to special-case us.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClientError {
    pub message: String,
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub code: u16,
}

impl ClientError {
    pub fn new(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            kind: "api_error",
            code,
        }
    }

    pub fn to_envelope(&self) -> serde_json::Value {
        serde_json::json!({ "error": self })
    }

    /// Render as a single SSE `data:` frame carrying this error as the only event.
    pub fn to_sse_frame(&self) -> String {
        format!("data: {}\n\n", self.to_envelope())
    }
}

/// Implemented by every error type that can be reported to a client.
pub trait UserFacingError: std::fmt::Display {
    /// A message safe to show a client: never leaks credential tokens,
    /// internal paths, or upstream stack traces.
    fn to_string_client(&self) -> String;
    fn status_code(&self) -> u16;

    fn to_client_error(&self) -> ClientError {
        ClientError::new(self.to_string_client(), self.status_code())
    }
}

/// Implemented by every error type that feeds into metrics/logging.
pub trait ReportableError: std::fmt::Debug {
    fn kind(&self) -> ErrorKind;
}

/// Consulted by the retry/rotate/refresh/ban state machine.
pub trait CouldRetry {
    fn could_retry(&self) -> bool;
}

impl CouldRetry for reqwest::Error {
    fn could_retry(&self) -> bool {
        self.is_timeout() || self.is_connect() || self.is_request()
    }
}

impl CouldRetry for std::io::Error {
    fn could_retry(&self) -> bool {
        matches!(
            self.kind(),
            std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::UnexpectedEof
        )
    }
}

/// Errors raised while admitting or recording a request against the IP subsystem.
#[derive(Debug, Error)]
pub enum AdmissionError {
    #[error("source IP is banned")]
    Banned,
    #[error("source IP is rate limited, retry later")]
    RateLimited,
}

impl UserFacingError for AdmissionError {
    fn to_string_client(&self) -> String {
        self.to_string()
    }
    fn status_code(&self) -> u16 {
        match self {
            AdmissionError::Banned => 403,
            AdmissionError::RateLimited => 429,
        }
    }
}

impl ReportableError for AdmissionError {
    fn kind(&self) -> ErrorKind {
        ErrorKind::RateLimit
    }
}

/// Errors raised by an operator ban/unban/rate-limit action.
#[derive(Debug, Error)]
pub enum OperatorError {
    #[error("refusing to ban {ip}: only {today_requests} requests today (minimum {minimum})")]
    InsufficientHistory {
        ip: String,
        today_requests: u64,
        minimum: u64,
    },
    #[error("ban operations throttled, retry in {remaining_minutes} minute(s)")]
    Throttled { remaining_minutes: i64 },
    #[error("invalid IP status requested")]
    InvalidStatus,
}

impl UserFacingError for OperatorError {
    fn to_string_client(&self) -> String {
        self.to_string()
    }
    fn status_code(&self) -> u16 {
        match self {
            OperatorError::InsufficientHistory { .. } => 400,
            OperatorError::Throttled { .. } => 429,
            OperatorError::InvalidStatus => 400,
        }
    }
}

impl ReportableError for OperatorError {
    fn kind(&self) -> ErrorKind {
        match self {
            OperatorError::Throttled { .. } => ErrorKind::RateLimit,
            _ => ErrorKind::User,
        }
    }
}

/// Final, client-visible outcome of driving an upstream request through the
/// retry/rotate/refresh/ban state machine.
#[derive(Debug, Error)]
pub enum UpstreamError {
    #[error("upstream returned {status}")]
    Status { status: u16, body_snippet: String },
    #[error("no active credential available")]
    PoolExhausted { last_status: Option<u16> },
    #[error("upstream request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("upstream response body was not valid JSON")]
    MalformedBody,
}

impl UserFacingError for UpstreamError {
    fn to_string_client(&self) -> String {
        match self {
            UpstreamError::Status { .. } => "Console request failed".to_owned(),
            UpstreamError::PoolExhausted { .. } => {
                "no credential available to service this request".to_owned()
            }
            UpstreamError::Transport(_) => "upstream request failed".to_owned(),
            UpstreamError::MalformedBody => "upstream returned a malformed response".to_owned(),
        }
    }

    fn status_code(&self) -> u16 {
        match self {
            UpstreamError::Status { status, .. } => *status,
            UpstreamError::PoolExhausted { last_status } => last_status.unwrap_or(503),
            UpstreamError::Transport(_) => 502,
            UpstreamError::MalformedBody => 502,
        }
    }
}

impl ReportableError for UpstreamError {
    fn kind(&self) -> ErrorKind {
        match self {
            UpstreamError::Status { status, .. } if *status == 429 => ErrorKind::ServiceRateLimit,
            UpstreamError::Status { status, .. } if (500..600).contains(status) => {
                ErrorKind::Upstream
            }
            UpstreamError::Status { .. } => ErrorKind::User,
            UpstreamError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
            UpstreamError::Transport(_) => ErrorKind::Upstream,
            UpstreamError::MalformedBody => ErrorKind::Upstream,
        }
    }
}

impl CouldRetry for UpstreamError {
    fn could_retry(&self) -> bool {
        match self {
            UpstreamError::Transport(e) => e.could_retry(),
            _ => false,
        }
    }
}
