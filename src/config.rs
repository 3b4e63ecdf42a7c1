//! CLI arguments, on-disk config, and the runtime-mutable policy knobs the
//! upstream state machine and admission subsystem consult on every request.
//!
//! A `clap::Parser` struct covers process wiring (addresses, paths, retry
//! policy); a small reloadable TOML file covers the handful of settings an
//! operator wants to change without a restart.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use camino::Utf8PathBuf;
use clap::Parser;
use serde::{Deserialize, Serialize};

#[derive(Parser, Debug)]
#[command(version, about = "AI upstream proxy gateway")]
pub struct CliArgs {
    /// Address to listen on for client traffic.
    #[clap(long, env = "GATEWAY_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: SocketAddr,

    /// Address to listen on for the Prometheus metrics / healthz endpoint.
    #[clap(long, env = "GATEWAY_METRICS_ADDR", default_value = "127.0.0.1:9090")]
    pub metrics_addr: SocketAddr,

    /// Directory holding the credential store and the IP/ban persistence files.
    #[clap(long, env = "GATEWAY_CREDENTIALS_DIR", default_value = "./credentials")]
    pub credentials_dir: Utf8PathBuf,

    /// Optional TOML config file reloaded on SIGHUP.
    #[clap(long, env = "GATEWAY_CONFIG_PATH")]
    pub config_path: Option<Utf8PathBuf>,

    /// Upstream vendor root endpoint.
    #[clap(long, env = "GATEWAY_BASE_ENDPOINT", default_value = "https://generativelanguage.googleapis.com")]
    pub base_endpoint: String,

    /// Bearer token operator routes (ban/unban/rate-limit/ranking) require.
    /// Those routes refuse every request when this is unset.
    #[clap(long, env = "GATEWAY_OPERATOR_TOKEN")]
    pub operator_token: Option<String>,

    #[clap(flatten)]
    pub retry: RetryArgs,

    #[clap(flatten)]
    pub ban: BanArgs,
}

#[derive(clap::Args, Debug, Clone)]
pub struct RetryArgs {
    /// Whether 429 responses are retried with exponential backoff.
    #[clap(long, env = "GATEWAY_RETRY_429_ENABLED", default_value_t = true, value_parser = clap::builder::BoolishValueParser::new(), action = clap::ArgAction::Set)]
    pub retry_429_enabled: bool,

    /// Maximum retry attempts after the first, shared by the 429 and 5xx paths.
    #[clap(long, env = "GATEWAY_RETRY_429_MAX_RETRIES", default_value_t = 3)]
    pub retry_429_max_retries: u32,

    /// Base backoff interval; actual wait is `interval * 2^attempt`.
    #[clap(long, env = "GATEWAY_RETRY_429_INTERVAL", default_value = "1s", value_parser = humantime::parse_duration)]
    pub retry_429_interval: Duration,
}

#[derive(clap::Args, Debug, Clone)]
pub struct BanArgs {
    /// Whether credentials are auto-disabled on the configured error codes.
    #[clap(long, env = "GATEWAY_AUTO_BAN_ENABLED", default_value_t = true, value_parser = clap::builder::BoolishValueParser::new(), action = clap::ArgAction::Set)]
    pub auto_ban_enabled: bool,

    /// Comma-separated HTTP status codes that trigger an automatic credential disable.
    #[clap(long, env = "GATEWAY_AUTO_BAN_ERROR_CODES", value_delimiter = ',', default_values_t = [400u16, 401, 403, 404])]
    pub auto_ban_error_codes: Vec<u16>,
}

/// Everything the upstream engine and IP subsystem read per-request. Built
/// once from `CliArgs` plus the optional config file, then shared via `Arc`.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub base_endpoint: String,
    pub operator_token: Option<String>,
    pub retry_429_enabled: bool,
    pub retry_429_max_retries: u32,
    pub retry_429_interval: Duration,
    pub auto_ban_enabled: bool,
    pub auto_ban_error_codes: HashSet<u16>,
    pub public_api_models: HashSet<String>,
    pub default_safety_settings: Vec<SafetySetting>,
    pub credential_refresh_delay: Duration,
    pub ban_duration: Duration,
    pub ban_operation_window: Duration,
    pub ban_operation_max: u32,
    pub ban_min_today_requests: u64,
    pub ip_store_flush_period: Duration,
    pub ip_sweep_period: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SafetySetting {
    pub category: String,
    pub threshold: String,
}

/// On-disk config document, merged on top of CLI defaults. Every field is
/// optional so an operator can override just the bits they care about.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct FileConfig {
    pub public_api_models: Option<Vec<String>>,
    pub default_safety_settings: Option<Vec<SafetySetting>>,
}

impl RuntimeConfig {
    pub fn from_args(args: &CliArgs, file: FileConfig) -> Self {
        Self {
            base_endpoint: args.base_endpoint.trim_end_matches('/').to_owned(),
            operator_token: args.operator_token.clone(),
            retry_429_enabled: args.retry.retry_429_enabled,
            retry_429_max_retries: args.retry.retry_429_max_retries,
            retry_429_interval: args.retry.retry_429_interval,
            auto_ban_enabled: args.ban.auto_ban_enabled,
            auto_ban_error_codes: args.ban.auto_ban_error_codes.iter().copied().collect(),
            public_api_models: file
                .public_api_models
                .unwrap_or_default()
                .into_iter()
                .collect(),
            default_safety_settings: file.default_safety_settings.unwrap_or_default(),
            credential_refresh_delay: Duration::from_millis(500),
            ban_duration: Duration::from_secs(86_400),
            ban_operation_window: Duration::from_secs(3600),
            ban_operation_max: 3,
            ban_min_today_requests: 80,
            ip_store_flush_period: Duration::from_secs(60),
            ip_sweep_period: Duration::from_secs(1800),
        }
    }

    /// Auto-ban applies to 401/400/404 *and* the configured set, but only
    /// 401/400/404 attempt a token refresh before disabling; see
    /// [`crate::proxy_engine`].
    pub fn is_auto_ban_status(&self, status: u16) -> bool {
        self.auto_ban_enabled
            && (self.auto_ban_error_codes.contains(&status) || status == 403)
    }

    pub fn is_refreshable_auth_status(&self, status: u16) -> bool {
        self.is_auto_ban_status(status) && matches!(status, 400 | 401 | 404)
    }

    pub fn uses_public_shape(&self, model: &str) -> bool {
        self.public_api_models.contains(model)
    }
}

pub async fn load_file_config(path: Option<&camino::Utf8Path>) -> FileConfig {
    let Some(path) = path else {
        return FileConfig::default();
    };
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
            tracing::error!(path = %path, error = %e, "failed to parse config file, using defaults");
            FileConfig::default()
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
        Err(e) => {
            tracing::error!(path = %path, error = %e, "failed to read config file, using defaults");
            FileConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_ban_always_includes_403() {
        let cfg = RuntimeConfig {
            base_endpoint: "https://x".into(),
            operator_token: None,
            retry_429_enabled: true,
            retry_429_max_retries: 3,
            retry_429_interval: Duration::from_secs(1),
            auto_ban_enabled: true,
            auto_ban_error_codes: HashSet::new(),
            public_api_models: HashSet::new(),
            default_safety_settings: vec![],
            credential_refresh_delay: Duration::from_millis(500),
            ban_duration: Duration::from_secs(86_400),
            ban_operation_window: Duration::from_secs(3600),
            ban_operation_max: 3,
            ban_min_today_requests: 80,
            ip_store_flush_period: Duration::from_secs(60),
            ip_sweep_period: Duration::from_secs(1800),
        };
        assert!(cfg.is_auto_ban_status(403));
        assert!(!cfg.is_auto_ban_status(500));
    }
}
