//! CLI entry point: wires config, credential store, IP admission, and the
//! proxy engine together, then serves the public and metrics listeners until
//! a signal asks for graceful shutdown.

use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use aigateway::config::{self, CliArgs, RuntimeConfig};
use aigateway::credentials::TokenRefresher;
use aigateway::{http, logging, AppState};

#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

/// Mints a fresh access token by POSTing the credential's id and project to
/// an operator-supplied refresh endpoint; the token itself is handled as an
/// opaque string throughout, never inspected or generated here. With no
/// endpoint configured, every refresh attempt fails closed, which just means
/// the credential gets disabled on the next auth error instead of retried.
struct HttpTokenRefresher {
    client: reqwest::Client,
    endpoint: Option<String>,
}

#[derive(serde::Deserialize)]
struct RefreshResponse {
    access_token: String,
}

#[async_trait::async_trait]
impl TokenRefresher for HttpTokenRefresher {
    async fn refresh(&self, credential_id: &str, project: &str) -> Option<String> {
        let endpoint = self.endpoint.as_ref()?;
        let response = self
            .client
            .post(endpoint)
            .json(&serde_json::json!({
                "credential_id": credential_id,
                "project": project,
            }))
            .send()
            .await
            .inspect_err(|e| error!(credential_id, error = %e, "refresh endpoint unreachable"))
            .ok()?;

        if !response.status().is_success() {
            error!(credential_id, status = %response.status(), "refresh endpoint rejected request");
            return None;
        }
        response
            .json::<RefreshResponse>()
            .await
            .inspect_err(|e| error!(credential_id, error = %e, "refresh endpoint returned malformed body"))
            .ok()
            .map(|body| body.access_token)
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    logging::init();

    let args = CliArgs::parse();
    let file_config = config::load_file_config(args.config_path.as_deref()).await;
    let runtime_config = Arc::new(RuntimeConfig::from_args(&args, file_config));

    let refresher: Arc<dyn TokenRefresher> = Arc::new(HttpTokenRefresher {
        client: reqwest::Client::new(),
        endpoint: std::env::var("GATEWAY_REFRESH_ENDPOINT").ok(),
    });

    let state = Arc::new(AppState::build(&args.credentials_dir, runtime_config, refresher).await);

    let listen_addr = args.listen_addr;
    let metrics_addr = args.metrics_addr;

    let shutdown = CancellationToken::new();
    let mut background_tasks = state.spawn_background_tasks(shutdown.clone());

    let public_listener = {
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(listen_addr, state, shutdown).await {
                error!(error = %e, "public HTTP listener exited with an error");
            }
        })
    };
    let metrics_listener = {
        let state = state.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = http::serve(metrics_addr, state, shutdown).await {
                error!(error = %e, "metrics HTTP listener exited with an error");
            }
        })
    };

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining connections");
    shutdown.cancel();

    let _ = public_listener.await;
    let _ = metrics_listener.await;
    for task in background_tasks.drain(..) {
        let _ = task.await;
    }

    state.flush_all().await;
    info!("gateway stopped");
    Ok(())
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm =
            signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
        tokio::select! {
            _ = ctrl_c => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = ctrl_c.await;
    }
}
