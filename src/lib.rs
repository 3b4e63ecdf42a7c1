//! AI upstream gateway: credential rotation, IP admission/accounting, and a
//! retry/rotate/refresh/ban state machine in front of a generative-model
//! upstream.

pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod http;
pub mod ip_admission;
pub mod kv_store;
pub mod logging;
pub mod metrics;
pub mod proxy_engine;

use std::sync::Arc;

use camino::Utf8PathBuf;

use clock::LocationResolver;
use config::RuntimeConfig;
use credentials::{Credential, CredentialPool, TokenRefresher};
use ip_admission::{IpManager, IpRecord};
use kv_store::KvStore;
use metrics::Metrics;
use proxy_engine::ProxyEngine;

/// Everything `main` needs to hand to the HTTP layer, built once at startup.
pub struct AppState {
    pub config: Arc<RuntimeConfig>,
    pub metrics: Arc<Metrics>,
    pub credentials: Arc<CredentialPool>,
    pub ip_manager: Arc<IpManager>,
    pub engine: Arc<ProxyEngine>,
}

impl AppState {
    pub async fn build(
        credentials_dir: &Utf8PathBuf,
        config: Arc<RuntimeConfig>,
        refresher: Arc<dyn TokenRefresher>,
    ) -> Self {
        let metrics = Arc::new(Metrics::new());

        let credential_store: Arc<KvStore<Credential>> =
            Arc::new(KvStore::load(credentials_dir.join("credentials.toml")).await);
        let credentials = Arc::new(CredentialPool::new(credential_store, refresher, metrics.clone()));

        let ip_store: Arc<KvStore<IpRecord>> = Arc::new(
            KvStore::load_nested(credentials_dir.join("ip_stats.toml"), "ips").await,
        );
        let ban_store: Arc<KvStore<Vec<f64>>> = Arc::new(
            KvStore::load_nested(credentials_dir.join("ban_operations.toml"), "operators").await,
        );
        let location = Arc::new(LocationResolver::new());
        let ip_manager = Arc::new(IpManager::new(
            ip_store,
            ban_store,
            location,
            config.clone(),
            metrics.clone(),
        ));

        let engine = Arc::new(ProxyEngine::new(credentials.clone(), config.clone(), metrics.clone()));

        Self {
            config,
            metrics,
            credentials,
            ip_manager,
            engine,
        }
    }

    /// Spawns every background task (KV flush, IP sweep) tied to `shutdown`.
    pub fn spawn_background_tasks(
        &self,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        self.ip_manager.clone().spawn_background_tasks(shutdown)
    }

    /// Flushes every persistent store once; called on graceful shutdown.
    pub async fn flush_all(&self) {
        self.credentials.flush().await;
        self.ip_manager.flush_all().await;
    }
}
