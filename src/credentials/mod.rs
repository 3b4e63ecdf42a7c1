//! Credential pool (C3): ordered, disable-aware rotation over a set of
//! OAuth-style credentials, with per-credential call accounting and token
//! refresh.
//!
//! A single lock guards the mutable pool state (cursor, disable flags);
//! network I/O for token refresh always happens with that lock released.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::now_epoch;
use crate::kv_store::KvStore;
use crate::metrics::Metrics;

/// A single OAuth-style credential. The access token is never included in
/// `Debug` output; only the stable identifier and counters are.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credential {
    pub id: String,
    pub token: String,
    pub project: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub last_good_epoch: Option<f64>,
    #[serde(default)]
    pub success_count: u64,
    #[serde(default)]
    pub error_counts: HashMap<String, u64>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("id", &self.id)
            .field("project", &self.project)
            .field("disabled", &self.disabled)
            .field("success_count", &self.success_count)
            .field("error_counts", &self.error_counts)
            .finish_non_exhaustive()
    }
}

impl Default for Credential {
    fn default() -> Self {
        Self {
            id: String::new(),
            token: String::new(),
            project: String::new(),
            disabled: false,
            last_good_epoch: None,
            success_count: 0,
            error_counts: HashMap::new(),
        }
    }
}

/// A borrowed credential's public-facing fields, detached from the pool.
#[derive(Clone, Debug)]
pub struct CredentialHandle {
    pub id: String,
    pub token: String,
    pub project: String,
}

/// The external identity provider capable of minting a fresh access token
/// for a given credential. A thin seam so tests can substitute a fake.
#[async_trait::async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, credential_id: &str, project: &str) -> Option<String>;
}

struct PoolState {
    order: Vec<String>,
    cursor: usize,
}

pub struct CredentialPool {
    store: Arc<KvStore<Credential>>,
    state: Mutex<PoolState>,
    refresher: Arc<dyn TokenRefresher>,
    metrics: Arc<Metrics>,
}

impl CredentialPool {
    /// Builds the pool from whatever the KV store already holds.
    pub fn new(
        store: Arc<KvStore<Credential>>,
        refresher: Arc<dyn TokenRefresher>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let order: Vec<String> = store.snapshot().into_keys().collect();
        Self {
            store,
            state: Mutex::new(PoolState { order, cursor: 0 }),
            refresher,
            metrics,
        }
    }

    pub fn add(&self, credential: Credential) {
        let id = credential.id.clone();
        self.store.insert(id.clone(), credential);
        let mut state = self.state.lock();
        if !state.order.contains(&id) {
            state.order.push(id);
        }
    }

    /// Round-robin over the active subset, skipping disabled credentials.
    /// Returns `None` only when every credential is disabled (or the pool
    /// is empty).
    pub fn borrow(&self) -> Option<CredentialHandle> {
        let mut state = self.state.lock();
        let n = state.order.len();
        if n == 0 {
            return None;
        }
        for _ in 0..n {
            let idx = state.cursor;
            state.cursor = (state.cursor + 1) % n;
            let id = &state.order[idx];
            if let Some(cred) = self.store.get(id) {
                if !cred.disabled {
                    return Some(CredentialHandle {
                        id: cred.id,
                        token: cred.token,
                        project: cred.project,
                    });
                }
            }
        }
        None
    }

    /// Advances the shared cursor without counting a call. Used after a 429
    /// or an auto-ban disable so the *next* `borrow()` picks up a different
    /// credential.
    pub fn rotate(&self) {
        let mut state = self.state.lock();
        if !state.order.is_empty() {
            state.cursor = (state.cursor + 1) % state.order.len();
        }
    }

    /// Attempts to mint a fresh token for `id` via the external identity
    /// provider. The network call happens with the pool lock released.
    pub async fn refresh_current(&self, id: &str) -> bool {
        let project = match self.store.get(id) {
            Some(c) => c.project,
            None => return false,
        };
        match self.refresher.refresh(id, &project).await {
            Some(new_token) => {
                self.store.mutate(id, |c| {
                    c.token = new_token;
                    c.last_good_epoch = Some(now_epoch());
                });
                self.store.flush_if_dirty().await;
                info!(credential_id = id, "refreshed credential token");
                true
            }
            None => {
                warn!(credential_id = id, "credential token refresh failed");
                false
            }
        }
    }

    pub async fn disable(&self, id: &str) {
        self.store.mutate(id, |c| c.disabled = true);
        self.store.flush_if_dirty().await;
        warn!(credential_id = id, "disabled credential");
    }

    pub async fn enable(&self, id: &str) {
        self.store.mutate(id, |c| c.disabled = false);
        self.store.flush_if_dirty().await;
        info!(credential_id = id, "enabled credential");
    }

    /// Records a completed call's outcome. Must never be invoked by a
    /// rotation-only path (429 rotate, auto-ban disable) — those update no
    /// counters.
    pub fn record(&self, id: &str, ok: bool, status_code: Option<u16>) {
        self.store.mutate(id, |c| {
            if ok {
                c.success_count += 1;
                c.last_good_epoch = Some(now_epoch());
            } else if let Some(code) = status_code {
                *c.error_counts.entry(code.to_string()).or_insert(0) += 1;
            }
        });
        let outcome = if ok { "success" } else { "error" };
        self.metrics
            .credential_calls_total
            .with_label_values(&[id, outcome])
            .inc();
    }

    pub fn get(&self, id: &str) -> Option<Credential> {
        self.store.get(id)
    }

    pub fn snapshot(&self) -> Vec<Credential> {
        self.store.snapshot().into_values().collect()
    }

    pub fn active_count(&self) -> usize {
        self.store.snapshot().values().filter(|c| !c.disabled).count()
    }

    pub async fn flush(&self) {
        self.store.flush_if_dirty().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;

    struct AlwaysRefresh;
    #[async_trait::async_trait]
    impl TokenRefresher for AlwaysRefresh {
        async fn refresh(&self, _id: &str, _project: &str) -> Option<String> {
            Some("new-token".to_owned())
        }
    }

    struct NeverRefresh;
    #[async_trait::async_trait]
    impl TokenRefresher for NeverRefresh {
        async fn refresh(&self, _id: &str, _project: &str) -> Option<String> {
            None
        }
    }

    async fn pool_with(ids: &[&str], refresher: Arc<dyn TokenRefresher>) -> CredentialPool {
        let dir = tempdir().unwrap();
        let store: Arc<KvStore<Credential>> =
            Arc::new(KvStore::load(dir.path().join("creds.toml")).await);
        let pool = CredentialPool::new(store, refresher, Arc::new(Metrics::new()));
        for id in ids {
            pool.add(Credential {
                id: id.to_string(),
                token: format!("token-{id}"),
                project: "proj".to_owned(),
                ..Default::default()
            });
        }
        pool
    }

    #[tokio::test]
    async fn borrow_round_robins_over_active_credentials() {
        let pool = pool_with(&["a", "b"], Arc::new(AlwaysRefresh)).await;
        let first = pool.borrow().unwrap().id;
        let second = pool.borrow().unwrap().id;
        let third = pool.borrow().unwrap().id;
        assert_ne!(first, second);
        assert_eq!(first, third);
    }

    #[tokio::test]
    async fn disabled_credential_is_skipped() {
        let pool = pool_with(&["a", "b"], Arc::new(AlwaysRefresh)).await;
        pool.disable("a").await;
        let cred = pool.borrow().unwrap();
        assert_eq!(cred.id, "b");
        let cred = pool.borrow().unwrap();
        assert_eq!(cred.id, "b");
    }

    #[tokio::test]
    async fn borrow_is_none_when_all_disabled() {
        let pool = pool_with(&["a"], Arc::new(AlwaysRefresh)).await;
        pool.disable("a").await;
        assert!(pool.borrow().is_none());
    }

    #[tokio::test]
    async fn refresh_updates_token_on_success() {
        let pool = pool_with(&["a"], Arc::new(AlwaysRefresh)).await;
        assert!(pool.refresh_current("a").await);
        assert_eq!(pool.get("a").unwrap().token, "new-token");
    }

    #[tokio::test]
    async fn refresh_failure_leaves_credential_eligible_for_ban() {
        let pool = pool_with(&["a"], Arc::new(NeverRefresh)).await;
        assert!(!pool.refresh_current("a").await);
        assert!(!pool.get("a").unwrap().disabled);
    }

    #[tokio::test]
    async fn record_does_not_run_on_rotation_only_paths() {
        let pool = pool_with(&["a", "b"], Arc::new(AlwaysRefresh)).await;
        pool.rotate();
        let cred = pool.get("a").unwrap();
        assert_eq!(cred.success_count, 0);
        assert!(cred.error_counts.is_empty());
    }

    #[tokio::test]
    async fn record_increments_correct_counters() {
        let pool = pool_with(&["a"], Arc::new(AlwaysRefresh)).await;
        pool.record("a", true, None);
        pool.record("a", false, Some(429));
        pool.record("a", false, Some(429));
        let cred = pool.get("a").unwrap();
        assert_eq!(cred.success_count, 1);
        assert_eq!(cred.error_counts.get("429"), Some(&2));
    }
}
