//! IP admission & accounting (C4): per-IP counters, ban/rate-limit status,
//! auto-unban, tiered pruning, and an operator-ban-throttle — all backed by
//! the generic [`crate::kv_store::KvStore`].
//!
//! Ban operations get their own store, keyed by operator IP, holding a list
//! of recent ban timestamps that is lazily compacted (expired entries
//! dropped) on every read rather than swept on a timer.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::clock::{is_local, now_epoch, now_human, today_date};
use crate::config::RuntimeConfig;
use crate::error::OperatorError;
use crate::kv_store::KvStore;
use crate::metrics::Metrics;

const MAX_USER_AGENTS: usize = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IpStatus {
    Active,
    Banned,
    RateLimited,
}

impl Default for IpStatus {
    fn default() -> Self {
        IpStatus::Active
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionOutcome {
    Allowed,
    Banned,
    RateLimited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpRecord {
    #[serde(default)]
    pub first_seen: String,
    #[serde(default)]
    pub last_seen: String,
    #[serde(default)]
    pub last_request_time: f64,
    #[serde(default)]
    pub total_requests: u64,
    #[serde(default)]
    pub today_requests: u64,
    #[serde(default)]
    pub today_date: String,
    #[serde(default)]
    pub status: IpStatus,
    #[serde(default)]
    pub rate_limit_seconds: Option<u64>,
    #[serde(default)]
    pub banned_time: Option<f64>,
    #[serde(default)]
    pub auto_unbanned_time: Option<String>,
    #[serde(default)]
    pub location: String,
    #[serde(default)]
    pub user_agents: VecDeque<String>,
    #[serde(default)]
    pub models_used: std::collections::HashMap<String, u64>,
    #[serde(default)]
    pub endpoints: std::collections::HashMap<String, u64>,
}

impl Default for IpRecord {
    fn default() -> Self {
        Self {
            first_seen: String::new(),
            last_seen: String::new(),
            last_request_time: 0.0,
            total_requests: 0,
            today_requests: 0,
            today_date: String::new(),
            status: IpStatus::Active,
            rate_limit_seconds: None,
            banned_time: None,
            auto_unbanned_time: None,
            location: String::new(),
            user_agents: VecDeque::new(),
            models_used: std::collections::HashMap::new(),
            endpoints: std::collections::HashMap::new(),
        }
    }
}

impl IpRecord {
    fn push_user_agent(&mut self, ua: &str) {
        if self.user_agents.iter().any(|existing| existing == ua) {
            return;
        }
        self.user_agents.push_back(ua.to_owned());
        while self.user_agents.len() > MAX_USER_AGENTS {
            self.user_agents.pop_front();
        }
    }

    fn roll_over_if_new_day(&mut self, today: &str) {
        if self.today_date != today {
            self.today_requests = 0;
            self.models_used.clear();
            self.today_date = today.to_owned();
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RankingItem {
    pub ip: String,
    pub today_requests: u64,
    pub total_requests: u64,
    pub status: IpStatus,
    pub location: String,
    pub first_seen: String,
    pub last_seen: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RankingPage {
    pub items: Vec<RankingItem>,
    pub page: usize,
    pub page_size: usize,
    pub total: usize,
    pub total_pages: usize,
    pub has_next: bool,
    pub has_prev: bool,
}

#[derive(Debug, Clone, Serialize, Default)]
pub struct IpSummary {
    pub total_ips: usize,
    pub active_ips: usize,
    pub banned_ips: usize,
    pub rate_limited_ips: usize,
    pub total_requests: u64,
    pub today_requests: u64,
}

pub struct IpManager {
    ip_store: Arc<KvStore<IpRecord>>,
    ban_store: Arc<KvStore<Vec<f64>>>,
    location: Arc<dyn crate::clock::LocationProviderResolve>,
    config: Arc<RuntimeConfig>,
    metrics: Arc<Metrics>,
}

impl IpManager {
    pub fn new(
        ip_store: Arc<KvStore<IpRecord>>,
        ban_store: Arc<KvStore<Vec<f64>>>,
        location: Arc<dyn crate::clock::LocationProviderResolve>,
        config: Arc<RuntimeConfig>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            ip_store,
            ban_store,
            location,
            config,
            metrics,
        }
    }

    /// Side-effect-free except for opportunistic auto-unban.
    pub async fn check(&self, ip: IpAddr) -> bool {
        matches!(self.admission_outcome(ip).await, AdmissionOutcome::Allowed)
    }

    /// Same gate as [`Self::check`], distinguishing *why* a request was
    /// refused so the HTTP layer can pick the right status code.
    pub async fn admission_outcome(&self, ip: IpAddr) -> AdmissionOutcome {
        let key = ip.to_string();
        let Some(mut record) = self.ip_store.get(&key) else {
            self.metrics.admission_total.with_label_values(&["allowed"]).inc();
            return AdmissionOutcome::Allowed;
        };
        let now = now_epoch();
        let outcome = if record.status == IpStatus::Banned {
            if self.maybe_auto_unban(&mut record, now) {
                self.ip_store.insert(key, record);
                AdmissionOutcome::Allowed
            } else {
                AdmissionOutcome::Banned
            }
        } else if record.status == IpStatus::RateLimited
            && now - record.last_request_time < record.rate_limit_seconds.unwrap_or(60) as f64
        {
            AdmissionOutcome::RateLimited
        } else {
            AdmissionOutcome::Allowed
        };

        let label = match outcome {
            AdmissionOutcome::Allowed => "allowed",
            AdmissionOutcome::Banned => "banned",
            AdmissionOutcome::RateLimited => "rate_limited",
        };
        self.metrics.admission_total.with_label_values(&[label]).inc();
        outcome
    }

    /// Returns `true` if, post-mutation, the record should be treated as
    /// active for this call (auto-unban fired). Mutates `record` in place.
    fn maybe_auto_unban(&self, record: &mut IpRecord, now: f64) -> bool {
        if record.status != IpStatus::Banned {
            return true;
        }
        let banned_time = record.banned_time.unwrap_or(0.0);
        if banned_time > 0.0 && now - banned_time >= self.config.ban_duration.as_secs_f64() {
            record.status = IpStatus::Active;
            record.auto_unbanned_time = Some(now_human());
            info!(banned_for_secs = now - banned_time, "auto-unbanned IP");
            true
        } else {
            false
        }
    }

    pub async fn record(
        &self,
        ip: IpAddr,
        endpoint: &str,
        user_agent: Option<&str>,
        model: Option<&str>,
    ) -> bool {
        let key = ip.to_string();
        if !self.check(ip).await {
            warn!(ip = %ip, "blocked request from banned/rate-limited IP");
            return false;
        }

        let today = today_date();
        let mut record = match self.ip_store.get(&key) {
            Some(r) => r,
            None => {
                let location = if is_local(ip) {
                    "local network".to_owned()
                } else {
                    self.location.resolve(ip).await
                };
                IpRecord {
                    first_seen: now_human(),
                    today_date: today.clone(),
                    status: IpStatus::Active,
                    location,
                    ..Default::default()
                }
            }
        };

        record.roll_over_if_new_day(&today);
        record.total_requests += 1;
        record.today_requests += 1;
        record.last_request_time = now_epoch();
        record.last_seen = now_human();
        if let Some(ua) = user_agent {
            record.push_user_agent(ua);
        }
        if let Some(model) = model {
            *record.models_used.entry(model.to_owned()).or_insert(0) += 1;
        }
        *record.endpoints.entry(endpoint.to_owned()).or_insert(0) += 1;

        self.ip_store.insert(key, record);
        true
    }

    pub async fn set_status(
        &self,
        ip: IpAddr,
        status: IpStatus,
        rate_limit_seconds: Option<u64>,
        operator_ip: Option<IpAddr>,
    ) -> Result<(), OperatorError> {
        let key = ip.to_string();

        if status == IpStatus::Banned {
            let today_requests = self.ip_store.get(&key).map(|r| r.today_requests).unwrap_or(0);
            if today_requests < self.config.ban_min_today_requests {
                return Err(OperatorError::InsufficientHistory {
                    ip: key,
                    today_requests,
                    minimum: self.config.ban_min_today_requests,
                });
            }
            if let Some(operator) = operator_ip {
                self.check_ban_throttle(operator).await?;
            }
        }

        let mut record = self.ip_store.get(&key).unwrap_or_else(|| IpRecord {
            first_seen: now_human(),
            today_date: today_date(),
            ..Default::default()
        });
        record.status = status;
        if status == IpStatus::Banned {
            record.banned_time = Some(now_epoch());
        }
        if status == IpStatus::RateLimited {
            record.rate_limit_seconds = rate_limit_seconds.or(Some(60));
        }
        self.ip_store.insert(key.clone(), record);

        if status == IpStatus::Banned {
            if let Some(operator) = operator_ip {
                self.record_ban_operation(operator).await;
            }
        }
        let event = match status {
            IpStatus::Banned => "ban",
            IpStatus::Active => "unban",
            IpStatus::RateLimited => "rate_limit",
        };
        self.metrics.ban_events_total.with_label_values(&[event]).inc();
        info!(ip = key, ?status, "set IP status");
        Ok(())
    }

    async fn check_ban_throttle(&self, operator: IpAddr) -> Result<(), OperatorError> {
        let key = operator.to_string();
        let timestamps = self.compact_ban_operations(&key).await;
        if timestamps.len() as u32 >= self.config.ban_operation_max {
            let oldest = timestamps[0];
            let remaining = self.config.ban_operation_window.as_secs_f64() - (now_epoch() - oldest);
            let remaining_minutes = (remaining / 60.0).ceil() as i64;
            return Err(OperatorError::Throttled { remaining_minutes });
        }
        Ok(())
    }

    async fn record_ban_operation(&self, operator: IpAddr) {
        let key = operator.to_string();
        let mut timestamps = self.compact_ban_operations(&key).await;
        timestamps.push(now_epoch());
        self.ban_store.insert(key, timestamps);
        self.ban_store.flush_if_dirty().await;
    }

    /// Drops timestamps older than the ban-operation window; idempotent.
    async fn compact_ban_operations(&self, operator_key: &str) -> Vec<f64> {
        let now = now_epoch();
        let window = self.config.ban_operation_window.as_secs_f64();
        let existing = self.ban_store.get(operator_key).unwrap_or_default();
        let compacted: Vec<f64> = existing.into_iter().filter(|ts| now - ts < window).collect();
        if compacted.is_empty() {
            self.ban_store.remove(operator_key);
        } else {
            self.ban_store.insert(operator_key.to_owned(), compacted.clone());
        }
        compacted
    }

    /// 30-minute sweep: lifts bans past their duration.
    pub async fn auto_unban_sweep(&self) -> usize {
        let now = now_epoch();
        let snapshot = self.ip_store.snapshot();
        let mut unbanned = 0;
        for (ip, mut record) in snapshot {
            if record.status == IpStatus::Banned {
                let banned_time = record.banned_time.unwrap_or(0.0);
                if banned_time > 0.0 && now - banned_time >= self.config.ban_duration.as_secs_f64() {
                    record.status = IpStatus::Active;
                    record.auto_unbanned_time = Some(now_human());
                    self.ip_store.insert(ip, record);
                    unbanned += 1;
                }
            }
        }
        if unbanned > 0 {
            self.metrics
                .ban_events_total
                .with_label_values(&["auto_unban"])
                .inc_by(unbanned as u64);
            info!(count = unbanned, "auto-unbanned expired bans");
        }
        unbanned
    }

    /// 30-minute sweep: deletes inactive, non-banned records per the tiered policy.
    pub async fn prune_sweep(&self) -> usize {
        let now = now_epoch();
        let removed = self.ip_store.retain(|_ip, record| {
            if record.status == IpStatus::Banned {
                return true;
            }
            if record.last_request_time == 0.0 {
                return true;
            }
            let inactive = now - record.last_request_time;
            let threshold_secs = if record.total_requests >= 300 {
                7 * 86_400
            } else if record.total_requests >= 50 {
                5 * 86_400
            } else {
                3 * 86_400
            };
            inactive < threshold_secs as f64
        });
        if removed > 0 {
            info!(count = removed, "pruned inactive IP records");
        }
        removed
    }

    pub fn summary(&self) -> IpSummary {
        let snapshot = self.ip_store.snapshot();
        let mut summary = IpSummary {
            total_ips: snapshot.len(),
            ..Default::default()
        };
        for record in snapshot.values() {
            match record.status {
                IpStatus::Active => summary.active_ips += 1,
                IpStatus::Banned => summary.banned_ips += 1,
                IpStatus::RateLimited => summary.rate_limited_ips += 1,
            }
            summary.total_requests += record.total_requests;
            summary.today_requests += record.today_requests;
        }
        summary
    }

    pub fn ranking(&self, rank_by_today: bool, page: usize, page_size: usize, include_banned: bool) -> RankingPage {
        let snapshot = self.ip_store.snapshot();
        let mut items: Vec<RankingItem> = snapshot
            .into_iter()
            .filter(|(_, r)| include_banned || r.status != IpStatus::Banned)
            .map(|(ip, r)| RankingItem {
                ip,
                today_requests: r.today_requests,
                total_requests: r.total_requests,
                status: r.status,
                location: r.location,
                first_seen: r.first_seen,
                last_seen: r.last_seen,
            })
            .collect();

        if rank_by_today {
            items.sort_by(|a, b| b.today_requests.cmp(&a.today_requests));
        } else {
            items.sort_by(|a, b| b.total_requests.cmp(&a.total_requests));
        }

        let total = items.len();
        let page_size = page_size.max(1);
        let total_pages = total.div_ceil(page_size).max(1);
        let page = page.clamp(1, total_pages);
        let start = (page - 1) * page_size;
        let end = (start + page_size).min(total);
        let page_items = if start < total { items[start..end].to_vec() } else { vec![] };

        RankingPage {
            items: page_items,
            page,
            page_size,
            total,
            total_pages,
            has_next: page < total_pages,
            has_prev: page > 1,
        }
    }

    pub async fn flush_all(&self) {
        self.ip_store.flush_if_dirty().await;
        self.ban_store.flush_if_dirty().await;
    }

    pub fn spawn_background_tasks(
        self: Arc<Self>,
        shutdown: tokio_util::sync::CancellationToken,
    ) -> Vec<tokio::task::JoinHandle<()>> {
        let flush_handle = self.ip_store.clone().spawn_periodic_flush(
            self.config.ip_store_flush_period,
            shutdown.clone(),
        );
        let sweep_self = self.clone();
        let sweep_shutdown = shutdown.clone();
        let sweep_period = self.config.ip_sweep_period;
        let sweep_handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(sweep_period) => {
                        sweep_self.auto_unban_sweep().await;
                        sweep_self.prune_sweep().await;
                    }
                    _ = sweep_shutdown.cancelled() => break,
                }
            }
        });
        vec![flush_handle, sweep_handle]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use camino_tempfile::tempdir;
    use clap::Parser as _;

    struct FakeLocation;
    #[async_trait::async_trait]
    impl crate::clock::LocationProviderResolve for FakeLocation {
        async fn resolve(&self, _ip: IpAddr) -> String {
            "nowhere".to_owned()
        }
    }

    async fn manager() -> IpManager {
        let dir = tempdir().unwrap();
        let ip_store = Arc::new(KvStore::load_nested(dir.path().join("ip_stats.toml"), "ips").await);
        let ban_store =
            Arc::new(KvStore::load_nested(dir.path().join("ban_operations.toml"), "operators").await);
        let config = Arc::new(RuntimeConfig::from_args(
            &crate::config::CliArgs::parse_from(["x"]),
            crate::config::FileConfig::default(),
        ));
        IpManager::new(ip_store, ban_store, Arc::new(FakeLocation), config, Arc::new(Metrics::new()))
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[tokio::test]
    async fn first_request_is_admitted_and_creates_a_record() {
        let mgr = manager().await;
        let allowed = mgr.record(ip("1.2.3.4"), "/v1/x", Some("curl"), Some("gemini")).await;
        assert!(allowed);
        let summary = mgr.summary();
        assert_eq!(summary.total_ips, 1);
        assert_eq!(summary.total_requests, 1);
    }

    #[tokio::test]
    async fn today_requests_never_exceeds_total_requests() {
        let mgr = manager().await;
        for _ in 0..5 {
            mgr.record(ip("1.2.3.4"), "/v1/x", None, None).await;
        }
        let record = mgr.ip_store.get("1.2.3.4").unwrap();
        assert!(record.today_requests <= record.total_requests);
        assert_eq!(record.today_requests, 5);
    }

    #[tokio::test]
    async fn ban_rejected_below_80_requests_today() {
        let mgr = manager().await;
        mgr.record(ip("1.2.3.4"), "/v1/x", None, None).await;
        let result = mgr.set_status(ip("1.2.3.4"), IpStatus::Banned, None, None).await;
        assert!(matches!(result, Err(OperatorError::InsufficientHistory { .. })));
    }

    #[tokio::test]
    async fn ban_at_exactly_80_requests_succeeds() {
        let mgr = manager().await;
        for _ in 0..80 {
            mgr.record(ip("1.2.3.4"), "/v1/x", None, None).await;
        }
        let result = mgr.set_status(ip("1.2.3.4"), IpStatus::Banned, None, None).await;
        assert!(result.is_ok());
        let record = mgr.ip_store.get("1.2.3.4").unwrap();
        assert!(record.banned_time.is_some());
    }

    #[tokio::test]
    async fn banned_ip_is_blocked_until_auto_unban_window() {
        let mgr = manager().await;
        for _ in 0..80 {
            mgr.record(ip("1.2.3.4"), "/v1/x", None, None).await;
        }
        mgr.set_status(ip("1.2.3.4"), IpStatus::Banned, None, None).await.unwrap();
        assert!(!mgr.check(ip("1.2.3.4")).await);

        let mut record = mgr.ip_store.get("1.2.3.4").unwrap();
        record.banned_time = Some(now_epoch() - 86_400.0 - 1.0);
        mgr.ip_store.insert("1.2.3.4".to_owned(), record);
        assert!(mgr.check(ip("1.2.3.4")).await);
    }

    #[tokio::test]
    async fn operator_ban_throttle_allows_three_then_blocks() {
        let mgr = manager().await;
        let operator = ip("9.9.9.9");
        for i in 0..3 {
            let target = format!("10.0.0.{i}").parse().unwrap();
            for _ in 0..80 {
                mgr.record(target, "/v1/x", None, None).await;
            }
            let result = mgr.set_status(target, IpStatus::Banned, None, Some(operator)).await;
            assert!(result.is_ok(), "ban {i} should succeed");
        }
        let target: IpAddr = "10.0.0.99".parse().unwrap();
        for _ in 0..80 {
            mgr.record(target, "/v1/x", None, None).await;
        }
        let result = mgr.set_status(target, IpStatus::Banned, None, Some(operator)).await;
        assert!(matches!(result, Err(OperatorError::Throttled { .. })));
    }

    #[tokio::test]
    async fn pruning_respects_tiered_thresholds() {
        let mgr = manager().await;
        let high = ip("1.1.1.1");
        let low = ip("2.2.2.2");
        mgr.ip_store.insert(
            high.to_string(),
            IpRecord {
                total_requests: 300,
                last_request_time: now_epoch() - 6.0 * 86_400.0,
                ..Default::default()
            },
        );
        mgr.ip_store.insert(
            low.to_string(),
            IpRecord {
                total_requests: 10,
                last_request_time: now_epoch() - 4.0 * 86_400.0,
                ..Default::default()
            },
        );
        mgr.prune_sweep().await;
        assert!(mgr.ip_store.contains(&high.to_string()));
        assert!(!mgr.ip_store.contains(&low.to_string()));
    }

    #[tokio::test]
    async fn banned_records_are_never_pruned() {
        let mgr = manager().await;
        let banned = ip("3.3.3.3");
        mgr.ip_store.insert(
            banned.to_string(),
            IpRecord {
                total_requests: 1,
                status: IpStatus::Banned,
                banned_time: Some(now_epoch()),
                last_request_time: now_epoch() - 30.0 * 86_400.0,
                ..Default::default()
            },
        );
        mgr.prune_sweep().await;
        assert!(mgr.ip_store.contains(&banned.to_string()));
    }

    #[tokio::test]
    async fn ban_operation_compaction_is_idempotent() {
        let mgr = manager().await;
        let operator = "5.5.5.5";
        mgr.ban_store.insert(operator.to_owned(), vec![now_epoch()]);
        let once = mgr.compact_ban_operations(operator).await;
        let twice = mgr.compact_ban_operations(operator).await;
        assert_eq!(once, twice);
    }
}
