//! Wall clock and IP-location resolution (C1).
//!
//! Epoch seconds are the only thing ever compared; a fixed +08:00 offset is
//! used solely to render human-readable timestamps, so displayed times are
//! stable regardless of the host's local zone.

use std::net::IpAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use chrono::{FixedOffset, TimeZone, Utc};
use reqwest::Client;
use tracing::debug;

const CANONICAL_OFFSET_SECS: i32 = 8 * 3600;
const LOCATION_PROVIDER_TIMEOUT: Duration = Duration::from_secs(5);

pub fn canonical_offset() -> FixedOffset {
    FixedOffset::east_opt(CANONICAL_OFFSET_SECS).expect("valid fixed offset")
}

/// Seconds since the epoch, for all internal comparisons.
pub fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}

/// `YYYY-MM-DD HH:MM:SS` in the canonical +08:00 zone, for display fields only.
pub fn now_human() -> String {
    canonical_offset()
        .from_utc_datetime(&Utc::now().naive_utc())
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

/// `YYYY-MM-DD` in the canonical zone; the day roll-over boundary for daily counters.
pub fn today_date() -> String {
    canonical_offset()
        .from_utc_datetime(&Utc::now().naive_utc())
        .format("%Y-%m-%d")
        .to_string()
}

/// Object-safe seam so the IP subsystem can take a fake resolver in tests
/// instead of making real outbound calls.
#[async_trait::async_trait]
pub trait LocationProviderResolve: Send + Sync {
    async fn resolve(&self, ip: IpAddr) -> String;
}

/// Resolves a source IP to a human-readable location string. Tries each
/// configured provider in order and never fails the caller: an exhausted
/// provider list resolves to `"unknown"`.
pub struct LocationResolver {
    client: Client,
    providers: Vec<Box<dyn LocationProvider>>,
}

#[async_trait::async_trait]
impl LocationProviderResolve for LocationResolver {
    async fn resolve(&self, ip: IpAddr) -> String {
        self.resolve(ip).await
    }
}

#[async_trait::async_trait]
pub trait LocationProvider: Send + Sync {
    async fn resolve(&self, client: &Client, ip: IpAddr) -> Option<String>;
}

impl LocationResolver {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(LOCATION_PROVIDER_TIMEOUT)
            .build()
            .expect("location resolver http client");
        Self {
            client,
            providers: vec![
                Box::new(IpApiComProvider),
                Box::new(IpWhoIsProvider),
                Box::new(PconlineProvider),
            ],
        }
    }

    pub async fn resolve(&self, ip: IpAddr) -> String {
        if is_local(ip) {
            return "local network".to_owned();
        }
        for provider in &self.providers {
            if let Some(location) = provider.resolve(&self.client, ip).await {
                return location;
            }
        }
        "unknown".to_owned()
    }
}

impl Default for LocationResolver {
    fn default() -> Self {
        Self::new()
    }
}

/// RFC1918 + loopback short-circuit, checked before any network call.
pub fn is_local(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => v4.is_loopback() || v4.is_private(),
        IpAddr::V6(v6) => v6.is_loopback(),
    }
}

struct IpApiComProvider;

#[async_trait::async_trait]
impl LocationProvider for IpApiComProvider {
    async fn resolve(&self, client: &Client, ip: IpAddr) -> Option<String> {
        #[derive(serde::Deserialize)]
        struct Resp {
            status: String,
            country: Option<String>,
            #[serde(rename = "regionName")]
            region_name: Option<String>,
            city: Option<String>,
            isp: Option<String>,
        }
        let url = format!("http://ip-api.com/json/{ip}?fields=status,country,regionName,city,isp");
        let resp = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "ip-api.com query failed");
                return None;
            }
        };
        let body: Resp = resp.json().await.ok()?;
        if body.status != "success" {
            return None;
        }
        Some(join_location(body.country, body.region_name, body.city, body.isp))
    }
}

struct IpWhoIsProvider;

#[async_trait::async_trait]
impl LocationProvider for IpWhoIsProvider {
    async fn resolve(&self, client: &Client, ip: IpAddr) -> Option<String> {
        #[derive(serde::Deserialize)]
        struct Connection {
            isp: Option<String>,
        }
        #[derive(serde::Deserialize)]
        struct Resp {
            success: bool,
            country: Option<String>,
            region: Option<String>,
            city: Option<String>,
            connection: Option<Connection>,
        }
        let url = format!("https://ipwho.is/{ip}");
        let resp = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "ipwho.is query failed");
                return None;
            }
        };
        let body: Resp = resp.json().await.ok()?;
        if !body.success {
            return None;
        }
        let isp = body.connection.and_then(|c| c.isp);
        Some(join_location(body.country, body.region, body.city, isp))
    }
}

/// Domestic fallback provider; effective mainly for IPs the global providers
/// refuse or throttle.
struct PconlineProvider;

#[async_trait::async_trait]
impl LocationProvider for PconlineProvider {
    async fn resolve(&self, client: &Client, ip: IpAddr) -> Option<String> {
        #[derive(serde::Deserialize)]
        struct Resp {
            pro: Option<String>,
            city: Option<String>,
            addr: Option<String>,
        }
        let url = format!("http://whois.pconline.com.cn/ipJson.jsp?ip={ip}&json=true");
        let resp = match client.get(&url).send().await {
            Ok(r) => r,
            Err(e) => {
                debug!(error = %e, "pconline query failed");
                return None;
            }
        };
        let body: Resp = resp.json().await.ok()?;
        let parts: Vec<String> = [body.pro, body.city, body.addr]
            .into_iter()
            .flatten()
            .filter(|p| p != "XX")
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join(" "))
        }
    }
}

fn join_location(
    country: Option<String>,
    region: Option<String>,
    city: Option<String>,
    isp: Option<String>,
) -> String {
    let mut parts: Vec<String> = [country, region, city].into_iter().flatten().collect();
    let joined = if parts.is_empty() {
        "unknown".to_owned()
    } else {
        parts.drain(..).collect::<Vec<_>>().join(" ")
    };
    match isp {
        Some(isp) if !isp.is_empty() => format!("{joined} ({isp})"),
        _ => joined,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loopback_and_private_are_local() {
        assert!(is_local("127.0.0.1".parse().unwrap()));
        assert!(is_local("192.168.1.5".parse().unwrap()));
        assert!(is_local("10.0.0.1".parse().unwrap()));
        assert!(is_local("::1".parse().unwrap()));
        assert!(!is_local("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn today_date_is_well_formed() {
        let d = today_date();
        assert_eq!(d.len(), 10);
        assert_eq!(d.as_bytes()[4], b'-');
    }
}
