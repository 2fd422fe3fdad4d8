//! Individual health probes: service endpoint, host resources.
//!
//! Probes never propagate errors. A signal that cannot be obtained is
//! encoded as an explicit failure value (`reachable = false`, `None`), and
//! the decision layer treats absence accordingly.

use std::path::Path;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Deserialize;

/// Result of one service health probe.
#[derive(Debug, Clone, Default)]
pub struct ServiceProbeResult {
    /// Endpoint answered with a success status inside the timeout.
    pub reachable: bool,
    /// Round-trip latency, when the probe completed.
    pub latency: Option<Duration>,
    /// Last browser heartbeat timestamp reported by the endpoint.
    pub last_heartbeat: Option<DateTime<Utc>>,
}

/// Health endpoint payload. Extra fields are ignored.
#[derive(Debug, Deserialize)]
struct HealthBody {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    last_heartbeat: Option<DateTime<Utc>>,
}

/// Blocking probe of the backend health endpoint.
#[derive(Clone)]
pub struct ServiceProbe {
    client: reqwest::blocking::Client,
    url: String,
}

impl ServiceProbe {
    /// Build a probe with a bounded per-request timeout. An unbounded client
    /// is never constructed: a builder failure is a startup error.
    pub fn new(url: &str, timeout: Duration) -> crate::core::errors::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|err| crate::core::errors::KwdError::Runtime {
                details: format!("http client init failed: {err}"),
            })?;
        Ok(Self {
            client,
            url: url.to_string(),
        })
    }

    /// Probe once. Any transport error, timeout, or non-success status maps
    /// to `reachable = false`; a heartbeat is only reported on success.
    #[must_use]
    pub fn probe(&self) -> ServiceProbeResult {
        let started = Instant::now();
        let response = match self.client.get(&self.url).send() {
            Ok(response) => response,
            Err(_) => return ServiceProbeResult::default(),
        };
        let latency = started.elapsed();
        if !response.status().is_success() {
            return ServiceProbeResult {
                reachable: false,
                latency: Some(latency),
                last_heartbeat: None,
            };
        }
        let body: Option<HealthBody> = response.json().ok();
        let (status_ok, last_heartbeat) = body.map_or((true, None), |b| {
            let ok = b.status.as_deref().is_none_or(|s| {
                matches!(s, "ok" | "healthy" | "up")
            });
            (ok, b.last_heartbeat)
        });
        ServiceProbeResult {
            reachable: status_ok,
            latency: Some(latency),
            last_heartbeat,
        }
    }
}

/// Result of one host resource probe. Missing signals stay `None` and are
/// fail-open: an unobtainable reading never counts as pressure.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceReading {
    /// 1-minute load average.
    pub load_1m: Option<f64>,
    /// Available memory in MiB.
    pub mem_free_mb: Option<u64>,
    /// Free disk space in MiB at the configured path.
    pub disk_free_mb: Option<u64>,
}

/// Sample host resources: load average, available memory, free disk.
#[must_use]
pub fn read_resources(disk_path: &Path) -> ResourceReading {
    ResourceReading {
        load_1m: std::fs::read_to_string("/proc/loadavg")
            .ok()
            .and_then(|raw| parse_load_avg_1m(&raw)),
        mem_free_mb: std::fs::read_to_string("/proc/meminfo")
            .ok()
            .and_then(|raw| parse_mem_available_mb(&raw)),
        disk_free_mb: disk_free_mb(disk_path),
    }
}

/// First field of `/proc/loadavg`.
#[must_use]
pub fn parse_load_avg_1m(raw: &str) -> Option<f64> {
    let value: f64 = raw.split_whitespace().next()?.parse().ok()?;
    value.is_finite().then_some(value)
}

/// `MemAvailable` from `/proc/meminfo`, converted from kB to MiB.
#[must_use]
pub fn parse_mem_available_mb(raw: &str) -> Option<u64> {
    for line in raw.lines() {
        let mut fields = line.split_whitespace();
        if fields.next() == Some("MemAvailable:") {
            let kb: u64 = fields.next()?.parse().ok()?;
            return Some(kb / 1024);
        }
    }
    None
}

#[cfg(unix)]
fn disk_free_mb(path: &Path) -> Option<u64> {
    let stat = nix::sys::statvfs::statvfs(path).ok()?;
    #[allow(clippy::unnecessary_cast)]
    let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
    Some(free / (1024 * 1024))
}

#[cfg(not(unix))]
fn disk_free_mb(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::{parse_load_avg_1m, parse_mem_available_mb};

    #[test]
    fn loadavg_first_field_parses() {
        assert_eq!(parse_load_avg_1m("1.50 1.21 0.80 2/199 1234\n"), Some(1.50));
        assert_eq!(parse_load_avg_1m("0.00 0.01 0.05 1/120 999"), Some(0.0));
    }

    #[test]
    fn loadavg_garbage_is_none() {
        assert_eq!(parse_load_avg_1m(""), None);
        assert_eq!(parse_load_avg_1m("abc 1.0"), None);
        assert_eq!(parse_load_avg_1m("inf 1.0 1.0"), None);
    }

    #[test]
    fn meminfo_mem_available_converts_to_mib() {
        let raw = "MemTotal:       16331712 kB\nMemFree:         1024000 kB\nMemAvailable:    8192000 kB\n";
        assert_eq!(parse_mem_available_mb(raw), Some(8000));
    }

    #[test]
    fn meminfo_missing_field_is_none() {
        assert_eq!(parse_mem_available_mb("MemTotal: 1 kB\n"), None);
    }
}
