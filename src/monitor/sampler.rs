//! Per-tick health snapshot assembly.
//!
//! Sub-probes (service endpoint, host resources) run concurrently on their
//! own threads and are joined against a shared deadline, so one slow probe
//! cannot stall the tick. The heartbeat is re-fetched at its own coarser
//! cadence; between polls the cached value is aged forward.

use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use crossbeam_channel::bounded;

use crate::core::config::{BrowserPolicy, RecoveryPolicy, ResourcePolicy};
use crate::core::errors::Result;
use crate::monitor::probes::{read_resources, ResourceReading, ServiceProbe};

/// One tick's normalized bundle of health signals. Immutable once produced.
#[derive(Debug, Clone)]
pub struct HealthSnapshot {
    /// When the snapshot was taken.
    pub sampled_at: DateTime<Utc>,
    /// Backend health endpoint answered successfully.
    pub service_reachable: bool,
    /// Endpoint round-trip latency, when the probe completed.
    pub service_latency: Option<Duration>,
    /// Age of the last observed browser heartbeat.
    pub browser_heartbeat_age: Option<Duration>,
    /// Heartbeat is fresh enough (or the startup grace window applies).
    pub render_probe_ok: bool,
    /// 1-minute load average, if obtainable.
    pub load_1m: Option<f64>,
    /// Available memory in MiB, if obtainable.
    pub mem_free_mb: Option<u64>,
    /// Free disk in MiB, if obtainable.
    pub disk_free_mb: Option<u64>,
    /// Any resource minimum breached. Feeds degraded mode, never a track.
    pub resource_pressure: bool,
    /// Snapshot was taken inside the startup grace window.
    pub within_grace: bool,
}

impl HealthSnapshot {
    /// A fully healthy snapshot at `now`. Test and default scaffolding.
    #[must_use]
    pub const fn healthy(now: DateTime<Utc>) -> Self {
        Self {
            sampled_at: now,
            service_reachable: true,
            service_latency: Some(Duration::from_millis(5)),
            browser_heartbeat_age: Some(Duration::from_secs(1)),
            render_probe_ok: true,
            load_1m: Some(0.5),
            mem_free_mb: Some(2048),
            disk_free_mb: Some(10_240),
            resource_pressure: false,
            within_grace: false,
        }
    }
}

/// Samples all health signals each tick.
pub struct HealthSampler {
    probe: ServiceProbe,
    browser: BrowserPolicy,
    resources: ResourcePolicy,
    join_deadline: Duration,
    started_at: DateTime<Utc>,
    cached_heartbeat: Option<DateTime<Utc>>,
    last_heartbeat_poll: Option<DateTime<Utc>>,
}

impl HealthSampler {
    /// Build a sampler from the loaded policy. `started_at` anchors the
    /// startup grace window.
    pub fn new(policy: &RecoveryPolicy, started_at: DateTime<Utc>) -> Result<Self> {
        Ok(Self {
            probe: ServiceProbe::new(&policy.service.health_url, policy.probe_timeout())?,
            browser: policy.browser.clone(),
            resources: policy.resources.clone(),
            // The HTTP client enforces its own timeout; the join deadline
            // only guards against a wedged probe thread.
            join_deadline: policy.probe_timeout() + Duration::from_secs(1),
            started_at,
            cached_heartbeat: None,
            last_heartbeat_poll: None,
        })
    }

    /// Take one snapshot. Never fails; unobtainable signals become explicit
    /// failure values.
    pub fn sample(&mut self, now: DateTime<Utc>) -> HealthSnapshot {
        let (service_tx, service_rx) = bounded(1);
        let (resource_tx, resource_rx) = bounded(1);

        let probe = self.probe.clone();
        thread::spawn(move || {
            let _ = service_tx.send(probe.probe());
        });
        let disk_path = self.resources.disk_path.clone();
        thread::spawn(move || {
            let _ = resource_tx.send(read_resources(&disk_path));
        });

        let deadline = Instant::now() + self.join_deadline;
        let service = service_rx.recv_deadline(deadline).unwrap_or_default();
        let resources = resource_rx.recv_deadline(deadline).unwrap_or_default();

        if service.reachable && self.heartbeat_poll_due(now) {
            if let Some(heartbeat) = service.last_heartbeat {
                self.cached_heartbeat = Some(heartbeat);
            }
            self.last_heartbeat_poll = Some(now);
        }

        let (render_probe_ok, within_grace, age) = evaluate_render_probe(
            now,
            self.started_at,
            self.cached_heartbeat,
            &self.browser,
        );

        HealthSnapshot {
            sampled_at: now,
            service_reachable: service.reachable,
            service_latency: service.latency,
            browser_heartbeat_age: age,
            render_probe_ok,
            load_1m: resources.load_1m,
            mem_free_mb: resources.mem_free_mb,
            disk_free_mb: resources.disk_free_mb,
            resource_pressure: evaluate_pressure(resources, &self.resources),
            within_grace,
        }
    }

    fn heartbeat_poll_due(&self, now: DateTime<Utc>) -> bool {
        self.last_heartbeat_poll.is_none_or(|last| {
            (now - last).num_seconds().unsigned_abs() >= self.browser.heartbeat_poll_secs
        })
    }
}

/// Judge heartbeat freshness. Returns `(render_probe_ok, within_grace, age)`.
///
/// During the startup grace window probe failures are not counted, which
/// suppresses false positives while the stack is still booting.
#[must_use]
pub fn evaluate_render_probe(
    now: DateTime<Utc>,
    started_at: DateTime<Utc>,
    heartbeat: Option<DateTime<Utc>>,
    policy: &BrowserPolicy,
) -> (bool, bool, Option<Duration>) {
    let age = heartbeat.map(|hb| (now - hb).to_std().unwrap_or_default());
    let within_grace =
        (now - started_at).num_seconds().unsigned_abs() < policy.startup_grace_secs;
    if within_grace {
        return (true, true, age);
    }
    let fresh = age.is_some_and(|a| a.as_secs() <= policy.heartbeat_timeout_secs);
    (fresh, false, age)
}

/// Any present resource signal breaching its configured minimum counts as
/// pressure. Missing signals are fail-open.
#[must_use]
pub fn evaluate_pressure(reading: ResourceReading, policy: &ResourcePolicy) -> bool {
    reading.load_1m.is_some_and(|load| load > policy.max_load_1m)
        || reading.mem_free_mb.is_some_and(|mb| mb < policy.min_mem_free_mb)
        || reading.disk_free_mb.is_some_and(|mb| mb < policy.min_disk_free_mb)
}

#[cfg(test)]
mod tests {
    use super::{evaluate_pressure, evaluate_render_probe};
    use crate::core::config::{BrowserPolicy, ResourcePolicy};
    use crate::monitor::probes::ResourceReading;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};

    fn browser_policy() -> BrowserPolicy {
        BrowserPolicy {
            heartbeat_timeout_secs: 90,
            fail_threshold: 2,
            startup_grace_secs: 120,
            heartbeat_poll_secs: 30,
        }
    }

    fn resource_policy() -> ResourcePolicy {
        ResourcePolicy {
            max_load_1m: 4.0,
            min_mem_free_mb: 128,
            min_disk_free_mb: 512,
            disk_path: "/".into(),
            degraded_after_ticks: 4,
            degraded_clear_ticks: 8,
            suppress_browser_track: true,
        }
    }

    #[test]
    fn fresh_heartbeat_passes() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let now = start + ChronoDuration::seconds(600);
        let heartbeat = now - ChronoDuration::seconds(30);
        let (ok, grace, age) = evaluate_render_probe(now, start, Some(heartbeat), &browser_policy());
        assert!(ok);
        assert!(!grace);
        assert_eq!(age.unwrap().as_secs(), 30);
    }

    #[test]
    fn stale_heartbeat_fails_after_grace() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let now = start + ChronoDuration::seconds(600);
        let heartbeat = now - ChronoDuration::seconds(91);
        let (ok, _, _) = evaluate_render_probe(now, start, Some(heartbeat), &browser_policy());
        assert!(!ok);
    }

    #[test]
    fn stale_heartbeat_suppressed_inside_grace() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let now = start + ChronoDuration::seconds(60);
        let (ok, grace, _) = evaluate_render_probe(now, start, None, &browser_policy());
        assert!(ok, "boot-time failures must not count");
        assert!(grace);
    }

    #[test]
    fn absent_heartbeat_after_grace_is_a_failure() {
        let start = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap();
        let now = start + ChronoDuration::seconds(300);
        let (ok, grace, age) = evaluate_render_probe(now, start, None, &browser_policy());
        assert!(!ok, "no heartbeat ever seen is an explicit failure value");
        assert!(!grace);
        assert!(age.is_none());
    }

    #[test]
    fn pressure_triggers_on_any_breach() {
        let policy = resource_policy();
        let healthy = ResourceReading {
            load_1m: Some(1.0),
            mem_free_mb: Some(1024),
            disk_free_mb: Some(4096),
        };
        assert!(!evaluate_pressure(healthy, &policy));

        assert!(evaluate_pressure(
            ResourceReading { load_1m: Some(6.5), ..healthy },
            &policy
        ));
        assert!(evaluate_pressure(
            ResourceReading { mem_free_mb: Some(64), ..healthy },
            &policy
        ));
        assert!(evaluate_pressure(
            ResourceReading { disk_free_mb: Some(100), ..healthy },
            &policy
        ));
    }

    #[test]
    fn missing_resource_signals_are_fail_open() {
        assert!(!evaluate_pressure(ResourceReading::default(), &resource_policy()));
    }
}
