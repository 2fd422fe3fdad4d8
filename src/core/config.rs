//! Recovery policy: thresholds, intervals, rate limits, and command bindings.
//!
//! The policy is loaded once at startup and is immutable for the process
//! lifetime. Validation is strict: a missing command binding or a zero
//! probe bound would mean unbounded recovery behavior, so the supervisor
//! refuses to start instead (the only fatal error family, `KWD-1xxx`).

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{KwdError, Result};

/// Top-level recovery policy, deserialized from TOML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPolicy {
    /// Tick loop and file locations.
    pub daemon: DaemonPolicy,
    /// Backend service health probing.
    pub service: ServicePolicy,
    /// Browser render heartbeat probing.
    pub browser: BrowserPolicy,
    /// Escalation verification delays and settle period.
    pub escalation: EscalationPolicy,
    /// Action rate limits and the global cooldown.
    pub limits: LimitPolicy,
    /// Host resource minimums feeding degraded mode.
    pub resources: ResourcePolicy,
    /// External command bindings for the five recovery actions.
    pub commands: CommandBindings,
}

/// Tick cadence and persistence paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonPolicy {
    /// Seconds between ticks.
    pub tick_interval_secs: u64,
    /// Path of the persisted escalation state file.
    pub state_file: PathBuf,
    /// Path of the append-only JSONL event log.
    pub event_log: PathBuf,
}

/// Backend service reachability policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicePolicy {
    /// Health endpoint URL, e.g. `http://127.0.0.1:8080/health`.
    pub health_url: String,
    /// Per-probe timeout in seconds. Must be > 0.
    pub probe_timeout_secs: u64,
    /// Consecutive unreachable ticks before the system track triggers.
    pub fail_threshold: u32,
}

/// Browser heartbeat policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserPolicy {
    /// Heartbeat older than this is a render-probe failure.
    pub heartbeat_timeout_secs: u64,
    /// Consecutive stale ticks before the browser track triggers.
    pub fail_threshold: u32,
    /// Probe failures inside this window after startup are not counted.
    pub startup_grace_secs: u64,
    /// Heartbeat re-fetch cadence; between polls the cached value is aged.
    pub heartbeat_poll_secs: u64,
}

/// Per-action verification delays and the settle period.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscalationPolicy {
    /// Delay before judging a soft reload.
    pub soft_reload_verify_secs: u64,
    /// Delay before judging a browser restart.
    pub browser_restart_verify_secs: u64,
    /// Delay before judging a windowing-session restart.
    pub session_restart_verify_secs: u64,
    /// Delay before judging a backend service restart.
    pub service_restart_verify_secs: u64,
    /// Sustained health required before a level resets to 0.
    pub settle_secs: u64,
}

/// Sliding-window rate limits plus the shared cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitPolicy {
    /// Browser/session restarts allowed per rolling hour.
    pub max_browser_restarts_per_hour: u32,
    /// Backend service restarts allowed per rolling hour.
    pub max_service_restarts_per_hour: u32,
    /// Reboots allowed per rolling day.
    pub max_reboots_per_day: u32,
    /// Minimum spacing between any two recovery actions.
    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

/// Resource pressure thresholds and degraded-mode hysteresis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePolicy {
    /// 1-minute load average above this counts as pressure.
    pub max_load_1m: f64,
    /// Free memory below this (MiB) counts as pressure.
    pub min_mem_free_mb: u64,
    /// Free disk below this (MiB) counts as pressure.
    pub min_disk_free_mb: u64,
    /// Filesystem path whose free space is checked.
    #[serde(default = "default_disk_path")]
    pub disk_path: PathBuf,
    /// Consecutive pressured ticks before degraded mode sets.
    pub degraded_after_ticks: u32,
    /// Consecutive clean ticks before degraded mode clears.
    pub degraded_clear_ticks: u32,
    /// Whether degraded mode suppresses browser-track dispatch.
    #[serde(default = "default_true")]
    pub suppress_browser_track: bool,
}

/// Shell bindings for the five recovery actions. All required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandBindings {
    /// Simulated refresh of the rendering session.
    pub soft_reload: String,
    /// Kill and relaunch the browser process.
    pub browser_restart: String,
    /// Restart the windowing session hosting the browser.
    pub session_restart: String,
    /// Restart the backend service process.
    pub service_restart: String,
    /// Reboot the node. Terminal.
    pub reboot: String,
}

const fn default_cooldown_secs() -> u64 {
    60
}

fn default_disk_path() -> PathBuf {
    PathBuf::from("/")
}

const fn default_true() -> bool {
    true
}

impl RecoveryPolicy {
    /// Load and validate a policy file.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(KwdError::MissingConfig {
                path: path.to_path_buf(),
            });
        }
        let raw = std::fs::read_to_string(path).map_err(|e| KwdError::io(path, e))?;
        let policy: Self = toml::from_str(&raw)?;
        policy.validate()?;
        Ok(policy)
    }

    /// Validate cross-field constraints. Every external wait must be bounded
    /// and every threshold non-degenerate.
    pub fn validate(&self) -> Result<()> {
        let reject = |details: &str| -> Result<()> {
            Err(KwdError::InvalidConfig {
                details: details.to_string(),
            })
        };

        if self.daemon.tick_interval_secs == 0 {
            return reject("daemon.tick_interval_secs must be > 0");
        }
        if self.service.probe_timeout_secs == 0 {
            return reject("service.probe_timeout_secs must be > 0");
        }
        if self.service.probe_timeout_secs >= self.daemon.tick_interval_secs.max(2) * 2 {
            return reject("service.probe_timeout_secs must be well under two tick intervals");
        }
        if self.service.health_url.is_empty() {
            return reject("service.health_url must be set");
        }
        if self.service.fail_threshold == 0 || self.browser.fail_threshold == 0 {
            return reject("fail thresholds must be >= 1");
        }
        if self.browser.heartbeat_timeout_secs == 0 {
            return reject("browser.heartbeat_timeout_secs must be > 0");
        }
        if self.browser.heartbeat_poll_secs == 0 {
            return reject("browser.heartbeat_poll_secs must be > 0");
        }
        for (field, secs) in [
            ("soft_reload_verify_secs", self.escalation.soft_reload_verify_secs),
            ("browser_restart_verify_secs", self.escalation.browser_restart_verify_secs),
            ("session_restart_verify_secs", self.escalation.session_restart_verify_secs),
            ("service_restart_verify_secs", self.escalation.service_restart_verify_secs),
            ("settle_secs", self.escalation.settle_secs),
        ] {
            if secs == 0 {
                return Err(KwdError::InvalidConfig {
                    details: format!("escalation.{field} must be > 0"),
                });
            }
        }
        if self.limits.max_browser_restarts_per_hour == 0
            || self.limits.max_service_restarts_per_hour == 0
        {
            return reject("hourly restart limits must be >= 1");
        }
        if self.limits.max_reboots_per_day > 1 {
            return reject("limits.max_reboots_per_day must be 0 or 1");
        }
        if self.limits.cooldown_secs == 0 {
            return reject("limits.cooldown_secs must be > 0");
        }
        if self.resources.max_load_1m <= 0.0 || !self.resources.max_load_1m.is_finite() {
            return reject("resources.max_load_1m must be a positive finite number");
        }
        if self.resources.degraded_after_ticks == 0 || self.resources.degraded_clear_ticks == 0 {
            return reject("degraded-mode hysteresis ticks must be >= 1");
        }
        for (name, command) in [
            ("soft_reload", &self.commands.soft_reload),
            ("browser_restart", &self.commands.browser_restart),
            ("session_restart", &self.commands.session_restart),
            ("service_restart", &self.commands.service_restart),
            ("reboot", &self.commands.reboot),
        ] {
            if command.trim().is_empty() {
                return Err(KwdError::InvalidConfig {
                    details: format!("commands.{name} must be set"),
                });
            }
        }
        Ok(())
    }

    /// Tick interval as a `Duration`.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_secs(self.daemon.tick_interval_secs)
    }

    /// Per-probe timeout as a `Duration`.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.service.probe_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::RecoveryPolicy;

    pub(crate) const VALID_POLICY: &str = include_str!("../../tests/fixtures/policy.toml");

    fn parse(raw: &str) -> RecoveryPolicy {
        toml::from_str(raw).expect("policy should parse")
    }

    #[test]
    fn valid_policy_passes_validation() {
        let policy = parse(VALID_POLICY);
        assert!(policy.validate().is_ok());
        assert_eq!(policy.limits.cooldown_secs, 60, "cooldown defaults to 60s");
        assert!(policy.resources.suppress_browser_track);
    }

    #[test]
    fn zero_probe_timeout_is_rejected() {
        let mut policy = parse(VALID_POLICY);
        policy.service.probe_timeout_secs = 0;
        let err = policy.validate().expect_err("unbounded probe must fail");
        assert_eq!(err.code(), "KWD-1001");
    }

    #[test]
    fn empty_command_binding_is_rejected() {
        let mut policy = parse(VALID_POLICY);
        policy.commands.reboot = "  ".to_string();
        let err = policy.validate().expect_err("blank binding must fail");
        assert!(err.to_string().contains("commands.reboot"));
    }

    #[test]
    fn zero_cooldown_is_rejected() {
        let mut policy = parse(VALID_POLICY);
        policy.limits.cooldown_secs = 0;
        let err = policy.validate().expect_err("disabled cooldown must fail");
        assert!(err.to_string().contains("cooldown_secs"));
    }

    #[test]
    fn multiple_daily_reboots_are_rejected() {
        let mut policy = parse(VALID_POLICY);
        policy.limits.max_reboots_per_day = 3;
        assert!(policy.validate().is_err());
    }

    #[test]
    fn missing_file_yields_missing_config() {
        let err = RecoveryPolicy::load(std::path::Path::new("/nonexistent/kwd.toml"))
            .expect_err("missing file must fail");
        assert_eq!(err.code(), "KWD-1002");
        assert!(err.is_fatal());
    }

    #[test]
    fn malformed_toml_yields_parse_error() {
        let err = toml::from_str::<RecoveryPolicy>("daemon = 3")
            .map_err(crate::core::errors::KwdError::from)
            .expect_err("malformed policy must fail");
        assert_eq!(err.code(), "KWD-1003");
    }
}
