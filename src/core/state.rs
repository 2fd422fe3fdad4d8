//! Persisted escalation state and the crash-safe state store.
//!
//! The state file is owned exclusively for writes by the supervisor and is
//! flushed synchronously after every mutation: the process may be killed by
//! its own reboot action at any moment, so a reboot's "issued" marker must
//! be durable before the command is dispatched.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::errors::{KwdError, Result};

/// Persisted state schema version; bumped on incompatible layout changes.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// One concrete, externally visible remedial operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Simulated refresh of the rendering session.
    SoftReload,
    /// Kill and relaunch the browser process.
    BrowserRestart,
    /// Restart the windowing session hosting the browser.
    SessionRestart,
    /// Restart the backend service process.
    ServiceRestart,
    /// Reboot the node. Terminal until the process restarts post-boot.
    Reboot,
}

impl Action {
    /// Rate-limit class. The limiter keys on action identity, not on which
    /// track requested it, so browser restarts cannot double-fire when both
    /// tracks want one in the same window.
    #[must_use]
    pub const fn limit_class(self) -> Option<LimitClass> {
        match self {
            // Cooldown-only: a soft reload is a simulated refresh.
            Self::SoftReload => None,
            Self::BrowserRestart | Self::SessionRestart => Some(LimitClass::BrowserRestart),
            Self::ServiceRestart => Some(LimitClass::ServiceRestart),
            Self::Reboot => Some(LimitClass::Reboot),
        }
    }

    /// Stable lowercase name used in events and state files.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::SoftReload => "soft_reload",
            Self::BrowserRestart => "browser_restart",
            Self::SessionRestart => "session_restart",
            Self::ServiceRestart => "service_restart",
            Self::Reboot => "reboot",
        }
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Windowed rate-limit classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitClass {
    /// Browser or windowing-session restarts, hourly window.
    BrowserRestart,
    /// Backend service restarts, hourly window.
    ServiceRestart,
    /// Node reboots, daily window.
    Reboot,
}

/// Which escalation track requested an action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    /// Heartbeat-staleness driven track, levels 0..=2.
    Browser,
    /// Service-unreachability driven track, levels 0..=3.
    System,
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Browser => f.write_str("browser"),
            Self::System => f.write_str("system"),
        }
    }
}

/// A dispatched action awaiting its wall-clock verification delay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingVerification {
    /// The dispatched action.
    pub action: Action,
    /// Track that requested it.
    pub track: Track,
    /// Escalation level at decision time.
    pub level: u8,
    /// Wall-clock dispatch time; verification is judged against it.
    pub dispatched_at: DateTime<Utc>,
}

/// One rate-limit history entry. Invariant: within its configured window;
/// older entries are pruned lazily on each `allow()` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionRecord {
    /// Rate-limit class of the dispatched action.
    pub class: LimitClass,
    /// Dispatch time.
    pub timestamp: DateTime<Utc>,
}

/// Time-windowed dispatch history, persisted so limits survive restarts.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionHistory {
    /// Browser/session restart records (hourly window).
    pub browser_restarts: Vec<ActionRecord>,
    /// Service restart records (hourly window).
    pub service_restarts: Vec<ActionRecord>,
    /// Reboot records (daily window).
    pub reboots: Vec<ActionRecord>,
    /// Most recent dispatch of any action, for the global cooldown.
    pub last_dispatch: Option<DateTime<Utc>>,
}

impl ActionHistory {
    /// Records list for a class.
    pub fn records_mut(&mut self, class: LimitClass) -> &mut Vec<ActionRecord> {
        match class {
            LimitClass::BrowserRestart => &mut self.browser_restarts,
            LimitClass::ServiceRestart => &mut self.service_restarts,
            LimitClass::Reboot => &mut self.reboots,
        }
    }

    /// Read-only records list for a class.
    #[must_use]
    pub fn records(&self, class: LimitClass) -> &[ActionRecord] {
        match class {
            LimitClass::BrowserRestart => &self.browser_restarts,
            LimitClass::ServiceRestart => &self.service_restarts,
            LimitClass::Reboot => &self.reboots,
        }
    }
}

/// Single-writer escalation state, mutated at most once per tick and flushed
/// synchronously after every mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationState {
    /// Persisted schema version.
    pub schema_version: u32,
    /// Browser track level, 0..=2.
    pub browser_level: u8,
    /// When the browser track last escalated.
    pub browser_escalated_at: Option<DateTime<Utc>>,
    /// Browser track has run out of levels; system track takes over.
    pub browser_exhausted: bool,
    /// System track level, 0..=3.
    pub system_level: u8,
    /// When the system track last escalated.
    pub system_escalated_at: Option<DateTime<Utc>>,
    /// Consecutive ticks with a failed render probe.
    pub consecutive_failures: u32,
    /// Consecutive ticks with the service unreachable.
    pub service_consecutive_failures: u32,
    /// Resource-pressure circuit breaker, orthogonal to the levels.
    pub degraded_mode: bool,
    /// Consecutive pressured ticks (degraded-mode hysteresis).
    pub pressure_ticks: u32,
    /// Consecutive clean ticks while degraded (hysteresis).
    pub clean_pressure_ticks: u32,
    /// Last time any recovery action was verified successful.
    pub last_recovery_time: Option<DateTime<Utc>>,
    /// Start of the current unbroken run of healthy signals; cleared the
    /// moment either signal fails. Anchors the settle period.
    #[serde(default)]
    pub healthy_since: Option<DateTime<Utc>>,
    /// Dispatched action awaiting verification, if any.
    pub pending: Option<PendingVerification>,
    /// Set after a reboot is dispatched; halts the engine until restart.
    pub reboot_issued: bool,
    /// When the last reboot was issued (survives the reboot).
    pub last_reboot_time: Option<DateTime<Utc>>,
    /// Rate-limit dispatch history.
    pub history: ActionHistory,
}

impl Default for EscalationState {
    fn default() -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            browser_level: 0,
            browser_escalated_at: None,
            browser_exhausted: false,
            system_level: 0,
            system_escalated_at: None,
            consecutive_failures: 0,
            service_consecutive_failures: 0,
            degraded_mode: false,
            pressure_ticks: 0,
            clean_pressure_ticks: 0,
            last_recovery_time: None,
            healthy_since: None,
            pending: None,
            reboot_issued: false,
            last_reboot_time: None,
            history: ActionHistory::default(),
        }
    }
}

impl EscalationState {
    /// Whether either track is above its idle level.
    #[must_use]
    pub const fn is_escalated(&self) -> bool {
        self.browser_level > 0
            || self.system_level > 0
            || self.browser_exhausted
            || self.pending.is_some()
    }

    /// Whether a reboot was issued on the given calendar day (UTC).
    #[must_use]
    pub fn rebooted_on(&self, day: DateTime<Utc>) -> bool {
        self.last_reboot_time
            .is_some_and(|at| at.date_naive() == day.date_naive())
    }
}

/// Where a loaded state came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadSource {
    /// No state file existed; defaults used.
    Fresh,
    /// State file parsed cleanly.
    Persisted,
    /// State file was unreadable or unparseable; defaults used.
    Recovered {
        /// Human-readable description of the corruption.
        details: String,
    },
}

/// Durable load/save of [`EscalationState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Create a store backed by `path`. The parent directory is created on
    /// the first save.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load persisted state, or a safe default. Corruption is never fatal:
    /// the caller logs the returned [`LoadSource`] and carries on.
    ///
    /// A persisted `reboot_issued` marker is cleared on load — reaching this
    /// code means the process has restarted, which is exactly the condition
    /// that re-arms the engine. `last_reboot_time` is kept so the daily
    /// reboot limit still holds across the boot.
    #[must_use]
    pub fn load(&self) -> (EscalationState, LoadSource) {
        if !self.path.exists() {
            return (EscalationState::default(), LoadSource::Fresh);
        }
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) => {
                return (
                    EscalationState::default(),
                    LoadSource::Recovered {
                        details: format!("read failed: {err}"),
                    },
                );
            }
        };
        match serde_json::from_str::<EscalationState>(&raw) {
            Ok(mut state) if state.schema_version == STATE_SCHEMA_VERSION => {
                state.reboot_issued = false;
                state.pending = None;
                (state, LoadSource::Persisted)
            }
            Ok(state) => (
                EscalationState::default(),
                LoadSource::Recovered {
                    details: format!(
                        "schema version {} != {STATE_SCHEMA_VERSION}",
                        state.schema_version
                    ),
                },
            ),
            Err(err) => (
                EscalationState::default(),
                LoadSource::Recovered {
                    details: format!("parse failed: {err}"),
                },
            ),
        }
    }

    /// Atomically persist `state`: write to a temporary sibling, fsync, then
    /// rename over the target so a crash mid-write cannot leave a half file.
    pub fn save(&self, state: &EscalationState) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(|e| KwdError::io(parent, e))?;
        }
        let payload = serde_json::to_vec_pretty(state)?;
        let tmp = self.path.with_extension("json.tmp");
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&tmp)
                .map_err(|e| KwdError::io(&tmp, e))?;
            file.write_all(&payload).map_err(|e| KwdError::io(&tmp, e))?;
            file.sync_all().map_err(|e| KwdError::io(&tmp, e))?;
        }
        fs::rename(&tmp, &self.path).map_err(|e| KwdError::io(&self.path, e))?;
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
            && let Ok(dir) = File::open(parent)
        {
            // Directory fsync is best-effort; rename durability varies by fs.
            let _ = dir.sync_all();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Action, EscalationState, LimitClass, LoadSource, StateStore};
    use chrono::{TimeZone, Utc};

    #[test]
    fn missing_file_loads_fresh_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("state.json"));
        let (state, source) = store.load();
        assert_eq!(source, LoadSource::Fresh);
        assert_eq!(state, EscalationState::default());
        assert_eq!(state.browser_level, 0);
        assert_eq!(state.consecutive_failures, 0);
        assert!(!state.degraded_mode);
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("state.json"));
        let mut state = EscalationState::default();
        state.browser_level = 2;
        state.consecutive_failures = 7;
        state.degraded_mode = true;
        state.last_reboot_time = Some(Utc.with_ymd_and_hms(2026, 3, 1, 4, 30, 0).unwrap());
        store.save(&state).expect("save");

        let (loaded, source) = store.load();
        assert_eq!(source, LoadSource::Persisted);
        assert_eq!(loaded, state);
    }

    #[test]
    fn corrupt_file_recovers_to_default() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").expect("write garbage");
        let store = StateStore::new(&path);
        let (state, source) = store.load();
        assert!(matches!(source, LoadSource::Recovered { .. }));
        assert_eq!(state, EscalationState::default());
    }

    #[test]
    fn reboot_issued_marker_clears_on_load_but_daily_record_survives() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = StateStore::new(dir.path().join("state.json"));
        let issued = Utc.with_ymd_and_hms(2026, 3, 1, 4, 30, 0).unwrap();
        let mut state = EscalationState::default();
        state.reboot_issued = true;
        state.last_reboot_time = Some(issued);
        store.save(&state).expect("save");

        let (loaded, _) = store.load();
        assert!(!loaded.reboot_issued, "restart re-arms the engine");
        assert_eq!(loaded.last_reboot_time, Some(issued));
        assert!(loaded.rebooted_on(issued));
        assert!(!loaded.rebooted_on(issued + chrono::Duration::days(1)));
    }

    #[test]
    fn limit_classes_share_action_identity_across_tracks() {
        assert_eq!(
            Action::BrowserRestart.limit_class(),
            Action::SessionRestart.limit_class()
        );
        assert_eq!(Action::SoftReload.limit_class(), None);
        assert_eq!(Action::Reboot.limit_class(), Some(LimitClass::Reboot));
    }

    #[test]
    fn save_is_atomic_no_tmp_left_behind() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("state.json");
        let store = StateStore::new(&path);
        store.save(&EscalationState::default()).expect("save");
        assert!(path.exists());
        assert!(!path.with_extension("json.tmp").exists());
    }
}
