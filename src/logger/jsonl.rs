//! Append-only JSONL event stream with graceful degradation.
//!
//! One line per event, schema-versioned, consumed by external aggregation
//! tooling. A logging failure must never take the supervisor down: if the
//! file cannot be opened or written the event is dropped (optionally echoed
//! to stderr) and the loop carries on.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event schema version; bumped on incompatible field changes.
pub const EVENT_SCHEMA_VERSION: u32 = 1;

/// Event severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventLevel {
    /// Per-tick detail.
    Debug,
    /// Normal decisions and transitions.
    Info,
    /// Recovered anomalies (state corruption, probe failures).
    Warning,
    /// Action execution failures and reboots.
    Critical,
}

impl std::fmt::Display for EventLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Debug => f.write_str("DEBUG"),
            Self::Info => f.write_str("INFO"),
            Self::Warning => f.write_str("WARNING"),
            Self::Critical => f.write_str("CRITICAL"),
        }
    }
}

/// One structured event line.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    /// Wall-clock event time.
    pub timestamp: DateTime<Utc>,
    /// Emitting component, e.g. `engine`, `executor`, `state_store`.
    pub component: &'static str,
    /// Severity.
    pub level: EventLevel,
    /// Stable machine-parseable event code, e.g. `action_dispatched`.
    pub code: &'static str,
    /// Human-readable summary.
    pub message: String,
    /// Free-form structured payload.
    #[serde(skip_serializing_if = "Value::is_null", default)]
    pub details: Value,
    /// Action dispatched by this decision, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub action_taken: Option<String>,
    /// Escalation level at decision time, if relevant.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub recovery_level: Option<u8>,
    /// Coarse system state, e.g. `healthy`, `escalated`, `degraded`.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub system_state: Option<String>,
    /// Event schema version.
    pub schema_version: u32,
}

impl Event {
    /// New event with the mandatory fields; optional fields start empty.
    #[must_use]
    pub fn new(
        component: &'static str,
        level: EventLevel,
        code: &'static str,
        message: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            component,
            level,
            code,
            message: message.into(),
            details: Value::Null,
            action_taken: None,
            recovery_level: None,
            system_state: None,
            schema_version: EVENT_SCHEMA_VERSION,
        }
    }

    /// Attach a structured payload.
    #[must_use]
    pub fn with_details(mut self, details: Value) -> Self {
        self.details = details;
        self
    }

    /// Attach the dispatched action.
    #[must_use]
    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action_taken = Some(action.into());
        self
    }

    /// Attach the escalation level at decision time.
    #[must_use]
    pub const fn with_level(mut self, level: u8) -> Self {
        self.recovery_level = Some(level);
        self
    }

    /// Attach the coarse system state.
    #[must_use]
    pub fn with_system_state(mut self, state: impl Into<String>) -> Self {
        self.system_state = Some(state.into());
        self
    }
}

enum Sink {
    File(File),
    /// Open failed or test mode; events are dropped (or echoed).
    Disabled,
}

/// Thread-safe JSONL event writer.
pub struct EventLog {
    sink: Mutex<Sink>,
    path: Option<PathBuf>,
    echo_stderr: bool,
}

impl EventLog {
    /// Open (appending) the event log at `path`. Failure to open degrades to
    /// a disabled sink rather than erroring: observability must not decide
    /// whether the supervisor runs.
    #[must_use]
    pub fn open(path: &Path, echo_stderr: bool) -> Self {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            let _ = std::fs::create_dir_all(parent);
        }
        let sink = match OpenOptions::new().create(true).append(true).open(path) {
            Ok(file) => Sink::File(file),
            Err(err) => {
                eprintln!("kwd: event log unavailable at {}: {err}", path.display());
                Sink::Disabled
            }
        };
        Self {
            sink: Mutex::new(sink),
            path: Some(path.to_path_buf()),
            echo_stderr,
        }
    }

    /// A log that drops everything. Used by tests and one-shot CLI commands.
    #[must_use]
    pub fn disabled() -> Self {
        Self {
            sink: Mutex::new(Sink::Disabled),
            path: None,
            echo_stderr: false,
        }
    }

    /// Path of the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Append one event. Write failures are swallowed.
    pub fn log(&self, event: &Event) {
        let Ok(line) = serde_json::to_string(event) else {
            return;
        };
        if self.echo_stderr {
            eprintln!("[{}] {} {}: {}", event.level, event.component, event.code, event.message);
        }
        let mut sink = self.sink.lock();
        if let Sink::File(file) = &mut *sink
            && writeln!(file, "{line}").is_err()
        {
            // Keep trying on later events; transient ENOSPC may clear.
            let _ = file.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Event, EventLevel, EventLog, EVENT_SCHEMA_VERSION};
    use serde_json::json;

    #[test]
    fn events_serialize_one_line_each_with_schema_version() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");
        let log = EventLog::open(&path, false);

        log.log(&Event::new("engine", EventLevel::Info, "escalation_advanced", "level up")
            .with_action("browser_restart")
            .with_level(1)
            .with_system_state("escalated")
            .with_details(json!({"track": "browser"})));
        log.log(&Event::new("state_store", EventLevel::Warning, "state_recovered", "corrupt"));

        let raw = std::fs::read_to_string(&path).expect("read log");
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).expect("line 0 parses");
        assert_eq!(first["schema_version"], EVENT_SCHEMA_VERSION);
        assert_eq!(first["code"], "escalation_advanced");
        assert_eq!(first["action_taken"], "browser_restart");
        assert_eq!(first["recovery_level"], 1);
        assert_eq!(first["details"]["track"], "browser");

        let second: serde_json::Value = serde_json::from_str(lines[1]).expect("line 1 parses");
        assert_eq!(second["level"], "WARNING");
        assert!(second.get("action_taken").is_none(), "empty optionals omitted");
    }

    #[test]
    fn disabled_log_swallows_events() {
        let log = EventLog::disabled();
        log.log(&Event::new("engine", EventLevel::Debug, "tick", "no-op"));
        assert!(log.path().is_none());
    }
}
