//! Per-tick orchestration: decide, gate, dispatch, persist, log.
//!
//! `run_tick` is the whole control flow for one tick and takes the snapshot
//! and clock as arguments, so scripted multi-tick scenarios drive it
//! directly in tests with a fake runner and fabricated snapshots.
//!
//! Ordering invariants:
//! - at most one action is dispatched per tick;
//! - state is flushed to disk before the tick ends;
//! - for a reboot, the issued marker is flushed BEFORE the command is
//!   dispatched, so the post-boot process cannot re-issue it.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::core::config::RecoveryPolicy;
use crate::core::errors::KwdError;
use crate::core::state::{Action, EscalationState, LoadSource, StateStore, Track};
use crate::daemon::engine::{Decision, EscalationEngine, HoldReason, Transition};
use crate::daemon::executor::{CommandRunner, RecoveryExecutor, ShellRunner};
use crate::daemon::rate_limiter::{RateLimiter, Verdict};
use crate::logger::{Event, EventLevel, EventLog};
use crate::monitor::HealthSnapshot;

/// Owns the escalation state and wires the decision plane to the host.
pub struct Supervisor<R> {
    engine: EscalationEngine,
    limiter: RateLimiter,
    executor: RecoveryExecutor<R>,
    store: StateStore,
    log: Arc<EventLog>,
    state: EscalationState,
}

impl Supervisor<ShellRunner> {
    /// Production wiring: shell runner, state store and event log at the
    /// policy's configured paths.
    #[must_use]
    pub fn open(policy: RecoveryPolicy, log: Arc<EventLog>) -> Self {
        let store = StateStore::new(policy.daemon.state_file.clone());
        let runner = ShellRunner::new(Arc::clone(&log));
        Self::with_runner(policy, runner, store, log)
    }
}

impl<R: CommandRunner> Supervisor<R> {
    /// Wire a supervisor over an arbitrary runner and store. Loads persisted
    /// state immediately and logs how the load went.
    pub fn with_runner(
        policy: RecoveryPolicy,
        runner: R,
        store: StateStore,
        log: Arc<EventLog>,
    ) -> Self {
        let (state, source) = store.load();
        match &source {
            LoadSource::Fresh => log.log(&Event::new(
                "state_store",
                EventLevel::Info,
                "state_fresh",
                "no persisted state; starting from defaults",
            )),
            LoadSource::Persisted => log.log(
                &Event::new(
                    "state_store",
                    EventLevel::Info,
                    "state_loaded",
                    "persisted state restored",
                )
                .with_details(serde_json::json!({
                    "browser_level": state.browser_level,
                    "system_level": state.system_level,
                    "degraded_mode": state.degraded_mode,
                })),
            ),
            LoadSource::Recovered { details } => {
                let err = KwdError::StateCorrupt {
                    path: store.path().to_path_buf(),
                    details: details.clone(),
                };
                log.log(
                    &Event::new(
                        "state_store",
                        EventLevel::Warning,
                        "state_recovered",
                        "state file unusable; starting from defaults",
                    )
                    .with_details(serde_json::json!({
                        "code": err.code(),
                        "details": details,
                    })),
                );
            }
        }

        let limiter = RateLimiter::new(policy.limits.clone());
        let executor = RecoveryExecutor::new(runner, policy.commands.clone());
        Self {
            engine: EscalationEngine::new(policy),
            limiter,
            executor,
            store,
            log,
            state,
        }
    }

    /// Current in-memory state.
    #[must_use]
    pub const fn state(&self) -> &EscalationState {
        &self.state
    }

    /// The executor, mainly so tests can reach their scripted runner.
    #[must_use]
    pub const fn executor(&self) -> &RecoveryExecutor<R> {
        &self.executor
    }

    /// Run one tick against `snapshot`. Returns the effective decision (a
    /// rate-limited dispatch comes back as `Hold(RateLimited)`).
    pub fn run_tick(&mut self, snapshot: &HealthSnapshot, now: DateTime<Utc>) -> Decision {
        let outcome = self.engine.decide(&self.state, snapshot, now);
        self.state = outcome.next;
        for transition in &outcome.transitions {
            self.log_transition(*transition);
        }

        let effective = match outcome.decision {
            Decision::Dispatch {
                action,
                track,
                level,
            } => self.dispatch(action, track, level, now),
            Decision::Hold(reason) => {
                self.log_hold(reason, snapshot);
                Decision::Hold(reason)
            }
            Decision::Reset => {
                self.log.log(
                    &Event::new(
                        "engine",
                        EventLevel::Info,
                        "escalation_reset",
                        "all escalation levels unwound to idle",
                    )
                    .with_system_state(self.coarse_state()),
                );
                Decision::Reset
            }
        };

        self.persist();
        effective
    }

    fn dispatch(
        &mut self,
        action: Action,
        track: Track,
        level: u8,
        now: DateTime<Utc>,
    ) -> Decision {
        match self.limiter.allow(&mut self.state.history, action, now) {
            Verdict::Allowed => {}
            Verdict::CoolingDown { remaining } => {
                self.log.log(
                    &Event::new(
                        "rate_limiter",
                        EventLevel::Info,
                        "action_rate_limited",
                        format!("{action} held: global cooldown for {}s", remaining.as_secs()),
                    )
                    .with_action(action.name())
                    .with_level(level)
                    .with_system_state(self.coarse_state()),
                );
                return Decision::Hold(HoldReason::RateLimited);
            }
            Verdict::WindowFull {
                class,
                limit,
                window,
            } => {
                self.log.log(
                    &Event::new(
                        "rate_limiter",
                        EventLevel::Warning,
                        "action_rate_limited",
                        format!(
                            "{action} held: {limit} dispatches of {class:?} in the last {}s",
                            window.as_secs()
                        ),
                    )
                    .with_action(action.name())
                    .with_level(level)
                    .with_system_state(self.coarse_state()),
                );
                return Decision::Hold(HoldReason::RateLimited);
            }
        }

        if action == Action::Reboot {
            return self.dispatch_reboot(track, level, now);
        }

        match self.executor.dispatch(action) {
            Ok(()) => {
                self.engine
                    .note_dispatched(&mut self.state, action, track, level, now);
                self.limiter.record(&mut self.state.history, action, now);
                self.log.log(
                    &Event::new(
                        "executor",
                        EventLevel::Info,
                        "action_dispatched",
                        format!("{action} dispatched ({track} track, level {level})"),
                    )
                    .with_action(action.name())
                    .with_level(level)
                    .with_system_state(self.coarse_state()),
                );
                Decision::Dispatch {
                    action,
                    track,
                    level,
                }
            }
            Err(err) => {
                // The remedy never ran; advance the track as on a verified
                // failure instead of waiting out a pointless delay.
                self.engine.note_spawn_failed(&mut self.state, track, level);
                self.log.log(
                    &Event::new(
                        "executor",
                        EventLevel::Critical,
                        "command_spawn_failed",
                        err.to_string(),
                    )
                    .with_action(action.name())
                    .with_level(level)
                    .with_details(serde_json::json!({ "code": err.code() }))
                    .with_system_state(self.coarse_state()),
                );
                Decision::Hold(HoldReason::DispatchFailed)
            }
        }
    }

    fn dispatch_reboot(&mut self, track: Track, level: u8, now: DateTime<Utc>) -> Decision {
        // Marker first, then flush, then the command. If the flush fails the
        // reboot is NOT dispatched: re-issuing one after boot is worse than
        // staying up broken for another day-window.
        let prior_reboot_time = self.state.last_reboot_time;
        let prior_dispatch = self.state.history.last_dispatch;
        self.engine
            .note_dispatched(&mut self.state, Action::Reboot, track, level, now);
        self.limiter
            .record(&mut self.state.history, Action::Reboot, now);
        if let Err(err) = self.store.save(&self.state) {
            self.rollback_reboot(prior_reboot_time, prior_dispatch);
            self.log.log(
                &Event::new(
                    "state_store",
                    EventLevel::Critical,
                    "reboot_marker_unpersisted",
                    format!("reboot withheld: state flush failed: {err}"),
                )
                .with_action(Action::Reboot.name())
                .with_level(level),
            );
            return Decision::Hold(HoldReason::DispatchFailed);
        }

        match self.executor.dispatch(Action::Reboot) {
            Ok(()) => {
                self.log.log(
                    &Event::new(
                        "executor",
                        EventLevel::Critical,
                        "reboot_dispatched",
                        "node reboot dispatched; supervisor halts until restart",
                    )
                    .with_action(Action::Reboot.name())
                    .with_level(level)
                    .with_system_state(self.coarse_state()),
                );
                Decision::Dispatch {
                    action: Action::Reboot,
                    track,
                    level,
                }
            }
            Err(err) => {
                // Re-arm: a marker for a reboot that never launched would
                // halt the engine until someone restarts the process.
                self.rollback_reboot(prior_reboot_time, prior_dispatch);
                self.log.log(
                    &Event::new(
                        "executor",
                        EventLevel::Critical,
                        "command_spawn_failed",
                        err.to_string(),
                    )
                    .with_action(Action::Reboot.name())
                    .with_level(level)
                    .with_details(serde_json::json!({ "code": err.code() })),
                );
                Decision::Hold(HoldReason::DispatchFailed)
            }
        }
    }

    /// Undo the in-memory bookkeeping of a reboot that never launched, so
    /// the daily bound does not count a reboot that did not happen.
    fn rollback_reboot(
        &mut self,
        prior_reboot_time: Option<DateTime<Utc>>,
        prior_dispatch: Option<DateTime<Utc>>,
    ) {
        self.state.reboot_issued = false;
        self.state.last_reboot_time = prior_reboot_time;
        self.state.history.reboots.pop();
        self.state.history.last_dispatch = prior_dispatch;
    }

    fn persist(&mut self) {
        if let Err(err) = self.store.save(&self.state) {
            // Not fatal: the next tick retries; only durability is degraded.
            self.log.log(
                &Event::new(
                    "state_store",
                    EventLevel::Warning,
                    "state_save_failed",
                    err.to_string(),
                )
                .with_details(serde_json::json!({ "code": err.code() })),
            );
        }
    }

    fn log_transition(&self, transition: Transition) {
        let event = match transition {
            Transition::VerifiedRecovered {
                action,
                track,
                level,
            } => Event::new(
                "engine",
                EventLevel::Info,
                "recovery_verified",
                format!("{action} verified successful ({track} track, level {level})"),
            )
            .with_action(action.name())
            .with_level(level),
            Transition::VerifiedFailed {
                action,
                track,
                level,
            } => Event::new(
                "engine",
                EventLevel::Warning,
                "escalation_advanced",
                format!("{action} did not recover the {track} track; escalating past level {level}"),
            )
            .with_action(action.name())
            .with_level(level),
            Transition::BrowserTrackExhausted => Event::new(
                "engine",
                EventLevel::Warning,
                "browser_track_exhausted",
                "browser track out of levels; system track takes over",
            ),
            Transition::SettleReset => Event::new(
                "engine",
                EventLevel::Info,
                "settle_reset",
                "sustained health; escalation unwound",
            ),
            Transition::DegradedEntered => Event::new(
                "engine",
                EventLevel::Warning,
                "degraded_entered",
                "sustained resource pressure; degraded mode set",
            ),
            Transition::DegradedCleared => Event::new(
                "engine",
                EventLevel::Info,
                "degraded_cleared",
                "resource pressure relieved; degraded mode cleared",
            ),
        };
        self.log.log(&event.with_system_state(self.coarse_state()));
    }

    fn log_hold(&self, reason: HoldReason, snapshot: &HealthSnapshot) {
        let (level, code, message) = match reason {
            HoldReason::Healthy => (EventLevel::Debug, "tick_healthy", "all signals healthy"),
            HoldReason::BelowThreshold => (
                EventLevel::Debug,
                "tick_below_threshold",
                "failures observed but below threshold",
            ),
            HoldReason::AwaitingVerification => (
                EventLevel::Debug,
                "awaiting_verification",
                "dispatched action inside its verification delay",
            ),
            HoldReason::DegradedSuppressed => (
                EventLevel::Info,
                "browser_track_suppressed",
                "degraded mode suppresses browser-track dispatch",
            ),
            HoldReason::RebootIssued => (
                EventLevel::Info,
                "reboot_pending",
                "reboot already issued; holding until restart",
            ),
            HoldReason::RebootAlreadyToday => (
                EventLevel::Warning,
                "reboot_suppressed",
                "reboot needed but one already happened today",
            ),
            // RateLimited is produced by dispatch(), which logs it itself.
            HoldReason::RateLimited | HoldReason::DispatchFailed => return,
        };
        self.log.log(
            &Event::new("engine", level, code, message)
                .with_details(serde_json::json!({
                    "service_reachable": snapshot.service_reachable,
                    "render_probe_ok": snapshot.render_probe_ok,
                    "resource_pressure": snapshot.resource_pressure,
                }))
                .with_system_state(self.coarse_state()),
        );
    }

    fn coarse_state(&self) -> &'static str {
        if self.state.degraded_mode {
            "degraded"
        } else if self.state.is_escalated() {
            "escalated"
        } else {
            "healthy"
        }
    }
}
