//! Escalation decision plane.
//!
//! `decide()` is pure: given the persisted state, one snapshot, and a
//! caller-supplied `now`, it returns the successor state and a decision.
//! No clock reads, no I/O — the whole escalation logic is unit-testable
//! against fabricated snapshots.
//!
//! Two linear tracks share the action namespace:
//!
//! - Browser track (levels 0..=2): SoftReload → BrowserRestart →
//!   SessionRestart, driven by sustained heartbeat staleness.
//! - System track (levels 0..=3): BrowserRestart → SessionRestart →
//!   ServiceRestart → Reboot, driven by service unreachability or
//!   browser-track exhaustion. Reboot is terminal until restart.
//!
//! Degraded mode is an orthogonal circuit breaker: sustained resource
//! pressure sets it, and policy may have it suppress browser-track
//! dispatch so a resource crisis is not compounded by a restart storm.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::config::RecoveryPolicy;
use crate::core::state::{Action, EscalationState, PendingVerification, Track};
use crate::monitor::HealthSnapshot;

/// Browser track actions, indexed by level.
pub const BROWSER_ACTIONS: [Action; 3] =
    [Action::SoftReload, Action::BrowserRestart, Action::SessionRestart];

/// System track actions, indexed by level.
pub const SYSTEM_ACTIONS: [Action; 4] = [
    Action::BrowserRestart,
    Action::SessionRestart,
    Action::ServiceRestart,
    Action::Reboot,
];

/// Why the engine held instead of acting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HoldReason {
    /// All signals healthy, nothing escalated.
    Healthy,
    /// Failure observed but below the consecutive-tick threshold.
    BelowThreshold,
    /// A dispatched action is still inside its verification delay.
    AwaitingVerification,
    /// Degraded mode suppresses browser-track dispatch.
    DegradedSuppressed,
    /// A reboot was issued this process lifetime; nothing more to do.
    RebootIssued,
    /// A reboot already happened today; the daily bound forbids another.
    RebootAlreadyToday,
    /// The rate limiter refused the action (set by the supervisor).
    RateLimited,
    /// Dispatch was attempted but aborted: the command failed to spawn, or
    /// a reboot marker could not be flushed first (set by the supervisor).
    DispatchFailed,
}

/// The per-tick decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Dispatch exactly this action.
    Dispatch {
        /// Action to run.
        action: Action,
        /// Requesting track.
        track: Track,
        /// Escalation level at decision time.
        level: u8,
    },
    /// Do nothing this tick.
    Hold(HoldReason),
    /// Escalation fully unwound to idle.
    Reset,
}

/// State transitions worth logging, produced alongside the decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// A dispatched action was judged successful at its verification delay.
    VerifiedRecovered {
        /// The verified action.
        action: Action,
        /// Requesting track.
        track: Track,
        /// Level at dispatch time.
        level: u8,
    },
    /// A dispatched action did not help; the track advances.
    VerifiedFailed {
        /// The failed action.
        action: Action,
        /// Requesting track.
        track: Track,
        /// Level at dispatch time.
        level: u8,
    },
    /// The browser track ran out of levels; system track takes over.
    BrowserTrackExhausted,
    /// Sustained health unwound all escalation levels.
    SettleReset,
    /// Sustained resource pressure set degraded mode.
    DegradedEntered,
    /// Sustained relief cleared degraded mode.
    DegradedCleared,
}

/// Result of folding one snapshot into the state.
#[derive(Debug, Clone)]
pub struct TickOutcome {
    /// Successor state (pre-dispatch; see [`EscalationEngine::note_dispatched`]).
    pub next: EscalationState,
    /// What to do this tick.
    pub decision: Decision,
    /// Transitions for the event log.
    pub transitions: Vec<Transition>,
}

/// Pure decision function over (state, snapshot, now).
pub struct EscalationEngine {
    policy: RecoveryPolicy,
}

impl EscalationEngine {
    /// Build an engine over a validated policy.
    #[must_use]
    pub const fn new(policy: RecoveryPolicy) -> Self {
        Self { policy }
    }

    /// The policy this engine decides under.
    #[must_use]
    pub const fn policy(&self) -> &RecoveryPolicy {
        &self.policy
    }

    /// Verification delay for an action. `None` for reboot: the process does
    /// not survive to verify it.
    #[must_use]
    pub const fn verify_delay(&self, action: Action) -> Option<Duration> {
        let secs = match action {
            Action::SoftReload => self.policy.escalation.soft_reload_verify_secs,
            Action::BrowserRestart => self.policy.escalation.browser_restart_verify_secs,
            Action::SessionRestart => self.policy.escalation.session_restart_verify_secs,
            Action::ServiceRestart => self.policy.escalation.service_restart_verify_secs,
            Action::Reboot => return None,
        };
        Some(Duration::from_secs(secs))
    }

    /// Fold one snapshot into `state` and decide. Pure and deterministic:
    /// identical `(state, snapshot, now)` always yields identical output.
    #[must_use]
    pub fn decide(
        &self,
        state: &EscalationState,
        snapshot: &HealthSnapshot,
        now: DateTime<Utc>,
    ) -> TickOutcome {
        let mut next = state.clone();
        let mut transitions = Vec::new();

        self.fold_counters(&mut next, snapshot, now, &mut transitions);

        // A dispatched reboot is terminal: hold until the process restarts.
        if next.reboot_issued {
            return TickOutcome {
                next,
                decision: Decision::Hold(HoldReason::RebootIssued),
                transitions,
            };
        }

        if let Some(pending) = next.pending {
            match self.judge_pending(&mut next, pending, snapshot, now, &mut transitions) {
                PendingStatus::StillWaiting => {
                    return TickOutcome {
                        next,
                        decision: Decision::Hold(HoldReason::AwaitingVerification),
                        transitions,
                    };
                }
                PendingStatus::RecoveredToIdle => {
                    return TickOutcome {
                        next,
                        decision: Decision::Reset,
                        transitions,
                    };
                }
                PendingStatus::Resolved => {}
            }
        }

        if self.settle_due(&next, snapshot, now) {
            next.browser_level = 0;
            next.browser_escalated_at = None;
            next.browser_exhausted = false;
            next.system_level = 0;
            next.system_escalated_at = None;
            transitions.push(Transition::SettleReset);
            return TickOutcome {
                next,
                decision: Decision::Reset,
                transitions,
            };
        }

        let decision = self.trigger(&next, now);
        TickOutcome {
            next,
            decision,
            transitions,
        }
    }

    /// Record a dispatched action into the state. Called by the supervisor
    /// after the rate limiter allowed it and the executor launched it.
    pub fn note_dispatched(
        &self,
        state: &mut EscalationState,
        action: Action,
        track: Track,
        level: u8,
        now: DateTime<Utc>,
    ) {
        match track {
            Track::Browser => state.browser_escalated_at = Some(now),
            Track::System => state.system_escalated_at = Some(now),
        }
        if action == Action::Reboot {
            // No pending entry: there is no later sample to verify against.
            state.reboot_issued = true;
            state.last_reboot_time = Some(now);
        } else {
            state.pending = Some(PendingVerification {
                action,
                track,
                level,
                dispatched_at: now,
            });
        }
    }

    /// Record a dispatch whose command could not even be spawned. The track
    /// advances exactly as on a verified failure: an unspawnable remedy is
    /// a failed remedy, and waiting out a verification delay for a command
    /// that never ran would only stall recovery.
    pub fn note_spawn_failed(&self, state: &mut EscalationState, track: Track, level: u8) {
        match track {
            Track::Browser => {
                if level >= (BROWSER_ACTIONS.len() as u8) - 1 {
                    state.browser_exhausted = true;
                } else {
                    state.browser_level = level + 1;
                }
            }
            Track::System => {
                if level < (SYSTEM_ACTIONS.len() as u8) - 1 {
                    state.system_level = level + 1;
                }
            }
        }
    }

    fn fold_counters(
        &self,
        state: &mut EscalationState,
        snapshot: &HealthSnapshot,
        now: DateTime<Utc>,
        transitions: &mut Vec<Transition>,
    ) {
        // The settle anchor follows observed health alone: a rung that was
        // judged failed but whose effect landed late (or a fault that cleared
        // on its own) must still unwind once health holds long enough.
        if snapshot.render_probe_ok && snapshot.service_reachable {
            if state.healthy_since.is_none() {
                state.healthy_since = Some(now);
            }
        } else {
            state.healthy_since = None;
        }

        if snapshot.render_probe_ok {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        }
        if snapshot.service_reachable {
            state.service_consecutive_failures = 0;
        } else {
            state.service_consecutive_failures =
                state.service_consecutive_failures.saturating_add(1);
        }

        let resources = &self.policy.resources;
        if snapshot.resource_pressure {
            state.pressure_ticks = state.pressure_ticks.saturating_add(1);
            state.clean_pressure_ticks = 0;
            if !state.degraded_mode && state.pressure_ticks >= resources.degraded_after_ticks {
                state.degraded_mode = true;
                transitions.push(Transition::DegradedEntered);
            }
        } else {
            state.pressure_ticks = 0;
            if state.degraded_mode {
                state.clean_pressure_ticks = state.clean_pressure_ticks.saturating_add(1);
                if state.clean_pressure_ticks >= resources.degraded_clear_ticks {
                    state.degraded_mode = false;
                    state.clean_pressure_ticks = 0;
                    transitions.push(Transition::DegradedCleared);
                }
            } else {
                state.clean_pressure_ticks = 0;
            }
        }
    }

    fn judge_pending(
        &self,
        state: &mut EscalationState,
        pending: PendingVerification,
        snapshot: &HealthSnapshot,
        now: DateTime<Utc>,
        transitions: &mut Vec<Transition>,
    ) -> PendingStatus {
        let Some(delay) = self.verify_delay(pending.action) else {
            // Reboot never reaches here: `reboot_issued` halts earlier.
            state.pending = None;
            return PendingStatus::Resolved;
        };
        let due = now
            .signed_duration_since(pending.dispatched_at)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= delay);
        if !due {
            return PendingStatus::StillWaiting;
        }
        state.pending = None;

        let healthy = match pending.track {
            Track::Browser => snapshot.render_probe_ok,
            Track::System => snapshot.service_reachable && snapshot.render_probe_ok,
        };
        if healthy {
            state.last_recovery_time = Some(now);
            transitions.push(Transition::VerifiedRecovered {
                action: pending.action,
                track: pending.track,
                level: pending.level,
            });
            // A successful soft reload unwinds to idle immediately; higher
            // levels hold where they are so a flapping browser does not get
            // soft-reload thrash. The settle period does the unwinding.
            if pending.track == Track::Browser && pending.level == 0 {
                state.browser_level = 0;
                state.browser_escalated_at = None;
                return PendingStatus::RecoveredToIdle;
            }
            return PendingStatus::Resolved;
        }

        transitions.push(Transition::VerifiedFailed {
            action: pending.action,
            track: pending.track,
            level: pending.level,
        });
        match pending.track {
            Track::Browser => {
                if pending.level >= (BROWSER_ACTIONS.len() as u8) - 1 {
                    state.browser_exhausted = true;
                    transitions.push(Transition::BrowserTrackExhausted);
                } else {
                    state.browser_level = pending.level + 1;
                }
            }
            Track::System => {
                if pending.level < (SYSTEM_ACTIONS.len() as u8) - 1 {
                    state.system_level = pending.level + 1;
                }
            }
        }
        PendingStatus::Resolved
    }

    fn settle_due(
        &self,
        state: &EscalationState,
        snapshot: &HealthSnapshot,
        now: DateTime<Utc>,
    ) -> bool {
        let escalated = state.browser_level > 0
            || state.system_level > 0
            || state.browser_exhausted;
        if !escalated || state.pending.is_some() {
            return false;
        }
        if !snapshot.service_reachable || !snapshot.render_probe_ok {
            return false;
        }
        state.healthy_since.is_some_and(|since| {
            now.signed_duration_since(since)
                .to_std()
                .is_ok_and(|elapsed| {
                    elapsed >= Duration::from_secs(self.policy.escalation.settle_secs)
                })
        })
    }

    fn trigger(&self, state: &EscalationState, now: DateTime<Utc>) -> Decision {
        let system_triggered = state.service_consecutive_failures
            >= self.policy.service.fail_threshold
            || state.browser_exhausted;
        let browser_triggered =
            state.consecutive_failures >= self.policy.browser.fail_threshold;

        // System track takes precedence: an unreachable service is the root
        // cause behind most stale heartbeats.
        if system_triggered {
            let level = state.system_level.min((SYSTEM_ACTIONS.len() as u8) - 1);
            let action = SYSTEM_ACTIONS[usize::from(level)];
            if action == Action::Reboot && state.rebooted_on(now) {
                return Decision::Hold(HoldReason::RebootAlreadyToday);
            }
            return Decision::Dispatch {
                action,
                track: Track::System,
                level,
            };
        }
        if browser_triggered {
            if state.degraded_mode && self.policy.resources.suppress_browser_track {
                return Decision::Hold(HoldReason::DegradedSuppressed);
            }
            let level = state.browser_level.min((BROWSER_ACTIONS.len() as u8) - 1);
            return Decision::Dispatch {
                action: BROWSER_ACTIONS[usize::from(level)],
                track: Track::Browser,
                level,
            };
        }

        if state.consecutive_failures == 0 && state.service_consecutive_failures == 0 {
            Decision::Hold(HoldReason::Healthy)
        } else {
            Decision::Hold(HoldReason::BelowThreshold)
        }
    }
}

enum PendingStatus {
    StillWaiting,
    Resolved,
    RecoveredToIdle,
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{Decision, EscalationEngine, HoldReason, Transition};
    use crate::core::config::RecoveryPolicy;
    use crate::core::state::{Action, EscalationState, Track};
    use crate::monitor::HealthSnapshot;
    use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};

    pub(crate) fn test_policy() -> RecoveryPolicy {
        toml::from_str(include_str!("../../tests/fixtures/policy.toml"))
            .expect("test policy parses")
    }

    fn engine() -> EscalationEngine {
        EscalationEngine::new(test_policy())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    fn unhealthy_browser(now: DateTime<Utc>) -> HealthSnapshot {
        HealthSnapshot {
            render_probe_ok: false,
            browser_heartbeat_age: Some(std::time::Duration::from_secs(600)),
            ..HealthSnapshot::healthy(now)
        }
    }

    fn unreachable_service(now: DateTime<Utc>) -> HealthSnapshot {
        HealthSnapshot {
            service_reachable: false,
            service_latency: None,
            ..HealthSnapshot::healthy(now)
        }
    }

    #[test]
    fn healthy_snapshot_holds_healthy() {
        let engine = engine();
        let outcome = engine.decide(&EscalationState::default(), &HealthSnapshot::healthy(t0()), t0());
        assert_eq!(outcome.decision, Decision::Hold(HoldReason::Healthy));
        assert_eq!(outcome.next.consecutive_failures, 0);
    }

    #[test]
    fn single_failure_below_threshold_holds() {
        let engine = engine();
        let outcome = engine.decide(&EscalationState::default(), &unhealthy_browser(t0()), t0());
        assert_eq!(outcome.decision, Decision::Hold(HoldReason::BelowThreshold));
        assert_eq!(outcome.next.consecutive_failures, 1);
    }

    #[test]
    fn threshold_reached_dispatches_level_zero_soft_reload() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.consecutive_failures = 1; // threshold is 2
        let outcome = engine.decide(&state, &unhealthy_browser(t0()), t0());
        assert_eq!(
            outcome.decision,
            Decision::Dispatch {
                action: Action::SoftReload,
                track: Track::Browser,
                level: 0
            }
        );
    }

    #[test]
    fn decide_is_pure_identical_inputs_identical_outputs() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.consecutive_failures = 3;
        state.browser_level = 1;
        let snapshot = unhealthy_browser(t0());
        let a = engine.decide(&state, &snapshot, t0());
        let b = engine.decide(&state, &snapshot, t0());
        assert_eq!(a.decision, b.decision);
        assert_eq!(a.next, b.next);
        assert_eq!(a.transitions, b.transitions);
    }

    #[test]
    fn pending_within_delay_holds_awaiting() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.consecutive_failures = 5;
        engine.note_dispatched(&mut state, Action::SoftReload, Track::Browser, 0, t0());
        let now = t0() + ChronoDuration::seconds(10); // delay is 30s
        let outcome = engine.decide(&state, &unhealthy_browser(now), now);
        assert_eq!(outcome.decision, Decision::Hold(HoldReason::AwaitingVerification));
        assert!(outcome.next.pending.is_some());
    }

    #[test]
    fn soft_reload_verified_success_resets_to_idle() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.consecutive_failures = 5;
        engine.note_dispatched(&mut state, Action::SoftReload, Track::Browser, 0, t0());
        let now = t0() + ChronoDuration::seconds(31);
        let outcome = engine.decide(&state, &HealthSnapshot::healthy(now), now);
        assert_eq!(outcome.decision, Decision::Reset);
        assert_eq!(outcome.next.browser_level, 0);
        assert!(outcome.next.pending.is_none());
        assert!(outcome.transitions.contains(&Transition::VerifiedRecovered {
            action: Action::SoftReload,
            track: Track::Browser,
            level: 0
        }));
    }

    #[test]
    fn soft_reload_verified_failure_advances_to_level_one() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.consecutive_failures = 5;
        engine.note_dispatched(&mut state, Action::SoftReload, Track::Browser, 0, t0());
        let now = t0() + ChronoDuration::seconds(31);
        let outcome = engine.decide(&state, &unhealthy_browser(now), now);
        assert_eq!(outcome.next.browser_level, 1);
        // Still failing past threshold: next level's action goes out now.
        assert_eq!(
            outcome.decision,
            Decision::Dispatch {
                action: Action::BrowserRestart,
                track: Track::Browser,
                level: 1
            }
        );
    }

    #[test]
    fn browser_restart_success_holds_at_level_one_no_reset() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.browser_level = 1;
        state.consecutive_failures = 5;
        engine.note_dispatched(&mut state, Action::BrowserRestart, Track::Browser, 1, t0());
        let now = t0() + ChronoDuration::seconds(61);
        let outcome = engine.decide(&state, &HealthSnapshot::healthy(now), now);
        assert!(matches!(outcome.decision, Decision::Hold(HoldReason::Healthy)));
        assert_eq!(outcome.next.browser_level, 1, "no immediate reset prevents thrash");
        assert_eq!(outcome.next.last_recovery_time, Some(now));
    }

    #[test]
    fn session_restart_failure_exhausts_browser_track() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.browser_level = 2;
        state.consecutive_failures = 9;
        engine.note_dispatched(&mut state, Action::SessionRestart, Track::Browser, 2, t0());
        let now = t0() + ChronoDuration::seconds(91);
        let outcome = engine.decide(&state, &unhealthy_browser(now), now);
        assert!(outcome.next.browser_exhausted);
        assert!(outcome.transitions.contains(&Transition::BrowserTrackExhausted));
        // Exhaustion hands control to the system track on the same tick.
        assert_eq!(
            outcome.decision,
            Decision::Dispatch {
                action: Action::BrowserRestart,
                track: Track::System,
                level: 0
            }
        );
    }

    #[test]
    fn sustained_service_failure_triggers_system_track() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.service_consecutive_failures = 1; // threshold 2
        let outcome = engine.decide(&state, &unreachable_service(t0()), t0());
        assert_eq!(
            outcome.decision,
            Decision::Dispatch {
                action: Action::BrowserRestart,
                track: Track::System,
                level: 0
            }
        );
    }

    #[test]
    fn single_service_blip_is_absorbed() {
        let engine = engine();
        let state = EscalationState::default();
        let blip = engine.decide(&state, &unreachable_service(t0()), t0());
        assert_eq!(blip.decision, Decision::Hold(HoldReason::BelowThreshold));

        let next_tick = t0() + ChronoDuration::seconds(15);
        let recovered = engine.decide(&blip.next, &HealthSnapshot::healthy(next_tick), next_tick);
        assert_eq!(recovered.decision, Decision::Hold(HoldReason::Healthy));
        assert_eq!(recovered.next.service_consecutive_failures, 0);
        assert_eq!(recovered.next.system_level, 0, "no escalation from a single blip");
    }

    #[test]
    fn system_track_reaches_reboot_and_halts_after() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.system_level = 3;
        state.service_consecutive_failures = 20;
        let outcome = engine.decide(&state, &unreachable_service(t0()), t0());
        assert_eq!(
            outcome.decision,
            Decision::Dispatch {
                action: Action::Reboot,
                track: Track::System,
                level: 3
            }
        );

        let mut after = outcome.next;
        engine.note_dispatched(&mut after, Action::Reboot, Track::System, 3, t0());
        assert!(after.reboot_issued);
        let later = t0() + ChronoDuration::seconds(15);
        let halted = engine.decide(&after, &unreachable_service(later), later);
        assert_eq!(halted.decision, Decision::Hold(HoldReason::RebootIssued));
    }

    #[test]
    fn reboot_already_today_is_suppressed() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.system_level = 3;
        state.service_consecutive_failures = 20;
        state.last_reboot_time = Some(t0() - ChronoDuration::hours(3));
        let outcome = engine.decide(&state, &unreachable_service(t0()), t0());
        assert_eq!(outcome.decision, Decision::Hold(HoldReason::RebootAlreadyToday));

        // The next calendar day the bound reopens.
        let tomorrow = t0() + ChronoDuration::days(1);
        let outcome = engine.decide(&state, &unreachable_service(tomorrow), tomorrow);
        assert!(matches!(outcome.decision, Decision::Dispatch { action: Action::Reboot, .. }));
    }

    #[test]
    fn settle_period_resets_both_tracks() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.browser_level = 1;
        state.system_level = 2;
        state.healthy_since = Some(t0());
        let now = t0() + ChronoDuration::seconds(301); // settle is 300s
        let outcome = engine.decide(&state, &HealthSnapshot::healthy(now), now);
        assert_eq!(outcome.decision, Decision::Reset);
        assert_eq!(outcome.next.browser_level, 0);
        assert_eq!(outcome.next.system_level, 0);
        assert!(!outcome.next.browser_exhausted);
        assert!(outcome.transitions.contains(&Transition::SettleReset));
    }

    #[test]
    fn settle_does_not_fire_before_period() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.browser_level = 1;
        state.healthy_since = Some(t0());
        let now = t0() + ChronoDuration::seconds(120);
        let outcome = engine.decide(&state, &HealthSnapshot::healthy(now), now);
        assert_eq!(outcome.decision, Decision::Hold(HoldReason::Healthy));
        assert_eq!(outcome.next.browser_level, 1);
    }

    #[test]
    fn unhealthy_tick_restarts_the_settle_clock() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.browser_level = 1;
        state.healthy_since = Some(t0());
        let relapse = t0() + ChronoDuration::seconds(150);
        let mut state = engine.decide(&state, &unhealthy_browser(relapse), relapse).next;
        assert_eq!(state.healthy_since, None);

        let back = relapse + ChronoDuration::seconds(15);
        state = engine.decide(&state, &HealthSnapshot::healthy(back), back).next;
        assert_eq!(state.healthy_since, Some(back), "anchor restarts at the new run");
        assert_eq!(state.browser_level, 1, "interrupted health must not settle");
    }

    #[test]
    fn settle_resets_a_failed_rung_when_health_returns_on_its_own() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.consecutive_failures = 5;
        engine.note_dispatched(&mut state, Action::SoftReload, Track::Browser, 0, t0());

        // Still stale at the verification delay: the rung is judged failed
        // and the level advances without any verified recovery.
        let verify = t0() + ChronoDuration::seconds(31);
        let outcome = engine.decide(&state, &unhealthy_browser(verify), verify);
        let mut state = outcome.next;
        assert_eq!(state.browser_level, 1);
        assert_eq!(state.last_recovery_time, None);

        // The remedy lands late (or the fault clears itself) before the next
        // rung goes out; sustained health alone must unwind the level.
        let mut now = verify;
        for _ in 0..25 {
            now += ChronoDuration::seconds(15);
            state = engine.decide(&state, &HealthSnapshot::healthy(now), now).next;
        }
        assert_eq!(state.browser_level, 0);
        assert!(!state.is_escalated());
    }

    #[test]
    fn degraded_mode_sets_and_clears_with_hysteresis() {
        let engine = engine();
        let mut state = EscalationState::default();
        let mut now = t0();
        let pressured = |at| HealthSnapshot {
            resource_pressure: true,
            load_1m: Some(9.0),
            ..HealthSnapshot::healthy(at)
        };

        // degraded_after_ticks = 4
        for tick in 1..=4 {
            let outcome = engine.decide(&state, &pressured(now), now);
            state = outcome.next;
            if tick < 4 {
                assert!(!state.degraded_mode, "tick {tick}: not yet degraded");
            } else {
                assert!(state.degraded_mode);
                assert!(outcome.transitions.contains(&Transition::DegradedEntered));
            }
            now += ChronoDuration::seconds(15);
        }

        // degraded_clear_ticks = 8
        for tick in 1..=8 {
            let outcome = engine.decide(&state, &HealthSnapshot::healthy(now), now);
            state = outcome.next;
            if tick < 8 {
                assert!(state.degraded_mode, "tick {tick}: still degraded");
            } else {
                assert!(!state.degraded_mode);
                assert!(outcome.transitions.contains(&Transition::DegradedCleared));
            }
            now += ChronoDuration::seconds(15);
        }
    }

    #[test]
    fn degraded_mode_suppresses_browser_track_but_not_system() {
        let engine = engine();
        let mut state = EscalationState::default();
        state.degraded_mode = true;
        state.pressure_ticks = 10;
        state.consecutive_failures = 5;
        let snapshot = HealthSnapshot {
            resource_pressure: true,
            ..unhealthy_browser(t0())
        };
        let outcome = engine.decide(&state, &snapshot, t0());
        assert_eq!(outcome.decision, Decision::Hold(HoldReason::DegradedSuppressed));
        assert_eq!(outcome.next.consecutive_failures, 6, "failures still counted while held");

        // Service loss is critical: the system track is never suppressed.
        state.service_consecutive_failures = 5;
        let snapshot = HealthSnapshot {
            resource_pressure: true,
            service_reachable: false,
            ..unhealthy_browser(t0())
        };
        let outcome = engine.decide(&state, &snapshot, t0());
        assert!(matches!(
            outcome.decision,
            Decision::Dispatch { track: Track::System, .. }
        ));
    }
}
