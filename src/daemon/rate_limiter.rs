//! Sliding-window rate limits over the persisted dispatch history.
//!
//! The limiter owns no clock and no storage: it reads and prunes the
//! [`ActionHistory`] that lives inside the persisted state, so limits
//! survive restarts for free. Windows are rolling (not calendar-aligned)
//! and entries are pruned lazily on each `allow()` call.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::core::config::LimitPolicy;
use crate::core::state::{Action, ActionHistory, ActionRecord, LimitClass};

const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Limiter response. A refusal is control flow, not an error: the engine
/// holds its level and retries on a later tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// The action may be dispatched now.
    Allowed,
    /// The global cooldown since the previous dispatch has not elapsed.
    CoolingDown {
        /// Time left until the cooldown opens.
        remaining: Duration,
    },
    /// The class's rolling window is at its configured bound.
    WindowFull {
        /// The exhausted class.
        class: LimitClass,
        /// Configured bound for the window.
        limit: u32,
        /// Window length.
        window: Duration,
    },
}

impl Verdict {
    /// Whether the dispatch may proceed.
    #[must_use]
    pub const fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Stateless policy evaluator over a mutable [`ActionHistory`].
#[derive(Debug, Clone)]
pub struct RateLimiter {
    limits: LimitPolicy,
}

impl RateLimiter {
    /// Build a limiter over a validated limit policy.
    #[must_use]
    pub const fn new(limits: LimitPolicy) -> Self {
        Self { limits }
    }

    /// Check whether `action` may be dispatched at `now`, pruning expired
    /// records as a side effect. Does NOT record the dispatch; call
    /// [`Self::record`] once the action has actually been launched.
    pub fn allow(&self, history: &mut ActionHistory, action: Action, now: DateTime<Utc>) -> Verdict {
        let cooldown = Duration::from_secs(self.limits.cooldown_secs);
        if let Some(last) = history.last_dispatch
            && let Ok(elapsed) = now.signed_duration_since(last).to_std()
            && elapsed < cooldown
        {
            return Verdict::CoolingDown {
                remaining: cooldown - elapsed,
            };
        }

        let Some(class) = action.limit_class() else {
            return Verdict::Allowed;
        };
        let (limit, window) = self.bound(class);
        let records = history.records_mut(class);
        records.retain(|record| within(record, now, window));
        if records.len() as u32 >= limit {
            return Verdict::WindowFull {
                class,
                limit,
                window,
            };
        }
        Verdict::Allowed
    }

    /// Record a launched dispatch. Every action feeds the global cooldown;
    /// only windowed classes get a history entry.
    pub fn record(&self, history: &mut ActionHistory, action: Action, now: DateTime<Utc>) {
        history.last_dispatch = Some(now);
        if let Some(class) = action.limit_class() {
            history.records_mut(class).push(ActionRecord {
                class,
                timestamp: now,
            });
        }
    }

    /// Remaining dispatches in the class's window at `now`, for status output.
    #[must_use]
    pub fn remaining(&self, history: &ActionHistory, class: LimitClass, now: DateTime<Utc>) -> u32 {
        let (limit, window) = self.bound(class);
        let used = history
            .records(class)
            .iter()
            .filter(|record| within(record, now, window))
            .count() as u32;
        limit.saturating_sub(used)
    }

    const fn bound(&self, class: LimitClass) -> (u32, Duration) {
        match class {
            LimitClass::BrowserRestart => (self.limits.max_browser_restarts_per_hour, HOUR),
            LimitClass::ServiceRestart => (self.limits.max_service_restarts_per_hour, HOUR),
            LimitClass::Reboot => (self.limits.max_reboots_per_day, DAY),
        }
    }
}

fn within(record: &ActionRecord, now: DateTime<Utc>, window: Duration) -> bool {
    now.signed_duration_since(record.timestamp)
        .to_std()
        .is_ok_and(|age| age < window)
}
