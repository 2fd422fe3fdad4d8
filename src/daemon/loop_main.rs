//! Fixed-interval tick loop with signal-driven shutdown.
//!
//! One tick = sample, decide, act, persist. The loop sleeps out the
//! remainder of the interval rather than a fixed time after each tick, so
//! cadence stays fixed even when a probe eats most of the interval. Sleep
//! happens in short slices so SIGTERM turns into a clean exit within a
//! fraction of a second, never mid-persist.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::Utc;
use signal_hook::consts::{SIGINT, SIGTERM};

use crate::core::config::RecoveryPolicy;
use crate::core::errors::{KwdError, Result};
use crate::daemon::supervisor::Supervisor;
use crate::logger::{Event, EventLevel, EventLog};
use crate::monitor::HealthSampler;

const SLEEP_SLICE: Duration = Duration::from_millis(200);

/// Run the supervisor loop until SIGTERM/SIGINT.
pub fn run(policy: RecoveryPolicy, echo_stderr: bool) -> Result<()> {
    let log = Arc::new(EventLog::open(&policy.daemon.event_log, echo_stderr));
    let shutdown = Arc::new(AtomicBool::new(false));
    for sig in [SIGTERM, SIGINT] {
        signal_hook::flag::register(sig, Arc::clone(&shutdown)).map_err(|err| {
            KwdError::Runtime {
                details: format!("signal handler registration: {err}"),
            }
        })?;
    }

    let started_at = Utc::now();
    let mut sampler = HealthSampler::new(&policy, started_at)?;
    let interval = policy.tick_interval();
    let mut supervisor = Supervisor::open(policy, Arc::clone(&log));

    log.log(
        &Event::new(
            "daemon",
            EventLevel::Info,
            "supervisor_started",
            format!("tick loop running, interval {}s", interval.as_secs()),
        )
        .with_details(serde_json::json!({
            "pid": std::process::id(),
            "version": env!("CARGO_PKG_VERSION"),
        })),
    );

    while !shutdown.load(Ordering::Relaxed) {
        let tick_started = Instant::now();
        let now = Utc::now();
        let snapshot = sampler.sample(now);
        let _ = supervisor.run_tick(&snapshot, now);

        let elapsed = tick_started.elapsed();
        match interval.checked_sub(elapsed) {
            Some(remaining) => sleep_until_shutdown(remaining, &shutdown),
            None => log.log(&Event::new(
                "daemon",
                EventLevel::Warning,
                "tick_overrun",
                format!(
                    "tick took {}ms, over the {}s interval",
                    elapsed.as_millis(),
                    interval.as_secs()
                ),
            )),
        }
    }

    log.log(&Event::new(
        "daemon",
        EventLevel::Info,
        "supervisor_stopped",
        "shutdown signal received; state persisted, exiting",
    ));
    Ok(())
}

fn sleep_until_shutdown(total: Duration, shutdown: &AtomicBool) {
    let deadline = Instant::now() + total;
    while !shutdown.load(Ordering::Relaxed) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(SLEEP_SLICE));
    }
}
