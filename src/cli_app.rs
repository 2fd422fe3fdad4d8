//! Top-level CLI definition and dispatch.

use std::path::PathBuf;
use std::process::ExitCode;

use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use serde::Serialize;

use crate::core::config::RecoveryPolicy;
use crate::core::errors::Result;
use crate::core::state::{EscalationState, LimitClass, LoadSource, StateStore};
use crate::daemon::rate_limiter::RateLimiter;
use crate::monitor::{HealthSampler, HealthSnapshot};

/// Kiosk Watchdog — self-healing supervisor for a kiosk display stack.
#[derive(Parser)]
#[command(name = "kwd", version, about)]
pub struct Cli {
    /// Path to the recovery policy file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "/etc/kiosk-watchdog/policy.toml"
    )]
    pub config: PathBuf,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// Run the supervisor loop in the foreground (used by systemd).
    Daemon {
        /// Echo events to stderr as well as the JSONL log.
        #[arg(long)]
        verbose: bool,
    },
    /// Show persisted escalation state and remaining rate-limit budget.
    Status {
        /// Emit machine-readable JSON instead of the human summary.
        #[arg(long)]
        json: bool,
    },
    /// Take one health sample and print it. Exits non-zero when unhealthy.
    Check,
    /// Validate the policy file and exit.
    Validate,
}

/// Dispatch a parsed command line.
pub fn run(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Command::Daemon { verbose } => {
            let policy = RecoveryPolicy::load(&cli.config)?;
            crate::daemon::loop_main::run(policy, *verbose)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Status { json } => status(&cli.config, *json),
        Command::Check => check(&cli.config),
        Command::Validate => {
            let policy = RecoveryPolicy::load(&cli.config)?;
            println!(
                "{} {} (tick every {}s)",
                "ok:".green().bold(),
                cli.config.display(),
                policy.daemon.tick_interval_secs
            );
            Ok(ExitCode::SUCCESS)
        }
    }
}

#[derive(Serialize)]
struct StatusReport<'a> {
    state_file: &'a std::path::Path,
    state_source: &'static str,
    state: &'a EscalationState,
    browser_restarts_remaining: u32,
    service_restarts_remaining: u32,
    reboots_remaining: u32,
}

fn status(config: &std::path::Path, json: bool) -> Result<ExitCode> {
    let policy = RecoveryPolicy::load(config)?;
    let store = StateStore::new(policy.daemon.state_file.clone());
    let (state, source) = store.load();
    let limiter = RateLimiter::new(policy.limits.clone());
    let now = Utc::now();

    let source_label = match source {
        LoadSource::Fresh => "fresh",
        LoadSource::Persisted => "persisted",
        LoadSource::Recovered { .. } => "recovered",
    };
    let report = StatusReport {
        state_file: store.path(),
        state_source: source_label,
        state: &state,
        browser_restarts_remaining: limiter.remaining(
            &state.history,
            LimitClass::BrowserRestart,
            now,
        ),
        service_restarts_remaining: limiter.remaining(
            &state.history,
            LimitClass::ServiceRestart,
            now,
        ),
        reboots_remaining: limiter.remaining(&state.history, LimitClass::Reboot, now),
    };

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
        return Ok(ExitCode::SUCCESS);
    }

    let overall = if state.degraded_mode {
        "DEGRADED".yellow().bold()
    } else if state.is_escalated() {
        "ESCALATED".red().bold()
    } else {
        "HEALTHY".green().bold()
    };
    println!("kiosk watchdog: {overall}  (state: {source_label})");
    println!(
        "  browser track: level {}{}",
        state.browser_level,
        if state.browser_exhausted {
            " (exhausted)".red().to_string()
        } else {
            String::new()
        }
    );
    println!("  system track:  level {}", state.system_level);
    println!(
        "  failures:      render {} consecutive, service {} consecutive",
        state.consecutive_failures, state.service_consecutive_failures
    );
    if let Some(pending) = state.pending {
        println!(
            "  pending:       {} dispatched at {}",
            pending.action, pending.dispatched_at
        );
    }
    if let Some(at) = state.last_reboot_time {
        println!("  last reboot:   {at}");
    }
    println!(
        "  budget:        {} browser / {} service restarts this hour, {} reboot today",
        report.browser_restarts_remaining,
        report.service_restarts_remaining,
        report.reboots_remaining
    );
    Ok(ExitCode::SUCCESS)
}

fn check(config: &std::path::Path) -> Result<ExitCode> {
    let policy = RecoveryPolicy::load(config)?;
    // One-shot mode: pretend startup happened long ago so the startup grace
    // window cannot mask a stale heartbeat.
    let grace = i64::try_from(policy.browser.startup_grace_secs).unwrap_or(i64::MAX);
    let started_at = Utc::now() - chrono::Duration::seconds(grace.saturating_add(1));
    let mut sampler = HealthSampler::new(&policy, started_at)?;
    let snapshot = sampler.sample(Utc::now());
    print_snapshot(&snapshot);

    let healthy =
        snapshot.service_reachable && snapshot.render_probe_ok && !snapshot.resource_pressure;
    Ok(if healthy {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn print_snapshot(snapshot: &HealthSnapshot) {
    let mark = |ok: bool| {
        if ok {
            "ok".green().to_string()
        } else {
            "FAIL".red().bold().to_string()
        }
    };
    println!("sampled at {}", snapshot.sampled_at);
    match snapshot.service_latency {
        Some(latency) => println!(
            "  service: {} ({} ms)",
            mark(snapshot.service_reachable),
            latency.as_millis()
        ),
        None => println!("  service: {}", mark(snapshot.service_reachable)),
    }
    match snapshot.browser_heartbeat_age {
        Some(age) => println!(
            "  render:  {} (heartbeat {}s old)",
            mark(snapshot.render_probe_ok),
            age.as_secs()
        ),
        None => println!("  render:  {} (no heartbeat)", mark(snapshot.render_probe_ok)),
    }
    println!(
        "  load:    {}   mem free: {}   disk free: {}",
        snapshot
            .load_1m
            .map_or_else(|| "n/a".to_string(), |v| format!("{v:.2}")),
        snapshot
            .mem_free_mb
            .map_or_else(|| "n/a".to_string(), |v| format!("{v} MiB")),
        snapshot
            .disk_free_mb
            .map_or_else(|| "n/a".to_string(), |v| format!("{v} MiB")),
    );
    if snapshot.resource_pressure {
        println!("  {}", "resource pressure".yellow().bold());
    }
}
