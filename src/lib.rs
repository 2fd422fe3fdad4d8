//! Kiosk Watchdog: a self-healing supervisor for a single-node kiosk
//! display stack (backend service + fullscreen browser).
//!
//! The daemon samples health on a fixed tick, escalates through two tracks
//! of recovery actions under per-hour/per-day rate limits, persists its
//! escalation state crash-safely, and emits a JSONL event stream.
//!
//! Layout:
//! - [`core`] — policy, errors, persisted state
//! - [`monitor`] — health probes and the per-tick snapshot
//! - [`daemon`] — escalation engine, rate limiter, executor, tick loop
//! - [`logger`] — the JSONL event stream

#[cfg(feature = "cli")]
pub mod cli_app;
pub mod core;
pub mod daemon;
pub mod logger;
pub mod monitor;
