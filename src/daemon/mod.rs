//! Daemon subsystem: escalation engine, rate limiting, action dispatch,
//! per-tick orchestration, and the tick loop itself.

pub mod engine;
pub mod executor;
#[cfg(feature = "daemon")]
pub mod loop_main;
pub mod rate_limiter;
pub mod supervisor;
