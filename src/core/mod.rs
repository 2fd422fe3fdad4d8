//! Core types: errors, recovery policy, persisted escalation state.

pub mod config;
pub mod errors;
pub mod state;
