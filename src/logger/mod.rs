//! Structured event logging: JSONL append-only with graceful degradation.

pub mod jsonl;

pub use jsonl::{Event, EventLevel, EventLog, EVENT_SCHEMA_VERSION};
