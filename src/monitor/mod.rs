//! Health monitoring: external probes and per-tick snapshot assembly.

pub mod probes;
pub mod sampler;

pub use sampler::{HealthSampler, HealthSnapshot};
