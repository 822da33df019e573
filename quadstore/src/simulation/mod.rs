//! Deterministic simulation testing.
//!
//! - [`SimulatedStorage`]: an in-memory page device with seeded fault
//!   injection and a durable image that survives a simulated crash
//! - [`Workload`]: seeded random transactions checked against a model
//!
//! Given the same seed, a run injects the same faults and issues the same
//! operations.

mod storage;
mod workload;

pub use storage::{FaultConfig, SimulatedDiskHandle, SimulatedStorage, SimulatedStorageStats};
pub use workload::{InvariantViolation, Workload, WorkloadConfig, WorkloadResult};
