//! # Replanner library.
//!
//! This library allows other crates in the workspace (and the integration tests and benchmarks)
//! to access items defined inside the replanner crate.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Autonomy module - perception, mapping, trajectory generation and replanning
pub mod auto;

/// Simulated depth camera for running the replanner without a vehicle
pub mod sim;
