//! # Communications interface crate.
//!
//! Provides the data exchanged between the replanner and its neighbouring subsystems: depth
//! frames coming from the camera driver, commands coming from the mission layer, and setpoints
//! going out to the flight controller.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Telecommand definitions
pub mod tc;

/// Data definitions for equipment (camera, flight controller)
pub mod eqpt;
