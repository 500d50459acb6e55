//! # Autonomy Module
//!
//! This module provides local obstacle avoidance for the vehicle. Depth images are projected into
//! a vehicle-centred distance field, and a B-spline trajectory seeded from a minimum snap
//! polynomial is continuously pushed away from sensed obstacles while it is being flown.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

pub use replan_mgr::ReplanMgr;

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

/// Localisation module - vehicle and camera poses
pub mod loc;

/// Perception module - converts from depth images to point clouds
pub mod per;

/// Map module - provides the ring buffer distance field
pub mod map;

/// Trajectory generation - waypoints to minimum snap polynomials
pub mod traj_gen;

/// B-spline trajectories and the obstacle avoidance optimiser
pub mod spline;

/// Replan manager - ties perception, mapping and optimisation to the setpoint stream
pub mod replan_mgr;
