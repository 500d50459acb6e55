//! # Flight Controller Interface
//!
//! Setpoints emitted by the replanner for the downstream position controller. Orientation is not
//! part of the setpoint, the flight controller derives it from the direction of travel.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A single position/velocity setpoint in the world frame.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Setpoint {
    /// Trajectory time at which this setpoint was sampled, in seconds since the trajectory start.
    pub traj_time_s: f64,

    /// Target position in the world frame.
    pub position_m: [f64; 3],

    /// Feed-forward velocity in the world frame.
    pub velocity_ms: [f64; 3],
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Setpoint {
    /// Setpoint holding the vehicle stationary at the given position.
    pub fn hold(traj_time_s: f64, position_m: [f64; 3]) -> Self {
        Self {
            traj_time_s,
            position_m,
            velocity_ms: [0.0; 3],
        }
    }

    /// Magnitude of the setpoint's velocity.
    pub fn speed_ms(&self) -> f64 {
        self.velocity_ms.iter().map(|v| v * v).sum::<f64>().sqrt()
    }
}
