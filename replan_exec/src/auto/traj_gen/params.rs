//! Trajectory generation parameters

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// Limits on the vehicle's motion, shared by trajectory generation and optimisation.
///
/// Both limits apply to the Euclidean norm of the vector quantity.
#[derive(Deserialize, Serialize, Debug, Clone, Copy, PartialEq)]
pub struct KinematicLimits {
    /// Maximum speed
    pub max_velocity_ms: f64,

    /// Maximum acceleration magnitude
    pub max_accel_mss: f64,
}

/// Parameters for the polynomial trajectory generator
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct Params {
    /// Fraction by which sampled peaks may exceed the limits
    pub limit_tolerance: f64,

    /// Maximum number of times the segment durations are rescaled to meet the limits
    pub max_scaling_iters: usize,

    /// Number of samples taken along each segment when finding the peak velocity and
    /// acceleration
    pub samples_per_segment: usize,

    /// Lower bound on a segment's duration, which keeps repeated waypoints well conditioned
    pub min_segment_duration_s: f64,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl KinematicLimits {
    /// True if both limits are strictly positive and finite.
    pub fn is_valid(&self) -> bool {
        self.max_velocity_ms > 0.0
            && self.max_accel_mss > 0.0
            && self.max_velocity_ms.is_finite()
            && self.max_accel_mss.is_finite()
    }

    /// Limits scaled down by `fraction`, used to leave headroom for avoidance manoeuvres.
    pub fn scaled(&self, fraction: f64) -> Self {
        Self {
            max_velocity_ms: self.max_velocity_ms * fraction,
            max_accel_mss: self.max_accel_mss * fraction,
        }
    }
}

impl Default for KinematicLimits {
    fn default() -> Self {
        Self {
            max_velocity_ms: 0.3,
            max_accel_mss: 0.5,
        }
    }
}

impl Default for Params {
    fn default() -> Self {
        Self {
            limit_tolerance: 0.01,
            max_scaling_iters: 5,
            samples_per_segment: 200,
            min_segment_duration_s: 0.1,
        }
    }
}
