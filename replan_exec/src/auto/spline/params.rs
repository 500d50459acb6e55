//! Spline optimiser parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Params {
    /// Knot spacing of the spline
    pub dt_s: f64,

    /// Number of control points in the optimisation window
    pub num_opt_points: usize,

    /// Minimum clearance the spline should keep from obstacles
    pub distance_threshold_m: f64,

    /// Gain applied to the collision correction of each point
    pub gain: f64,

    /// Fraction of the offset from its original position removed from each point with no
    /// collision correction, per iteration
    pub restore_gain: f64,

    /// Maximum distance a point may move in one iteration
    pub max_step_m: f64,

    /// Maximum number of iterations per optimisation cycle
    pub max_iterations: usize,

    /// The cycle has converged once the largest correction is below this
    pub convergence_tol_m: f64,

    /// Number of times a step is halved while trying to meet the kinematic limits
    pub max_step_halvings: usize,

    /// Maximum passes made over the window when projecting a step onto the kinematic limits
    pub projection_sweeps: usize,

    /// Number of distance samples taken along each spline segment
    pub samples_per_segment: usize,

    /// How unknown distances are treated
    pub unknown_policy: UnknownPolicy,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Treatment of samples which fall in unknown space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnknownPolicy {
    /// Unknown space counts as a full violation of the distance threshold, but gives no direction
    /// to move in
    Conservative,

    /// Unknown space is assumed clear
    Optimistic,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for Params {
    fn default() -> Self {
        Self {
            dt_s: 0.5,
            num_opt_points: 7,
            distance_threshold_m: 0.3,
            gain: 2.0,
            restore_gain: 0.1,
            max_step_m: 0.05,
            max_iterations: 10,
            convergence_tol_m: 0.002,
            max_step_halvings: 4,
            projection_sweeps: 20,
            samples_per_segment: 8,
            unknown_policy: UnknownPolicy::Conservative,
        }
    }
}

impl Default for UnknownPolicy {
    fn default() -> Self {
        Self::Conservative
    }
}
