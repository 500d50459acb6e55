//! Replan manager parameters

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use util::params::{load as load_params, LoadError};

use crate::auto::{
    map::DistFieldParams,
    per::PerMgrParams,
    spline::SplineOptParams,
    traj_gen::{self, KinematicLimits},
};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplanMgrParams {
    /// Period of the control tick, the trajectory clock advances by this much every step
    pub control_period_s: f64,

    /// The vehicle's kinematic limits, which the optimised spline must respect
    pub limits: KinematicLimits,

    /// Fraction of the limits used for the initial polynomial, leaving headroom for the optimiser
    /// to steer around obstacles
    pub cruise_fraction: f64,

    /// If true snapshots of the occupied voxels are saved to the session after every frame
    pub save_maps: bool,
}

/// Parameters for every component the manager owns.
#[derive(Debug, Clone, Default)]
pub struct ReplanMgrConfig {
    pub mgr: ReplanMgrParams,
    pub per: PerMgrParams,
    pub dist_field: DistFieldParams,
    pub traj_gen: traj_gen::Params,
    pub spline_opt: SplineOptParams,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for ReplanMgrParams {
    fn default() -> Self {
        Self {
            control_period_s: 0.1,
            limits: KinematicLimits::default(),
            cruise_fraction: 0.8,
            save_maps: false,
        }
    }
}

impl ReplanMgrConfig {
    /// Load every parameter file from the software root's params directory.
    pub fn load() -> Result<Self, LoadError> {
        Ok(Self {
            mgr: load_params("replan_mgr.toml")?,
            per: load_params("per_mgr.toml")?,
            dist_field: load_params("dist_field.toml")?,
            traj_gen: load_params("traj_gen.toml")?,
            spline_opt: load_params("spline_opt.toml")?,
        })
    }
}
