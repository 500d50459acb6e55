//! # Localisation module
//!
//! Poses of the vehicle and its sensors. Localisation itself is external, poses are pushed into
//! the replanner by whoever owns the state estimate.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::{Point3, UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The pose (position and attitude) of a frame in its parent frame.
///
/// For the vehicle the parent is the world frame. For a camera it is either the world frame (a
/// resolved camera pose) or the vehicle body (a mounting).
#[derive(Debug, Copy, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Pose {
    /// The position of the frame's origin in the parent frame
    pub position_m: Vector3<f64>,

    /// The attitude of the frame in the parent frame. This quaternion rotates a vector expressed
    /// in this frame into the parent frame.
    pub attitude_q: UnitQuaternion<f64>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Pose {
    pub fn new(position_m: Vector3<f64>, attitude_q: UnitQuaternion<f64>) -> Self {
        Self {
            position_m,
            attitude_q,
        }
    }

    /// A pose at the given position with no rotation relative to the parent.
    pub fn from_position(position_m: Vector3<f64>) -> Self {
        Self {
            position_m,
            attitude_q: UnitQuaternion::identity(),
        }
    }

    /// Return the heading (angle to the positive X axis of the parent) in radians.
    pub fn get_heading(&self) -> f64 {
        self.attitude_q.euler_angles().2
    }

    /// Transform a point expressed in this frame into the parent frame.
    pub fn transform_point(&self, point: &Point3<f64>) -> Point3<f64> {
        self.attitude_q * point + self.position_m
    }

    /// The origin of this frame expressed in the parent frame.
    pub fn origin(&self) -> Point3<f64> {
        Point3::from(self.position_m)
    }

    /// Compose this pose with a child pose expressed in this frame, giving the child's pose in
    /// this frame's parent.
    ///
    /// For example `vehicle_pose.compose(&camera_mount)` gives the camera's world pose.
    pub fn compose(&self, child: &Pose) -> Pose {
        Pose {
            position_m: self.attitude_q * child.position_m + self.position_m,
            attitude_q: self.attitude_q * child.attitude_q,
        }
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------
