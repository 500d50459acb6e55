//! # Simulated depth camera
//!
//! Renders depth images of a world made of spheres, for running the replanner without a vehicle.
//! The camera uses the same pinhole model as the depth projector, so a rendered image projects
//! back onto the sphere surfaces.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::f64::consts::FRAC_PI_2;

use chrono::{DateTime, Utc};
use comms_if::eqpt::depth::{DepthBuffer, DepthImage};
use image::Luma;
use nalgebra::{UnitQuaternion, Vector3};
use serde::{Deserialize, Serialize};

use crate::auto::{loc::Pose, per::PerMgrParams};

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A spherical obstacle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct Sphere {
    pub position_m: [f64; 3],
    pub radius_m: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimCameraParams {
    /// Image width in pixels
    pub width: u32,

    /// Image height in pixels
    pub height: u32,

    /// Returns closer than this are dropped
    pub min_range_m: f64,

    /// Returns further than this are dropped
    pub max_range_m: f64,

    /// Position of the camera in the vehicle body frame
    pub mount_position_m: [f64; 3],
}

/// The simulated world flown by the harness.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimParams {
    pub camera: SimCameraParams,

    /// Position the vehicle starts at
    pub start_position_m: [f64; 3],

    /// Time between rendered depth frames
    pub frame_period_s: f64,

    pub obstacles: Vec<Sphere>,
}

/// The simulated camera.
#[derive(Debug, Clone)]
pub struct SimCamera {
    params: SimCameraParams,

    intrinsics: PerMgrParams,

    /// Pose of the camera's optical frame in the vehicle body frame
    mount: Pose,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for SimCameraParams {
    fn default() -> Self {
        Self {
            width: 500,
            height: 360,
            min_range_m: 0.2,
            max_range_m: 8.0,
            mount_position_m: [0.1, 0.0, 0.0],
        }
    }
}

impl SimCamera {
    /// Create a camera rendering with the projector's intrinsics.
    ///
    /// The camera looks along the vehicle's +X axis. Its optical frame has Z forward, X right and
    /// Y down.
    pub fn new(params: SimCameraParams, intrinsics: PerMgrParams) -> Self {
        let mount = Pose::new(
            Vector3::from(params.mount_position_m),
            UnitQuaternion::from_euler_angles(-FRAC_PI_2, 0.0, -FRAC_PI_2),
        );

        Self {
            params,
            intrinsics,
            mount,
        }
    }

    /// World pose of the camera's optical frame for the given vehicle pose.
    pub fn camera_pose(&self, vehicle_pose: &Pose) -> Pose {
        vehicle_pose.compose(&self.mount)
    }

    /// Render a depth image of the spheres from the given camera pose.
    pub fn render(
        &self,
        camera_pose: &Pose,
        spheres: &[Sphere],
        timestamp: DateTime<Utc>,
    ) -> DepthImage {
        let pp = &self.intrinsics.principle_point_pixels;
        let fl = &self.intrinsics.focal_length_pixels;
        let origin = camera_pose.position_m;

        let image = DepthBuffer::from_fn(self.params.width, self.params.height, |u, v| {
            // Ray with unit optical depth, so the hit parameter is the z depth itself
            let ray_cam = Vector3::new((u as f64 - pp.x) / fl.x, (v as f64 - pp.y) / fl.y, 1.0);
            let ray = camera_pose.attitude_q * ray_cam;

            let depth_m = spheres
                .iter()
                .filter_map(|s| ray_sphere(&origin, &ray, s))
                .filter(|d| *d >= self.params.min_range_m && *d <= self.params.max_range_m)
                .fold(f64::INFINITY, f64::min);

            Luma([self.to_sample(depth_m)])
        });

        DepthImage { timestamp, image }
    }

    /// Convert a depth into a raw sample, zero for no return.
    fn to_sample(&self, depth_m: f64) -> u16 {
        if !depth_m.is_finite() {
            return 0;
        }

        let sample = (depth_m / self.intrinsics.depth_to_m).round();
        if sample >= u16::MAX as f64 {
            0
        } else {
            sample as u16
        }
    }
}

/// Distance from the point to the nearest sphere surface, negative inside a sphere and infinite if
/// there are no spheres.
pub fn clearance_m(point_m: &Vector3<f64>, spheres: &[Sphere]) -> f64 {
    spheres
        .iter()
        .map(|s| (point_m - Vector3::from(s.position_m)).norm() - s.radius_m)
        .fold(f64::INFINITY, f64::min)
}

/// Parameter of the first intersection of the ray `origin + t * ray` with the sphere for `t > 0`.
fn ray_sphere(origin: &Vector3<f64>, ray: &Vector3<f64>, sphere: &Sphere) -> Option<f64> {
    let oc = origin - Vector3::from(sphere.position_m);

    let a = ray.dot(ray);
    let b = oc.dot(ray);
    let c = oc.dot(&oc) - sphere.radius_m * sphere.radius_m;

    let discriminant = b * b - a * c;
    if discriminant < 0.0 {
        return None;
    }

    let t = (-b - discriminant.sqrt()) / a;
    if t > 0.0 {
        Some(t)
    } else {
        None
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::auto::per::PerMgr;

    #[test]
    fn test_render_projects_onto_sphere() {
        let intrinsics = PerMgrParams::default();
        let camera = SimCamera::new(SimCameraParams::default(), intrinsics.clone());
        let sphere = Sphere {
            position_m: [3.0, 0.2, 1.0],
            radius_m: 0.5,
        };

        let vehicle = Pose::from_position(Vector3::new(0.0, 0.0, 1.0));
        let camera_pose = camera.camera_pose(&vehicle);
        assert!((camera_pose.position_m - Vector3::new(0.1, 0.0, 1.0)).norm() < 1e-12);

        let img = camera.render(&camera_pose, &[sphere], Utc::now());
        assert_eq!(img.width(), 500);

        // The centre pixel looks straight ahead and sees the sphere's near side
        let centre = img.sample(249, 179).unwrap();
        assert!(centre > 0);

        // Every projected point lies on the sphere
        let cloud = PerMgr::new(intrinsics)
            .calculate(&img, Some(&camera_pose))
            .unwrap();
        assert!(!cloud.points.is_empty());
        for p in cloud.points.iter() {
            let r = (p.coords - Vector3::from(sphere.position_m)).norm();
            assert!((r - 0.5).abs() < 0.01, "r = {}", r);
        }
    }

    #[test]
    fn test_clearance() {
        let spheres = [
            Sphere {
                position_m: [2.0, 0.0, 0.0],
                radius_m: 0.5,
            },
            Sphere {
                position_m: [0.0, 1.0, 0.0],
                radius_m: 0.25,
            },
        ];

        assert!((clearance_m(&Vector3::zeros(), &spheres) - 0.75).abs() < 1e-12);
        assert!(clearance_m(&Vector3::new(2.0, 0.0, 0.0), &spheres) < 0.0);
        assert_eq!(clearance_m(&Vector3::zeros(), &[]), f64::INFINITY);
    }

    #[test]
    fn test_nothing_behind() {
        let camera = SimCamera::new(SimCameraParams::default(), PerMgrParams::default());
        let sphere = Sphere {
            position_m: [-3.0, 0.0, 1.0],
            radius_m: 0.5,
        };

        let vehicle = Pose::from_position(Vector3::new(0.0, 0.0, 1.0));
        let img = camera.render(&camera.camera_pose(&vehicle), &[sphere], Utc::now());

        assert!(img.image.pixels().all(|p| p[0] == 0));
    }
}
