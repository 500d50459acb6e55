//! Perception module - converts from depth images to world frame point clouds

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use nalgebra::{Point2, Point3};
use serde::{Deserialize, Serialize};

use crate::auto::loc::Pose;
use comms_if::eqpt::depth::DepthImage;

// -----------------------------------------------------------------------------------------------
// STRUCTS
// -----------------------------------------------------------------------------------------------

/// Manages the perception algorithm, converting between depth images and point clouds.
///
/// Procedure:
///  - Subsample the image by the pixel stride in both rows and columns
///  - Reject samples with no return
///  - Back-project each remaining sample through the pinhole model into the camera optical frame
///    (X right, Y down, Z forward)
///  - Transform into the world frame with the camera pose
#[derive(Debug, Clone)]
pub struct PerMgr {
    pub params: PerMgrParams,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerMgrParams {
    /// Multiplier to convert from depth units to meters
    pub depth_to_m: f64,

    /// The principle point (middle) of the calibrated depth image.
    pub principle_point_pixels: Point2<f64>,

    /// The focal length of the x and y axes.
    pub focal_length_pixels: Point2<f64>,

    /// Only every `pixel_stride`th row and column of the image is projected.
    pub pixel_stride: usize,
}

/// A point cloud in the world frame.
#[derive(Debug, Clone, Serialize)]
pub struct ProjectedCloud {
    /// The projected points
    pub points: Vec<Point3<f64>>,

    /// The origin of the camera in the world frame, from which all points were observed
    pub origin: Point3<f64>,

    /// Number of sampled pixels which were rejected as having no valid depth
    pub num_rejected: usize,
}

// -----------------------------------------------------------------------------------------------
// ENUMS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, Clone, thiserror::Error)]
pub enum PerError {
    #[error("The provided depth image was empty")]
    DepthImgIsEmpty,

    #[error("No camera pose was available at the time of the depth image")]
    NoCameraPose,
}

// -----------------------------------------------------------------------------------------------
// IMPLS
// -----------------------------------------------------------------------------------------------

impl Default for PerMgrParams {
    fn default() -> Self {
        Self {
            depth_to_m: 1.0 / 5000.0,
            principle_point_pixels: Point2::new(249.322647094727, 179.5),
            focal_length_pixels: Point2::new(457.815979003906, 457.815979003906),
            pixel_stride: 4,
        }
    }
}

impl PerMgr {
    pub fn new(params: PerMgrParams) -> Self {
        Self { params }
    }

    /// Calculate the world frame point cloud from the given depth image and camera pose.
    ///
    /// `depth_img` - the image to process
    /// `camera_pose` - the pose of the camera's optical frame in the world when the image was
    /// taken. If the pose couldn't be resolved the frame can't be used and
    /// [`PerError::NoCameraPose`] is returned.
    pub fn calculate(
        &self,
        depth_img: &DepthImage,
        camera_pose: Option<&Pose>,
    ) -> Result<ProjectedCloud, PerError> {
        let camera_pose = camera_pose.ok_or(PerError::NoCameraPose)?;

        if depth_img.width() == 0 || depth_img.height() == 0 {
            return Err(PerError::DepthImgIsEmpty);
        }

        let stride = self.params.pixel_stride.max(1);
        let pp = &self.params.principle_point_pixels;
        let fl = &self.params.focal_length_pixels;

        let mut points = Vec::with_capacity(
            (depth_img.width() as usize / stride + 1) * (depth_img.height() as usize / stride + 1),
        );
        let mut num_rejected = 0;

        for v in (0..depth_img.height()).step_by(stride) {
            for u in (0..depth_img.width()).step_by(stride) {
                let depth_m = match depth_img.sample(u, v) {
                    Some(d) => d as f64 * self.params.depth_to_m,
                    None => continue,
                };

                if depth_m <= 0.0 || !depth_m.is_finite() {
                    num_rejected += 1;
                    continue;
                }

                let point_cam = Point3::new(
                    (u as f64 - pp.x) * depth_m / fl.x,
                    (v as f64 - pp.y) * depth_m / fl.y,
                    depth_m,
                );

                points.push(camera_pose.transform_point(&point_cam));
            }
        }

        Ok(ProjectedCloud {
            points,
            origin: camera_pose.origin(),
            num_rejected,
        })
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;
    use nalgebra::Vector3;

    fn params() -> PerMgrParams {
        PerMgrParams {
            depth_to_m: 0.001,
            principle_point_pixels: Point2::new(2.0, 2.0),
            focal_length_pixels: Point2::new(2.0, 2.0),
            pixel_stride: 2,
        }
    }

    #[test]
    fn test_projection() {
        let per_mgr = PerMgr::new(params());

        // 5x5 image, stride 2 samples the 3x3 grid of even pixels
        let mut img = DepthImage::empty(Utc::now(), 5, 5);
        img.set_sample(2, 2, 2000);
        img.set_sample(4, 2, 1000);
        img.set_sample(3, 3, 4000);

        let camera_pose = Pose::from_position(Vector3::new(1.0, 0.0, 0.0));
        let cloud = per_mgr.calculate(&img, Some(&camera_pose)).unwrap();

        // The odd pixel is never sampled, the other 7 sampled pixels have no return
        assert_eq!(cloud.points.len(), 2);
        assert_eq!(cloud.num_rejected, 7);
        assert_eq!(cloud.origin, Point3::new(1.0, 0.0, 0.0));

        // Principle point projects straight down the optical axis
        assert!((cloud.points[0] - Point3::new(1.0, 0.0, 2.0)).norm() < 1e-12);

        // Two pixels right at 1 m with f = 2 px is half a meter right
        assert!((cloud.points[1] - Point3::new(2.0, 0.0, 1.0)).norm() < 1e-12);
    }

    #[test]
    fn test_no_pose() {
        let per_mgr = PerMgr::new(params());
        let img = DepthImage::empty(Utc::now(), 5, 5);

        assert!(matches!(
            per_mgr.calculate(&img, None),
            Err(PerError::NoCameraPose)
        ));
        assert!(matches!(
            per_mgr.calculate(&DepthImage::empty(Utc::now(), 0, 0), Some(&Pose::default())),
            Err(PerError::DepthImgIsEmpty)
        ));
    }
}
