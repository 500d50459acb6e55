//! # Distance Field
//!
//! A cubic ring buffer of `2^pow` voxels per axis. Voxel world indices are `floor(p / resolution)`
//! and world index `w` lives at storage index `w mod 2^pow`. The volume covers world indices
//! `offset <= w < offset + 2^pow`, so moving the volume by one voxel along an axis only changes the
//! offset and clears the single plane of storage that now holds the entering voxels. Distances
//! within the radius of the departed and entering planes are then recomputed from the obstacles
//! still in the volume.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use nalgebra::{Point3, Vector3};
use ndarray::{Array3, Axis};
use serde::{Deserialize, Serialize};

use super::raycast::for_each_voxel_on_ray;

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Largest supported `pow`, giving a 1024^3 volume.
const MAX_POW: u32 = 10;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// Parameters describing the distance field.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistFieldParams {
    /// The volume is `2^pow` voxels along each axis
    pub pow: u32,

    /// Side length of a voxel in meters
    pub resolution_m: f64,

    /// Distances are truncated at this radius, anything further from an obstacle reads as
    /// `radius_m`
    pub radius_m: f64,

    /// If true voxels between the camera and each measured point are marked as free
    pub carve_free_space: bool,
}

/// A single voxel of the field.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Voxel {
    /// True if a point has been measured in this voxel
    pub occupied: bool,

    /// True if this voxel has been seen, either as a hit or as free space along a ray
    pub observed: bool,

    /// Distance to the nearest occupied voxel, truncated at the field's radius
    pub distance_m: f64,

    /// The insertion which last changed this voxel, 0 if it has never been changed
    pub generation: u64,
}

/// The distance field ring buffer.
#[derive(Debug, Clone)]
pub struct DistField {
    params: DistFieldParams,

    /// Number of voxels along each axis
    size: i64,

    /// The world index of the minimum corner of the volume
    offset: Vector3<i64>,

    /// Number of whole voxels covered by the radius
    radius_cells: i64,

    /// Offsets (and their distances) from an obstacle voxel to every voxel within the radius
    kernel: Vec<(Vector3<i64>, f64)>,

    /// Number of insertions performed
    generation: u64,

    voxels: Array3<Voxel>,
}

/// Summary of an insertion.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct InsertReport {
    /// Number of points which fell inside the volume and were marked occupied
    pub num_inserted: usize,

    /// Number of points which fell outside the volume and were ignored
    pub num_outside: usize,

    /// Number of voxels whose occupancy changed
    pub num_changed: usize,
}

/// Serialisable snapshot of the occupied voxels in the field, used for archiving.
#[derive(Debug, Clone, Serialize)]
pub struct OccupiedSnapshot {
    pub resolution_m: f64,
    pub center: [i64; 3],
    pub points_m: Vec<[f64; 3]>,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// Result of a distance query.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Distance {
    /// The distance to the nearest obstacle is known, truncated at the field's radius
    Known(f64),

    /// The point is outside the volume or hasn't been observed
    Unknown,
}

#[derive(Debug, thiserror::Error)]
pub enum DistFieldError {
    #[error("The field's pow must be between 1 and 10, got {0}")]
    InvalidPow(u32),

    #[error("The field's resolution must be positive, got {0}")]
    InvalidResolution(f64),

    #[error("The field's radius must be positive, got {0}")]
    InvalidRadius(f64),
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl Default for DistFieldParams {
    fn default() -> Self {
        Self {
            pow: 6,
            resolution_m: 0.1,
            radius_m: 1.0,
            carve_free_space: true,
        }
    }
}

impl Voxel {
    fn cleared(radius_m: f64) -> Self {
        Self {
            occupied: false,
            observed: false,
            distance_m: radius_m,
            generation: 0,
        }
    }
}

impl Distance {
    /// The known distance, or `None` if unknown.
    pub fn known(&self) -> Option<f64> {
        match self {
            Distance::Known(d) => Some(*d),
            Distance::Unknown => None,
        }
    }
}

impl DistField {
    /// Create a new empty field with its minimum corner at the world origin.
    pub fn new(params: DistFieldParams) -> Result<Self, DistFieldError> {
        if params.pow == 0 || params.pow > MAX_POW {
            return Err(DistFieldError::InvalidPow(params.pow));
        }
        if !(params.resolution_m > 0.0) {
            return Err(DistFieldError::InvalidResolution(params.resolution_m));
        }
        if !(params.radius_m > 0.0) {
            return Err(DistFieldError::InvalidRadius(params.radius_m));
        }

        let size = 1i64 << params.pow;
        let radius_cells = (params.radius_m / params.resolution_m).ceil() as i64;

        let mut kernel = Vec::new();
        for x in -radius_cells..=radius_cells {
            for y in -radius_cells..=radius_cells {
                for z in -radius_cells..=radius_cells {
                    let dist_m =
                        Vector3::new(x as f64, y as f64, z as f64).norm() * params.resolution_m;
                    if dist_m < params.radius_m {
                        kernel.push((Vector3::new(x, y, z), dist_m));
                    }
                }
            }
        }

        let dim = size as usize;
        let voxels = Array3::from_elem((dim, dim, dim), Voxel::cleared(params.radius_m));

        Ok(Self {
            params,
            size,
            offset: Vector3::zeros(),
            radius_cells,
            kernel,
            generation: 0,
            voxels,
        })
    }

    pub fn params(&self) -> &DistFieldParams {
        &self.params
    }

    /// Number of voxels along each axis of the volume.
    pub fn size(&self) -> i64 {
        self.size
    }

    /// World index of the minimum corner of the volume.
    pub fn offset(&self) -> Vector3<i64> {
        self.offset
    }

    /// World index of the centre of the volume.
    pub fn center(&self) -> Vector3<i64> {
        self.offset.add_scalar(self.size / 2)
    }

    /// Number of insertions performed so far.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Convert a world position into the index of the voxel containing it.
    pub fn world_to_index(&self, point: &Point3<f64>) -> Vector3<i64> {
        point
            .coords
            .map(|c| (c / self.params.resolution_m).floor() as i64)
    }

    /// The world position of the centre of the voxel with the given index.
    pub fn index_to_world(&self, index: &Vector3<i64>) -> Point3<f64> {
        Point3::from(index.map(|i| (i as f64 + 0.5) * self.params.resolution_m))
    }

    /// True if the voxel with the given world index is inside the volume.
    pub fn is_inside(&self, index: &Vector3<i64>) -> bool {
        index_inside(&self.offset, self.size, index)
    }

    /// Get the voxel with the given world index, or `None` if it's outside the volume.
    pub fn voxel(&self, index: &Vector3<i64>) -> Option<&Voxel> {
        if self.is_inside(index) {
            Some(&self.voxels[self.storage_index(index)])
        } else {
            None
        }
    }

    /// Clear every voxel in the volume without moving it.
    pub fn clear(&mut self) {
        self.voxels.fill(Voxel::cleared(self.params.radius_m));
    }

    /// Place the volume so that its centre is the voxel containing `point`, clearing all data.
    ///
    /// Used for the first frame, when there is nothing in the field worth shifting.
    pub fn set_center(&mut self, point: &Point3<f64>) {
        self.offset = self.world_to_index(point).add_scalar(-self.size / 2);
        self.clear();
    }

    /// Move the volume one voxel along each axis with a non-zero component of `direction`.
    ///
    /// Only the sign of each component is used. The plane of voxels leaving the volume on each
    /// moved axis is cleared, since its storage now holds the plane entering on the other side.
    /// Distances are then recomputed within the radius of both planes, so nothing inside the
    /// volume keeps a distance to an obstacle which has left it.
    pub fn move_volume(&mut self, direction: &Vector3<i64>) {
        let cleared = Voxel::cleared(self.params.radius_m);
        let mut moved = Vec::with_capacity(3);

        for a in 0..3 {
            let (departed, entering) = match direction[a].signum() {
                1 => {
                    self.offset[a] += 1;
                    (self.offset[a] - 1, self.offset[a] + self.size - 1)
                }
                -1 => {
                    self.offset[a] -= 1;
                    (self.offset[a] + self.size, self.offset[a])
                }
                _ => continue,
            };

            self.voxels
                .index_axis_mut(Axis(a), entering.rem_euclid(self.size) as usize)
                .fill(cleared);

            moved.push((a, departed, entering));
        }

        for (a, departed, entering) in moved {
            for plane in [departed, entering].iter() {
                let mut min = self.offset;
                let mut max = self.offset.add_scalar(self.size - 1);
                min[a] = *plane;
                max[a] = *plane;

                self.update_distances(&min, &max);
            }
        }
    }

    /// Shift the volume by `delta` voxels, one unit step at a time.
    pub fn shift(&mut self, delta: &Vector3<i64>) {
        // After a full volume of steps along any axis every plane has been cleared, so jump there
        // directly rather than stepping through planes which are already empty.
        if (0..3).any(|a| delta[a].abs() >= self.size) {
            self.offset += delta;
            self.clear();
            return;
        }

        let mut remaining = *delta;
        loop {
            let step = remaining.map(|d| d.signum());
            if step == Vector3::zeros() {
                break;
            }

            self.move_volume(&step);
            remaining -= step;
        }
    }

    /// Shift the volume so that its centre is the voxel containing `point`. Returns the shift
    /// that was applied.
    pub fn recenter(&mut self, point: &Point3<f64>) -> Vector3<i64> {
        let delta = self.world_to_index(point) - self.center();
        self.shift(&delta);
        delta
    }

    /// Insert a point cloud observed from `origin`.
    ///
    /// If carving is enabled every voxel on the ray from the origin to each point, except the
    /// voxel holding the point, is marked free. Then every point inside the volume marks its voxel
    /// occupied, and distances are recomputed around all voxels whose occupancy changed.
    pub fn insert(&mut self, points: &[Point3<f64>], origin: &Point3<f64>) -> InsertReport {
        self.generation += 1;
        let generation = self.generation;

        let mut report = InsertReport::default();
        let mut changed = ChangedBounds::default();

        // ---- FREE SPACE ----

        if self.params.carve_free_space {
            let resolution_m = self.params.resolution_m;

            for point in points {
                let voxels = &mut self.voxels;
                let offset = self.offset;
                let size = self.size;

                for_each_voxel_on_ray(origin, point, resolution_m, |index| {
                    if !index_inside(&offset, size, &index) {
                        return;
                    }

                    let voxel = &mut voxels[storage_index(size, &index)];
                    if voxel.occupied || !voxel.observed {
                        if voxel.occupied {
                            changed.include(&index);
                        }
                        voxel.occupied = false;
                        voxel.observed = true;
                        voxel.generation = generation;
                    }
                });
            }
        }

        // ---- HITS ----

        for point in points {
            let index = self.world_to_index(point);

            if !self.is_inside(&index) {
                report.num_outside += 1;
                continue;
            }

            report.num_inserted += 1;

            let storage = self.storage_index(&index);
            let voxel = &mut self.voxels[storage];
            if !voxel.occupied {
                changed.include(&index);
                voxel.occupied = true;
                voxel.observed = true;
                voxel.generation = generation;
            }
        }

        report.num_changed = changed.count;

        // ---- DISTANCES ----

        if let Some((min, max)) = changed.bounds() {
            self.update_distances(&min, &max);
        }

        report
    }

    /// Query the distance to the nearest obstacle from `point`.
    ///
    /// Points outside the volume are always unknown. Inside the volume a voxel within the radius
    /// of a known obstacle has a known distance, otherwise the distance is only known (as the
    /// radius) if the voxel has been observed.
    pub fn query_distance(&self, point: &Point3<f64>) -> Distance {
        self.distance_at(&self.world_to_index(point))
    }

    /// Query the trilinearly interpolated distance and its gradient at `point`.
    ///
    /// Returns `None` if the voxel containing `point` is unknown. Unknown neighbours of a known
    /// voxel are treated as being at the radius.
    pub fn distance_with_gradient(&self, point: &Point3<f64>) -> Option<(f64, Vector3<f64>)> {
        self.query_distance(point).known()?;

        let res = self.params.resolution_m;
        let radius = self.params.radius_m;

        // Interpolate between voxel centres
        let q = point.coords / res - Vector3::repeat(0.5);
        let base = q.map(|c| c.floor());
        let frac = q - base;
        let base = base.map(|c| c as i64);

        let mut c = [[[0.0; 2]; 2]; 2];
        for (i, cx) in c.iter_mut().enumerate() {
            for (j, cy) in cx.iter_mut().enumerate() {
                for (k, cz) in cy.iter_mut().enumerate() {
                    let index = base + Vector3::new(i as i64, j as i64, k as i64);
                    *cz = self.distance_at(&index).known().unwrap_or(radius);
                }
            }
        }

        let (fx, fy, fz) = (frac.x, frac.y, frac.z);
        let lerp = |a: f64, b: f64, t: f64| a + (b - a) * t;

        // Along z, then y, then x
        let c00 = lerp(c[0][0][0], c[0][0][1], fz);
        let c01 = lerp(c[0][1][0], c[0][1][1], fz);
        let c10 = lerp(c[1][0][0], c[1][0][1], fz);
        let c11 = lerp(c[1][1][0], c[1][1][1], fz);
        let c0 = lerp(c00, c01, fy);
        let c1 = lerp(c10, c11, fy);
        let dist = lerp(c0, c1, fx);

        let grad_x = (c1 - c0) / res;
        let grad_y = (lerp(c01, c11, fx) - lerp(c00, c10, fx)) / res;
        let dz0 = lerp(
            lerp(c[0][0][0], c[1][0][0], fx),
            lerp(c[0][1][0], c[1][1][0], fx),
            fy,
        );
        let dz1 = lerp(
            lerp(c[0][0][1], c[1][0][1], fx),
            lerp(c[0][1][1], c[1][1][1], fx),
            fy,
        );
        let grad_z = (dz1 - dz0) / res;

        Some((dist, Vector3::new(grad_x, grad_y, grad_z)))
    }

    /// True if the voxel containing `point` is inside the volume and occupied.
    pub fn is_occupied(&self, point: &Point3<f64>) -> bool {
        self.voxel(&self.world_to_index(point))
            .map(|v| v.occupied)
            .unwrap_or(false)
    }

    /// Number of occupied voxels in the volume.
    pub fn num_occupied(&self) -> usize {
        self.voxels.iter().filter(|v| v.occupied).count()
    }

    /// World positions of the centres of all occupied voxels.
    pub fn occupied_points(&self) -> Vec<Point3<f64>> {
        let mut points = Vec::new();

        for index in indices_in(&self.offset, &self.offset.add_scalar(self.size - 1)) {
            if self.voxels[self.storage_index(&index)].occupied {
                points.push(self.index_to_world(&index));
            }
        }

        points
    }

    /// Build a serialisable snapshot of the occupied voxels.
    pub fn occupied_snapshot(&self) -> OccupiedSnapshot {
        let center = self.center();

        OccupiedSnapshot {
            resolution_m: self.params.resolution_m,
            center: [center.x, center.y, center.z],
            points_m: self
                .occupied_points()
                .iter()
                .map(|p| [p.x, p.y, p.z])
                .collect(),
        }
    }

    fn storage_index(&self, index: &Vector3<i64>) -> [usize; 3] {
        storage_index(self.size, index)
    }

    fn distance_at(&self, index: &Vector3<i64>) -> Distance {
        match self.voxel(index) {
            Some(v) if v.distance_m < self.params.radius_m => Distance::Known(v.distance_m),
            Some(v) if v.observed => Distance::Known(self.params.radius_m),
            _ => Distance::Unknown,
        }
    }

    /// Clip the box `[min, max]` to the volume, `None` if they don't intersect.
    fn clip(&self, min: &Vector3<i64>, max: &Vector3<i64>) -> Option<(Vector3<i64>, Vector3<i64>)> {
        let vol_max = self.offset.add_scalar(self.size - 1);
        let min = min.zip_map(&self.offset, |a, b| a.max(b));
        let max = max.zip_map(&vol_max, |a, b| a.min(b));

        if (0..3).all(|a| min[a] <= max[a]) {
            Some((min, max))
        } else {
            None
        }
    }

    /// Recompute distances for every voxel within the radius of the box `[min, max]`.
    fn update_distances(&mut self, min: &Vector3<i64>, max: &Vector3<i64>) {
        let r = self.radius_cells;

        // Voxels whose distance may have changed
        let (update_min, update_max) =
            match self.clip(&min.add_scalar(-r), &max.add_scalar(r)) {
                Some(b) => b,
                None => return,
            };

        // Obstacles which can affect those voxels
        let (source_min, source_max) =
            match self.clip(&update_min.add_scalar(-r), &update_max.add_scalar(r)) {
                Some(b) => b,
                None => return,
            };

        let radius_m = self.params.radius_m;
        for index in indices_in(&update_min, &update_max) {
            let storage = self.storage_index(&index);
            self.voxels[storage].distance_m = radius_m;
        }

        let sources: Vec<Vector3<i64>> = indices_in(&source_min, &source_max)
            .filter(|i| self.voxels[self.storage_index(i)].occupied)
            .collect();

        for source in sources {
            for (k, dist_m) in &self.kernel {
                let index = source + k;
                if (0..3).any(|a| index[a] < update_min[a] || index[a] > update_max[a]) {
                    continue;
                }

                let storage = storage_index(self.size, &index);
                let voxel = &mut self.voxels[storage];
                if *dist_m < voxel.distance_m {
                    voxel.distance_m = *dist_m;
                }
            }
        }
    }
}

/// Tracks the bounding box of changed voxels during an insertion.
#[derive(Default)]
struct ChangedBounds {
    min: Option<Vector3<i64>>,
    max: Option<Vector3<i64>>,
    count: usize,
}

impl ChangedBounds {
    fn include(&mut self, index: &Vector3<i64>) {
        self.count += 1;
        self.min = Some(self.min.map_or(*index, |m| m.zip_map(index, |a, b| a.min(b))));
        self.max = Some(self.max.map_or(*index, |m| m.zip_map(index, |a, b| a.max(b))));
    }

    fn bounds(&self) -> Option<(Vector3<i64>, Vector3<i64>)> {
        Some((self.min?, self.max?))
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

fn storage_index(size: i64, index: &Vector3<i64>) -> [usize; 3] {
    [
        index.x.rem_euclid(size) as usize,
        index.y.rem_euclid(size) as usize,
        index.z.rem_euclid(size) as usize,
    ]
}

/// Iterate over every world index in the box `[min, max]`.
fn indices_in(min: &Vector3<i64>, max: &Vector3<i64>) -> impl Iterator<Item = Vector3<i64>> {
    let (min, max) = (*min, *max);
    (min.x..=max.x).flat_map(move |x| {
        (min.y..=max.y).flat_map(move |y| (min.z..=max.z).map(move |z| Vector3::new(x, y, z)))
    })
}

fn index_inside(offset: &Vector3<i64>, size: i64, index: &Vector3<i64>) -> bool {
    (0..3).all(|a| index[a] >= offset[a] && index[a] < offset[a] + size)
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn field(carve_free_space: bool) -> DistField {
        DistField::new(DistFieldParams {
            pow: 5,
            resolution_m: 0.1,
            radius_m: 0.5,
            carve_free_space,
        })
        .unwrap()
    }

    fn state(field: &DistField) -> Array3<(bool, bool, f64)> {
        field
            .voxels
            .map(|v| (v.occupied, v.observed, v.distance_m))
    }

    #[test]
    fn test_indexing() {
        let field = field(true);

        assert_eq!(
            field.world_to_index(&Point3::new(-0.05, 0.15, 0.0)),
            Vector3::new(-1, 1, 0)
        );
        assert_eq!(field.center(), Vector3::new(16, 16, 16));
        assert!(field.is_inside(&Vector3::new(0, 31, 0)));
        assert!(!field.is_inside(&Vector3::new(0, 32, 0)));
        assert!(!field.is_inside(&Vector3::new(-1, 0, 0)));

        assert!(matches!(
            DistField::new(DistFieldParams {
                pow: 0,
                ..Default::default()
            }),
            Err(DistFieldError::InvalidPow(0))
        ));
        assert!(matches!(
            DistField::new(DistFieldParams {
                resolution_m: 0.0,
                ..Default::default()
            }),
            Err(DistFieldError::InvalidResolution(_))
        ));
    }

    #[test]
    fn test_shift_tracks_center() {
        let mut field = field(false);
        let initial = field.center();

        let deltas = [
            Vector3::new(3, 0, -2),
            Vector3::new(-1, 5, 0),
            Vector3::new(0, 0, 0),
            Vector3::new(40, -3, 1),
        ];

        let mut total = Vector3::zeros();
        for d in deltas.iter() {
            field.shift(d);
            total += d;
            assert_eq!(field.center(), initial + total);
        }
    }

    #[test]
    fn test_shift_clears_departed() {
        let mut field = field(false);

        // Obstacle near the minimum x face of the volume
        let obstacle = Point3::new(0.25, 1.65, 1.65);
        field.insert(&[obstacle], &Point3::new(1.65, 1.65, 1.65));
        assert!(field.is_occupied(&obstacle));

        // Move 3 voxels in +x, voxel 2 leaves the volume
        field.shift(&Vector3::new(3, 0, 0));
        assert!(!field.is_occupied(&obstacle));
        assert_eq!(field.query_distance(&obstacle), Distance::Unknown);

        // The storage of the departed plane now holds world x = 34, which must be empty
        let wrapped = field.index_to_world(&Vector3::new(34, 16, 16));
        assert!(!field.is_occupied(&wrapped));
        assert_eq!(field.query_distance(&wrapped), Distance::Unknown);
        assert_eq!(field.num_occupied(), 0);

        // Moving back doesn't restore it
        field.shift(&Vector3::new(-3, 0, 0));
        assert!(!field.is_occupied(&obstacle));
    }

    #[test]
    fn test_shift_recomputes_distances() {
        let mut field = field(false);

        // On the minimum x face, one alone and one with a neighbour still in the volume after the
        // shift, plus one near the maximum x face
        let lone = Point3::new(0.05, 0.45, 0.45);
        let departing = Point3::new(0.05, 1.65, 1.65);
        let staying = Point3::new(0.55, 1.65, 1.65);
        let far = Point3::new(3.05, 1.65, 1.65);
        field.insert(&[lone, departing, staying, far], &Point3::new(1.65, 1.65, 1.65));

        let next_to_lone = Point3::new(0.15, 0.45, 0.45);
        let next_to_departing = Point3::new(0.15, 1.65, 1.65);
        let between = Point3::new(0.25, 1.65, 1.65);
        assert_eq!(field.query_distance(&next_to_lone), Distance::Known(0.1));
        assert_eq!(field.query_distance(&next_to_departing), Distance::Known(0.1));

        field.shift(&Vector3::new(1, 0, 0));
        assert_eq!(field.num_occupied(), 2);

        // Nothing is left near the lone obstacle
        assert_eq!(field.query_distance(&next_to_lone), Distance::Unknown);
        assert_eq!(
            field.query_distance(&Point3::new(0.35, 0.45, 0.45)),
            Distance::Unknown
        );

        // Distances now come from the obstacle which stayed
        let known = |p: &Point3<f64>| field.query_distance(p).known().unwrap();
        assert!((known(&next_to_departing) - 0.4).abs() < 1e-9);
        assert!((known(&between) - 0.3).abs() < 1e-9);

        // The entering plane picks up the obstacle already in the volume
        assert!((known(&Point3::new(3.25, 1.65, 1.65)) - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_insert_idempotent() {
        let mut field = field(true);
        let origin = Point3::new(1.6, 1.6, 1.6);
        let cloud = vec![
            Point3::new(2.3, 1.6, 1.6),
            Point3::new(2.3, 1.7, 1.6),
            Point3::new(2.2, 1.2, 1.9),
            Point3::new(0.9, 1.1, 1.4),
            Point3::new(9.0, 1.6, 1.6),
        ];

        let first = field.insert(&cloud, &origin);
        let after_first = state(&field);

        let second = field.insert(&cloud, &origin);
        assert_eq!(state(&field), after_first);

        assert_eq!(first.num_inserted, 4);
        assert_eq!(first.num_outside, 1);
        assert_eq!(second.num_inserted, 4);
        assert_eq!(field.generation(), 2);
    }

    #[test]
    fn test_query_distance() {
        let mut field = field(true);
        let origin = Point3::new(1.05, 1.65, 1.65);
        let obstacle = Point3::new(2.05, 1.65, 1.65);

        field.insert(&[obstacle], &origin);

        assert_eq!(field.query_distance(&obstacle), Distance::Known(0.0));

        match field.query_distance(&Point3::new(2.05, 1.85, 1.65)) {
            Distance::Known(d) => assert!((d - 0.2).abs() < 1e-9),
            Distance::Unknown => panic!("Expected a known distance"),
        }

        // Carved free space beyond the radius is known at the radius
        assert_eq!(
            field.query_distance(&Point3::new(1.25, 1.65, 1.65)),
            Distance::Known(0.5)
        );

        // Unobserved and far from anything
        assert_eq!(
            field.query_distance(&Point3::new(0.25, 0.25, 0.25)),
            Distance::Unknown
        );

        // Outside the volume
        assert_eq!(
            field.query_distance(&Point3::new(-1.0, 1.65, 1.65)),
            Distance::Unknown
        );
    }

    #[test]
    fn test_carving() {
        let mut field = field(true);
        let origin = Point3::new(1.05, 1.65, 1.65);

        // A stale obstacle which a later ray passes through
        let stale = Point3::new(1.55, 1.65, 1.65);
        field.insert(&[stale], &Point3::new(1.55, 0.05, 1.65));
        assert!(field.is_occupied(&stale));

        let hit = Point3::new(2.05, 1.65, 1.65);
        let report = field.insert(&[hit], &origin);

        assert!(!field.is_occupied(&stale));
        assert!(field.is_occupied(&hit));
        assert_eq!(report.num_changed, 2);

        // Without carving the stale obstacle survives
        let mut field = self::field(false);
        field.insert(&[stale], &origin);
        field.insert(&[hit], &origin);
        assert!(field.is_occupied(&stale));
    }

    #[test]
    fn test_gradient() {
        let mut field = field(true);
        let obstacle = Point3::new(1.65, 1.65, 1.65);
        field.insert(&[obstacle], &Point3::new(0.35, 1.65, 1.65));

        // Between voxel centres on the +y side of the obstacle, the gradient points away from it
        let (d, grad) = field
            .distance_with_gradient(&Point3::new(1.66, 1.92, 1.66))
            .unwrap();

        assert!(d > 0.2 && d < 0.3);
        assert!(grad.y > 0.5);
        assert!(grad.y > 2.0 * grad.x.abs());
        assert!(grad.y > 2.0 * grad.z.abs());

        assert!(field
            .distance_with_gradient(&Point3::new(0.05, 0.05, 0.05))
            .is_none());
    }
}
