//! Voxel traversal along rays, after Amanatides & Woo (1987).

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use nalgebra::{Point3, Vector3};

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Call `f` with the world index of every voxel the segment `start -> end` passes through, starting
/// with the voxel containing `start` and stopping before the voxel containing `end`.
///
/// `resolution_m` is the side length of a voxel.
pub(super) fn for_each_voxel_on_ray<F>(
    start: &Point3<f64>,
    end: &Point3<f64>,
    resolution_m: f64,
    mut f: F,
) where
    F: FnMut(Vector3<i64>),
{
    let s = start.coords / resolution_m;
    let e = end.coords / resolution_m;

    let mut idx = s.map(|c| c.floor() as i64);
    let end_idx = e.map(|c| c.floor() as i64);
    let dir = e - s;

    let mut step = Vector3::zeros();
    let mut t_max = Vector3::repeat(f64::INFINITY);
    let mut t_delta = Vector3::repeat(f64::INFINITY);

    for a in 0..3 {
        if dir[a] > 0.0 {
            step[a] = 1;
            t_max[a] = ((idx[a] + 1) as f64 - s[a]) / dir[a];
            t_delta[a] = 1.0 / dir[a];
        } else if dir[a] < 0.0 {
            step[a] = -1;
            t_max[a] = (s[a] - idx[a] as f64) / -dir[a];
            t_delta[a] = -1.0 / dir[a];
        }
    }

    // An exact traversal takes one step per crossed plane, which bounds the loop even when
    // rounding sends it down the wrong axis near a corner.
    let max_steps = (end_idx - idx).abs().sum();
    let mut num_steps = 0;

    while idx != end_idx && num_steps < max_steps {
        f(idx);

        let a = if t_max.x <= t_max.y && t_max.x <= t_max.z {
            0
        } else if t_max.y <= t_max.z {
            1
        } else {
            2
        };

        idx[a] += step[a];
        t_max[a] += t_delta[a];
        num_steps += 1;
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn collect(start: Point3<f64>, end: Point3<f64>) -> Vec<Vector3<i64>> {
        let mut visited = Vec::new();
        for_each_voxel_on_ray(&start, &end, 0.1, |v| visited.push(v));
        visited
    }

    #[test]
    fn test_axis_aligned() {
        let visited = collect(Point3::new(0.05, 0.05, 0.05), Point3::new(0.45, 0.05, 0.05));

        assert_eq!(
            visited,
            vec![
                Vector3::new(0, 0, 0),
                Vector3::new(1, 0, 0),
                Vector3::new(2, 0, 0),
                Vector3::new(3, 0, 0),
            ]
        );
    }

    #[test]
    fn test_negative_diagonal() {
        let visited = collect(Point3::new(0.05, 0.05, 0.05), Point3::new(-0.25, -0.15, 0.05));

        // Face connected walk from the start voxel, never visiting the end voxel
        assert_eq!(visited.first(), Some(&Vector3::new(0, 0, 0)));
        assert!(!visited.contains(&Vector3::new(-3, -2, 0)));
        assert_eq!(visited.len(), 5);
        for pair in visited.windows(2) {
            assert_eq!((pair[1] - pair[0]).abs().sum(), 1);
        }
    }

    #[test]
    fn test_same_voxel() {
        assert!(collect(Point3::new(0.01, 0.01, 0.01), Point3::new(0.09, 0.02, 0.03)).is_empty());
    }
}
