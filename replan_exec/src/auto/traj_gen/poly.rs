//! Piecewise polynomial trajectories

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use nalgebra::Vector3;
use ordered_float::OrderedFloat;
use serde::Serialize;

use util::maths::poly_val;

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of coefficients of each segment polynomial (degree 9).
pub const NUM_COEFFS: usize = 10;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A single polynomial segment in normalised time.
///
/// The segment's position at time `t` after its start is `sum(coeffs[i] * tau^i)` where
/// `tau = t / duration_s`.
#[derive(Debug, Clone, Serialize)]
pub struct PolySegment {
    pub duration_s: f64,

    /// Coefficients for each axis, lowest power first
    pub coeffs: [[f64; NUM_COEFFS]; 3],
}

/// A time parameterised piecewise polynomial through a set of waypoints.
#[derive(Debug, Clone, Serialize)]
pub struct PolyTraj {
    waypoints: Vec<Vector3<f64>>,
    segments: Vec<PolySegment>,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl PolySegment {
    /// Evaluate the `deriv`th time derivative at `t` seconds after the segment start.
    pub fn eval(&self, t: f64, deriv: usize) -> Vector3<f64> {
        let tau = t / self.duration_s;
        let scale = self.duration_s.powi(deriv as i32);

        Vector3::new(
            poly_val(&self.coeffs[0][..], tau, deriv) / scale,
            poly_val(&self.coeffs[1][..], tau, deriv) / scale,
            poly_val(&self.coeffs[2][..], tau, deriv) / scale,
        )
    }
}

impl PolyTraj {
    pub(super) fn new(waypoints: Vec<Vector3<f64>>, segments: Vec<PolySegment>) -> Self {
        Self {
            waypoints,
            segments,
        }
    }

    pub fn waypoints(&self) -> &[Vector3<f64>] {
        &self.waypoints
    }

    pub fn segments(&self) -> &[PolySegment] {
        &self.segments
    }

    /// Total duration of the trajectory.
    pub fn duration_s(&self) -> f64 {
        self.segments.iter().map(|s| s.duration_s).sum()
    }

    /// Evaluate the `deriv`th derivative at time `t`, clamped into the trajectory's duration.
    pub fn eval(&self, t: f64, deriv: usize) -> Vector3<f64> {
        let mut t = t.max(0.0);

        for (i, seg) in self.segments.iter().enumerate() {
            if t <= seg.duration_s || i == self.segments.len() - 1 {
                return seg.eval(t.min(seg.duration_s), deriv);
            }
            t -= seg.duration_s;
        }

        Vector3::zeros()
    }

    pub fn position(&self, t: f64) -> Vector3<f64> {
        self.eval(t, 0)
    }

    pub fn velocity(&self, t: f64) -> Vector3<f64> {
        self.eval(t, 1)
    }

    pub fn acceleration(&self, t: f64) -> Vector3<f64> {
        self.eval(t, 2)
    }

    /// Find the peak speed and acceleration magnitude by sampling each segment.
    pub fn peaks(&self, samples_per_segment: usize) -> (f64, f64) {
        let n = samples_per_segment.max(1);

        let sampled = || {
            self.segments.iter().flat_map(move |seg| {
                (0..=n).map(move |i| (seg, seg.duration_s * i as f64 / n as f64))
            })
        };

        let v_peak = sampled()
            .map(|(seg, t)| OrderedFloat(seg.eval(t, 1).norm()))
            .max()
            .map_or(0.0, |v| v.0);
        let a_peak = sampled()
            .map(|(seg, t)| OrderedFloat(seg.eval(t, 2).norm()))
            .max()
            .map_or(0.0, |a| a.0);

        (v_peak, a_peak)
    }

    /// Multiply every segment duration by `factor`.
    ///
    /// Coefficients are in normalised time so the path is unchanged, velocities scale by
    /// `1 / factor` and accelerations by `1 / factor^2`.
    pub(super) fn scale_durations(&mut self, factor: f64) {
        for seg in self.segments.iter_mut() {
            seg.duration_s *= factor;
        }
    }
}
