//! # B-spline trajectory module
//!
//! A uniform B-spline of degree 6 over 3D control points with knot spacing `dt_s`. The spline is
//! seeded by sampling a polynomial trajectory, then a small window of its control points is
//! reshaped by the [`SplineOpt`] as the vehicle flies along it.
//!
//! Control points are in one of three states:
//!
//!  - Frozen: the point influences the current emission time or an earlier one. Frozen points are
//!    never changed again.
//!  - Active: one of the `num_opt_points` points just after the frozen ones, which the optimiser
//!    may move.
//!  - Pending: points further into the future, which will become active later.
//!
//! The final `DEGREE + 1` points hold the vehicle at rest on the goal and are never active.

// ------------------------------------------------------------------------------------------------
// MODULES
// ------------------------------------------------------------------------------------------------

mod optimizer;
pub mod params;

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use std::ops::Range;

use nalgebra::Vector3;
use serde::Serialize;

use util::maths::{binomial, clamp};

use crate::auto::traj_gen::PolyTraj;

pub use optimizer::{OptReport, SplineOpt};
pub use params::{Params as SplineOptParams, UnknownPolicy};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Degree of the spline.
pub const DEGREE: usize = 6;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// A uniform B-spline trajectory with an optimisation window.
///
/// The spline is defined over `[0, duration_s()]`. The segment covering
/// `[s * dt_s, (s + 1) * dt_s]` is a blend of control points `s..=s + DEGREE`.
#[derive(Debug, Clone, Serialize)]
pub struct BSpline {
    dt_s: f64,

    ctrl_pts: Vec<Vector3<f64>>,

    /// The control points as they were built, which the optimiser relaxes back towards
    original_pts: Vec<Vector3<f64>>,

    /// Index of the first non-frozen point
    frozen_until: usize,

    num_opt_points: usize,
}

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// The state of a single control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointState {
    Frozen,
    Active,
    Pending,
}

#[derive(Debug, thiserror::Error)]
pub enum BSplineError {
    #[error("Knot spacing must be positive, got {0}")]
    InvalidKnotSpacing(f64),

    #[error("The optimisation window must contain at least one point")]
    EmptyWindow,

    #[error("A degree 6 spline needs at least 7 control points, got {0}")]
    TooFewPoints(usize),

    #[error("Control point {0} is frozen and cannot be changed")]
    FrozenPoint(usize),

    #[error("Control point {0} is not in the optimisation window")]
    NotInWindow(usize),

    #[error("Expected {expected} window points, got {found}")]
    WindowSizeMismatch { expected: usize, found: usize },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl BSpline {
    /// Build a spline directly from control points.
    pub fn new(
        ctrl_pts: Vec<Vector3<f64>>,
        dt_s: f64,
        num_opt_points: usize,
    ) -> Result<Self, BSplineError> {
        if !(dt_s > 0.0 && dt_s.is_finite()) {
            return Err(BSplineError::InvalidKnotSpacing(dt_s));
        }
        if num_opt_points == 0 {
            return Err(BSplineError::EmptyWindow);
        }
        if ctrl_pts.len() < DEGREE + 1 {
            return Err(BSplineError::TooFewPoints(ctrl_pts.len()));
        }

        Ok(Self {
            dt_s,
            original_pts: ctrl_pts.clone(),
            ctrl_pts,
            frozen_until: 0,
            num_opt_points,
        })
    }

    /// Build a spline which follows the given polynomial.
    ///
    /// Control points sample the polynomial every `dt_s`, padded by `DEGREE` copies of the start
    /// and end positions so that the spline begins and ends at rest.
    pub fn from_poly(
        poly: &PolyTraj,
        dt_s: f64,
        num_opt_points: usize,
    ) -> Result<Self, BSplineError> {
        if !(dt_s > 0.0 && dt_s.is_finite()) {
            return Err(BSplineError::InvalidKnotSpacing(dt_s));
        }

        let duration_s = poly.duration_s();
        let num_pts = 2 * DEGREE + 1 + (duration_s / dt_s).ceil() as usize;

        let ctrl_pts = (0..num_pts)
            .map(|j| {
                let t = (j as f64 - DEGREE as f64) * dt_s;
                poly.position(clamp(t, 0.0, duration_s))
            })
            .collect();

        Self::new(ctrl_pts, dt_s, num_opt_points)
    }

    pub fn dt_s(&self) -> f64 {
        self.dt_s
    }

    pub fn num_points(&self) -> usize {
        self.ctrl_pts.len()
    }

    pub fn num_segments(&self) -> usize {
        self.ctrl_pts.len() - DEGREE
    }

    pub fn duration_s(&self) -> f64 {
        self.num_segments() as f64 * self.dt_s
    }

    pub fn control_points(&self) -> &[Vector3<f64>] {
        &self.ctrl_pts
    }

    pub fn original_points(&self) -> &[Vector3<f64>] {
        &self.original_pts
    }

    /// Evaluate the `deriv`th derivative at time `t`, clamped into the spline's duration.
    pub fn eval(&self, t: f64, deriv: usize) -> Vector3<f64> {
        if deriv > DEGREE {
            return Vector3::zeros();
        }

        let (seg, u) = self.locate(t);
        let degree = DEGREE - deriv;
        let weights = basis(degree, u);

        // The derived spline's control points are the `deriv`th differences, the last one of this
        // segment sits on point `seg + DEGREE`
        let mut value = Vector3::zeros();
        for (m, w) in weights.iter().enumerate() {
            value += *w * self.difference(seg + deriv + m, deriv);
        }

        value / self.dt_s.powi(deriv as i32)
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

    /// The end position of the spline, which is held once the spline is complete.
    pub fn end_position(&self) -> Vector3<f64> {
        self.position(self.duration_s())
    }

    /// The control points influencing time `t` and their basis weights.
    ///
    /// Returns the index of the first point and one weight for each of the `DEGREE + 1` points
    /// starting at that index.
    pub fn support(&self, t: f64) -> (usize, Vec<f64>) {
        let (seg, u) = self.locate(t);
        (seg, basis(DEGREE, u))
    }

    /// Range of segment indices influenced by control point `index`.
    pub fn segments_influenced_by(&self, index: usize) -> Range<usize> {
        let start = index.saturating_sub(DEGREE);
        let end = (index + 1).min(self.num_segments());
        start..end.max(start)
    }

    // ---- WINDOW ----

    /// Slide the optimisation window so that no point influencing time `t` is active.
    ///
    /// The window only ever moves forward, points frozen by an earlier call stay frozen.
    pub fn advance(&mut self, t: f64) -> Range<usize> {
        let (seg, _) = self.locate(t);
        let last_influencing = seg + DEGREE;

        self.frozen_until = self
            .frozen_until
            .max(last_influencing + 1)
            .min(self.ctrl_pts.len());

        self.window()
    }

    /// Index range of the active points.
    pub fn window(&self) -> Range<usize> {
        let limit = self.ctrl_pts.len().saturating_sub(DEGREE + 1);
        let start = self.frozen_until.min(limit);
        let end = (self.frozen_until + self.num_opt_points).min(limit);

        start..end
    }

    pub fn frozen_until(&self) -> usize {
        self.frozen_until
    }

    pub fn point_state(&self, index: usize) -> PointState {
        if index < self.frozen_until {
            PointState::Frozen
        } else if self.window().contains(&index) {
            PointState::Active
        } else {
            PointState::Pending
        }
    }

    /// The current positions of the active points.
    pub fn window_points(&self) -> &[Vector3<f64>] {
        &self.ctrl_pts[self.window()]
    }

    /// The original positions of the active points.
    pub fn window_original_points(&self) -> &[Vector3<f64>] {
        &self.original_pts[self.window()]
    }

    /// Move a single active point.
    pub fn set_point(&mut self, index: usize, point: Vector3<f64>) -> Result<(), BSplineError> {
        match self.point_state(index) {
            PointState::Active => {
                self.ctrl_pts[index] = point;
                Ok(())
            }
            PointState::Frozen => Err(BSplineError::FrozenPoint(index)),
            PointState::Pending => Err(BSplineError::NotInWindow(index)),
        }
    }

    /// Replace all active points at once.
    pub fn set_window(&mut self, points: &[Vector3<f64>]) -> Result<(), BSplineError> {
        let window = self.window();

        if points.len() != window.len() {
            return Err(BSplineError::WindowSizeMismatch {
                expected: window.len(),
                found: points.len(),
            });
        }

        self.ctrl_pts[window].copy_from_slice(points);

        Ok(())
    }

    /// The largest first and second control point differences, scaled by the knot spacing, across
    /// the window if its points were replaced by `window_pts`.
    ///
    /// These bound the spline's speed and acceleration over every segment the window touches.
    pub fn hull_peaks_with(&self, window_pts: &[Vector3<f64>]) -> (f64, f64) {
        let window = self.window();
        let point = |j: usize| {
            if window.contains(&j) && j - window.start < window_pts.len() {
                window_pts[j - window.start]
            } else {
                self.ctrl_pts[j]
            }
        };

        let last = self.ctrl_pts.len() - 1;
        let mut v_peak: f64 = 0.0;
        let mut a_peak: f64 = 0.0;

        for j in window.start.max(1)..=(window.end + 1).min(last) {
            if j <= window.end {
                v_peak = v_peak.max((point(j) - point(j - 1)).norm() / self.dt_s);
            }
            if j >= 2 {
                let second = point(j) - 2.0 * point(j - 1) + point(j - 2);
                a_peak = a_peak.max(second.norm() / self.dt_s.powi(2));
            }
        }

        (v_peak, a_peak)
    }

    /// Hull peaks of the window as it currently is.
    pub fn hull_peaks(&self) -> (f64, f64) {
        self.hull_peaks_with(self.window_points())
    }

    // ---- PRIVATE ----

    /// Segment index and normalised time within it for time `t`.
    fn locate(&self, t: f64) -> (usize, f64) {
        let s = (t / self.dt_s).max(0.0);
        let last = self.num_segments() - 1;

        if !s.is_finite() || s >= (last + 1) as f64 {
            return (last, 1.0);
        }

        let seg = (s.floor() as usize).min(last);
        (seg, s - seg as f64)
    }

    /// The `k`th backward difference ending at point `j`.
    fn difference(&self, j: usize, k: usize) -> Vector3<f64> {
        (0..=k).fold(Vector3::zeros(), |acc, l| {
            let sign = if l % 2 == 0 { 1.0 } else { -1.0 };
            acc + sign * binomial::<f64>(k, l) * self.ctrl_pts[j - l]
        })
    }
}

/// Uniform B-spline basis weights of the given degree at normalised time `u`, oldest point first.
fn basis(degree: usize, u: f64) -> Vec<f64> {
    let mut weights = vec![1.0];

    for p in 1..=degree {
        let pf = p as f64;
        let mut next = vec![0.0; p + 1];

        for (k, n) in next.iter_mut().enumerate() {
            let kf = k as f64;
            let left = if k >= 1 { weights[k - 1] } else { 0.0 };
            let right = if k < p { weights[k] } else { 0.0 };

            *n = ((u + pf - kf) * left + (kf + 1.0 - u) * right) / pf;
        }

        weights = next;
    }

    weights
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn line(num_pts: usize) -> BSpline {
        let pts = (0..num_pts)
            .map(|i| Vector3::new(i as f64 * 0.1, 0.0, 1.0))
            .collect();
        BSpline::new(pts, 0.5, 4).unwrap()
    }

    #[test]
    fn test_basis_partition_of_unity() {
        for degree in 0..=DEGREE {
            for i in 0..=10 {
                let u = i as f64 / 10.0;
                let b = basis(degree, u);

                assert_eq!(b.len(), degree + 1);
                assert!((b.iter().sum::<f64>() - 1.0).abs() < 1e-12);
                assert!(b.iter().all(|w| *w >= -1e-12));
            }
        }

        // Known degree 6 weights at a knot
        let b = basis(6, 0.0);
        let expected = [1.0, 57.0, 302.0, 302.0, 57.0, 1.0, 0.0];
        for (w, e) in b.iter().zip(expected.iter()) {
            assert!((w - e / 720.0).abs() < 1e-12);
        }
    }

    #[test]
    fn test_linear_control_points() {
        // Evenly spaced colinear points give a constant velocity spline
        let spline = line(20);

        assert!((spline.duration_s() - 7.0).abs() < 1e-12);
        for i in 0..=14 {
            let t = i as f64 * 0.5;
            let v = spline.velocity(t);
            assert!((v - Vector3::new(0.2, 0.0, 0.0)).norm() < 1e-9);
            assert!(spline.acceleration(t).norm() < 1e-9);
        }

        // Position at a knot is the centre of the supporting points
        let p = spline.position(1.0);
        assert!((p.x - 0.45).abs() < 1e-9);
    }

    #[test]
    fn test_derivative_matches_finite_difference() {
        let pts = (0..12)
            .map(|i| {
                let f = i as f64;
                Vector3::new(f.sin(), (0.3 * f).cos(), f * f * 0.01)
            })
            .collect();
        let spline = BSpline::new(pts, 0.4, 3).unwrap();

        let h = 1e-6;
        for i in 1..20 {
            let t = i as f64 * 0.11;
            let fd = (spline.position(t + h) - spline.position(t - h)) / (2.0 * h);
            assert!((fd - spline.velocity(t)).norm() < 1e-5);

            let fd = (spline.velocity(t + h) - spline.velocity(t - h)) / (2.0 * h);
            assert!((fd - spline.acceleration(t)).norm() < 1e-4);
        }
    }

    #[test]
    fn test_window_only_moves_forward() {
        let mut spline = line(30);

        assert_eq!(spline.advance(0.0), 7..11);
        assert_eq!(spline.point_state(6), PointState::Frozen);
        assert_eq!(spline.point_state(7), PointState::Active);
        assert_eq!(spline.point_state(11), PointState::Pending);

        assert_eq!(spline.advance(1.2), 9..13);

        // Going back in time doesn't unfreeze points
        assert_eq!(spline.advance(0.0), 9..13);

        // The goal points are never active
        let window = spline.advance(100.0);
        assert!(window.is_empty());
        assert!(spline.window_points().is_empty());
    }

    #[test]
    fn test_frozen_points_rejected() {
        let mut spline = line(30);
        spline.advance(2.0);

        let window = spline.window();
        assert!(matches!(
            spline.set_point(window.start - 1, Vector3::zeros()),
            Err(BSplineError::FrozenPoint(_))
        ));
        assert!(matches!(
            spline.set_point(window.end, Vector3::zeros()),
            Err(BSplineError::NotInWindow(_))
        ));
        assert!(matches!(
            spline.set_window(&[Vector3::zeros()]),
            Err(BSplineError::WindowSizeMismatch { .. })
        ));

        spline.set_point(window.start, Vector3::zeros()).unwrap();
        assert_eq!(spline.control_points()[window.start], Vector3::zeros());
        assert_ne!(spline.original_points()[window.start], Vector3::zeros());
    }

    #[test]
    fn test_hull_peaks() {
        let spline = line(30);

        let (v, a) = spline.hull_peaks();
        assert!((v - 0.2).abs() < 1e-12);
        assert!(a < 1e-12);

        // Kink one point sideways
        let mut kinked = spline.window_points().to_vec();
        kinked[1].y += 0.1;
        let (v, a) = spline.hull_peaks_with(&kinked);
        assert!((v - (0.1f64.powi(2) * 2.0).sqrt() / 0.5).abs() < 1e-12);
        assert!((a - 0.2 / 0.25).abs() < 1e-12);
    }

    #[test]
    fn test_invalid_construction() {
        assert!(matches!(
            BSpline::new(vec![Vector3::zeros(); 3], 0.5, 2),
            Err(BSplineError::TooFewPoints(3))
        ));
        assert!(matches!(
            BSpline::new(vec![Vector3::zeros(); 10], 0.0, 2),
            Err(BSplineError::InvalidKnotSpacing(_))
        ));
        assert!(matches!(
            BSpline::new(vec![Vector3::zeros(); 10], 0.5, 0),
            Err(BSplineError::EmptyWindow)
        ));
    }
}
