//! B-spline obstacle avoidance optimiser
//!
//! Each cycle samples the distance field along every segment the optimisation window influences.
//! Samples closer to an obstacle than the distance threshold push the points supporting them away
//! from the obstacle, normal to the direction of travel. Points which aren't pushed relax back
//! towards where they started.
//!
//! Every step must keep the control point hull inside the kinematic limits, or at least not make it
//! worse. A step which breaks them is first projected back onto the limits by moving the other
//! active points, which spreads a sideways correction along the window instead of kinking the
//! spline at the pushed points. If the projection still can't satisfy the limits the step is halved
//! and eventually rejected.

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use log::{trace, warn};
use nalgebra::{Point3, Vector3};
use ordered_float::OrderedFloat;
use serde::Serialize;

use crate::auto::{map::DistField, traj_gen::KinematicLimits};

use super::{
    params::{Params, UnknownPolicy},
    BSpline,
};

// ------------------------------------------------------------------------------------------------
// CONSTANTS
// ------------------------------------------------------------------------------------------------

/// Below this size the gradient normal to the spline gives no useful direction, the obstacle is
/// head on.
const MIN_NORMAL_GRADIENT: f64 = 0.05;

/// Speeds below this have no meaningful direction of travel.
const MIN_SPEED_MS: f64 = 1e-6;

// ------------------------------------------------------------------------------------------------
// STRUCTS
// ------------------------------------------------------------------------------------------------

/// The spline optimiser.
#[derive(Debug, Clone)]
pub struct SplineOpt {
    params: Params,
}

/// Summary of one optimisation cycle.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct OptReport {
    /// Index of the first point in the window during this cycle
    pub window_start: usize,

    /// Number of iterations run
    pub num_iterations: usize,

    /// Number of steps applied to the window
    pub num_steps: usize,

    /// Number of steps rejected for breaking the kinematic limits
    pub num_rejected: usize,

    /// True if the corrections became smaller than the convergence tolerance
    pub converged: bool,

    /// Largest clearance deficit of the final state
    pub max_violation_m: f64,

    /// Sum of all clearance deficits of the final state
    pub total_violation_m: f64,

    /// Number of distance samples taken of the final state
    pub num_samples: usize,

    /// Number of those samples in unknown space
    pub num_unknown: usize,
}

/// Clearance of the window's segments and the corrections it implies.
#[derive(Debug, Default)]
struct Evaluation {
    max_violation_m: f64,
    total_violation_m: f64,
    num_samples: usize,
    num_unknown: usize,

    /// Weighted sum of pushes on each active point
    pushes: Vec<Vector3<f64>>,

    /// True for each active point which received any push
    pushed: Vec<bool>,
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl SplineOpt {
    pub fn new(params: Params) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Run one optimisation cycle over the spline's current window.
    ///
    /// Only active points are moved. The cycle never fails, if it doesn't converge the best state
    /// seen is kept and `converged` is false in the report.
    pub fn optimize(
        &self,
        spline: &mut BSpline,
        field: &DistField,
        limits: &KinematicLimits,
    ) -> OptReport {
        let mut report = OptReport {
            window_start: spline.window().start,
            ..Default::default()
        };

        if spline.window().is_empty() {
            report.converged = true;
            return report;
        }

        let original = spline.window_original_points().to_vec();
        let mut best: Option<((OrderedFloat<f64>, OrderedFloat<f64>), Vec<Vector3<f64>>)> = None;
        let mut final_eval = None;

        for _ in 0..self.params.max_iterations {
            report.num_iterations += 1;

            let eval = self.evaluate(spline, field);
            let metric = eval.metric();
            if best.as_ref().map_or(true, |(m, _)| metric < *m) {
                best = Some((metric, spline.window_points().to_vec()));
            }

            let steps = self.steps(spline, &eval, &original);
            let largest = steps.iter().map(|s| s.norm()).fold(0.0, f64::max);

            if largest < self.params.convergence_tol_m {
                report.converged = true;
                final_eval = Some(eval);
                break;
            }

            match self.limited_step(spline, &steps, limits) {
                Some(candidate) => {
                    if let Err(e) = spline.set_window(&candidate) {
                        warn!("Could not apply optimiser step: {}", e);
                        break;
                    }
                    report.num_steps += 1;
                }
                None => {
                    report.num_rejected += 1;
                    break;
                }
            }
        }

        let mut eval = match final_eval {
            Some(e) => e,
            None => self.evaluate(spline, field),
        };

        // Fall back to the best state if the last steps made things worse
        if let Some((metric, points)) = best {
            if metric < eval.metric() {
                if let Err(e) = spline.set_window(&points) {
                    warn!("Could not restore best optimiser state: {}", e);
                } else {
                    eval = self.evaluate(spline, field);
                }
            }
        }

        report.max_violation_m = eval.max_violation_m;
        report.total_violation_m = eval.total_violation_m;
        report.num_samples = eval.num_samples;
        report.num_unknown = eval.num_unknown;

        trace!(
            "Opt cycle from point {}: {} iters, {} steps, {} rejected, max violation {:.3} m, \
             converged: {}",
            report.window_start,
            report.num_iterations,
            report.num_steps,
            report.num_rejected,
            report.max_violation_m,
            report.converged
        );

        report
    }

    /// Sample the clearance of every segment influenced by the window.
    fn evaluate(&self, spline: &BSpline, field: &DistField) -> Evaluation {
        let window = spline.window();
        let mut eval = Evaluation {
            pushes: vec![Vector3::zeros(); window.len()],
            pushed: vec![false; window.len()],
            ..Default::default()
        };

        if window.is_empty() {
            return eval;
        }

        let threshold = self.params.distance_threshold_m;
        let num_samples = self.params.samples_per_segment.max(1);
        let segs = spline.segments_influenced_by(window.start).start
            ..spline.segments_influenced_by(window.end - 1).end;

        for seg in segs {
            for k in 0..num_samples {
                let t = (seg as f64 + (k as f64 + 0.5) / num_samples as f64) * spline.dt_s();
                let position = Point3::from(spline.position(t));
                eval.num_samples += 1;

                let (dist_m, gradient) = match field.distance_with_gradient(&position) {
                    Some(d) => d,
                    None => {
                        eval.num_unknown += 1;
                        if self.params.unknown_policy == UnknownPolicy::Conservative {
                            eval.add_violation(threshold);
                        }
                        continue;
                    }
                };

                let deficit = threshold - dist_m;
                if deficit <= 0.0 {
                    continue;
                }
                eval.add_violation(deficit);

                let direction = push_direction(&gradient, &spline.velocity(t));
                let (first, weights) = spline.support(t);

                for (m, w) in weights.iter().enumerate() {
                    let j = first + m;
                    if *w > 0.0 && window.contains(&j) {
                        eval.pushes[j - window.start] += *w * deficit * direction;
                        eval.pushed[j - window.start] = true;
                    }
                }
            }
        }

        eval
    }

    /// The step each active point wants to take.
    fn steps(
        &self,
        spline: &BSpline,
        eval: &Evaluation,
        original: &[Vector3<f64>],
    ) -> Vec<Vector3<f64>> {
        let scale = self.params.gain / self.params.samples_per_segment.max(1) as f64;

        spline
            .window_points()
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let step = if eval.pushed[i] {
                    eval.pushes[i] * scale
                } else {
                    (original[i] - p) * self.params.restore_gain
                };

                clamp_norm(step, self.params.max_step_m)
            })
            .collect()
    }

    /// Halve the step until the window's hull is within the limits, or at least no worse than it
    /// was. Each candidate is projected onto the limits before it is checked. Returns the new
    /// window points, or `None` if no step was acceptable.
    fn limited_step(
        &self,
        spline: &BSpline,
        steps: &[Vector3<f64>],
        limits: &KinematicLimits,
    ) -> Option<Vec<Vector3<f64>>> {
        let current = spline.window_points();
        let (v_now, a_now) = spline.hull_peaks();

        let acceptable =
            |peak: f64, limit: f64, now: f64| peak <= limit * (1.0 + 1e-9) || peak <= now + 1e-12;

        let mut scale = 1.0;
        for _ in 0..=self.params.max_step_halvings {
            let candidate: Vec<Vector3<f64>> = current
                .iter()
                .zip(steps.iter())
                .map(|(p, s)| p + s * scale)
                .collect();
            let candidate =
                project_onto_limits(spline, &candidate, limits, self.params.projection_sweeps);

            let (v, a) = spline.hull_peaks_with(&candidate);
            if acceptable(v, limits.max_velocity_ms, v_now)
                && acceptable(a, limits.max_accel_mss, a_now)
            {
                return Some(candidate);
            }

            scale *= 0.5;
        }

        None
    }
}

impl Evaluation {
    fn add_violation(&mut self, deficit_m: f64) {
        self.max_violation_m = self.max_violation_m.max(deficit_m);
        self.total_violation_m += deficit_m;
    }

    /// Ordering of states, smallest worst deficit first then smallest total.
    fn metric(&self) -> (OrderedFloat<f64>, OrderedFloat<f64>) {
        (
            OrderedFloat(self.max_violation_m),
            OrderedFloat(self.total_violation_m),
        )
    }
}

// ------------------------------------------------------------------------------------------------
// FUNCTIONS
// ------------------------------------------------------------------------------------------------

/// Unit direction to push a spline moving with `velocity` away from an obstacle.
///
/// This is the distance gradient with the along-track part removed. Head on to an obstacle there
/// is no normal part, so the spline is pushed to its left in the horizontal plane instead.
fn push_direction(gradient: &Vector3<f64>, velocity: &Vector3<f64>) -> Vector3<f64> {
    let speed = velocity.norm();

    if speed < MIN_SPEED_MS {
        let norm = gradient.norm();
        return if norm > 0.0 {
            gradient / norm
        } else {
            Vector3::zeros()
        };
    }

    let tangent = velocity / speed;
    let normal = gradient - tangent * gradient.dot(&tangent);
    let norm = normal.norm();

    if norm > MIN_NORMAL_GRADIENT {
        return normal / norm;
    }

    let left = Vector3::z().cross(&tangent);
    let left_norm = left.norm();
    if left_norm > MIN_NORMAL_GRADIENT {
        left / left_norm
    } else {
        // Vertical travel
        Vector3::x()
    }
}

/// Move the active points in `window_pts` until the hull of the spline's first and second
/// differences is inside the limits, or `max_sweeps` passes have been made.
///
/// Each pass walks the differences touching the window in order. A difference over its limit is
/// shrunk back onto it by the smallest move of the active points it involves, frozen and pending
/// points never move.
fn project_onto_limits(
    spline: &BSpline,
    window_pts: &[Vector3<f64>],
    limits: &KinematicLimits,
    max_sweeps: usize,
) -> Vec<Vector3<f64>> {
    let window = spline.window();

    let mut pts = spline.control_points().to_vec();
    pts[window.clone()].copy_from_slice(window_pts);

    let dt = spline.dt_s();
    let first_limit = limits.max_velocity_ms * dt;
    let second_limit = limits.max_accel_mss * dt * dt;
    let last = pts.len() - 1;
    let active = |j: usize| window.contains(&j);

    for _ in 0..max_sweeps {
        let mut worst: f64 = 0.0;

        for j in window.start.max(1)..=(window.end + 1).min(last) {
            if j <= window.end {
                let first = pts[j] - pts[j - 1];
                let norm = first.norm();

                if norm > first_limit {
                    worst = worst.max(norm / first_limit - 1.0);
                    let excess = first * ((norm - first_limit) / norm);

                    match (active(j - 1), active(j)) {
                        (true, true) => {
                            pts[j] -= excess * 0.5;
                            pts[j - 1] += excess * 0.5;
                        }
                        (false, true) => pts[j] -= excess,
                        (true, false) => pts[j - 1] += excess,
                        (false, false) => (),
                    }
                }
            }

            if j >= 2 {
                let second = pts[j] - 2.0 * pts[j - 1] + pts[j - 2];
                let norm = second.norm();

                if norm > second_limit {
                    worst = worst.max(norm / second_limit - 1.0);
                    let excess = second * ((norm - second_limit) / norm);

                    let coeffs = [(j, 1.0), (j - 1, -2.0), (j - 2, 1.0)];
                    let denom: f64 = coeffs
                        .iter()
                        .filter(|(k, _)| active(*k))
                        .map(|(_, c)| c * c)
                        .sum();

                    if denom > 0.0 {
                        for (k, c) in coeffs.iter() {
                            if active(*k) {
                                pts[*k] -= excess * (c / denom);
                            }
                        }
                    }
                }
            }
        }

        if worst < 1e-9 {
            break;
        }
    }

    pts[window].to_vec()
}

fn clamp_norm(v: Vector3<f64>, max: f64) -> Vector3<f64> {
    let norm = v.norm();
    if norm > max {
        v * (max / norm)
    } else {
        v
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use crate::auto::map::DistFieldParams;

    fn line_spline() -> BSpline {
        let pts = (0..40)
            .map(|i| Vector3::new(i as f64 * 0.1, 0.0, 1.0))
            .collect();
        BSpline::new(pts, 0.5, 7).unwrap()
    }

    fn field_with_obstacle(obstacle: &Point3<f64>) -> DistField {
        let mut field = DistField::new(DistFieldParams {
            carve_free_space: false,
            ..Default::default()
        })
        .unwrap();
        field.set_center(&Point3::new(2.0, 0.0, 1.0));
        field.insert(&[*obstacle], &Point3::new(0.0, 0.0, 1.0));
        field
    }

    fn roomy() -> KinematicLimits {
        KinematicLimits {
            max_velocity_ms: 2.0,
            max_accel_mss: 4.0,
        }
    }

    #[test]
    fn test_clear_field_takes_no_steps() {
        let field = DistField::new(DistFieldParams::default()).unwrap();

        // Optimistic, everything is clear
        let opt = SplineOpt::new(Params {
            unknown_policy: UnknownPolicy::Optimistic,
            ..Default::default()
        });
        let mut spline = line_spline();
        spline.advance(5.0);
        let before = spline.clone();

        let report = opt.optimize(&mut spline, &field, &roomy());

        assert!(report.converged);
        assert_eq!(report.num_steps, 0);
        assert_eq!(report.max_violation_m, 0.0);
        assert!(report.num_samples > 0);
        assert_eq!(report.num_unknown, report.num_samples);
        assert_eq!(spline.control_points(), before.control_points());

        // Conservative, unknown space is reported but gives nothing to push against
        let opt = SplineOpt::new(Params::default());
        let report = opt.optimize(&mut spline, &field, &roomy());

        assert!(report.converged);
        assert_eq!(report.num_steps, 0);
        assert!((report.max_violation_m - 0.3).abs() < 1e-12);
        assert_eq!(spline.control_points(), before.control_points());
    }

    #[test]
    fn test_pushes_away_without_touching_frozen() {
        let field = field_with_obstacle(&Point3::new(2.0, 0.12, 1.0));
        let opt = SplineOpt::new(Params {
            unknown_policy: UnknownPolicy::Optimistic,
            ..Default::default()
        });

        let mut spline = line_spline();
        let window = spline.advance(5.0);
        assert_eq!(window, 17..24);
        let before = spline.clone();

        // Smallest clearance over the segments the window controls
        let clearance = |s: &BSpline| {
            (0..=80)
                .map(|i| 8.0 + i as f64 * 0.05)
                .filter_map(|t| field.distance_with_gradient(&Point3::from(s.position(t))))
                .map(|(d, _)| d)
                .fold(f64::INFINITY, f64::min)
        };
        let clearance_before = clearance(&spline);
        assert!(clearance_before < 0.3);

        let first = opt.optimize(&mut spline, &field, &roomy());
        assert!(first.num_steps > 0);

        let mut last = first;
        for _ in 0..20 {
            last = opt.optimize(&mut spline, &field, &roomy());
        }

        assert!(last.max_violation_m <= first.max_violation_m);
        assert!(clearance(&spline) > clearance_before + 0.05);

        // Moved away from the obstacle, which is on the +y side
        assert!(spline.control_points()[20].y < -0.01);

        // Only the window changed
        for j in 0..spline.num_points() {
            if !window.contains(&j) {
                assert_eq!(spline.control_points()[j], before.control_points()[j]);
            }
        }
    }

    #[test]
    fn test_step_rejected_at_limits() {
        let field = field_with_obstacle(&Point3::new(2.0, 0.12, 1.0));
        let opt = SplineOpt::new(Params {
            unknown_policy: UnknownPolicy::Optimistic,
            ..Default::default()
        });

        let mut spline = line_spline();
        spline.advance(5.0);
        let before = spline.clone();

        // Any sideways step bends the straight line, which these limits can't allow
        let tight = KinematicLimits {
            max_velocity_ms: 0.1,
            max_accel_mss: 1e-6,
        };
        let report = opt.optimize(&mut spline, &field, &tight);

        assert_eq!(report.num_steps, 0);
        assert_eq!(report.num_rejected, 1);
        assert!(!report.converged);
        assert_eq!(spline.control_points(), before.control_points());
    }

    #[test]
    fn test_correction_spread_within_limits() {
        // Head on obstacle, with limits which a kink at the pushed points would break
        let field = field_with_obstacle(&Point3::new(2.0, 0.05, 1.0));
        let opt = SplineOpt::new(Params {
            unknown_policy: UnknownPolicy::Optimistic,
            ..Default::default()
        });
        let limits = KinematicLimits {
            max_velocity_ms: 0.3,
            max_accel_mss: 0.5,
        };

        let mut spline = line_spline();
        let window = spline.advance(5.0);

        let clearance = |s: &BSpline| {
            (0..=80)
                .map(|i| 8.0 + i as f64 * 0.05)
                .filter_map(|t| field.distance_with_gradient(&Point3::from(s.position(t))))
                .map(|(d, _)| d)
                .fold(f64::INFINITY, f64::min)
        };
        assert!(clearance(&spline) < 0.1);

        for _ in 0..20 {
            opt.optimize(&mut spline, &field, &limits);
        }

        let (v, a) = spline.hull_peaks();
        assert!(v <= limits.max_velocity_ms * (1.0 + 1e-6), "v = {}", v);
        assert!(a <= limits.max_accel_mss * (1.0 + 1e-6), "a = {}", a);
        assert!(clearance(&spline) > 0.25);

        // The whole window leans away, not just the points next to the obstacle
        for j in window.clone() {
            assert!(spline.control_points()[j].y < -0.01);
        }
        assert!(spline.control_points()[window.start + 3].y < -0.12);
    }

    #[test]
    fn test_restores_towards_original() {
        let field = DistField::new(DistFieldParams::default()).unwrap();
        let opt = SplineOpt::new(Params {
            unknown_policy: UnknownPolicy::Optimistic,
            max_iterations: 50,
            ..Default::default()
        });

        let mut spline = line_spline();
        let window = spline.advance(5.0);
        spline
            .set_point(window.start + 2, Vector3::new(1.9, 0.1, 1.0))
            .unwrap();

        opt.optimize(&mut spline, &field, &roomy());

        let moved = spline.control_points()[window.start + 2];
        assert!(moved.y < 0.1);
        assert!(moved.y >= 0.0);
    }

    #[test]
    fn test_push_direction() {
        let along = Vector3::new(1.0, 0.0, 0.0);

        // Gradient with a sideways part
        let d = push_direction(&Vector3::new(-0.8, -0.6, 0.0), &along);
        assert!((d - Vector3::new(0.0, -1.0, 0.0)).norm() < 1e-12);

        // Head on, escape to the left
        let d = push_direction(&Vector3::new(-1.0, 0.0, 0.0), &along);
        assert!((d - Vector3::new(0.0, 1.0, 0.0)).norm() < 1e-12);

        // Stationary
        let d = push_direction(&Vector3::new(0.0, 0.0, 2.0), &Vector3::zeros());
        assert!((d - Vector3::z()).norm() < 1e-12);
    }
}
