//! # Trajectory generation module
//!
//! Converts a sequence of waypoints into a minimum snap piecewise polynomial which respects the
//! vehicle's kinematic limits.
//!
//! Each segment is a 9th order polynomial in normalised time `tau = t / T` over its duration `T`.
//! The trajectory starts and ends at rest (zero velocity, acceleration, jerk and snap), passes
//! through every waypoint, and is continuous up to the 6th derivative at interior waypoints. The
//! coefficients minimise the integral of squared snap, which is an equality constrained quadratic
//! program solved directly through its KKT system, once for all three axes.
//!
//! Initial segment durations come from a trapezoidal velocity profile. Because coefficients are in
//! normalised time, uniformly scaling the durations doesn't change the optimal path, only the speed
//! it is flown at, so the durations are then scaled until the sampled peak speed and acceleration
//! sit on the limits.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod params;
mod poly;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

use log::{debug, warn};
use nalgebra::{DMatrix, Vector3};

use util::maths::falling_factorial;

pub use params::{KinematicLimits, Params};
pub use poly::{PolySegment, PolyTraj, NUM_COEFFS};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Number of derivatives fixed to zero at the start and end of the trajectory.
const NUM_REST_DERIVS: usize = 4;

/// Highest derivative kept continuous across interior waypoints.
const MAX_CONTINUOUS_DERIV: usize = 6;

/// The derivative whose squared integral is minimised (snap).
const COST_DERIV: usize = 4;

/// Peaks below this are treated as a stationary trajectory which needs no scaling.
const STATIONARY_PEAK: f64 = 1e-9;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// The minimum snap trajectory generator.
#[derive(Debug, Clone)]
pub struct TrajGen {
    params: Params,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// Errors which can occur while generating a trajectory.
#[derive(Debug, thiserror::Error)]
pub enum TrajGenError {
    #[error("At least two waypoints are required, got {0}")]
    TooFewWaypoints(usize),

    #[error("Kinematic limits must be positive, got {0:?}")]
    InvalidLimits(KinematicLimits),

    #[error("A waypoint contains a non-finite coordinate")]
    NonFiniteWaypoint,

    #[error("The minimum snap system is singular")]
    SingularSystem,
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl TrajGen {
    pub fn new(params: Params) -> Self {
        Self { params }
    }

    pub fn params(&self) -> &Params {
        &self.params
    }

    /// Generate a trajectory through the given waypoints.
    pub fn generate(
        &self,
        waypoints: &[Vector3<f64>],
        limits: &KinematicLimits,
    ) -> Result<PolyTraj, TrajGenError> {
        if waypoints.len() < 2 {
            return Err(TrajGenError::TooFewWaypoints(waypoints.len()));
        }
        if !limits.is_valid() {
            return Err(TrajGenError::InvalidLimits(*limits));
        }
        if waypoints.iter().any(|w| w.iter().any(|c| !c.is_finite())) {
            return Err(TrajGenError::NonFiniteWaypoint);
        }

        let durations: Vec<f64> = waypoints
            .windows(2)
            .map(|w| {
                trapezoidal_duration((w[1] - w[0]).norm(), limits)
                    .max(self.params.min_segment_duration_s)
            })
            .collect();

        let mut traj = solve_min_snap(waypoints, &durations)?;

        // ---- DURATION SCALING ----

        let mut factor = 1.0;
        for _ in 0..self.params.max_scaling_iters.max(1) {
            let (v_peak, a_peak) = traj.peaks(self.params.samples_per_segment);

            if v_peak < STATIONARY_PEAK && a_peak < STATIONARY_PEAK {
                factor = 1.0;
                break;
            }

            factor = (v_peak / limits.max_velocity_ms).max((a_peak / limits.max_accel_mss).sqrt());

            if (factor - 1.0).abs() < 1e-6 {
                break;
            }

            traj.scale_durations(factor);
        }

        let (v_peak, a_peak) = traj.peaks(self.params.samples_per_segment);
        let tol = 1.0 + self.params.limit_tolerance;
        if v_peak > limits.max_velocity_ms * tol || a_peak > limits.max_accel_mss * tol {
            warn!(
                "Trajectory exceeds limits after scaling (v = {:.3} m/s, a = {:.3} m/s^2, last \
                 factor {:.4})",
                v_peak, a_peak, factor
            );
        }

        debug!(
            "Generated {} segment trajectory lasting {:.2} s (v_peak = {:.3} m/s, a_peak = {:.3} \
             m/s^2)",
            traj.segments().len(),
            traj.duration_s(),
            v_peak,
            a_peak
        );

        Ok(traj)
    }
}

// ---------------------------------------------------------------------------
// PRIVATE FUNCTIONS
// ---------------------------------------------------------------------------

/// Time to travel `dist_m` from rest to rest with a trapezoidal velocity profile.
fn trapezoidal_duration(dist_m: f64, limits: &KinematicLimits) -> f64 {
    let v = limits.max_velocity_ms;
    let a = limits.max_accel_mss;

    if dist_m >= v * v / a {
        dist_m / v + v / a
    } else {
        2.0 * (dist_m / a).sqrt()
    }
}

/// Solve the minimum snap KKT system for the given waypoints and segment durations.
fn solve_min_snap(
    waypoints: &[Vector3<f64>],
    durations: &[f64],
) -> Result<PolyTraj, TrajGenError> {
    let num_segs = durations.len();
    let num_vars = NUM_COEFFS * num_segs;
    let num_cons = 2 * (NUM_REST_DERIVS + 1) + (MAX_CONTINUOUS_DERIV + 2) * (num_segs - 1);
    let n = num_vars + num_cons;

    let var = |seg: usize, coeff: usize| seg * NUM_COEFFS + coeff;
    let ff = |n: usize, k: usize| falling_factorial::<f64>(n, k);

    let mut kkt = DMatrix::<f64>::zeros(n, n);
    let mut rhs = DMatrix::<f64>::zeros(n, 3);

    // ---- COST ----

    // Costs are weighted relative to the mean duration, which keeps the matrix well scaled without
    // moving the minimum
    let t_ref = durations.iter().sum::<f64>() / num_segs as f64;

    for (seg, dur) in durations.iter().enumerate() {
        let weight = (t_ref / dur).powi(2 * COST_DERIV as i32 - 1);

        for j in COST_DERIV..NUM_COEFFS {
            for k in COST_DERIV..NUM_COEFFS {
                kkt[(var(seg, j), var(seg, k))] = weight * ff(j, COST_DERIV) * ff(k, COST_DERIV)
                    / (j + k + 1 - 2 * COST_DERIV) as f64;
            }
        }
    }

    // ---- CONSTRAINTS ----

    let mut row = num_vars;
    let mut add_constraint = |coeffs: &[(usize, f64)], value: &Vector3<f64>| {
        for (col, c) in coeffs {
            kkt[(row, *col)] += *c;
            kkt[(*col, row)] += *c;
        }
        for a in 0..3 {
            rhs[(row, a)] = value[a];
        }
        row += 1;
    };

    let zero = Vector3::zeros();
    let last = num_segs - 1;

    // Start and end at rest
    for k in 0..=NUM_REST_DERIVS {
        let value = if k == 0 { &waypoints[0] } else { &zero };
        add_constraint(&[(var(0, k), ff(k, k))], value);
    }
    for k in 0..=NUM_REST_DERIVS {
        let value = if k == 0 { &waypoints[num_segs] } else { &zero };
        let coeffs: Vec<(usize, f64)> = (k..NUM_COEFFS).map(|j| (var(last, j), ff(j, k))).collect();
        add_constraint(&coeffs, value);
    }

    // Interior waypoints
    for seg in 0..last {
        let waypoint = &waypoints[seg + 1];

        let end_pos: Vec<(usize, f64)> = (0..NUM_COEFFS).map(|j| (var(seg, j), 1.0)).collect();
        add_constraint(&end_pos, waypoint);
        add_constraint(&[(var(seg + 1, 0), 1.0)], waypoint);

        // Derivatives are compared in real time, scaled through by this segment's duration
        let ratio = durations[seg] / durations[seg + 1];
        for k in 1..=MAX_CONTINUOUS_DERIV {
            let mut coeffs: Vec<(usize, f64)> =
                (k..NUM_COEFFS).map(|j| (var(seg, j), ff(j, k))).collect();
            coeffs.push((var(seg + 1, k), -ratio.powi(k as i32) * ff(k, k)));
            add_constraint(&coeffs, &zero);
        }
    }

    // ---- SOLVE ----

    let sol = kkt.lu().solve(&rhs).ok_or(TrajGenError::SingularSystem)?;
    if sol.iter().any(|c| !c.is_finite()) {
        return Err(TrajGenError::SingularSystem);
    }

    let segments = durations
        .iter()
        .enumerate()
        .map(|(seg, dur)| {
            let mut coeffs = [[0.0; NUM_COEFFS]; 3];
            for (a, axis) in coeffs.iter_mut().enumerate() {
                for (j, c) in axis.iter_mut().enumerate() {
                    *c = sol[(var(seg, j), a)];
                }
            }
            PolySegment {
                duration_s: *dur,
                coeffs,
            }
        })
        .collect();

    Ok(PolyTraj::new(waypoints.to_vec(), segments))
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    fn limits() -> KinematicLimits {
        KinematicLimits {
            max_velocity_ms: 0.3,
            max_accel_mss: 0.5,
        }
    }

    #[test]
    fn test_two_waypoints() {
        let traj_gen = TrajGen::new(Params::default());
        let start = Vector3::new(0.0, 0.0, 1.0);
        let end = Vector3::new(5.0, 0.0, 1.0);

        let traj = traj_gen.generate(&[start, end], &limits()).unwrap();
        let dur = traj.duration_s();

        assert!((traj.position(0.0) - start).norm() < 1e-6);
        assert!((traj.position(dur) - end).norm() < 1e-6);
        assert!(traj.velocity(0.0).norm() < 1e-6);
        assert!(traj.velocity(dur).norm() < 1e-6);
        assert!(traj.acceleration(dur).norm() < 1e-6);

        // Straight line
        for i in 0..=50 {
            let p = traj.position(dur * i as f64 / 50.0);
            assert!(p.y.abs() < 1e-6 && (p.z - 1.0).abs() < 1e-6);
        }

        // Peaks on, but not over, the limits
        let (v_peak, a_peak) = traj.peaks(400);
        assert!(v_peak <= 0.3 * 1.01);
        assert!(a_peak <= 0.5 * 1.01);
        assert!(v_peak > 0.3 * 0.99 || a_peak > 0.5 * 0.99);
    }

    #[test]
    fn test_limits_property() {
        let traj_gen = TrajGen::new(Params::default());
        let limit_sets = [
            limits(),
            KinematicLimits {
                max_velocity_ms: 2.0,
                max_accel_mss: 0.2,
            },
            KinematicLimits {
                max_velocity_ms: 0.05,
                max_accel_mss: 4.0,
            },
        ];

        for lims in limit_sets.iter() {
            for i in 0..10 {
                let f = i as f64;
                let start = Vector3::new(f * 0.3 - 1.0, (f * 1.7).sin(), 0.5 * f);
                let end = Vector3::new((f * 0.9).cos() * 4.0, f * 0.2, 1.0 - f * 0.01);

                let traj = traj_gen.generate(&[start, end], lims).unwrap();
                let (v_peak, a_peak) = traj.peaks(400);

                assert!(v_peak <= lims.max_velocity_ms * 1.01, "v = {}", v_peak);
                assert!(a_peak <= lims.max_accel_mss * 1.01, "a = {}", a_peak);
            }
        }
    }

    #[test]
    fn test_multi_waypoint_continuity() {
        let traj_gen = TrajGen::new(Params::default());
        let waypoints = [
            Vector3::new(0.0, 0.0, 1.0),
            Vector3::new(2.0, 1.0, 1.0),
            Vector3::new(3.0, -1.0, 1.5),
            Vector3::new(5.0, 0.0, 1.0),
        ];

        let traj = traj_gen.generate(&waypoints, &limits()).unwrap();
        assert_eq!(traj.segments().len(), 3);

        let mut t = 0.0;
        for (seg, waypoint) in traj.segments().iter().zip(waypoints[1..].iter()) {
            t += seg.duration_s;
            assert!((traj.position(t) - waypoint).norm() < 1e-6);

            let eps = 1e-7;
            for deriv in 0..3 {
                let before = traj.eval(t - eps, deriv);
                let after = traj.eval(t + eps, deriv);
                assert!((before - after).norm() < 1e-4, "deriv {} at t = {}", deriv, t);
            }
        }
    }

    #[test]
    fn test_invalid_inputs() {
        let traj_gen = TrajGen::new(Params::default());
        let w = Vector3::new(1.0, 2.0, 3.0);

        assert!(matches!(
            traj_gen.generate(&[w], &limits()),
            Err(TrajGenError::TooFewWaypoints(1))
        ));
        assert!(matches!(
            traj_gen.generate(&[w, w * 2.0], &limits().scaled(0.0)),
            Err(TrajGenError::InvalidLimits(_))
        ));
        assert!(matches!(
            traj_gen.generate(&[w, Vector3::new(f64::NAN, 0.0, 0.0)], &limits()),
            Err(TrajGenError::NonFiniteWaypoint)
        ));

        // Repeated waypoints give a stationary trajectory
        let traj = traj_gen.generate(&[w, w], &limits()).unwrap();
        assert!((traj.position(0.05) - w).norm() < 1e-9);
        assert_eq!(traj.peaks(10), (0.0, 0.0));
    }
}
