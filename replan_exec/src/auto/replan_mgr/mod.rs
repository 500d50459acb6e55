//! # Replan Manager
//!
//! Ties the perception, mapping and trajectory modules into the setpoint stream.
//!
//! Depth frames are sent to a worker thread which projects them, recentres the distance field on
//! the camera and inserts the new points. On every control tick the owning thread advances the
//! trajectory clock, slides the optimisation window along the spline, runs an optimisation cycle
//! against the field and emits the spline's position at the new time.
//!
//! A new goal throws away the current spline and seeds a new one from a minimum snap polynomial
//! between the vehicle's position and the goal.

// -----------------------------------------------------------------------------------------------
// IMPORTS
// -----------------------------------------------------------------------------------------------

use std::{
    sync::{
        mpsc::{channel, Receiver, RecvError, SendError, Sender, TryRecvError},
        Arc, PoisonError, RwLock,
    },
    thread::{self, JoinHandle},
};

use comms_if::eqpt::{depth::DepthImage, fc::Setpoint};
use log::{error, info, warn};
use nalgebra::{Point3, Vector3};
use serde::Serialize;

use crate::auto::{
    loc::Pose,
    map::{DistField, DistFieldError, InsertReport},
    per::{PerError, PerMgr},
    spline::{BSpline, BSplineError, OptReport, SplineOpt},
    traj_gen::{TrajGen, TrajGenError},
};

use self::worker::{worker_thread, WorkerSignal};

pub use self::{
    params::{ReplanMgrConfig, ReplanMgrParams},
    worker::FrameReport,
};

// -----------------------------------------------------------------------------------------------
// MODULES
// -----------------------------------------------------------------------------------------------

pub mod params;
mod worker;

// -----------------------------------------------------------------------------------------------
// STRUCTS
// -----------------------------------------------------------------------------------------------

/// The replan manager.
#[derive(Debug)]
pub struct ReplanMgr {
    shared: Arc<Shared>,

    worker_jh: Option<JoinHandle<Result<(), ReplanMgrError>>>,

    worker_sender: Sender<WorkerSignal>,
    worker_reciever: Receiver<WorkerSignal>,

    /// True while the worker is processing a frame, further frames are dropped until it finishes
    frame_in_flight: bool,

    traj_gen: TrajGen,

    vehicle_pose: Option<Pose>,

    report: StatusReport,
}

/// The trajectory currently being flown.
#[derive(Debug, Clone, Serialize)]
pub struct ActiveTraj {
    pub goal_m: Vector3<f64>,

    pub spline: BSpline,

    /// Time along the spline of the last emitted setpoint
    pub clock_s: f64,
}

/// Output of a single control tick.
#[derive(Debug, Clone, Copy)]
pub struct StepOutput {
    /// The setpoint to send to the flight controller, `None` if there is no trajectory
    pub setpoint: Option<Setpoint>,

    pub report: StatusReport,
}

/// The status report containing monitoring quantities for the last tick.
#[derive(Debug, Default, Clone, Copy, Serialize)]
pub struct StatusReport {
    /// Trajectory clock after the tick
    pub clock_s: f64,

    /// True if a trajectory is loaded
    pub has_traj: bool,

    /// True once the trajectory clock has passed the end of the spline
    pub traj_complete: bool,

    /// The optimisation cycle run during the tick
    pub opt: Option<OptReport>,

    /// Total number of frames integrated into the field
    pub num_frames_integrated: usize,

    /// Total number of frames dropped, either because the worker was busy or because the frame
    /// couldn't be used
    pub num_frames_dropped: usize,
}

#[derive(Debug)]
struct Shared {
    pub params: ReplanMgrParams,

    pub per_mgr: PerMgr,
    pub spline_opt: SplineOpt,

    pub map: RwLock<MapState>,
    pub traj: RwLock<Option<ActiveTraj>>,
}

#[derive(Debug)]
struct MapState {
    pub field: DistField,

    /// False until the first frame has placed the field around the camera
    pub centred: bool,
}

// -----------------------------------------------------------------------------------------------
// ENUMS
// -----------------------------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ReplanMgrError {
    #[error("Couldn't load parameters: {0}")]
    ParamLoadError(util::params::LoadError),

    #[error("Sync primitive is poisoned")]
    PoisonError,

    #[error("Perception error: {0}")]
    PerError(PerError),

    #[error("Distance field error: {0}")]
    DistFieldError(DistFieldError),

    #[error("Trajectory generation error: {0}")]
    TrajGenError(TrajGenError),

    #[error("B-spline error: {0}")]
    BSplineError(BSplineError),

    #[error("Cannot plan to a goal before the vehicle pose is known")]
    NoVehiclePose,

    #[error("Goal contains a non-finite coordinate")]
    InvalidGoal,

    #[error("Invalid manager parameters: {0}")]
    InvalidParams(&'static str),

    #[error("Failed to send signal {0:?} between threads")]
    SendError(WorkerSignal),

    #[error("Failed to receive signal between threads")]
    RecvError,

    #[error("The worker thread has stopped")]
    WorkerStopped,

    #[error("Couldn't start the worker thread: {0}")]
    WorkerStartError(std::io::Error),
}

// -----------------------------------------------------------------------------------------------
// IMPLS
// -----------------------------------------------------------------------------------------------

impl ReplanMgr {
    /// Create a new replan manager, loading its parameters from the parameter files.
    pub fn new() -> Result<Self, ReplanMgrError> {
        Self::with_config(ReplanMgrConfig::load()?)
    }

    /// Create a new replan manager from the given parameters.
    pub fn with_config(config: ReplanMgrConfig) -> Result<Self, ReplanMgrError> {
        if !(config.mgr.control_period_s > 0.0) {
            return Err(ReplanMgrError::InvalidParams(
                "control_period_s must be positive",
            ));
        }
        if !(config.mgr.cruise_fraction > 0.0 && config.mgr.cruise_fraction <= 1.0) {
            return Err(ReplanMgrError::InvalidParams(
                "cruise_fraction must be in (0, 1]",
            ));
        }

        // Create submodules
        let field = DistField::new(config.dist_field)?;
        let per_mgr = PerMgr::new(config.per);
        let spline_opt = SplineOpt::new(config.spline_opt);
        let traj_gen = TrajGen::new(config.traj_gen);

        // Create shared data
        let shared = Arc::new(Shared {
            params: config.mgr,
            per_mgr,
            spline_opt,
            map: RwLock::new(MapState {
                field,
                centred: false,
            }),
            traj: RwLock::new(None),
        });
        let shared_worker = shared.clone();

        // Create channels
        let (worker_sender, rx) = channel();
        let (tx, worker_reciever) = channel();

        // Start worker thread
        let worker_jh = thread::Builder::new()
            .name("replan_mgr::worker".into())
            .spawn(move || worker_thread(shared_worker, tx, rx))
            .map_err(ReplanMgrError::WorkerStartError)?;

        Ok(Self {
            shared,
            worker_jh: Some(worker_jh),
            worker_sender,
            worker_reciever,
            frame_in_flight: false,
            traj_gen,
            vehicle_pose: None,
            report: StatusReport::default(),
        })
    }

    /// Update the vehicle's pose in the world.
    pub fn set_pose(&mut self, pose: Pose) {
        self.vehicle_pose = Some(pose);
    }

    pub fn vehicle_pose(&self) -> Option<&Pose> {
        self.vehicle_pose.as_ref()
    }

    /// Plan a new trajectory from the vehicle's current position to the goal.
    ///
    /// Any existing trajectory is discarded first, so on error there is no trajectory and no
    /// setpoints are emitted until a valid goal is given.
    pub fn set_goal(&mut self, goal_m: Vector3<f64>) -> Result<(), ReplanMgrError> {
        let mut traj = self.shared.traj.write()?;
        *traj = None;

        if goal_m.iter().any(|c| !c.is_finite()) {
            return Err(ReplanMgrError::InvalidGoal);
        }

        let start_m = self
            .vehicle_pose
            .as_ref()
            .ok_or(ReplanMgrError::NoVehiclePose)?
            .position_m;

        let params = &self.shared.params;
        let poly = self.traj_gen.generate(
            &[start_m, goal_m],
            &params.limits.scaled(params.cruise_fraction),
        )?;

        let opt_params = self.shared.spline_opt.params();
        let spline = BSpline::from_poly(&poly, opt_params.dt_s, opt_params.num_opt_points)?;

        info!(
            "New goal [{:.2}, {:.2}, {:.2}] accepted, trajectory duration {:.1} s over {} control \
             points",
            goal_m.x,
            goal_m.y,
            goal_m.z,
            spline.duration_s(),
            spline.num_points()
        );

        *traj = Some(ActiveTraj {
            goal_m,
            spline,
            clock_s: 0.0,
        });

        Ok(())
    }

    /// Abandon the current trajectory.
    pub fn clear_goal(&mut self) -> Result<(), ReplanMgrError> {
        if self.shared.traj.write()?.take().is_some() {
            info!("Trajectory cleared");
        }

        Ok(())
    }

    /// Returns true if there is a trajectory loaded.
    pub fn has_traj(&self) -> bool {
        match self.shared.traj.read() {
            Ok(t) => t.is_some(),
            Err(_) => false,
        }
    }

    /// Send a depth frame to the worker to be integrated into the distance field.
    ///
    /// `camera_pose` is the pose of the camera's optical frame when the frame was taken, or `None`
    /// if it couldn't be found. Frames are never queued, if the worker is still busy with the last
    /// frame this one is dropped and `false` is returned.
    pub fn submit_frame(
        &mut self,
        img: DepthImage,
        camera_pose: Option<Pose>,
    ) -> Result<bool, ReplanMgrError> {
        if self.frame_in_flight {
            self.report.num_frames_dropped += 1;
            return Ok(false);
        }

        self.worker_sender
            .send(WorkerSignal::NewDepthImg(Box::new(img), camera_pose))?;
        self.frame_in_flight = true;

        Ok(true)
    }

    /// Integrate a depth frame on the calling thread, blocking until it's done.
    pub fn integrate_frame(
        &mut self,
        img: &DepthImage,
        camera_pose: Option<&Pose>,
    ) -> Result<FrameReport, ReplanMgrError> {
        let result = worker::integrate_frame(&self.shared, img, camera_pose);

        match result {
            Ok(_) => self.report.num_frames_integrated += 1,
            Err(_) => self.report.num_frames_dropped += 1,
        }

        result
    }

    /// Insert points measured from `origin` straight into the distance field, bypassing the
    /// depth projection.
    ///
    /// The field is moved onto `origin` first, exactly as it would be for a frame taken there.
    pub fn insert_points(
        &mut self,
        points: &[Point3<f64>],
        origin: &Point3<f64>,
    ) -> Result<InsertReport, ReplanMgrError> {
        let mut map = self.shared.map.write()?;

        if map.centred {
            map.field.recenter(origin);
        } else {
            map.field.set_center(origin);
            map.centred = true;
        }

        Ok(map.field.insert(points, origin))
    }

    /// Perform one control tick.
    pub fn step(&mut self) -> Result<StepOutput, ReplanMgrError> {
        self.poll_worker()?;

        self.report.opt = None;

        let mut traj_lock = self.shared.traj.write()?;
        let traj = match traj_lock.as_mut() {
            Some(t) => t,
            None => {
                self.report.has_traj = false;
                self.report.traj_complete = false;
                return Ok(StepOutput {
                    setpoint: None,
                    report: self.report,
                });
            }
        };

        traj.clock_s += self.shared.params.control_period_s;
        let t = traj.clock_s;

        let setpoint = if t >= traj.spline.duration_s() {
            self.report.traj_complete = true;
            Setpoint::hold(t, traj.spline.end_position().into())
        } else {
            traj.spline.advance(t);

            {
                let map = self.shared.map.read()?;
                self.report.opt = Some(self.shared.spline_opt.optimize(
                    &mut traj.spline,
                    &map.field,
                    &self.shared.params.limits,
                ));
            }

            self.report.traj_complete = false;
            Setpoint {
                traj_time_s: t,
                position_m: traj.spline.position(t).into(),
                velocity_ms: traj.spline.velocity(t).into(),
            }
        };

        if let Some(ref opt) = self.report.opt {
            if !opt.converged {
                warn!(
                    "Optimisation did not converge at t = {:.2} s (max violation {:.3} m)",
                    t, opt.max_violation_m
                );
            }
        }

        self.report.clock_s = t;
        self.report.has_traj = true;

        Ok(StepOutput {
            setpoint: Some(setpoint),
            report: self.report,
        })
    }

    /// The status report from the last tick.
    pub fn status_report(&self) -> StatusReport {
        self.report
    }

    /// A copy of the current trajectory.
    pub fn traj(&self) -> Result<Option<ActiveTraj>, ReplanMgrError> {
        Ok(self.shared.traj.read()?.clone())
    }

    /// Run a function with read access to the distance field.
    pub fn with_field<F, R>(&self, f: F) -> Result<R, ReplanMgrError>
    where
        F: FnOnce(&DistField) -> R,
    {
        Ok(f(&self.shared.map.read()?.field))
    }

    /// Stop the worker thread and wait for it to finish.
    pub fn stop(mut self) -> Result<(), ReplanMgrError> {
        self.stop_worker()
    }

    /// Handle all signals waiting from the worker.
    fn poll_worker(&mut self) -> Result<(), ReplanMgrError> {
        loop {
            match self.worker_reciever.try_recv() {
                Ok(WorkerSignal::Complete(report)) => {
                    self.frame_in_flight = false;
                    self.report.num_frames_integrated += 1;

                    if report.insert.num_outside > 0 {
                        warn!(
                            "{} points fell outside the distance field",
                            report.insert.num_outside
                        );
                    }
                }
                Ok(WorkerSignal::Error(e)) => {
                    self.frame_in_flight = false;
                    self.report.num_frames_dropped += 1;
                    warn!("Depth frame dropped: {}", e);
                }
                Ok(s) => warn!("Unexpected signal from worker: {:?}", s),
                Err(TryRecvError::Empty) => return Ok(()),
                Err(TryRecvError::Disconnected) => {
                    error!("Worker has stopped");
                    return Err(ReplanMgrError::WorkerStopped);
                }
            }
        }
    }

    fn stop_worker(&mut self) -> Result<(), ReplanMgrError> {
        let jh = match self.worker_jh.take() {
            Some(jh) => jh,
            None => return Ok(()),
        };

        // The worker may already have exited, in which case joining gives its result
        if self.worker_sender.send(WorkerSignal::Stop).is_err() {
            warn!("Worker already stopped");
        }

        match jh.join() {
            Ok(r) => r,
            Err(_) => Err(ReplanMgrError::WorkerStopped),
        }
    }
}

impl Drop for ReplanMgr {
    fn drop(&mut self) {
        if let Err(e) = self.stop_worker() {
            warn!("Error stopping the replan worker: {}", e);
        }
    }
}

impl<T> From<PoisonError<T>> for ReplanMgrError {
    fn from(_: PoisonError<T>) -> Self {
        Self::PoisonError
    }
}

impl From<SendError<WorkerSignal>> for ReplanMgrError {
    fn from(e: SendError<WorkerSignal>) -> Self {
        Self::SendError(e.0)
    }
}

impl From<RecvError> for ReplanMgrError {
    fn from(_: RecvError) -> Self {
        Self::RecvError
    }
}

impl From<util::params::LoadError> for ReplanMgrError {
    fn from(e: util::params::LoadError) -> Self {
        Self::ParamLoadError(e)
    }
}

impl From<PerError> for ReplanMgrError {
    fn from(e: PerError) -> Self {
        Self::PerError(e)
    }
}

impl From<DistFieldError> for ReplanMgrError {
    fn from(e: DistFieldError) -> Self {
        Self::DistFieldError(e)
    }
}

impl From<TrajGenError> for ReplanMgrError {
    fn from(e: TrajGenError) -> Self {
        Self::TrajGenError(e)
    }
}

impl From<BSplineError> for ReplanMgrError {
    fn from(e: BSplineError) -> Self {
        Self::BSplineError(e)
    }
}

// -----------------------------------------------------------------------------------------------
// TESTS
// -----------------------------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Utc;

    fn mgr() -> ReplanMgr {
        ReplanMgr::with_config(ReplanMgrConfig::default()).unwrap()
    }

    #[test]
    fn test_no_setpoints_without_goal() {
        let mut mgr = mgr();

        let out = mgr.step().unwrap();
        assert!(out.setpoint.is_none());
        assert!(!out.report.has_traj);

        // No pose yet
        assert!(matches!(
            mgr.set_goal(Vector3::new(1.0, 0.0, 1.0)),
            Err(ReplanMgrError::NoVehiclePose)
        ));
        assert!(mgr.step().unwrap().setpoint.is_none());
    }

    #[test]
    fn test_invalid_goal_clears_traj() {
        let mut mgr = mgr();
        mgr.set_pose(Pose::from_position(Vector3::new(0.0, 0.0, 1.0)));

        mgr.set_goal(Vector3::new(1.0, 0.0, 1.0)).unwrap();
        assert!(mgr.has_traj());
        assert!(mgr.step().unwrap().setpoint.is_some());

        assert!(matches!(
            mgr.set_goal(Vector3::new(f64::NAN, 0.0, 1.0)),
            Err(ReplanMgrError::InvalidGoal)
        ));
        assert!(!mgr.has_traj());
        assert!(mgr.step().unwrap().setpoint.is_none());
    }

    #[test]
    fn test_setpoints_follow_spline_and_hold() {
        let mut mgr = mgr();
        let start = Vector3::new(0.0, 0.0, 1.0);
        let goal = Vector3::new(1.0, 0.5, 1.2);
        mgr.set_pose(Pose::from_position(start));
        mgr.set_goal(goal).unwrap();

        let duration = mgr.traj().unwrap().unwrap().spline.duration_s();
        let period = ReplanMgrParams::default().control_period_s;

        let first = mgr.step().unwrap().setpoint.unwrap();
        assert!((first.traj_time_s - period).abs() < 1e-12);
        assert!((Vector3::from(first.position_m) - start).norm() < 1e-3);

        let mut last = first;
        let num_ticks = (duration / period).ceil() as usize + 5;
        for _ in 0..num_ticks {
            let out = mgr.step().unwrap();
            let sp = out.setpoint.unwrap();

            // Empty field, unknown space gives no push so the spline is unchanged
            assert!(sp.speed_ms() <= 0.3 * 1.01);
            assert!(sp.traj_time_s > last.traj_time_s);
            last = sp;
        }

        assert!(mgr.status_report().traj_complete);
        assert!((Vector3::from(last.position_m) - goal).norm() < 1e-6);
        assert_eq!(last.velocity_ms, [0.0; 3]);
    }

    #[test]
    fn test_frozen_points_never_rewritten() {
        let mut mgr = mgr();
        let start = Vector3::new(0.0, 0.0, 1.0);
        mgr.set_pose(Pose::from_position(start));

        // Just off the path, so the window is reshaped as it passes
        mgr.insert_points(&[Point3::new(2.5, 0.1, 1.0)], &Point3::from(start)).unwrap();
        mgr.set_goal(Vector3::new(5.0, 0.0, 1.0)).unwrap();

        let mut frozen: Vec<Vector3<f64>> = Vec::new();
        let mut last = mgr.traj().unwrap().unwrap().spline.control_points().to_vec();
        let mut num_reshaped = 0;

        for _ in 0..2000 {
            let out = mgr.step().unwrap();
            let spline = mgr.traj().unwrap().unwrap().spline;
            let points = spline.control_points();

            // Everything frozen by an earlier tick is exactly as it was
            assert!(spline.frozen_until() >= frozen.len());
            assert_eq!(&points[..frozen.len()], &frozen[..]);

            if points != &last[..] {
                num_reshaped += 1;
            }

            frozen = points[..spline.frozen_until()].to_vec();
            last = points.to_vec();

            if out.report.traj_complete {
                break;
            }
        }

        assert!(mgr.status_report().traj_complete);
        assert!(num_reshaped > 0);
    }

    #[test]
    fn test_frame_without_pose_is_dropped() {
        let mut mgr = mgr();
        let img = DepthImage::from_raw(Utc::now(), 8, 8, vec![5000; 64]).unwrap();

        assert!(matches!(
            mgr.integrate_frame(&img, None),
            Err(ReplanMgrError::PerError(PerError::NoCameraPose))
        ));
        assert_eq!(mgr.with_field(|f| f.num_occupied()).unwrap(), 0);
        assert_eq!(mgr.status_report().num_frames_dropped, 1);

        let report = mgr.integrate_frame(&img, Some(&Pose::default())).unwrap();
        assert!(report.insert.num_inserted > 0);
        assert!(mgr.with_field(|f| f.num_occupied()).unwrap() > 0);
        assert_eq!(mgr.status_report().num_frames_integrated, 1);
    }

    #[test]
    fn test_worker_integrates_submitted_frames() {
        let mut mgr = mgr();
        let img = DepthImage::from_raw(Utc::now(), 8, 8, vec![5000; 64]).unwrap();

        assert!(mgr.submit_frame(img.clone(), None).unwrap());

        // The worker is busy, so this frame is dropped
        assert!(!mgr.submit_frame(img.clone(), Some(Pose::default())).unwrap());

        // Wait for the first frame to come back as dropped
        while mgr.frame_in_flight {
            mgr.step().unwrap();
            std::thread::yield_now();
        }
        assert_eq!(mgr.status_report().num_frames_dropped, 2);

        assert!(mgr.submit_frame(img, Some(Pose::default())).unwrap());
        while mgr.frame_in_flight {
            mgr.step().unwrap();
            std::thread::yield_now();
        }
        assert_eq!(mgr.status_report().num_frames_integrated, 1);
        assert!(mgr.with_field(|f| f.num_occupied()).unwrap() > 0);

        mgr.stop().unwrap();
    }
}
