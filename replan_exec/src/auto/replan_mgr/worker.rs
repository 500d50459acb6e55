//! Worker thread which integrates depth frames into the distance field without blocking the
//! control tick.

// -----------------------------------------------------------------------------------------------
// INCLUDES
// -----------------------------------------------------------------------------------------------

use std::{
    sync::{
        mpsc::{Receiver, Sender},
        Arc,
    },
    time::Instant,
};

use comms_if::eqpt::depth::DepthImage;
use log::{debug, warn};
use serde::Serialize;
use util::session;

use crate::auto::{loc::Pose, map::InsertReport, spline::OptReport};

use super::{ReplanMgrError, Shared};

// -----------------------------------------------------------------------------------------------
// STRUCTS
// -----------------------------------------------------------------------------------------------

/// Summary of a single integrated frame.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct FrameReport {
    /// Number of points projected from the image
    pub num_points: usize,

    /// Number of sampled pixels with no valid depth
    pub num_rejected: usize,

    /// Shift applied to the distance field, in voxels
    pub shift: [i64; 3],

    pub insert: InsertReport,

    /// Report from the optimisation cycle run after the frame, if there was a trajectory
    pub opt: Option<OptReport>,
}

// -----------------------------------------------------------------------------------------------
// ENUMS
// -----------------------------------------------------------------------------------------------

#[derive(Debug)]
pub enum WorkerSignal {
    /// The worker should stop it's operations
    Stop,

    /// A new depth image was acquired, plus the pose of the camera when the image was taken, if
    /// it could be found.
    NewDepthImg(Box<DepthImage>, Option<Pose>),

    /// The frame has been integrated
    Complete(FrameReport),

    /// The frame couldn't be integrated
    Error(Box<ReplanMgrError>),
}

// -----------------------------------------------------------------------------------------------
// FUNCTIONS
// -----------------------------------------------------------------------------------------------

pub(super) fn worker_thread(
    shared: Arc<Shared>,
    main_sender: Sender<WorkerSignal>,
    main_reciever: Receiver<WorkerSignal>,
) -> Result<(), ReplanMgrError> {
    // Wait for commands from main
    while let Ok(signal) = main_reciever.recv() {
        match signal {
            WorkerSignal::Stop => break,
            WorkerSignal::NewDepthImg(img, pose) => {
                match integrate_frame(&shared, &img, pose.as_ref()) {
                    Ok(report) => main_sender.send(WorkerSignal::Complete(report))?,
                    Err(e) => main_sender.send(WorkerSignal::Error(Box::new(e)))?,
                }
            }
            s => warn!("Worker recieved unexpected signal {:?}", s),
        }
    }

    Ok(())
}

/// Project a depth frame, move the distance field onto the camera and insert the projected points,
/// then run an optimisation cycle against the updated field.
///
/// A frame without a camera pose is dropped before anything in the field is touched.
pub(super) fn integrate_frame(
    shared: &Shared,
    img: &DepthImage,
    camera_pose: Option<&Pose>,
) -> Result<FrameReport, ReplanMgrError> {
    let t_start = Instant::now();

    let cloud = shared.per_mgr.calculate(img, camera_pose)?;

    let t_projected = Instant::now();

    let mut report = FrameReport {
        num_points: cloud.points.len(),
        num_rejected: cloud.num_rejected,
        ..Default::default()
    };

    // Update the field in a scope so the write lock is released before optimising
    let t_shifted = {
        let mut map = shared.map.write()?;

        if map.centred {
            let shift = map.field.recenter(&cloud.origin);
            report.shift = [shift.x, shift.y, shift.z];
        } else {
            map.field.set_center(&cloud.origin);
            map.centred = true;
        }

        let t_shifted = Instant::now();

        report.insert = map.field.insert(&cloud.points, &cloud.origin);

        if shared.params.save_maps {
            session::save_with_timestamp("dist_field/occupied.json", map.field.occupied_snapshot());
        }

        t_shifted
    };

    let t_inserted = Instant::now();

    debug!(
        "Frame integrated: {} points ({} rejected), projection {:.2} ms, shift {:?} {:.2} ms, \
         insertion of {} ({} changed) {:.2} ms",
        report.num_points,
        report.num_rejected,
        (t_projected - t_start).as_secs_f64() * 1e3,
        report.shift,
        (t_shifted - t_projected).as_secs_f64() * 1e3,
        report.insert.num_inserted,
        report.insert.num_changed,
        (t_inserted - t_shifted).as_secs_f64() * 1e3,
    );

    // Re-optimise against the new data, spline lock first to match the control tick
    let mut traj = shared.traj.write()?;
    if let Some(traj) = traj.as_mut() {
        let map = shared.map.read()?;
        report.opt = Some(shared.spline_opt.optimize(
            &mut traj.spline,
            &map.field,
            &shared.params.limits,
        ));
    }

    Ok(report)
}
