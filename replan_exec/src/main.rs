//! Replanner executable entry point.
//!
//! # Architecture
//!
//! The executable flies a simulated vehicle through the world described in `sim.toml`:
//!
//!     - Initialise the session, logger and replan manager
//!     - Main loop:
//!         - Telecommand processing from the script or the command line
//!         - Depth frame rendering and submission at the frame rate
//!         - Replanner control tick
//!         - Vehicle update, the vehicle is assumed to track every setpoint perfectly
//!
//! At the end of the run the emitted setpoints are saved into the session directory.

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use color_eyre::{
    eyre::{eyre, WrapErr},
    Report,
};
use log::{debug, info, warn};
use nalgebra::{UnitQuaternion, Vector3};
use std::{
    path::PathBuf,
    thread,
    time::{Duration, Instant},
};
use structopt::StructOpt;

// Internal
use comms_if::{
    eqpt::fc::Setpoint,
    tc::{auto::AutoCmd, Tc, TimedTc},
};
use replan_lib::{
    auto::{
        loc::Pose,
        replan_mgr::{ReplanMgr, ReplanMgrConfig},
    },
    sim::{clearance_m, SimCamera, SimParams},
};
use util::{
    logger::{logger_init, LevelFilter},
    session::{self, Session},
};

// ---------------------------------------------------------------------------
// CONSTANTS
// ---------------------------------------------------------------------------

/// Modules whose per-cycle output is capped at debug level.
const QUIET_TARGETS: [&str; 2] = ["replan_lib::auto::spline", "replan_lib::auto::map"];

/// Below this speed the vehicle keeps its current heading.
const MIN_HEADING_SPEED_MS: f64 = 0.05;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

#[derive(Debug, StructOpt)]
#[structopt(
    name = "replan_exec",
    about = "Fly a simulated vehicle with the local trajectory replanner"
)]
struct Opts {
    /// Path to a JSON script of timed telecommands
    #[structopt(short, long, parse(from_os_str))]
    script: Option<PathBuf>,

    /// Length of the simulation in seconds
    #[structopt(short, long, default_value = "60")]
    duration_s: f64,

    /// Run as fast as possible rather than in real time
    #[structopt(long)]
    fast: bool,

    /// Command issued at the start of the run, used if no script is given
    #[structopt(subcommand)]
    cmd: Option<AutoCmd>,
}

// ---------------------------------------------------------------------------
// FUNCTIONS
// ---------------------------------------------------------------------------

/// Executable main function, entry point.
fn main() -> Result<(), Report> {
    let opts = Opts::from_args();

    // ---- EARLY INITIALISATION ----

    // Initialise session
    let session =
        Session::new("replan_exec", "sessions").wrap_err("Failed to create the session")?;

    // Initialise logger
    logger_init(LevelFilter::Trace, &QUIET_TARGETS, &session)
        .wrap_err("Failed to initialise logging")?;

    info!("Skylark Local Replanner\n");
    info!("Session directory: {:?}\n", session.session_root);

    // ---- LOAD PARAMETERS ----

    let config = ReplanMgrConfig::load().wrap_err("Could not load replanner params")?;
    let sim_params: SimParams =
        util::params::load("sim.toml").wrap_err("Could not load sim params")?;

    info!("Exec parameters loaded");

    // ---- LOAD TELECOMMANDS ----

    let script = match (&opts.script, &opts.cmd) {
        (Some(path), _) => {
            info!("Loading script from {:?}", path);

            let json = std::fs::read_to_string(path).wrap_err("Failed to read the script")?;
            TimedTc::script_from_json(&json).wrap_err("Failed to parse the script")?
        }
        (None, Some(cmd)) => vec![TimedTc {
            time_s: 0.0,
            tc: Tc::Autonomy(cmd.clone()),
        }],
        (None, None) => return Err(eyre!("Expected either a script or a command")),
    };

    info!("{} TCs loaded\n", script.len());

    // ---- INITIALISE MODULES ----

    info!("Initialising modules...");

    let control_period_s = config.mgr.control_period_s;
    let camera = SimCamera::new(sim_params.camera.clone(), config.per.clone());

    let mut replan_mgr =
        ReplanMgr::with_config(config).wrap_err("Failed to initialise the ReplanMgr")?;
    info!("ReplanMgr init complete");

    let mut vehicle_pose = Pose::from_position(Vector3::from(sim_params.start_position_m));
    replan_mgr.set_pose(vehicle_pose);

    info!("Module initialisation complete\n");

    // ---- MAIN LOOP ----

    info!("Begining main loop\n");

    let frame_every = ((sim_params.frame_period_s / control_period_s).round() as u64).max(1);
    let num_cycles = (opts.duration_s / control_period_s).ceil() as u64;

    let mut pending_tcs = script.into_iter().peekable();
    let mut setpoints: Vec<Setpoint> = Vec::new();
    let mut min_clearance_m = f64::INFINITY;

    for cycle in 0..num_cycles {
        // Get cycle start time
        let cycle_start_instant = Instant::now();
        let sim_time_s = cycle as f64 * control_period_s;

        // ---- TELECOMMAND PROCESSING ----

        while let Some(timed_tc) = pending_tcs.next_if(|t| t.time_s <= sim_time_s) {
            exec_tc(&mut replan_mgr, &timed_tc.tc);
        }

        // ---- PERCEPTION ----

        if cycle % frame_every == 0 {
            let camera_pose = camera.camera_pose(&vehicle_pose);
            let img = camera.render(&camera_pose, &sim_params.obstacles, chrono::Utc::now());

            if !replan_mgr
                .submit_frame(img, Some(camera_pose))
                .wrap_err("Failed to submit depth frame")?
            {
                debug!("Replan worker busy, frame dropped");
            }
        }

        // ---- REPLANNING ----

        let output = replan_mgr
            .step()
            .wrap_err("Error during replanner processing")?;

        // ---- VEHICLE UPDATE ----

        if let Some(setpoint) = output.setpoint {
            vehicle_pose = track(&vehicle_pose, &setpoint);
            replan_mgr.set_pose(vehicle_pose);

            min_clearance_m =
                min_clearance_m.min(clearance_m(&vehicle_pose.position_m, &sim_params.obstacles));

            setpoints.push(setpoint);
        }

        // ---- CYCLE MANAGEMENT ----

        let cycle_dur = Instant::now() - cycle_start_instant;
        let period = Duration::from_secs_f64(control_period_s);

        match period.checked_sub(cycle_dur) {
            Some(d) => {
                if !opts.fast {
                    thread::sleep(d)
                }
            }
            None => warn!(
                "Cycle overran by {:.06} s",
                cycle_dur.as_secs_f64() - control_period_s
            ),
        }
    }

    // ---- SHUTDOWN ----

    let report = replan_mgr.status_report();
    info!(
        "Simulation complete: {} setpoints emitted, {} frames integrated, {} dropped",
        setpoints.len(),
        report.num_frames_integrated,
        report.num_frames_dropped
    );
    info!("Minimum obstacle clearance {:.3} m", min_clearance_m);

    session.save("setpoints.json", setpoints);
    session::save("status_report.json", report);

    replan_mgr
        .stop()
        .wrap_err("Failed to stop the ReplanMgr")?;

    info!("End of session");
    session.exit();

    Ok(())
}

/// Execute a single telecommand.
fn exec_tc(replan_mgr: &mut ReplanMgr, tc: &Tc) {
    match tc {
        Tc::Heartbeat => debug!("Heartbeat"),
        Tc::Autonomy(AutoCmd::Goto { x_m, y_m, z_m }) => {
            info!("Goto [{}, {}, {}] command recieved", x_m, y_m, z_m);

            if let Err(e) = replan_mgr.set_goal(Vector3::new(*x_m, *y_m, *z_m)) {
                warn!("Could not plan to the goal: {}", e);
            }
        }
        Tc::Autonomy(AutoCmd::Abort) => {
            info!("Abort command recieved");

            if let Err(e) = replan_mgr.clear_goal() {
                warn!("Could not clear the trajectory: {}", e);
            }
        }
    }
}

/// The vehicle's pose after perfectly tracking the setpoint, facing along the direction of travel.
fn track(pose: &Pose, setpoint: &Setpoint) -> Pose {
    let attitude_q = if setpoint.speed_ms() > MIN_HEADING_SPEED_MS {
        let [vx, vy, _] = setpoint.velocity_ms;
        UnitQuaternion::from_euler_angles(0.0, 0.0, vy.atan2(vx))
    } else {
        pose.attitude_q
    };

    Pose::new(Vector3::from(setpoint.position_m), attitude_q)
}
