//! # Autonomy Telecommands

// ------------------------------------------------------------------------------------------------
// IMPORTS
// ------------------------------------------------------------------------------------------------

use serde::{Deserialize, Serialize};
use structopt::StructOpt;

// ------------------------------------------------------------------------------------------------
// ENUMS
// ------------------------------------------------------------------------------------------------

/// A command that can be given to the replanner.
#[derive(Debug, Clone, Serialize, Deserialize, StructOpt, PartialEq)]
pub enum AutoCmd {
    /// Abort the current trajectory. The vehicle holds its last setpoint until a new goal.
    #[structopt(name = "abort")]
    Abort,

    /// Fly to the given coordinates in the world frame, avoiding sensed obstacles.
    #[structopt(name = "goto")]
    Goto {
        /// The x-coordinate of the goal.
        #[structopt(allow_hyphen_values = true)]
        x_m: f64,

        /// The y-coordinate of the goal.
        #[structopt(allow_hyphen_values = true)]
        y_m: f64,

        /// The z-coordinate of the goal.
        #[structopt(allow_hyphen_values = true)]
        z_m: f64,
    },
}

// ------------------------------------------------------------------------------------------------
// IMPLS
// ------------------------------------------------------------------------------------------------

impl AutoCmd {
    /// The goal position carried by this command, if any.
    pub fn goal_m(&self) -> Option<[f64; 3]> {
        match self {
            AutoCmd::Goto { x_m, y_m, z_m } => Some([*x_m, *y_m, *z_m]),
            AutoCmd::Abort => None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TESTS
// ------------------------------------------------------------------------------------------------
