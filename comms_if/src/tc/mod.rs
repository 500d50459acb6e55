//! # Telecommand module
//!
//! This module provides telecommand functionality to the communications
//! interface.

// ---------------------------------------------------------------------------
// MODULES
// ---------------------------------------------------------------------------

pub mod auto;

// ---------------------------------------------------------------------------
// IMPORTS
// ---------------------------------------------------------------------------

// External
use serde::{Deserialize, Serialize};
use thiserror::Error;

// Internal
use auto::AutoCmd;

// ---------------------------------------------------------------------------
// DATA STRUCTURES
// ---------------------------------------------------------------------------

/// A telecommand scheduled at a given time, as read from a command script.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TimedTc {
    /// Time after the start of execution at which the TC is issued
    pub time_s: f64,

    /// The telecommand itself
    pub tc: Tc,
}

// ---------------------------------------------------------------------------
// ENUMERATIONS
// ---------------------------------------------------------------------------

/// A telecommand, i.e. an instruction sent to the vehicle by the mission layer.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum Tc {
    /// Liveness check, no action is taken.
    #[serde(rename = "HEARTBEAT")]
    Heartbeat,

    /// A command to the replanner
    #[serde(rename = "AUTO")]
    Autonomy(AutoCmd),
}

/// Possible parsing errors.
#[derive(Debug, Error)]
pub enum TcParseError {
    #[error("TC contains invalid JSON: {0}")]
    InvalidJson(serde_json::Error),

    #[error("TC at t = {0} s is scheduled before the previous one")]
    OutOfOrder(f64),
}

// ---------------------------------------------------------------------------
// IMPLEMENTATIONS
// ---------------------------------------------------------------------------

impl Tc {
    /// Parse a new TC from a JSON packet
    pub fn from_json(json_str: &str) -> Result<Self, TcParseError> {
        serde_json::from_str(json_str).map_err(TcParseError::InvalidJson)
    }
}

impl TimedTc {
    /// Parse a script of timed TCs from a JSON array.
    ///
    /// The TCs must be in non-decreasing time order.
    pub fn script_from_json(json_str: &str) -> Result<Vec<Self>, TcParseError> {
        let script: Vec<Self> = serde_json::from_str(json_str).map_err(TcParseError::InvalidJson)?;

        for pair in script.windows(2) {
            if pair[1].time_s < pair[0].time_s {
                return Err(TcParseError::OutOfOrder(pair[1].time_s));
            }
        }

        Ok(script)
    }
}

// ---------------------------------------------------------------------------
// TESTS
// ---------------------------------------------------------------------------

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_tc_from_json() {
        let tc = Tc::from_json(r#"{"type": "AUTO", "payload": {"Goto": {"x_m": 5.0, "y_m": 0.0, "z_m": 1.0}}}"#)
            .unwrap();
        assert_eq!(
            tc,
            Tc::Autonomy(AutoCmd::Goto {
                x_m: 5.0,
                y_m: 0.0,
                z_m: 1.0
            })
        );

        assert_eq!(Tc::from_json(r#"{"type": "HEARTBEAT"}"#).unwrap(), Tc::Heartbeat);

        assert!(matches!(
            Tc::from_json(r#"{"type": "MNVR"}"#),
            Err(TcParseError::InvalidJson(_))
        ));
    }

    #[test]
    fn test_script_order() {
        let script = TimedTc::script_from_json(
            r#"[
                {"time_s": 0.0, "tc": {"type": "AUTO", "payload": {"Goto": {"x_m": 1.0, "y_m": 0.0, "z_m": 1.0}}}},
                {"time_s": 4.0, "tc": {"type": "AUTO", "payload": "Abort"}}
            ]"#,
        )
        .unwrap();
        assert_eq!(script.len(), 2);
        assert_eq!(script[1].tc, Tc::Autonomy(AutoCmd::Abort));

        assert!(matches!(
            TimedTc::script_from_json(
                r#"[{"time_s": 2.0, "tc": {"type": "HEARTBEAT"}}, {"time_s": 1.0, "tc": {"type": "HEARTBEAT"}}]"#
            ),
            Err(TcParseError::OutOfOrder(_))
        ));
    }
}
