/// Error types for the plotter
///
/// Hardware-facing failures get a typed variant so callers can tell a stalled
/// motor from a stop request. Everything else travels as `anyhow::Error` with
/// context naming the phase that failed.

use thiserror::Error;

use crate::actuator::{Axis, Sensor};

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PlotterError {
    /// A motion command failed or never confirmed completion
    #[error("Actuator fault on {axis}: {reason}")]
    ActuatorFault { axis: Axis, reason: String },

    /// Limit sensor did not assert within the homing timeout
    #[error("Sensor {sensor} not pressed after {timeout_ms}ms")]
    SensorTimeout { sensor: Sensor, timeout_ms: u64 },

    /// The run-level stop signal was raised
    #[error("Stopped during {phase}")]
    Stopped { phase: String },

    /// Serial link to the controller board failed
    #[error("Controller link: {0}")]
    Link(String),

    #[error("Configuration: {0}")]
    Config(String),
}

impl PlotterError {
    pub fn fault(axis: Axis, reason: impl Into<String>) -> Self {
        PlotterError::ActuatorFault { axis, reason: reason.into() }
    }

    pub fn stopped(phase: impl Into<String>) -> Self {
        PlotterError::Stopped { phase: phase.into() }
    }
}
