/// Actuator port - the boundary between the playback core and motor drivers
///
/// Both the motion loop and the extrusion task hold an `Arc<dyn ActuatorPort>`
/// at the same time, so implementations take `&self` and must not hold an
/// internal lock across a blocking wait on a different axis.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Motor axes on the plotter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Axis {
    /// Top beam, left/right
    X,
    /// Cart, forward/back
    Y,
    /// Vertical plate, up/down
    Plate,
    /// Syringe plunger
    Syringe,
}

impl Axis {
    pub const ALL: [Axis; 4] = [Axis::X, Axis::Y, Axis::Plate, Axis::Syringe];

    /// Index used on the controller wire protocol
    pub fn code(self) -> u8 {
        match self {
            Axis::X => 0,
            Axis::Y => 1,
            Axis::Plate => 2,
            Axis::Syringe => 3,
        }
    }

    pub fn from_code(code: u8) -> Option<Axis> {
        Axis::ALL.iter().copied().find(|a| a.code() == code)
    }
}

impl fmt::Display for Axis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Axis::X => "X",
            Axis::Y => "Y",
            Axis::Plate => "plate",
            Axis::Syringe => "syringe",
        };
        f.write_str(name)
    }
}

/// Binary limit sensors used for homing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sensor {
    XLimit,
    YLimit,
}

impl Sensor {
    pub const ALL: [Sensor; 2] = [Sensor::XLimit, Sensor::YLimit];

    pub fn code(self) -> u8 {
        match self {
            Sensor::XLimit => 0,
            Sensor::YLimit => 1,
        }
    }

    pub fn from_code(code: u8) -> Option<Sensor> {
        Sensor::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// Limit sensor that homes the given axis
    pub fn for_axis(axis: Axis) -> Option<Sensor> {
        match axis {
            Axis::X => Some(Sensor::XLimit),
            Axis::Y => Some(Sensor::YLimit),
            _ => None,
        }
    }
}

impl fmt::Display for Sensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sensor::XLimit => f.write_str("X limit"),
            Sensor::YLimit => f.write_str("Y limit"),
        }
    }
}

/// What the motor does once a motion command finishes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Then {
    /// Actively hold position
    Hold,
    /// Passive brake
    Brake,
}

impl Then {
    pub fn holds(self) -> bool {
        matches!(self, Then::Hold)
    }
}

/// Motor and sensor operations consumed by the playback core.
///
/// Speeds are degrees per second, powers are signed duty cycle percent.
/// Commands with `wait = true` return only once the controller confirms the
/// motion finished; with `wait = false` the caller must later call
/// `wait_complete` for that axis.
pub trait ActuatorPort: Send + Sync {
    fn run_relative(&self, axis: Axis, speed: f64, degrees: f64, then: Then, wait: bool) -> Result<()>;
    fn run_absolute_target(&self, axis: Axis, speed: f64, target_degrees: f64, then: Then, wait: bool) -> Result<()>;
    fn run_timed(&self, axis: Axis, power: f64, duration_ms: u64, then: Then, wait: bool) -> Result<()>;
    /// Drive continuously at a signed power until told otherwise
    fn run_power(&self, axis: Axis, power: f64) -> Result<()>;
    /// Drive continuously at a signed speed until told otherwise
    fn run_speed(&self, axis: Axis, speed: f64) -> Result<()>;
    fn brake(&self, axis: Axis) -> Result<()>;
    fn hold(&self, axis: Axis) -> Result<()>;
    /// Redefine the current angle of the axis
    fn reset_angle(&self, axis: Axis, degrees: f64) -> Result<()>;
    /// Block until the last non-waiting motion on `axis` completes
    fn wait_complete(&self, axis: Axis) -> Result<()>;
    fn sensor_pressed(&self, sensor: Sensor) -> Result<bool>;
}
