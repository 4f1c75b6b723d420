/// Syringe Plotter Library
///
/// Path playback for a two-axis gantry with a lifting plate and a syringe
/// extruder, shared by the plot, range_test and prime_syringe binaries

pub mod actuator;
pub mod config_loader;
pub mod controller_link;
pub mod error;
pub mod extrusion;
pub mod homing;
pub mod limit_switches;
pub mod motion;
pub mod path;
pub mod plate;
pub mod playback;
pub mod sim;
pub mod sync;
