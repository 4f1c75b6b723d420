/// Homing controller
///
/// Drives an axis at fixed power toward its limit switch and brakes once the
/// switch asserts. Without a timeout this blocks until the switch is pressed;
/// an obstructed axis hangs visibly instead of homing to the wrong place.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use std::thread;
use std::time::{Duration, Instant};

use crate::actuator::{ActuatorPort, Axis, Sensor};
use crate::error::PlotterError;
use crate::sync::{StopSignal, MIN_POLL};

#[derive(Debug, Clone)]
pub struct HomingSettings {
    /// Signed duty cycle; the sign picks the direction toward the switch
    pub power: f64,
    pub poll_interval: Duration,
    /// `None` keeps the block-until-pressed behavior
    pub timeout: Option<Duration>,
}

impl Default for HomingSettings {
    fn default() -> Self {
        Self {
            power: -100.0,
            poll_interval: Duration::from_millis(10),
            timeout: None,
        }
    }
}

fn wait_for_switch(
    port: &dyn ActuatorPort,
    sensor: Sensor,
    settings: &HomingSettings,
    stop: &StopSignal,
) -> Result<()> {
    let started = Instant::now();
    let mut polls: u64 = 0;
    loop {
        stop.check(&format!("homing ({})", sensor))?;
        if port.sensor_pressed(sensor)? {
            debug!(target: "homing", "{} pressed after {} polls", sensor, polls);
            return Ok(());
        }
        polls += 1;
        if let Some(timeout) = settings.timeout {
            if started.elapsed() >= timeout {
                return Err(PlotterError::SensorTimeout {
                    sensor,
                    timeout_ms: timeout.as_millis() as u64,
                }
                .into());
            }
        }
        thread::sleep(settings.poll_interval.max(MIN_POLL));
    }
}

/// Home `axis` against its limit switch. The axis is braked on every exit path.
pub fn home(port: &dyn ActuatorPort, axis: Axis, settings: &HomingSettings, stop: &StopSignal) -> Result<()> {
    let sensor = Sensor::for_axis(axis)
        .ok_or_else(|| PlotterError::Config(format!("Axis {} has no limit switch", axis)))?;

    info!(target: "homing", "Homing {} axis at power {}", axis, settings.power);
    port.run_power(axis, settings.power)
        .with_context(|| format!("Failed to start {} axis toward {}", axis, sensor))?;

    let result = wait_for_switch(port, sensor, settings, stop);
    if let Err(e) = port.brake(axis) {
        warn!(target: "homing", "Brake after homing {} failed: {:#}", axis, e);
        if result.is_ok() {
            return Err(e);
        }
    }
    result?;

    info!(target: "homing", "{} axis homed", axis);
    Ok(())
}
