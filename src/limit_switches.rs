/// GPIO limit switches
///
/// Homing switches wired to host GPIO lines instead of the controller board.
/// Lines are requested as inputs with pull-up bias; a pressed switch shorts
/// the line to ground, so a LOW (inactive) reading means pressed.
///
/// Hardware access needs the `gpiod` feature. Without it `open` fails loudly.

use anyhow::{anyhow, Result};
use log::info;

use crate::actuator::Sensor;

#[cfg(feature = "gpiod")]
use gpiocdev::line::{Bias, Value};
#[cfg(feature = "gpiod")]
use gpiocdev::request::Request;
#[cfg(feature = "gpiod")]
use std::collections::HashMap;
#[cfg(feature = "gpiod")]
use std::sync::{Mutex, PoisonError};

/// Source of limit switch readings other than the controller link
pub trait LimitSwitchReader: Send + Sync {
    fn pressed(&self, sensor: Sensor) -> Result<bool>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitSwitchPins {
    pub chip: String,
    pub x_limit: u32,
    pub y_limit: u32,
}

impl LimitSwitchPins {
    pub fn offset(&self, sensor: Sensor) -> u32 {
        match sensor {
            Sensor::XLimit => self.x_limit,
            Sensor::YLimit => self.y_limit,
        }
    }
}

#[derive(Debug)]
pub struct GpioLimitSwitches {
    pins: LimitSwitchPins,
    #[cfg(feature = "gpiod")]
    requests: Mutex<HashMap<u32, Request>>,
}

impl GpioLimitSwitches {
    /// Request both switch lines on the configured chip
    #[cfg(feature = "gpiod")]
    pub fn open(pins: LimitSwitchPins) -> Result<Self> {
        let mut requests = HashMap::new();
        for sensor in Sensor::ALL {
            let offset = pins.offset(sensor);
            if requests.contains_key(&offset) {
                continue;
            }
            let request = Request::builder()
                .on_chip(&pins.chip)
                .with_consumer("SyringePlotter")
                .with_line(offset)
                .as_input()
                .with_bias(Bias::PullUp)
                .request()
                .map_err(|e| anyhow!("Failed to request {} line {} on {}: {}", sensor, offset, pins.chip, e))?;
            requests.insert(offset, request);
        }
        info!(target: "limit_switches", "Limit switches on {} (X line {}, Y line {})",
              pins.chip, pins.x_limit, pins.y_limit);
        Ok(Self { pins, requests: Mutex::new(requests) })
    }

    #[cfg(not(feature = "gpiod"))]
    pub fn open(pins: LimitSwitchPins) -> Result<Self> {
        info!(target: "limit_switches", "GPIO limit switches requested on {} without gpiod support", pins.chip);
        Err(anyhow!("GPIO support not compiled in. Enable 'gpiod' feature."))
    }
}

impl LimitSwitchReader for GpioLimitSwitches {
    #[cfg(feature = "gpiod")]
    fn pressed(&self, sensor: Sensor) -> Result<bool> {
        let offset = self.pins.offset(sensor);
        let requests = self.requests.lock().unwrap_or_else(PoisonError::into_inner);
        let request = requests
            .get(&offset)
            .ok_or_else(|| anyhow!("No line request for {} (line {})", sensor, offset))?;
        let value = request.value(offset)?;
        Ok(value == Value::Inactive)
    }

    #[cfg(not(feature = "gpiod"))]
    fn pressed(&self, sensor: Sensor) -> Result<bool> {
        Err(anyhow!("GPIO support not compiled in, cannot read {} (line {})", sensor, self.pins.offset(sensor)))
    }
}
