/// Simulated actuator port
///
/// Records every command, tracks per-axis angles and presses a limit sensor
/// after it has been polled a few times while its axis is driven. Used by the
/// tests and by the `--simulate` flag of the binaries, which turn the call log
/// off so long dry runs stay flat in memory.

use anyhow::Result;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use crate::actuator::{ActuatorPort, Axis, Sensor, Then};
use crate::error::PlotterError;

/// One recorded port call
#[derive(Debug, Clone, PartialEq)]
pub enum ActuatorCall {
    Relative { axis: Axis, speed: f64, degrees: f64, then: Then, wait: bool },
    AbsoluteTarget { axis: Axis, speed: f64, target: f64, then: Then, wait: bool },
    Timed { axis: Axis, power: f64, duration_ms: u64, then: Then, wait: bool },
    Power { axis: Axis, power: f64 },
    Speed { axis: Axis, speed: f64 },
    Brake(Axis),
    Hold(Axis),
    ResetAngle { axis: Axis, degrees: f64 },
    WaitComplete(Axis),
    SensorQuery(Sensor),
}

impl ActuatorCall {
    pub fn axis(&self) -> Option<Axis> {
        match *self {
            ActuatorCall::Relative { axis, .. }
            | ActuatorCall::AbsoluteTarget { axis, .. }
            | ActuatorCall::Timed { axis, .. }
            | ActuatorCall::Power { axis, .. }
            | ActuatorCall::Speed { axis, .. }
            | ActuatorCall::Brake(axis)
            | ActuatorCall::Hold(axis)
            | ActuatorCall::ResetAngle { axis, .. }
            | ActuatorCall::WaitComplete(axis) => Some(axis),
            ActuatorCall::SensorQuery(_) => None,
        }
    }
}

#[derive(Debug)]
struct InjectedFault {
    on_command: usize,
    reason: String,
}

#[derive(Debug, Default)]
struct SimState {
    calls: Vec<ActuatorCall>,
    angles: HashMap<Axis, f64>,
    powered: HashMap<Axis, f64>,
    polls_while_driven: HashMap<Sensor, u32>,
    pressed: HashSet<Sensor>,
    motion_counts: HashMap<Axis, usize>,
    busy_until: HashMap<Axis, Instant>,
}

#[derive(Debug)]
pub struct SimulatedActuatorPort {
    state: Mutex<SimState>,
    press_after_polls: u32,
    time_scale: f64,
    record_calls: bool,
    stuck_sensors: HashSet<Sensor>,
    faults: HashMap<Axis, InjectedFault>,
}

impl Default for SimulatedActuatorPort {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedActuatorPort {
    /// Instant motions, sensors press on the third poll while driven
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SimState::default()),
            press_after_polls: 3,
            time_scale: 0.0,
            record_calls: true,
            stuck_sensors: HashSet::new(),
            faults: HashMap::new(),
        }
    }

    pub fn with_press_after(mut self, polls: u32) -> Self {
        self.press_after_polls = polls;
        self
    }

    /// Sleep `time_scale` times the real motion duration (0 = instant)
    pub fn with_time_scale(mut self, scale: f64) -> Self {
        self.time_scale = scale.max(0.0);
        self
    }

    /// Stop recording calls; `calls()` then stays empty
    pub fn without_call_log(mut self) -> Self {
        self.record_calls = false;
        self
    }

    /// Sensor never asserts, as if the axis were obstructed
    pub fn with_stuck_sensor(mut self, sensor: Sensor) -> Self {
        self.stuck_sensors.insert(sensor);
        self
    }

    /// Fail the `on_command`-th motion command (1-based) issued to `axis`
    pub fn with_fault(mut self, axis: Axis, on_command: usize, reason: &str) -> Self {
        self.faults.insert(axis, InjectedFault { on_command, reason: reason.to_string() });
        self
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, state: &mut SimState, call: ActuatorCall) {
        if self.record_calls {
            state.calls.push(call);
        }
    }

    pub fn calls(&self) -> Vec<ActuatorCall> {
        self.state().calls.clone()
    }

    pub fn calls_for(&self, axis: Axis) -> Vec<ActuatorCall> {
        self.state().calls.iter().filter(|c| c.axis() == Some(axis)).cloned().collect()
    }

    pub fn angle(&self, axis: Axis) -> f64 {
        self.state().angles.get(&axis).copied().unwrap_or(0.0)
    }

    fn scaled(&self, seconds: f64) -> Duration {
        if self.time_scale <= 0.0 || !seconds.is_finite() {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(seconds * self.time_scale)
    }

    /// Record a motion command, apply fault injection and schedule completion
    fn motion(&self, call: ActuatorCall, axis: Axis, duration: Duration, wait: bool) -> Result<()> {
        {
            let mut state = self.state();
            self.record(&mut state, call);
            let count = {
                let count = state.motion_counts.entry(axis).or_insert(0);
                *count += 1;
                *count
            };
            if let Some(fault) = self.faults.get(&axis) {
                if fault.on_command == count {
                    return Err(PlotterError::fault(axis, fault.reason.clone()).into());
                }
            }
            state.busy_until.insert(axis, Instant::now() + duration);
        }
        if wait {
            thread::sleep(duration);
        }
        Ok(())
    }
}

impl ActuatorPort for SimulatedActuatorPort {
    fn run_relative(&self, axis: Axis, speed: f64, degrees: f64, then: Then, wait: bool) -> Result<()> {
        let duration = self.scaled(degrees.abs() / speed.abs().max(f64::EPSILON));
        self.motion(ActuatorCall::Relative { axis, speed, degrees, then, wait }, axis, duration, wait)?;
        let mut state = self.state();
        *state.angles.entry(axis).or_insert(0.0) += degrees;
        if degrees != 0.0 {
            if let Some(sensor) = Sensor::for_axis(axis) {
                state.pressed.remove(&sensor);
            }
        }
        Ok(())
    }

    fn run_absolute_target(&self, axis: Axis, speed: f64, target_degrees: f64, then: Then, wait: bool) -> Result<()> {
        let travel = (target_degrees - self.angle(axis)).abs();
        let duration = self.scaled(travel / speed.abs().max(f64::EPSILON));
        self.motion(
            ActuatorCall::AbsoluteTarget { axis, speed, target: target_degrees, then, wait },
            axis,
            duration,
            wait,
        )?;
        self.state().angles.insert(axis, target_degrees);
        Ok(())
    }

    fn run_timed(&self, axis: Axis, power: f64, duration_ms: u64, then: Then, wait: bool) -> Result<()> {
        let duration = self.scaled(duration_ms as f64 / 1000.0);
        self.motion(ActuatorCall::Timed { axis, power, duration_ms, then, wait }, axis, duration, wait)?;
        *self.state().angles.entry(axis).or_insert(0.0) += power * duration_ms as f64 / 1000.0;
        Ok(())
    }

    fn run_power(&self, axis: Axis, power: f64) -> Result<()> {
        let mut state = self.state();
        self.record(&mut state, ActuatorCall::Power { axis, power });
        state.powered.insert(axis, power);
        if let Some(sensor) = Sensor::for_axis(axis) {
            state.polls_while_driven.insert(sensor, 0);
        }
        Ok(())
    }

    fn run_speed(&self, axis: Axis, speed: f64) -> Result<()> {
        let mut state = self.state();
        self.record(&mut state, ActuatorCall::Speed { axis, speed });
        state.powered.insert(axis, speed);
        if let Some(sensor) = Sensor::for_axis(axis) {
            state.polls_while_driven.insert(sensor, 0);
        }
        Ok(())
    }

    fn brake(&self, axis: Axis) -> Result<()> {
        let mut state = self.state();
        self.record(&mut state, ActuatorCall::Brake(axis));
        state.powered.remove(&axis);
        Ok(())
    }

    fn hold(&self, axis: Axis) -> Result<()> {
        let mut state = self.state();
        self.record(&mut state, ActuatorCall::Hold(axis));
        state.powered.remove(&axis);
        Ok(())
    }

    fn reset_angle(&self, axis: Axis, degrees: f64) -> Result<()> {
        let mut state = self.state();
        self.record(&mut state, ActuatorCall::ResetAngle { axis, degrees });
        state.angles.insert(axis, degrees);
        Ok(())
    }

    fn wait_complete(&self, axis: Axis) -> Result<()> {
        let remaining = {
            let mut state = self.state();
            self.record(&mut state, ActuatorCall::WaitComplete(axis));
            state
                .busy_until
                .remove(&axis)
                .map(|until| until.saturating_duration_since(Instant::now()))
                .unwrap_or(Duration::ZERO)
        };
        thread::sleep(remaining);
        Ok(())
    }

    fn sensor_pressed(&self, sensor: Sensor) -> Result<bool> {
        let mut state = self.state();
        self.record(&mut state, ActuatorCall::SensorQuery(sensor));
        if state.pressed.contains(&sensor) {
            return Ok(true);
        }
        if self.stuck_sensors.contains(&sensor) {
            return Ok(false);
        }
        let driven = Axis::ALL
            .iter()
            .any(|a| Sensor::for_axis(*a) == Some(sensor) && state.powered.contains_key(a));
        if !driven {
            return Ok(false);
        }
        let polls = {
            let polls = state.polls_while_driven.entry(sensor).or_insert(0);
            *polls += 1;
            *polls
        };
        if polls >= self.press_after_polls {
            debug!(target: "sim", "{} pressed after {} polls", sensor, polls);
            state.pressed.insert(sensor);
            return Ok(true);
        }
        Ok(false)
    }
}
