/// Serial link to the motor controller board
///
/// Commands and replies are CmdMessenger-style text frames, `<cmd>,<arg>,...;`.
/// Motion commands (1-3) are acknowledged with a completion or fault reply
/// once the motor stops; power, speed, brake, hold and angle reset are not
/// acknowledged. A reader thread routes every reply to a channel for its axis
/// or sensor, so the motion loop and the extrusion task can each block on
/// their own axis while sharing one connection.

use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::actuator::{ActuatorPort, Axis, Sensor, Then};
use crate::config_loader::{LimitSwitchSource, PlotterSettings};
use crate::error::PlotterError;
use crate::limit_switches::{GpioLimitSwitches, LimitSwitchPins, LimitSwitchReader};
use crate::sim::SimulatedActuatorPort;

/// Board resets when the port opens and ignores input until it has booted
const RESET_DELAY: Duration = Duration::from_millis(2000);
const READ_TIMEOUT: Duration = Duration::from_millis(100);
/// Dry runs play at a hundredth of real motor time
const SIM_TIME_SCALE: f64 = 0.01;

const REPLY_COMPLETE: u8 = 10;
const REPLY_SENSOR: u8 = 11;
const REPLY_FAULT: u8 = 12;

/// One outgoing command, already oriented for the wire
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Relative { axis: Axis, speed: f64, degrees: f64, then: Then },
    AbsoluteTarget { axis: Axis, speed: f64, target: f64, then: Then },
    Timed { axis: Axis, power: f64, duration_ms: u64, then: Then },
    Power { axis: Axis, power: f64 },
    Speed { axis: Axis, speed: f64 },
    Brake(Axis),
    Hold(Axis),
    ResetAngle { axis: Axis, degrees: f64 },
    SensorQuery(Sensor),
}

fn hold_flag(then: Then) -> u8 {
    u8::from(then.holds())
}

pub fn encode_command(command: &Command) -> String {
    match *command {
        Command::Relative { axis, speed, degrees, then } => {
            format!("1,{},{:.2},{:.2},{};", axis.code(), speed, degrees, hold_flag(then))
        }
        Command::AbsoluteTarget { axis, speed, target, then } => {
            format!("2,{},{:.2},{:.2},{};", axis.code(), speed, target, hold_flag(then))
        }
        Command::Timed { axis, power, duration_ms, then } => {
            format!("3,{},{:.2},{},{};", axis.code(), power, duration_ms, hold_flag(then))
        }
        Command::Power { axis, power } => format!("4,{},{:.2};", axis.code(), power),
        Command::Brake(axis) => format!("5,{};", axis.code()),
        Command::Hold(axis) => format!("6,{};", axis.code()),
        Command::ResetAngle { axis, degrees } => format!("7,{},{:.2};", axis.code(), degrees),
        Command::SensorQuery(sensor) => format!("8,{};", sensor.code()),
        Command::Speed { axis, speed } => format!("9,{},{:.2};", axis.code(), speed),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Complete(Axis),
    SensorState(Sensor, bool),
    Fault(Axis, String),
}

/// Parse one frame with its `;` terminator already removed
pub fn parse_reply(frame: &str) -> Result<Reply, PlotterError> {
    let bad = || PlotterError::Link(format!("Malformed reply '{}'", frame));
    let mut fields = frame.trim().splitn(3, ',');
    let code: u8 = fields.next().and_then(|f| f.trim().parse().ok()).ok_or_else(bad)?;
    let target: u8 = fields.next().and_then(|f| f.trim().parse().ok()).ok_or_else(bad)?;
    let rest = fields.next().map(str::trim);

    match code {
        REPLY_COMPLETE => {
            let axis = Axis::from_code(target).ok_or_else(bad)?;
            Ok(Reply::Complete(axis))
        }
        REPLY_SENSOR => {
            let sensor = Sensor::from_code(target).ok_or_else(bad)?;
            match rest {
                Some("0") => Ok(Reply::SensorState(sensor, false)),
                Some("1") => Ok(Reply::SensorState(sensor, true)),
                _ => Err(bad()),
            }
        }
        REPLY_FAULT => {
            let axis = Axis::from_code(target).ok_or_else(bad)?;
            let reason = rest.filter(|r| !r.is_empty()).unwrap_or("unspecified fault");
            Ok(Reply::Fault(axis, reason.to_string()))
        }
        _ => Err(PlotterError::Link(format!("Unknown reply code {} in '{}'", code, frame))),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Completion {
    Done,
    Fault(String),
}

struct Routes {
    completions: HashMap<Axis, Sender<Completion>>,
    sensors: HashMap<Sensor, Sender<bool>>,
}

impl Routes {
    fn dispatch(&self, frame: &str) {
        let reply = match parse_reply(frame) {
            Ok(r) => r,
            Err(e) => {
                warn!(target: "controller_link", "{}", e);
                return;
            }
        };
        debug!(target: "controller_link", "<- {:?}", reply);
        // Sends only fail once the link is dropped
        match reply {
            Reply::Complete(axis) => self.complete(axis, Completion::Done),
            Reply::Fault(axis, reason) => self.complete(axis, Completion::Fault(reason)),
            Reply::SensorState(sensor, pressed) => {
                if let Some(tx) = self.sensors.get(&sensor) {
                    let _ = tx.send(pressed);
                }
            }
        }
    }

    fn complete(&self, axis: Axis, completion: Completion) {
        if let Some(tx) = self.completions.get(&axis) {
            let _ = tx.send(completion);
        }
    }
}

fn reader_loop(mut reader: Box<dyn Read + Send>, routes: Routes, shutdown: Arc<AtomicBool>) {
    let mut buf = [0u8; 256];
    let mut frame: Vec<u8> = Vec::with_capacity(64);
    while !shutdown.load(Ordering::Acquire) {
        match reader.read(&mut buf) {
            Ok(0) => thread::sleep(Duration::from_millis(5)),
            Ok(n) => {
                for &b in &buf[..n] {
                    if b == b';' {
                        let text = String::from_utf8_lossy(&frame);
                        if !text.trim().is_empty() {
                            routes.dispatch(&text);
                        }
                        frame.clear();
                    } else {
                        frame.push(b);
                    }
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock | ErrorKind::Interrupted) => {}
            Err(e) => {
                error!(target: "controller_link", "Serial read failed, reader stopping: {}", e);
                break;
            }
        }
    }
    debug!(target: "controller_link", "Reader thread exiting");
}

#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Longest wait for a completion or sensor reply
    pub command_timeout: Duration,
    /// Negate Y motion on the wire (motor mounted mirrored)
    pub y_reversed: bool,
}

impl Default for LinkOptions {
    fn default() -> Self {
        Self { command_timeout: Duration::from_millis(60000), y_reversed: true }
    }
}

pub struct ControllerLink {
    writer: Mutex<Box<dyn Write + Send>>,
    completions: HashMap<Axis, Receiver<Completion>>,
    sensor_states: HashMap<Sensor, Receiver<bool>>,
    options: LinkOptions,
    limit_switches: Option<Box<dyn LimitSwitchReader>>,
    shutdown: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl ControllerLink {
    /// Start the reader thread over an already open transport
    pub fn with_transport(
        reader: Box<dyn Read + Send>,
        writer: Box<dyn Write + Send>,
        options: LinkOptions,
    ) -> Result<Self> {
        let mut completions = HashMap::new();
        let mut completion_routes = HashMap::new();
        for axis in Axis::ALL {
            let (tx, rx) = unbounded();
            completion_routes.insert(axis, tx);
            completions.insert(axis, rx);
        }
        let mut sensor_states = HashMap::new();
        let mut sensor_routes = HashMap::new();
        for sensor in Sensor::ALL {
            let (tx, rx) = unbounded();
            sensor_routes.insert(sensor, tx);
            sensor_states.insert(sensor, rx);
        }

        let routes = Routes { completions: completion_routes, sensors: sensor_routes };
        let shutdown = Arc::new(AtomicBool::new(false));
        let reader_shutdown = shutdown.clone();
        let handle = thread::Builder::new()
            .name("controller-reader".to_string())
            .spawn(move || reader_loop(reader, routes, reader_shutdown))
            .map_err(|e| PlotterError::Link(format!("Failed to start reader thread: {}", e)))?;

        Ok(Self {
            writer: Mutex::new(writer),
            completions,
            sensor_states,
            options,
            limit_switches: None,
            shutdown,
            reader: Some(handle),
        })
    }

    /// Open the configured serial device and, for GPIO switches, the switch lines
    pub fn open(settings: &PlotterSettings) -> Result<Self> {
        info!(target: "controller_link", "Opening {} at {} baud", settings.controller_port, settings.controller_baud);
        let port = serialport::new(settings.controller_port.as_str(), settings.controller_baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| PlotterError::Link(format!("Connection to {} failed: {}", settings.controller_port, e)))?;
        thread::sleep(RESET_DELAY);
        let _ = port.clear(serialport::ClearBuffer::Input);
        let reader = port
            .try_clone()
            .map_err(|e| PlotterError::Link(format!("Failed to clone {}: {}", settings.controller_port, e)))?;

        let options = LinkOptions { command_timeout: settings.command_timeout, y_reversed: settings.y_reversed };
        let link = Self::with_transport(Box::new(reader), Box::new(port), options)?;

        match settings.limit_switch_source {
            LimitSwitchSource::Controller => Ok(link),
            LimitSwitchSource::Gpio => {
                let (Some(x_limit), Some(y_limit)) = (settings.x_limit_pin, settings.y_limit_pin) else {
                    return Err(PlotterError::Config("GPIO limit switches need X_LIMIT_PIN and Y_LIMIT_PIN".into()).into());
                };
                let pins = LimitSwitchPins { chip: settings.gpio_chip.clone(), x_limit, y_limit };
                Ok(link.with_limit_switches(Box::new(GpioLimitSwitches::open(pins)?)))
            }
        }
    }

    /// Read limit switches from `switches` instead of querying the board
    pub fn with_limit_switches(mut self, switches: Box<dyn LimitSwitchReader>) -> Self {
        self.limit_switches = Some(switches);
        self
    }

    fn orient(&self, axis: Axis, value: f64) -> f64 {
        if axis == Axis::Y && self.options.y_reversed { -value } else { value }
    }

    fn send(&self, command: &Command) -> Result<()> {
        let frame = encode_command(command);
        debug!(target: "controller_link", "-> {}", frame);
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writer
            .write_all(frame.as_bytes())
            .and_then(|_| writer.flush())
            .map_err(|e| PlotterError::Link(format!("Write of '{}' failed: {}", frame, e)))?;
        Ok(())
    }

    fn completion_channel(&self, axis: Axis) -> Result<&Receiver<Completion>> {
        self.completions
            .get(&axis)
            .ok_or_else(|| anyhow!("No completion channel for {} axis", axis))
    }

    /// Drop completions left over from earlier commands nobody waited on
    fn drain_stale(&self, axis: Axis) -> Result<()> {
        for stale in self.completion_channel(axis)?.try_iter() {
            match stale {
                Completion::Done => debug!(target: "controller_link", "Dropped stale completion on {}", axis),
                Completion::Fault(reason) => {
                    warn!(target: "controller_link", "Dropped stale fault on {}: {}", axis, reason)
                }
            }
        }
        Ok(())
    }

    fn motion(&self, axis: Axis, command: Command, wait: bool) -> Result<()> {
        self.drain_stale(axis)?;
        self.send(&command)?;
        if wait {
            self.wait_complete(axis)?;
        }
        Ok(())
    }
}

impl Drop for ControllerLink {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        if let Some(handle) = self.reader.take() {
            let _ = handle.join();
        }
    }
}

impl ActuatorPort for ControllerLink {
    fn run_relative(&self, axis: Axis, speed: f64, degrees: f64, then: Then, wait: bool) -> Result<()> {
        let degrees = self.orient(axis, degrees);
        self.motion(axis, Command::Relative { axis, speed, degrees, then }, wait)
    }

    fn run_absolute_target(&self, axis: Axis, speed: f64, target_degrees: f64, then: Then, wait: bool) -> Result<()> {
        let target = self.orient(axis, target_degrees);
        self.motion(axis, Command::AbsoluteTarget { axis, speed, target, then }, wait)
    }

    fn run_timed(&self, axis: Axis, power: f64, duration_ms: u64, then: Then, wait: bool) -> Result<()> {
        let power = self.orient(axis, power);
        self.motion(axis, Command::Timed { axis, power, duration_ms, then }, wait)
    }

    fn run_power(&self, axis: Axis, power: f64) -> Result<()> {
        let power = self.orient(axis, power);
        self.send(&Command::Power { axis, power })
    }

    fn run_speed(&self, axis: Axis, speed: f64) -> Result<()> {
        let speed = self.orient(axis, speed);
        self.send(&Command::Speed { axis, speed })
    }

    fn brake(&self, axis: Axis) -> Result<()> {
        self.send(&Command::Brake(axis))
    }

    fn hold(&self, axis: Axis) -> Result<()> {
        self.send(&Command::Hold(axis))
    }

    fn reset_angle(&self, axis: Axis, degrees: f64) -> Result<()> {
        let degrees = self.orient(axis, degrees);
        self.send(&Command::ResetAngle { axis, degrees })
    }

    fn wait_complete(&self, axis: Axis) -> Result<()> {
        let timeout = self.options.command_timeout;
        match self.completion_channel(axis)?.recv_timeout(timeout) {
            Ok(Completion::Done) => Ok(()),
            Ok(Completion::Fault(reason)) => Err(PlotterError::fault(axis, reason).into()),
            Err(RecvTimeoutError::Timeout) => Err(PlotterError::fault(
                axis,
                format!("no completion within {}ms", timeout.as_millis()),
            )
            .into()),
            Err(RecvTimeoutError::Disconnected) => Err(PlotterError::Link("reader thread stopped".into()).into()),
        }
    }

    fn sensor_pressed(&self, sensor: Sensor) -> Result<bool> {
        if let Some(switches) = &self.limit_switches {
            return switches.pressed(sensor);
        }
        let rx = self
            .sensor_states
            .get(&sensor)
            .ok_or_else(|| anyhow!("No state channel for {}", sensor))?;
        rx.try_iter().for_each(drop);
        self.send(&Command::SensorQuery(sensor))?;
        let timeout = self.options.command_timeout;
        match rx.recv_timeout(timeout) {
            Ok(pressed) => Ok(pressed),
            Err(RecvTimeoutError::Timeout) => Err(PlotterError::SensorTimeout {
                sensor,
                timeout_ms: timeout.as_millis() as u64,
            }
            .into()),
            Err(RecvTimeoutError::Disconnected) => Err(PlotterError::Link("reader thread stopped".into()).into()),
        }
    }
}

/// Hardware link for `settings`, or a simulated port for dry runs
pub fn open_port(settings: &PlotterSettings, simulate: bool) -> Result<Arc<dyn ActuatorPort>> {
    if simulate {
        info!(target: "controller_link", "Simulating actuators, no hardware will move");
        let port = SimulatedActuatorPort::new().with_time_scale(SIM_TIME_SCALE).without_call_log();
        return Ok(Arc::new(port));
    }
    Ok(Arc::new(ControllerLink::open(settings)?))
}
