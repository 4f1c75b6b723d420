use anyhow::{anyhow, Context, Result};
use dotenvy::dotenv;
use serde_yaml::{Mapping, Value};
use std::env;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::extrusion::{validate_budget, ExtrusionSettings};
use crate::homing::HomingSettings;
use crate::motion::AxisCalibration;
use crate::plate::PlateSettings;
use crate::playback::PlaybackSettings;

/// OS sections searched, in order, for a block named after the host
const OS_SECTIONS: [&str; 3] = ["RaspberryPi", "Ubuntu", "macOS"];

/// Environment override for CONTROLLER_PORT
pub const PORT_ENV: &str = "PLOTTER_PORT";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitSwitchSource {
    /// Sensor queries go over the controller link
    Controller,
    /// Switches wired to GPIO lines on the host
    Gpio,
}

#[derive(Debug, Clone)]
pub struct PlotterSettings {
    pub controller_port: String,
    pub controller_baud: u32,
    pub command_timeout: Duration,
    /// Y motor is mounted mirrored; positive commands are negated on the wire
    pub y_reversed: bool,
    pub limit_switch_source: LimitSwitchSource,
    pub gpio_chip: String,
    pub x_limit_pin: Option<u32>,
    pub y_limit_pin: Option<u32>,
    pub x_full_scale_rotations: f64,
    pub y_full_scale_rotations: f64,
    pub base_speed: f64,
    pub homing_power: f64,
    pub homing_poll_ms: u64,
    /// `None` blocks until the switch is pressed
    pub homing_timeout_ms: Option<u64>,
    pub plate_power: f64,
    pub plate_duration_ms: u64,
    pub extrusion_enabled: bool,
    pub extrusion_total_degrees: f64,
    pub extrusion_speed: f64,
    pub extrusion_poll_ms: u64,
    pub point_settle_ms: u64,
    pub paths_dir: PathBuf,
    pub path_step: usize,
    pub prime_speed: f64,
    pub prime_seconds: u64,
}

impl PlotterSettings {
    /// Defaults for everything except the serial device
    pub fn with_port(port: &str) -> Self {
        Self {
            controller_port: port.to_string(),
            controller_baud: 115200,
            command_timeout: Duration::from_millis(60000),
            y_reversed: true,
            limit_switch_source: LimitSwitchSource::Controller,
            gpio_chip: "/dev/gpiochip0".to_string(),
            x_limit_pin: None,
            y_limit_pin: None,
            x_full_scale_rotations: 27.0,
            y_full_scale_rotations: 15.0,
            base_speed: 800.0,
            homing_power: -100.0,
            homing_poll_ms: 10,
            homing_timeout_ms: None,
            plate_power: 400.0,
            plate_duration_ms: 4000,
            extrusion_enabled: true,
            extrusion_total_degrees: 430.0,
            extrusion_speed: 100.0,
            extrusion_poll_ms: 50,
            point_settle_ms: 50,
            paths_dir: PathBuf::from("paths"),
            path_step: 1,
            prime_speed: 90.0,
            prime_seconds: 20,
        }
    }

    pub fn calibration(&self) -> AxisCalibration {
        AxisCalibration {
            x_full_scale_rotations: self.x_full_scale_rotations,
            y_full_scale_rotations: self.y_full_scale_rotations,
        }
    }

    pub fn homing(&self) -> HomingSettings {
        HomingSettings {
            power: self.homing_power,
            poll_interval: Duration::from_millis(self.homing_poll_ms),
            timeout: self.homing_timeout_ms.map(Duration::from_millis),
        }
    }

    pub fn plate(&self) -> PlateSettings {
        PlateSettings { power: self.plate_power, duration_ms: self.plate_duration_ms }
    }

    pub fn extrusion(&self) -> ExtrusionSettings {
        ExtrusionSettings {
            total_degrees: self.extrusion_total_degrees,
            speed: self.extrusion_speed,
            poll_interval: Duration::from_millis(self.extrusion_poll_ms),
        }
    }

    pub fn playback(&self) -> PlaybackSettings {
        PlaybackSettings {
            base_speed: self.base_speed,
            calibration: self.calibration(),
            homing: self.homing(),
            plate: self.plate(),
            extrusion: self.extrusion(),
            extrusion_enabled: self.extrusion_enabled,
            point_settle: Duration::from_millis(self.point_settle_ms),
            path_step: self.path_step,
        }
    }

    /// Relative paths resolve against the crate directory
    pub fn resolved_paths_dir(&self) -> PathBuf {
        if self.paths_dir.is_absolute() {
            self.paths_dir.clone()
        } else {
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join(&self.paths_dir)
        }
    }
}

pub fn default_config_path() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("plotter.yaml")
}

/// Find the block for `hostname` under any of the OS sections
fn find_host_block<'a>(yaml: &'a Value, hostname: &str) -> Option<&'a Mapping> {
    for os_key in OS_SECTIONS.iter() {
        if let Some(os_map) = yaml.get(*os_key).and_then(|v| v.as_mapping()) {
            for (k, v) in os_map.iter() {
                if k.as_str() == Some(hostname) {
                    return v.as_mapping();
                }
            }
        }
    }
    None
}

fn get_f64(block: &Mapping, key: &str) -> Option<f64> {
    block.get(&Value::from(key)).and_then(|v| v.as_f64().or_else(|| v.as_i64().map(|n| n as f64)))
}

fn get_u64(block: &Mapping, key: &str) -> Option<u64> {
    block.get(&Value::from(key)).and_then(|v| v.as_u64())
}

fn get_bool(block: &Mapping, key: &str) -> Option<bool> {
    block.get(&Value::from(key)).and_then(|v| v.as_bool())
}

fn get_str<'a>(block: &'a Mapping, key: &str) -> Option<&'a str> {
    block.get(&Value::from(key)).and_then(|v| v.as_str())
}

/// Build settings from a parsed plotter.yaml. Fails loudly on a missing host
/// block, a missing CONTROLLER_PORT, GPIO switches without pins, or a value
/// out of range.
pub fn parse_plotter_settings(yaml: &Value, hostname: &str) -> Result<PlotterSettings> {
    let block = find_host_block(yaml, hostname)
        .ok_or_else(|| anyhow!("No host entry for '{}' in plotter.yaml", hostname))?;

    let port = get_str(block, "CONTROLLER_PORT")
        .ok_or_else(|| anyhow!("CONTROLLER_PORT missing for '{}' in plotter.yaml", hostname))?;
    let mut s = PlotterSettings::with_port(port);

    if let Some(v) = get_u64(block, "CONTROLLER_BAUD") { s.controller_baud = v as u32; }
    if let Some(v) = get_u64(block, "COMMAND_TIMEOUT_MS") { s.command_timeout = Duration::from_millis(v); }
    if let Some(v) = get_bool(block, "Y_REVERSED") { s.y_reversed = v; }

    s.limit_switch_source = match get_str(block, "LIMIT_SWITCH_SOURCE") {
        None | Some("controller") => LimitSwitchSource::Controller,
        Some("gpio") => LimitSwitchSource::Gpio,
        Some(other) => {
            return Err(anyhow!("LIMIT_SWITCH_SOURCE '{}' for '{}' must be 'controller' or 'gpio'", other, hostname));
        }
    };
    if let Some(v) = get_str(block, "GPIO_CHIP") { s.gpio_chip = v.to_string(); }
    s.x_limit_pin = get_u64(block, "X_LIMIT_PIN").map(|n| n as u32);
    s.y_limit_pin = get_u64(block, "Y_LIMIT_PIN").map(|n| n as u32);
    if s.limit_switch_source == LimitSwitchSource::Gpio && (s.x_limit_pin.is_none() || s.y_limit_pin.is_none()) {
        return Err(anyhow!(
            "LIMIT_SWITCH_SOURCE is gpio but X_LIMIT_PIN or Y_LIMIT_PIN is missing for '{}' in plotter.yaml",
            hostname
        ));
    }

    if let Some(v) = get_f64(block, "X_FULL_SCALE_ROTATIONS") { s.x_full_scale_rotations = v; }
    if let Some(v) = get_f64(block, "Y_FULL_SCALE_ROTATIONS") { s.y_full_scale_rotations = v; }
    if let Some(v) = get_f64(block, "BASE_SPEED") { s.base_speed = v; }
    if let Some(v) = get_f64(block, "HOMING_POWER") { s.homing_power = v; }
    if let Some(v) = get_u64(block, "HOMING_POLL_MS") { s.homing_poll_ms = v; }
    s.homing_timeout_ms = get_u64(block, "HOMING_TIMEOUT_MS");
    if let Some(v) = get_f64(block, "PLATE_POWER") { s.plate_power = v; }
    if let Some(v) = get_u64(block, "PLATE_DURATION_MS") { s.plate_duration_ms = v; }
    if let Some(v) = get_bool(block, "EXTRUSION_ENABLED") { s.extrusion_enabled = v; }
    if let Some(v) = get_f64(block, "EXTRUSION_TOTAL_DEGREES") { s.extrusion_total_degrees = v; }
    if let Some(v) = get_f64(block, "EXTRUSION_SPEED") { s.extrusion_speed = v; }
    if let Some(v) = get_u64(block, "EXTRUSION_POLL_MS") { s.extrusion_poll_ms = v; }
    if let Some(v) = get_u64(block, "POINT_SETTLE_MS") { s.point_settle_ms = v; }
    if let Some(v) = get_str(block, "PATHS_DIR") { s.paths_dir = PathBuf::from(v); }
    if let Some(v) = get_u64(block, "PATH_STEP") { s.path_step = v.max(1) as usize; }
    if let Some(v) = get_f64(block, "PRIME_SPEED") { s.prime_speed = v; }
    if let Some(v) = get_u64(block, "PRIME_SECONDS") { s.prime_seconds = v; }

    if s.base_speed <= 0.0 {
        return Err(anyhow!("BASE_SPEED must be positive for '{}' (got {})", hostname, s.base_speed));
    }
    validate_budget(s.extrusion_total_degrees)
        .with_context(|| format!("EXTRUSION_TOTAL_DEGREES for '{}'", hostname))?;
    for (key, ms) in [("HOMING_POLL_MS", s.homing_poll_ms), ("EXTRUSION_POLL_MS", s.extrusion_poll_ms)] {
        if ms == 0 {
            return Err(anyhow!("{} must be at least 1 for '{}'", key, hostname));
        }
    }

    Ok(s)
}

/// Load settings for `hostname` from a specific YAML file, applying the
/// PLOTTER_PORT environment override.
pub fn load_plotter_settings_from(yaml_path: &Path, hostname: &str) -> Result<PlotterSettings> {
    let _ = dotenv();
    let file = File::open(yaml_path)
        .map_err(|e| anyhow!("Missing required plotter.yaml at {:?}: {}", yaml_path, e))?;
    let yaml: Value = serde_yaml::from_reader(file)
        .with_context(|| format!("Failed to parse {:?}", yaml_path))?;
    let mut settings = parse_plotter_settings(&yaml, hostname)?;

    if let Ok(port) = env::var(PORT_ENV) {
        log::info!(target: "config_loader", "{} overrides CONTROLLER_PORT: {}", PORT_ENV, port);
        settings.controller_port = port;
    }

    log::info!(target: "config_loader", "PlotterSettings: port={}, baud={}, switches={:?} (hostname={})",
               settings.controller_port, settings.controller_baud, settings.limit_switch_source, hostname);
    Ok(settings)
}

/// Settings for a binary run: `config` or the default plotter.yaml, for this
/// host. A simulated run falls back to defaults when no host entry exists.
pub fn load_run_settings(config: Option<&Path>, simulate: bool) -> Result<PlotterSettings> {
    let hostname = current_hostname();
    let path = config.map(Path::to_path_buf).unwrap_or_else(default_config_path);
    match load_plotter_settings_from(&path, &hostname) {
        Ok(settings) => Ok(settings),
        Err(e) if simulate => {
            log::warn!(target: "config_loader", "Using default settings for simulation: {:#}", e);
            Ok(PlotterSettings::with_port("simulated"))
        }
        Err(e) => Err(e),
    }
}

/// Current machine's hostname, as used to pick the host block
pub fn current_hostname() -> String {
    gethostname::gethostname().to_string_lossy().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn parse(text: &str, host: &str) -> Result<PlotterSettings> {
        let yaml: Value = serde_yaml::from_str(text).unwrap();
        parse_plotter_settings(&yaml, host)
    }

    const SAMPLE: &str = r#"
RaspberryPi:
  plotter-pi:
    CONTROLLER_PORT: /dev/ttyACM0
    BASE_SPEED: 600
    HOMING_TIMEOUT_MS: 30000
    EXTRUSION_TOTAL_DEGREES: 512.5
Ubuntu:
  bench:
    CONTROLLER_PORT: /dev/ttyUSB1
    LIMIT_SWITCH_SOURCE: gpio
    X_LIMIT_PIN: 17
    Y_LIMIT_PIN: 27
    EXTRUSION_ENABLED: false
"#;

    #[test]
    fn test_defaults_fill_missing_keys() {
        let s = parse(SAMPLE, "plotter-pi").unwrap();
        assert_eq!(s.controller_port, "/dev/ttyACM0");
        assert_eq!(s.base_speed, 600.0);
        assert_eq!(s.extrusion_total_degrees, 512.5);
        assert_eq!(s.homing_timeout_ms, Some(30000));
        assert_eq!(s.controller_baud, 115200);
        assert_eq!(s.plate_duration_ms, 4000);
        assert_eq!(s.calibration(), AxisCalibration::default());
        assert_eq!(s.limit_switch_source, LimitSwitchSource::Controller);
    }

    #[test]
    fn test_host_found_in_any_os_section() {
        let s = parse(SAMPLE, "bench").unwrap();
        assert_eq!(s.limit_switch_source, LimitSwitchSource::Gpio);
        assert_eq!((s.x_limit_pin, s.y_limit_pin), (Some(17), Some(27)));
        assert!(!s.playback().extrusion_enabled);
    }

    #[test]
    fn test_unknown_host_fails_loudly() {
        let err = parse(SAMPLE, "laptop").unwrap_err();
        assert!(err.to_string().contains("laptop"));
    }

    #[test]
    fn test_gpio_source_requires_pins() {
        let text = "Ubuntu:\n  bench:\n    CONTROLLER_PORT: /dev/ttyUSB0\n    LIMIT_SWITCH_SOURCE: gpio\n    X_LIMIT_PIN: 4\n";
        assert!(parse(text, "bench").is_err());
    }

    #[test]
    fn test_missing_port_is_an_error() {
        let text = "macOS:\n  mbp:\n    BASE_SPEED: 500\n";
        let err = parse(text, "mbp").unwrap_err();
        assert!(err.to_string().contains("CONTROLLER_PORT"));
    }

    #[test]
    fn test_negative_budget_is_rejected() {
        let text = "macOS:\n  mbp:\n    CONTROLLER_PORT: /dev/cu.usbmodem1\n    EXTRUSION_TOTAL_DEGREES: -100\n";
        let err = parse(text, "mbp").unwrap_err();
        assert!(format!("{:#}", err).contains("EXTRUSION_TOTAL_DEGREES"));
        let text = "macOS:\n  mbp:\n    CONTROLLER_PORT: /dev/cu.usbmodem1\n    EXTRUSION_TOTAL_DEGREES: .nan\n";
        assert!(parse(text, "mbp").is_err());
    }

    #[test]
    fn test_zero_poll_intervals_are_rejected() {
        for key in ["HOMING_POLL_MS", "EXTRUSION_POLL_MS"] {
            let text = format!("Ubuntu:\n  bench:\n    CONTROLLER_PORT: /dev/ttyUSB0\n    {}: 0\n", key);
            let err = parse(&text, "bench").unwrap_err();
            assert!(err.to_string().contains(key), "{}", err);
        }
    }

    #[test]
    fn test_converters_carry_values() {
        let s = parse(SAMPLE, "plotter-pi").unwrap();
        let homing = s.homing();
        assert_eq!(homing.power, -100.0);
        assert_eq!(homing.timeout, Some(Duration::from_secs(30)));
        let playback = s.playback();
        assert_eq!(playback.base_speed, 600.0);
        assert_eq!(playback.point_settle, Duration::from_millis(50));
        assert_eq!(playback.plate.power, 400.0);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(SAMPLE.as_bytes()).unwrap();
        let s = load_plotter_settings_from(file.path(), "bench").unwrap();
        assert_eq!(s.y_limit_pin, Some(27));
    }
}
