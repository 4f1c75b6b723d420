/// Playback orchestrator
///
/// One run: lower the plate, home X then Y, load the path, start the
/// extrusion thread, then walk the path updating the plate before each move.
/// A run is all-or-nothing; any failure ends it and is returned with the
/// phase and path index attached.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::path::Path as FsPath;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use uuid::Uuid;

use crate::actuator::{ActuatorPort, Axis};
use crate::error::PlotterError;
use crate::extrusion::{ExtrusionReport, ExtrusionSettings, ExtrusionSynchronizer};
use crate::homing::{home, HomingSettings};
use crate::motion::{AxisCalibration, HeadPosition, MotionController};
use crate::path::{load_path, Path};
use crate::plate::{PlateSettings, PlateState, PlateStateMachine};
use crate::sync::{StopSignal, SyncFlag};

#[derive(Debug, Clone)]
pub struct PlaybackSettings {
    pub base_speed: f64,
    pub calibration: AxisCalibration,
    pub homing: HomingSettings,
    pub plate: PlateSettings,
    pub extrusion: ExtrusionSettings,
    pub extrusion_enabled: bool,
    /// Pause after each point once the head has arrived
    pub point_settle: Duration,
    /// Play every n-th recorded point
    pub path_step: usize,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            base_speed: 800.0,
            calibration: AxisCalibration::default(),
            homing: HomingSettings::default(),
            plate: PlateSettings::default(),
            extrusion: ExtrusionSettings::default(),
            extrusion_enabled: true,
            point_settle: Duration::from_millis(50),
            path_step: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaybackReport {
    pub run_id: Uuid,
    pub path_len: usize,
    pub draw_points: usize,
    pub moves_issued: usize,
    pub raise_count: usize,
    pub lower_count: usize,
    pub final_head: HeadPosition,
    pub extrusion: Option<ExtrusionReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

fn is_stop(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<PlotterError>(), Some(PlotterError::Stopped { .. }))
}

fn join_extrusion(handle: JoinHandle<Result<ExtrusionReport>>) -> Result<ExtrusionReport> {
    handle
        .join()
        .map_err(|_| anyhow!("Extrusion thread panicked"))?
        .context("Extrusion synchronizer failed")
}

/// Lower the plate if a run left it raised
fn park(plate: &mut PlateStateMachine) -> Result<()> {
    if plate.state() == PlateState::Raised {
        plate.update(false).context("Parking plate after last point failed")?;
    }
    Ok(())
}

pub struct PlaybackOrchestrator {
    port: Arc<dyn ActuatorPort>,
    settings: PlaybackSettings,
    stop: StopSignal,
}

impl PlaybackOrchestrator {
    pub fn new(port: Arc<dyn ActuatorPort>, settings: PlaybackSettings, stop: StopSignal) -> Self {
        Self { port, settings, stop }
    }

    /// Home X, then Y
    pub fn home_axes(&self) -> Result<()> {
        for axis in [Axis::X, Axis::Y] {
            home(self.port.as_ref(), axis, &self.settings.homing, &self.stop)
                .with_context(|| format!("Homing {} axis failed", axis))?;
        }
        Ok(())
    }

    /// Play an already loaded path
    pub fn play(&self, path: Path) -> Result<PlaybackReport> {
        self.play_with(move || path)
    }

    /// Play path `id` from `dir`, loading it after homing
    pub fn play_file(&self, dir: &FsPath, id: u32) -> Result<PlaybackReport> {
        self.play_with(|| load_path(dir, id))
    }

    fn play_with<F: FnOnce() -> Path>(&self, load: F) -> Result<PlaybackReport> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(target: "playback", "Run {} starting", run_id);

        let sync = SyncFlag::new();
        let mut plate = PlateStateMachine::new(self.port.clone(), self.settings.plate.clone(), sync.clone());
        plate.lower_to_idle().context("Lowering plate before homing failed")?;
        self.home_axes()?;

        let mut motion = MotionController::new(self.port.clone(), self.settings.calibration);
        let path = Arc::new(load().every_nth(self.settings.path_step));
        info!(target: "playback", "Playing {} points, {} draw-points", path.len(), path.draw_point_count());

        let extrusion = if self.settings.extrusion_enabled {
            let synchronizer = ExtrusionSynchronizer::new(
                self.port.clone(),
                self.settings.extrusion.clone(),
                sync.clone(),
                self.stop.clone(),
            );
            Some(synchronizer.spawn(path.clone())?)
        } else {
            info!(target: "playback", "Extrusion disabled for this run");
            None
        };

        let traversal = self.traverse(&path, &mut plate, &mut motion);
        sync.close();
        if traversal.is_err() {
            self.stop.request();
        }
        let extrusion = extrusion.map(join_extrusion);
        let parked = park(&mut plate);

        let outcome = match (traversal, extrusion) {
            (Err(motion_err), Some(Err(extrusion_err))) if is_stop(&motion_err) && !is_stop(&extrusion_err) => {
                Err(extrusion_err)
            }
            (Err(motion_err), _) => Err(motion_err),
            (Ok(()), extrusion) => extrusion.transpose(),
        };
        let extrusion = match outcome {
            Ok(extrusion) => {
                parked?;
                extrusion
            }
            Err(e) => {
                if let Err(park_err) = parked {
                    warn!(target: "playback", "Plate may still be raised: {:#}", park_err);
                }
                error!(target: "playback", "Run {} failed: {:#}", run_id, e);
                return Err(e);
            }
        };

        let report = PlaybackReport {
            run_id,
            path_len: path.len(),
            draw_points: path.draw_point_count(),
            moves_issued: motion.moves_issued(),
            raise_count: plate.raise_count(),
            lower_count: plate.lower_count(),
            final_head: motion.head(),
            extrusion,
            started_at,
            finished_at: Utc::now(),
        };
        info!(target: "playback", "Run {} complete: {} moves, head at ({:.4}, {:.4})",
              run_id, report.moves_issued, report.final_head.x, report.final_head.y);
        Ok(report)
    }

    fn traverse(&self, path: &Path, plate: &mut PlateStateMachine, motion: &mut MotionController) -> Result<()> {
        for (index, point) in path.iter().enumerate() {
            self.stop
                .check("playback")
                .with_context(|| format!("Stopped before path index {}", index))?;

            if let Some(transition) = plate
                .update(point.draw)
                .with_context(|| format!("Plate update at path index {}", index))?
            {
                info!(target: "playback", "Plate {:?} at path index {}", transition, index);
            }

            motion
                .move_to(point.x, point.y, self.settings.base_speed)
                .with_context(|| format!("Move to path index {} ({:.4}, {:.4})", index, point.x, point.y))?;

            if !self.settings.point_settle.is_zero() {
                thread::sleep(self.settings.point_settle);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathPoint;
    use crate::sim::{ActuatorCall, SimulatedActuatorPort};

    fn fast_settings() -> PlaybackSettings {
        PlaybackSettings {
            homing: HomingSettings { poll_interval: Duration::from_millis(1), ..Default::default() },
            extrusion: ExtrusionSettings { poll_interval: Duration::from_millis(2), ..Default::default() },
            point_settle: Duration::ZERO,
            ..Default::default()
        }
    }

    #[test]
    fn test_run_order_lower_then_home_x_then_y() {
        let port = Arc::new(SimulatedActuatorPort::new());
        let orchestrator = PlaybackOrchestrator::new(port.clone(), fast_settings(), StopSignal::new());
        orchestrator.play(Path::default()).unwrap();
        let calls = port.calls();
        assert!(matches!(calls[0], ActuatorCall::Timed { axis: Axis::Plate, .. }));
        assert_eq!(calls[1], ActuatorCall::Power { axis: Axis::X, power: -100.0 });
        let y_start = calls.iter().position(|c| *c == ActuatorCall::Power { axis: Axis::Y, power: -100.0 }).unwrap();
        let x_brake = calls.iter().position(|c| *c == ActuatorCall::Brake(Axis::X)).unwrap();
        assert!(x_brake < y_start);
    }

    #[test]
    fn test_empty_path_moves_nothing() {
        let port = Arc::new(SimulatedActuatorPort::new());
        let orchestrator = PlaybackOrchestrator::new(port.clone(), fast_settings(), StopSignal::new());
        let report = orchestrator.play(Path::default()).unwrap();
        assert_eq!(report.moves_issued, 0);
        assert!(report.extrusion.unwrap().skipped);
        assert_eq!(report.final_head, HeadPosition::default());
    }

    #[test]
    fn test_extrusion_disabled_leaves_syringe_alone() {
        let port = Arc::new(SimulatedActuatorPort::new());
        let settings = PlaybackSettings { extrusion_enabled: false, ..fast_settings() };
        let orchestrator = PlaybackOrchestrator::new(port.clone(), settings, StopSignal::new());
        let path = Path::new(vec![PathPoint::new(0.1, 0.1, true)]);
        let report = orchestrator.play(path).unwrap();
        assert!(report.extrusion.is_none());
        assert!(port.calls_for(Axis::Syringe).is_empty());
    }

    #[test]
    fn test_ends_with_plate_parked() {
        let port = Arc::new(SimulatedActuatorPort::new());
        let orchestrator = PlaybackOrchestrator::new(port.clone(), fast_settings(), StopSignal::new());
        let path = Path::new(vec![PathPoint::new(0.1, 0.1, false), PathPoint::new(0.2, 0.2, true)]);
        let report = orchestrator.play(path).unwrap();
        assert_eq!(report.raise_count, 1);
        assert_eq!(report.lower_count, 1);
        let plate_calls = port.calls_for(Axis::Plate);
        assert!(matches!(plate_calls.last(), Some(ActuatorCall::Timed { power, .. }) if *power > 0.0));
    }

    #[test]
    fn test_extrusion_fault_still_parks_plate() {
        let port = Arc::new(SimulatedActuatorPort::new().with_fault(Axis::Syringe, 2, "plunger jammed"));
        let orchestrator = PlaybackOrchestrator::new(port.clone(), fast_settings(), StopSignal::new());
        let path = Path::new(vec![
            PathPoint::new(0.0, 0.0, false),
            PathPoint::new(0.1, 0.1, true),
            PathPoint::new(0.2, 0.2, true),
        ]);
        let err = orchestrator.play(path).unwrap_err();
        assert!(format!("{:#}", err).contains("plunger jammed"));
        let plate_powers: Vec<f64> = port
            .calls_for(Axis::Plate)
            .into_iter()
            .filter_map(|c| match c {
                ActuatorCall::Timed { power, .. } => Some(power),
                _ => None,
            })
            .collect();
        // Idle, raise at index 1, park
        assert_eq!(plate_powers, vec![400.0, -400.0, 400.0]);
    }

    #[test]
    fn test_motion_fault_parks_raised_plate() {
        let port = Arc::new(SimulatedActuatorPort::new().with_fault(Axis::X, 2, "stall"));
        let settings = PlaybackSettings { extrusion_enabled: false, ..fast_settings() };
        let orchestrator = PlaybackOrchestrator::new(port.clone(), settings, StopSignal::new());
        let path = Path::new(vec![PathPoint::new(0.1, 0.0, true), PathPoint::new(0.2, 0.0, true)]);
        orchestrator.play(path).unwrap_err();
        let plate_calls = port.calls_for(Axis::Plate);
        assert!(matches!(plate_calls.last(), Some(ActuatorCall::Timed { power, .. }) if *power > 0.0));
        assert_eq!(plate_calls.len(), 3);
    }

    #[test]
    fn test_motion_fault_reports_path_index() {
        let port = Arc::new(SimulatedActuatorPort::new().with_fault(Axis::X, 2, "stall"));
        let orchestrator = PlaybackOrchestrator::new(port, fast_settings(), StopSignal::new());
        let path = Path::new(vec![
            PathPoint::new(0.1, 0.0, false),
            PathPoint::new(0.2, 0.0, false),
            PathPoint::new(0.3, 0.0, false),
        ]);
        let err = orchestrator.play(path).unwrap_err();
        let message = format!("{:#}", err);
        assert!(message.contains("path index 1"), "{}", message);
        assert!(message.contains("stall"), "{}", message);
    }
}
