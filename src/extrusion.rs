/// Extrusion synchronizer
///
/// Runs on its own thread next to the motion loop. It walks the same path,
/// pushing the syringe a fixed share of the extrusion budget for every
/// draw-point, and parks whenever the sync flag says the plate is down.
///
/// It never assumes the motion loop is at the same index. The only inputs it
/// trusts are the sync flag and its own progress count, which only grows.
/// At the end of a stroke it waits for the flag to be written again, so it
/// never crosses a travel gap before the plate has actually come down.

use anyhow::{Context, Result};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::actuator::{ActuatorPort, Axis, Then};
use crate::error::PlotterError;
use crate::path::Path;
use crate::sync::{Gate, StopSignal, SyncFlag};

#[derive(Debug, Clone)]
pub struct ExtrusionSettings {
    /// Syringe rotation spread over all draw-points of a path
    pub total_degrees: f64,
    pub speed: f64,
    /// Longest time a paused synchronizer goes without re-checking
    pub poll_interval: Duration,
}

impl Default for ExtrusionSettings {
    fn default() -> Self {
        Self {
            total_degrees: 430.0,
            speed: 100.0,
            poll_interval: Duration::from_millis(50),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExtrusionReport {
    pub degrees_per_point: f64,
    /// Syringe target after each extruded draw-point, in order
    pub progress: Vec<f64>,
    pub points_visited: usize,
    pub pauses: usize,
    /// Path had no draw-points
    pub skipped: bool,
    /// Draw-points left when the motion loop finished with the plate down
    pub abandoned: usize,
}

impl ExtrusionReport {
    pub fn final_progress(&self) -> f64 {
        self.progress.last().copied().unwrap_or(0.0)
    }
}

/// Accept an extrusion budget only if it is a finite, non-negative angle
pub fn validate_budget(total_degrees: f64) -> Result<f64, PlotterError> {
    if total_degrees.is_finite() && total_degrees >= 0.0 {
        Ok(total_degrees)
    } else {
        Err(PlotterError::Config(format!(
            "Extrusion budget must be a non-negative number of degrees, got {}",
            total_degrees
        )))
    }
}

/// Budget share per draw-point, `None` for a path without draw-points
pub fn degrees_per_point(total_degrees: f64, path: &Path) -> Result<Option<f64>, PlotterError> {
    let total_degrees = validate_budget(total_degrees)?;
    Ok(match path.draw_point_count() {
        0 => None,
        n => Some(total_degrees / n as f64),
    })
}

pub struct ExtrusionSynchronizer {
    port: Arc<dyn ActuatorPort>,
    settings: ExtrusionSettings,
    sync: SyncFlag,
    stop: StopSignal,
}

impl ExtrusionSynchronizer {
    pub fn new(port: Arc<dyn ActuatorPort>, settings: ExtrusionSettings, sync: SyncFlag, stop: StopSignal) -> Self {
        Self { port, settings, sync, stop }
    }

    /// Run on a dedicated thread over a shared path. A failure raises the
    /// stop signal so the motion loop ends too.
    pub fn spawn(self, path: Arc<Path>) -> Result<JoinHandle<Result<ExtrusionReport>>> {
        thread::Builder::new()
            .name("extrusion".to_string())
            .spawn(move || {
                let result = self.run(&path);
                if let Err(e) = &result {
                    warn!(target: "extrusion", "Extrusion ended early: {:#}", e);
                    self.stop.request();
                }
                result
            })
            .context("Failed to spawn extrusion thread")
    }

    /// Block until extrusion may advance and return the flag generation it
    /// was permitted at. `Ok(None)` means the flag closed while paused and no
    /// more drawing will happen.
    fn wait_for_permission(&self, index: usize, report: &mut ExtrusionReport) -> Result<Option<u64>> {
        let mut paused = false;
        loop {
            self.stop.check("extrusion")?;
            match self.sync.wait_gate(self.settings.poll_interval) {
                (Gate::Permitted, snapshot) => {
                    if paused {
                        debug!(target: "extrusion", "Resumed at path index {}", index);
                    }
                    return Ok(Some(snapshot.generation));
                }
                (Gate::Closed, _) => return Ok(None),
                (Gate::Paused, _) => {
                    if !paused {
                        paused = true;
                        report.pauses += 1;
                        debug!(target: "extrusion", "Paused at path index {}, braking syringe", index);
                        self.port.brake(Axis::Syringe).context("Syringe brake while paused")?;
                    }
                }
            }
        }
    }

    /// Hold at the first travel point after a stroke until the flag has been
    /// written since the stroke was permitted, i.e. the plate has lowered.
    fn wait_for_stroke_end(&self, stroke_generation: u64, index: usize) -> Result<()> {
        debug!(target: "extrusion", "Stroke ends before path index {}, waiting for plate", index);
        loop {
            self.stop.check("extrusion")?;
            let snapshot = self.sync.wait_past(stroke_generation, self.settings.poll_interval);
            if snapshot.generation > stroke_generation {
                return Ok(());
            }
        }
    }

    pub fn run(&self, path: &Path) -> Result<ExtrusionReport> {
        let mut report = ExtrusionReport::default();

        let Some(per_point) = degrees_per_point(self.settings.total_degrees, path)? else {
            warn!(target: "extrusion", "No drawing points in path, extrusion skipped");
            report.skipped = true;
            return Ok(report);
        };
        report.degrees_per_point = per_point;
        info!(target: "extrusion", "Total drawing points: {}, {:.2} degrees per point",
              path.draw_point_count(), per_point);

        self.port.reset_angle(Axis::Syringe, 0.0).context("Failed to zero syringe")?;

        let mut extruded = 0usize;
        // Flag generation the current stroke was first permitted at
        let mut stroke: Option<u64> = None;
        for (index, point) in path.iter().enumerate() {
            if !point.draw {
                if let Some(generation) = stroke.take() {
                    self.wait_for_stroke_end(generation, index)?;
                }
            }

            let Some(generation) = self.wait_for_permission(index, &mut report)? else {
                report.abandoned = path.points()[index..].iter().filter(|p| p.draw).count();
                info!(target: "extrusion", "Motion finished with plate lowered, {} draw-points not extruded",
                      report.abandoned);
                break;
            };

            if point.draw {
                stroke.get_or_insert(generation);
                extruded += 1;
                let target = per_point * extruded as f64;
                debug!(target: "extrusion", "Syringe pushing to {:.2} degrees (index {})", target, index);
                self.port
                    .run_absolute_target(Axis::Syringe, self.settings.speed, target, Then::Hold, true)
                    .with_context(|| format!("Syringe push to {:.2} degrees at path index {}", target, index))?;
                report.progress.push(target);
            } else {
                self.port.brake(Axis::Syringe).context("Syringe brake on travel point")?;
            }
            report.points_visited += 1;
        }

        info!(target: "extrusion", "Extrusion finished at {:.2} degrees ({} pauses)",
              report.final_progress(), report.pauses);
        Ok(report)
    }
}
