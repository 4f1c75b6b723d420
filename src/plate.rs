/// Plate state machine
///
/// The plate is raised against the nozzle while drawing and lowered for
/// travel moves. Transitions fire only on draw-flag edges between consecutive
/// points, and each one flips the extrusion sync flag after the plate has
/// finished moving.

use anyhow::{Context, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::actuator::{ActuatorPort, Axis, Then};
use crate::sync::SyncFlag;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PlateState {
    /// Idle, no material deposited
    Lowered,
    /// Drawing
    Raised,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlateTransition {
    Raise,
    Lower,
}

#[derive(Debug, Clone)]
pub struct PlateSettings {
    /// Timed-run power; raising runs at `-power`, lowering at `+power`
    pub power: f64,
    pub duration_ms: u64,
}

impl Default for PlateSettings {
    fn default() -> Self {
        Self { power: 400.0, duration_ms: 4000 }
    }
}

pub struct PlateStateMachine {
    port: Arc<dyn ActuatorPort>,
    settings: PlateSettings,
    sync: SyncFlag,
    state: PlateState,
    raise_count: usize,
    lower_count: usize,
}

impl PlateStateMachine {
    pub fn new(port: Arc<dyn ActuatorPort>, settings: PlateSettings, sync: SyncFlag) -> Self {
        Self {
            port,
            settings,
            sync,
            state: PlateState::Lowered,
            raise_count: 0,
            lower_count: 0,
        }
    }

    pub fn state(&self) -> PlateState {
        self.state
    }

    pub fn raise_count(&self) -> usize {
        self.raise_count
    }

    pub fn lower_count(&self) -> usize {
        self.lower_count
    }

    /// Drive the plate down without a state change (start-of-run posture)
    pub fn lower_to_idle(&self) -> Result<()> {
        info!(target: "plate", "Lowering plate to idle posture");
        self.drive(PlateTransition::Lower)
    }

    fn drive(&self, transition: PlateTransition) -> Result<()> {
        let power = match transition {
            PlateTransition::Raise => -self.settings.power,
            PlateTransition::Lower => self.settings.power,
        };
        self.port
            .run_timed(Axis::Plate, power, self.settings.duration_ms, Then::Hold, true)
            .with_context(|| format!("Plate {:?} failed", transition))
    }

    /// Apply the draw flag of the next point. Returns the transition fired, if any.
    pub fn update(&mut self, draw: bool) -> Result<Option<PlateTransition>> {
        let transition = match (self.state, draw) {
            (PlateState::Lowered, true) => PlateTransition::Raise,
            (PlateState::Raised, false) => PlateTransition::Lower,
            _ => return Ok(None),
        };

        self.drive(transition)?;
        match transition {
            PlateTransition::Raise => {
                self.state = PlateState::Raised;
                self.raise_count += 1;
                self.sync.set(true);
                info!(target: "plate", "Plate raised, extrusion resumed");
            }
            PlateTransition::Lower => {
                self.state = PlateState::Lowered;
                self.lower_count += 1;
                self.sync.set(false);
                info!(target: "plate", "Plate lowered, extrusion paused");
            }
        }
        Ok(Some(transition))
    }
}
