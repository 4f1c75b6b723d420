/// Motion controller for the X/Y gantry
///
/// Converts a normalized target into relative angular moves per axis. The
/// axis with the longer travel runs at the base speed and the other axis is
/// slowed in proportion, so both arrive together and strokes stay straight.
///
/// Targets are not clamped to [0, 1]. Out-of-range values pass through and
/// the hardware travel limits apply.

use anyhow::{Context, Result};
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::actuator::{ActuatorPort, Axis, Then};

/// Motor rotations that span the full work area on each axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisCalibration {
    pub x_full_scale_rotations: f64,
    pub y_full_scale_rotations: f64,
}

impl Default for AxisCalibration {
    fn default() -> Self {
        Self { x_full_scale_rotations: 27.0, y_full_scale_rotations: 15.0 }
    }
}

/// Believed head location in normalized work-area coordinates
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct HeadPosition {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AxisMove {
    pub degrees: f64,
    pub speed: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MovePlan {
    pub x: AxisMove,
    pub y: AxisMove,
}

/// Per-axis degrees and speeds for a move from `from` to (`x`, `y`).
///
/// Returns `None` when neither axis would move.
pub fn plan_move(from: HeadPosition, x: f64, y: f64, base_speed: f64, calibration: &AxisCalibration) -> Option<MovePlan> {
    let x_degrees = (x - from.x) * calibration.x_full_scale_rotations * 360.0;
    let y_degrees = (y - from.y) * calibration.y_full_scale_rotations * 360.0;

    let max_abs = x_degrees.abs().max(y_degrees.abs());
    if max_abs == 0.0 {
        return None;
    }

    Some(MovePlan {
        x: AxisMove { degrees: x_degrees, speed: base_speed * x_degrees.abs() / max_abs },
        y: AxisMove { degrees: y_degrees, speed: base_speed * y_degrees.abs() / max_abs },
    })
}

pub struct MotionController {
    port: Arc<dyn ActuatorPort>,
    calibration: AxisCalibration,
    head: HeadPosition,
    moves_issued: usize,
}

impl MotionController {
    /// New controller with the head at the homed origin
    pub fn new(port: Arc<dyn ActuatorPort>, calibration: AxisCalibration) -> Self {
        Self { port, calibration, head: HeadPosition::default(), moves_issued: 0 }
    }

    pub fn head(&self) -> HeadPosition {
        self.head
    }

    pub fn moves_issued(&self) -> usize {
        self.moves_issued
    }

    /// Best-effort brake of axes a failed move left running
    fn brake_axes(&self, axes: &[Axis]) {
        for &axis in axes {
            if let Err(e) = self.port.brake(axis) {
                warn!(target: "motion", "Brake of {} after failed move did not go through: {:#}", axis, e);
            }
        }
    }

    /// Move the head to (`x`, `y`) and block until both axes confirm.
    ///
    /// Both axes are dispatched before either is awaited. The head position
    /// only changes after both completions arrive.
    pub fn move_to(&mut self, x: f64, y: f64, base_speed: f64) -> Result<Option<MovePlan>> {
        let Some(plan) = plan_move(self.head, x, y, base_speed, &self.calibration) else {
            debug!(target: "motion", "Already at ({:.4}, {:.4}), no move", x, y);
            return Ok(None);
        };

        debug!(target: "motion", "({:.4}, {:.4}) -> ({:.4}, {:.4}): X {:.1}deg @ {:.1}, Y {:.1}deg @ {:.1}",
               self.head.x, self.head.y, x, y,
               plan.x.degrees, plan.x.speed, plan.y.degrees, plan.y.speed);

        let mut dispatched = Vec::with_capacity(2);
        for (axis, axis_move) in [(Axis::X, plan.x), (Axis::Y, plan.y)] {
            if axis_move.degrees == 0.0 {
                continue;
            }
            if let Err(e) = self.port.run_relative(axis, axis_move.speed, axis_move.degrees, Then::Hold, false) {
                self.brake_axes(&dispatched);
                return Err(e).with_context(|| format!("{} axis move of {:.1} degrees", axis, axis_move.degrees));
            }
            dispatched.push(axis);
        }
        for (i, &axis) in dispatched.iter().enumerate() {
            if let Err(e) = self.port.wait_complete(axis) {
                self.brake_axes(&dispatched[i + 1..]);
                return Err(e).with_context(|| format!("{} axis did not complete its move", axis));
            }
        }

        self.head = HeadPosition { x, y };
        self.moves_issued += 1;
        Ok(Some(plan))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{ActuatorCall, SimulatedActuatorPort};

    fn controller() -> (Arc<SimulatedActuatorPort>, MotionController) {
        let port = Arc::new(SimulatedActuatorPort::new());
        let motion = MotionController::new(port.clone(), AxisCalibration::default());
        (port, motion)
    }

    #[test]
    fn test_plan_converts_to_degrees() {
        let plan = plan_move(HeadPosition::default(), 0.5, 0.0, 800.0, &AxisCalibration::default()).unwrap();
        assert_eq!(plan.x.degrees, 0.5 * 27.0 * 360.0);
        assert_eq!(plan.y.degrees, 0.0);
        assert_eq!(plan.x.speed, 800.0);
        assert_eq!(plan.y.speed, 0.0);
    }

    #[test]
    fn test_plan_speeds_are_proportional() {
        let from = HeadPosition { x: 0.2, y: 0.9 };
        let plan = plan_move(from, 0.5, 0.1, 800.0, &AxisCalibration::default()).unwrap();
        let ratio = plan.x.speed / plan.y.speed;
        let expected = plan.x.degrees.abs() / plan.y.degrees.abs();
        assert!((ratio - expected).abs() < 1e-9);
        // Y travels further: 0.8 * 15 > 0.3 * 27
        assert_eq!(plan.y.speed, 800.0);
        assert!(plan.y.degrees < 0.0);
    }

    #[test]
    fn test_plan_zero_move_is_none() {
        let from = HeadPosition { x: 0.3, y: 0.3 };
        assert!(plan_move(from, 0.3, 0.3, 800.0, &AxisCalibration::default()).is_none());
    }

    #[test]
    fn test_out_of_range_targets_pass_through() {
        let plan = plan_move(HeadPosition::default(), 1.5, -0.5, 800.0, &AxisCalibration::default()).unwrap();
        assert_eq!(plan.x.degrees, 1.5 * 27.0 * 360.0);
        assert_eq!(plan.y.degrees, -0.5 * 15.0 * 360.0);
    }

    #[test]
    fn test_move_to_updates_head_and_dispatches_both_axes() {
        let (port, mut motion) = controller();
        motion.move_to(0.5, 0.5, 800.0).unwrap();
        assert_eq!(motion.head(), HeadPosition { x: 0.5, y: 0.5 });
        let calls = port.calls();
        assert!(matches!(calls[0], ActuatorCall::Relative { axis: Axis::X, wait: false, then: Then::Hold, .. }));
        assert!(matches!(calls[1], ActuatorCall::Relative { axis: Axis::Y, wait: false, .. }));
        assert_eq!(calls[2], ActuatorCall::WaitComplete(Axis::X));
        assert_eq!(calls[3], ActuatorCall::WaitComplete(Axis::Y));
    }

    #[test]
    fn test_repeat_move_is_noop() {
        let (port, mut motion) = controller();
        assert!(motion.move_to(0.25, 0.75, 800.0).unwrap().is_some());
        let before = port.calls().len();
        assert!(motion.move_to(0.25, 0.75, 800.0).unwrap().is_none());
        assert_eq!(port.calls().len(), before);
        assert_eq!(motion.head(), HeadPosition { x: 0.25, y: 0.75 });
        assert_eq!(motion.moves_issued(), 1);
    }

    #[test]
    fn test_single_axis_move_skips_idle_axis() {
        let (port, mut motion) = controller();
        motion.move_to(0.0, 0.4, 800.0).unwrap();
        assert!(port.calls_for(Axis::X).is_empty());
        assert_eq!(port.angle(Axis::Y), 0.4 * 15.0 * 360.0);
    }

    #[test]
    fn test_failed_y_dispatch_brakes_x_and_keeps_head() {
        let port = Arc::new(SimulatedActuatorPort::new().with_fault(Axis::Y, 1, "stall"));
        let mut motion = MotionController::new(port.clone(), AxisCalibration::default());
        let err = motion.move_to(0.5, 0.5, 800.0).unwrap_err();
        assert!(format!("{:#}", err).contains("stall"));
        let x_calls = port.calls_for(Axis::X);
        assert!(matches!(x_calls[0], ActuatorCall::Relative { wait: false, .. }));
        assert_eq!(x_calls.last(), Some(&ActuatorCall::Brake(Axis::X)));
        assert_eq!(motion.head(), HeadPosition::default());
    }
}
