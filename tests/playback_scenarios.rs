use std::sync::Arc;
use std::time::Duration;

use syringe_plotter::actuator::Axis;
use syringe_plotter::error::PlotterError;
use syringe_plotter::extrusion::ExtrusionSettings;
use syringe_plotter::homing::HomingSettings;
use syringe_plotter::motion::HeadPosition;
use syringe_plotter::path::{save_path, Path, PathPoint};
use syringe_plotter::playback::{PlaybackOrchestrator, PlaybackSettings};
use syringe_plotter::sim::{ActuatorCall, SimulatedActuatorPort};
use syringe_plotter::sync::StopSignal;
use tempfile::TempDir;

fn settings(total_degrees: f64) -> PlaybackSettings {
    PlaybackSettings {
        homing: HomingSettings { poll_interval: Duration::from_millis(1), ..Default::default() },
        extrusion: ExtrusionSettings {
            total_degrees,
            poll_interval: Duration::from_millis(2),
            ..Default::default()
        },
        point_settle: Duration::ZERO,
        ..Default::default()
    }
}

fn square() -> Path {
    Path::new(vec![
        PathPoint::new(0.0, 0.0, false),
        PathPoint::new(0.5, 0.0, true),
        PathPoint::new(0.5, 0.5, true),
        PathPoint::new(0.0, 0.5, false),
    ])
}

fn plate_powers(port: &SimulatedActuatorPort) -> Vec<f64> {
    port.calls_for(Axis::Plate)
        .into_iter()
        .filter_map(|c| match c {
            ActuatorCall::Timed { power, .. } => Some(power),
            _ => None,
        })
        .collect()
}

#[test]
fn square_stroke_extrudes_in_step_with_the_plate() {
    // Motors run at 1/500 of real time so the syringe finishes each draw-point
    // well before the gantry reaches the next plate transition
    let port = Arc::new(SimulatedActuatorPort::new().with_time_scale(0.002));
    let orchestrator = PlaybackOrchestrator::new(port.clone(), settings(100.0), StopSignal::new());

    let report = orchestrator.play(square()).unwrap();

    assert_eq!(report.raise_count, 1);
    assert_eq!(report.lower_count, 1);
    assert_eq!(report.final_head, HeadPosition { x: 0.0, y: 0.5 });
    assert_eq!(report.draw_points, 2);
    // Idle lowering, raise before point 1, lower before point 3
    assert_eq!(plate_powers(&port), vec![400.0, -400.0, 400.0]);

    let extrusion = report.extrusion.unwrap();
    assert_eq!(extrusion.degrees_per_point, 50.0);
    assert_eq!(extrusion.progress, vec![50.0, 100.0]);
    assert_eq!(extrusion.abandoned, 0);
    assert_eq!(port.angle(Axis::Syringe), 100.0);
}

#[test]
fn second_stroke_waits_for_the_plate_to_come_down() {
    let port = Arc::new(SimulatedActuatorPort::new().with_time_scale(0.01));
    let orchestrator = PlaybackOrchestrator::new(port.clone(), settings(100.0), StopSignal::new());
    let flags = [false, true, true, false, true, true];
    let path = Path::new(
        flags
            .iter()
            .enumerate()
            .map(|(i, &draw)| PathPoint::new(0.1 * i as f64, 0.1, draw))
            .collect(),
    );

    let report = orchestrator.play(path).unwrap();
    assert_eq!(report.extrusion.unwrap().progress, vec![25.0, 50.0, 75.0, 100.0]);

    let calls = port.calls();
    let plate_moves: Vec<usize> = calls
        .iter()
        .enumerate()
        .filter(|(_, c)| matches!(c, ActuatorCall::Timed { axis: Axis::Plate, .. }))
        .map(|(i, _)| i)
        .collect();
    // Idle, raise at 1, lower at 3, raise at 4, park
    assert_eq!(plate_moves.len(), 5);
    let stroke_two_push = calls
        .iter()
        .position(|c| matches!(c, ActuatorCall::AbsoluteTarget { axis: Axis::Syringe, target, .. } if *target > 50.0))
        .unwrap();
    assert!(stroke_two_push > plate_moves[2], "second stroke extruded before the plate lowered");
}

#[test]
fn plate_fires_on_edges_and_parks_at_the_end() {
    let port = Arc::new(SimulatedActuatorPort::new());
    let settings = PlaybackSettings { extrusion_enabled: false, ..settings(100.0) };
    let orchestrator = PlaybackOrchestrator::new(port.clone(), settings, StopSignal::new());
    let flags = [false, false, true, true, false, true];
    let path = Path::new(
        flags
            .iter()
            .enumerate()
            .map(|(i, &draw)| PathPoint::new(0.1 * i as f64, 0.05 * i as f64, draw))
            .collect(),
    );

    let report = orchestrator.play(path).unwrap();

    assert_eq!(report.raise_count, 2);
    assert_eq!(report.lower_count, 2);
    assert_eq!(plate_powers(&port), vec![400.0, -400.0, 400.0, -400.0, 400.0]);
    assert_eq!(report.moves_issued, 5);
}

#[test]
fn syringe_fault_ends_the_run_with_that_fault() {
    let port = Arc::new(
        SimulatedActuatorPort::new()
            .with_time_scale(0.001)
            .with_fault(Axis::Syringe, 1, "plunger jammed"),
    );
    let orchestrator = PlaybackOrchestrator::new(port, settings(100.0), StopSignal::new());
    let mut points = vec![PathPoint::new(0.0, 0.0, false)];
    points.extend((1..20).map(|i| PathPoint::new(0.05 * i as f64, 0.02 * i as f64, true)));

    let err = orchestrator.play(Path::new(points)).unwrap_err();

    assert!(matches!(
        err.downcast_ref::<PlotterError>(),
        Some(PlotterError::ActuatorFault { axis: Axis::Syringe, .. })
    ));
    assert!(format!("{:#}", err).contains("plunger jammed"));
}

#[test]
fn stop_before_start_aborts_during_homing() {
    let port = Arc::new(SimulatedActuatorPort::new());
    let stop = StopSignal::new();
    stop.request();
    let orchestrator = PlaybackOrchestrator::new(port.clone(), settings(100.0), stop);

    let err = orchestrator.play(square()).unwrap_err();

    assert!(matches!(err.downcast_ref::<PlotterError>(), Some(PlotterError::Stopped { .. })));
    assert!(format!("{:#}", err).contains("Homing X"));
    assert_eq!(port.calls_for(Axis::X).last(), Some(&ActuatorCall::Brake(Axis::X)));
    assert!(port.calls_for(Axis::Syringe).is_empty());
}

#[test]
fn play_file_loads_after_homing_and_thins_the_path() {
    let dir = TempDir::new().unwrap();
    let id = save_path(dir.path(), &square()).unwrap();
    let port = Arc::new(SimulatedActuatorPort::new());
    let settings = PlaybackSettings { path_step: 2, extrusion_enabled: false, ..settings(100.0) };
    let orchestrator = PlaybackOrchestrator::new(port, settings, StopSignal::new());

    let report = orchestrator.play_file(dir.path(), id).unwrap();

    // Points 0 and 2 remain
    assert_eq!(report.path_len, 2);
    assert_eq!(report.final_head, HeadPosition { x: 0.5, y: 0.5 });
    assert_eq!(report.raise_count, 1);
}

#[test]
fn missing_path_file_is_an_empty_run() {
    let dir = TempDir::new().unwrap();
    let port = Arc::new(SimulatedActuatorPort::new());
    let orchestrator = PlaybackOrchestrator::new(port, settings(100.0), StopSignal::new());

    let report = orchestrator.play_file(dir.path(), 7).unwrap();

    assert_eq!(report.path_len, 0);
    assert_eq!(report.moves_issued, 0);
    assert!(report.extrusion.unwrap().skipped);
}

#[test]
fn report_serializes_to_json() {
    let port = Arc::new(SimulatedActuatorPort::new());
    let orchestrator = PlaybackOrchestrator::new(port, settings(100.0), StopSignal::new());
    let report = orchestrator.play(Path::default()).unwrap();

    let json: serde_json::Value = serde_json::to_value(&report).unwrap();
    assert_eq!(json["path_len"], 0);
    assert!(json["run_id"].is_string());
    assert!(json["started_at"].is_string());
}
