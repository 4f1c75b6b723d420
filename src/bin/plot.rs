//! Play a recorded path: home, then draw it with synchronized extrusion.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use syringe_plotter::actuator::{ActuatorPort, Axis};
use syringe_plotter::config_loader::load_run_settings;
use syringe_plotter::controller_link::open_port;
use syringe_plotter::extrusion::validate_budget;
use syringe_plotter::playback::PlaybackOrchestrator;
use syringe_plotter::sync::StopSignal;

/// Syringe plotter path playback
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path identifier, read from <PATHS_DIR>/<PATH_ID>.txt
    path_id: u32,
    /// Dry run against a simulated controller
    #[arg(long, default_value_t = false)]
    simulate: bool,
    /// Move and lift the plate but leave the syringe alone
    #[arg(long = "no-extrude", default_value_t = false)]
    no_extrude: bool,
    /// Override EXTRUSION_TOTAL_DEGREES
    #[arg(long, value_parser = parse_budget)]
    total_degrees: Option<f64>,
    /// Override BASE_SPEED
    #[arg(long)]
    speed: Option<f64>,
    /// Play every n-th point (overrides PATH_STEP)
    #[arg(long)]
    step: Option<usize>,
    /// Write the run report as JSON to this file
    #[arg(long)]
    report: Option<PathBuf>,
    /// plotter.yaml to use instead of the one beside Cargo.toml
    #[arg(long)]
    config: Option<PathBuf>,
    /// Debug-level logging
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn parse_budget(text: &str) -> Result<f64, String> {
    let degrees: f64 = text.parse().map_err(|e| format!("{}", e))?;
    validate_budget(degrees).map_err(|e| e.to_string())
}

fn brake_all(port: &dyn ActuatorPort) {
    for axis in Axis::ALL {
        if let Err(e) = port.brake(axis) {
            warn!("Brake of {} axis after failure did not go through: {:#}", axis, e);
        }
    }
}

fn run(args: Args) -> Result<()> {
    let mut settings = load_run_settings(args.config.as_deref(), args.simulate)?;
    if let Some(total) = args.total_degrees {
        settings.extrusion_total_degrees = total;
    }
    if let Some(speed) = args.speed {
        settings.base_speed = speed;
    }
    if let Some(step) = args.step {
        settings.path_step = step.max(1);
    }
    if args.no_extrude {
        settings.extrusion_enabled = false;
    }

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || {
            warn!("Stop requested, finishing current command");
            stop.request();
        })
        .context("Failed to install Ctrl-C handler")?;
    }

    let port = open_port(&settings, args.simulate)?;
    let orchestrator = PlaybackOrchestrator::new(Arc::clone(&port), settings.playback(), stop);
    let paths_dir = settings.resolved_paths_dir();
    info!("Playing path {} from {}", args.path_id, paths_dir.display());

    let report = match orchestrator.play_file(&paths_dir, args.path_id) {
        Ok(report) => report,
        Err(e) => {
            brake_all(port.as_ref());
            return Err(e);
        }
    };

    println!(
        "Path {} done: {} points, {} moves, plate up {} / down {}",
        args.path_id, report.path_len, report.moves_issued, report.raise_count, report.lower_count
    );
    if let Some(extrusion) = &report.extrusion {
        println!(
            "Extruded to {:.1} degrees ({:.2} per point, {} pauses)",
            extrusion.final_progress(),
            extrusion.degrees_per_point,
            extrusion.pauses
        );
    }

    if let Some(report_path) = args.report {
        let json = serde_json::to_string_pretty(&report)?;
        fs::write(&report_path, json).with_context(|| format!("Failed to write report to {:?}", report_path))?;
        info!("Report written to {}", report_path.display());
    }
    Ok(())
}

fn main() {
    let args = Args::parse();
    let level = if args.debug { log::LevelFilter::Debug } else { log::LevelFilter::Info };
    env_logger::Builder::from_default_env().filter_level(level).init();

    if let Err(e) = run(args) {
        error!("{:#}", e);
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}
