//! Prime the nozzle: run the syringe for a fixed time, then brake.

use anyhow::{Context, Result};
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::thread;
use std::time::{Duration, Instant};

use syringe_plotter::actuator::Axis;
use syringe_plotter::config_loader::load_run_settings;
use syringe_plotter::controller_link::open_port;
use syringe_plotter::sync::StopSignal;

const STOP_POLL: Duration = Duration::from_millis(100);

/// Push material through the syringe before a run
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Dry run against a simulated controller
    #[arg(long, default_value_t = false)]
    simulate: bool,
    /// Override PRIME_SPEED
    #[arg(long)]
    speed: Option<f64>,
    /// Override PRIME_SECONDS
    #[arg(long)]
    seconds: Option<u64>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    debug: bool,
}

fn run(args: Args) -> Result<()> {
    let settings = load_run_settings(args.config.as_deref(), args.simulate)?;
    let speed = args.speed.unwrap_or(settings.prime_speed);
    let duration = Duration::from_secs(args.seconds.unwrap_or(settings.prime_seconds));

    let stop = StopSignal::new();
    {
        let stop = stop.clone();
        ctrlc::set_handler(move || stop.request()).context("Failed to install Ctrl-C handler")?;
    }

    let port = open_port(&settings, args.simulate)?;
    info!("Priming syringe at {} deg/s for {}s", speed, duration.as_secs());
    port.run_speed(Axis::Syringe, speed).context("Failed to start syringe")?;

    let started = Instant::now();
    while started.elapsed() < duration {
        if stop.is_requested() {
            warn!("Priming stopped early after {:.1}s", started.elapsed().as_secs_f64());
            break;
        }
        thread::sleep(STOP_POLL.min(duration.saturating_sub(started.elapsed())));
    }

    port.brake(Axis::Syringe).context("Failed to brake syringe")?;
    println!("Syringe primed");
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
