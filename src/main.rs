// src/main.rs
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use tokio::io::AsyncBufReadExt;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::prelude::*;
use tracing_subscriber::reload;

use motiond::com::HostChannel;
use motiond::config;
use motiond::hardware::SimBackend;
use motiond::motion::AXIS_COUNT;
use motiond::printer::Printer;
use motiond::scheduler::SystemClock;

#[tokio::main]
async fn main() -> ExitCode {
    // M111 retunes the level at runtime through the reload handle
    let (filter, reload_handle) = reload::Layer::new(LevelFilter::INFO);
    tracing_subscriber::registry().with(filter).with(tracing_subscriber::fmt::layer()).init();

    tracing::info!("starting motiond {}", env!("CARGO_PKG_VERSION"));

    let args: Vec<String> = std::env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("printer.toml");
    tracing::info!("loading configuration from {}", config_path);
    let config = match config::load_config(config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("failed to load config '{}': {}", config_path, e);
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        "printer: {} ({}), max velocity {} mm/s, max accel {} mm/s^2",
        config.printer.printer_name.as_deref().unwrap_or("unnamed"),
        config.printer.geometry,
        config.printer.max_velocity,
        config.printer.max_accel
    );

    // feed host lines from stdin into the polled channel
    let (host_tx, host_rx) = tokio::sync::mpsc::unbounded_channel();
    tokio::spawn(async move {
        let mut lines = tokio::io::BufReader::new(tokio::io::stdin()).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if host_tx.send(line).is_err() {
                break;
            }
        }
    });
    let host = HostChannel::new(host_rx, Box::new(std::io::stdout()));

    // Simulated machine: endstop switches sit a full envelope of travel out
    // in each axis's homing direction. Swap SimBackend for a GPIO backend
    // to drive real hardware.
    let backend = SimBackend::new();
    let mut endstops: [Option<Arc<AtomicBool>>; AXIS_COUNT] = Default::default();
    let steppers = match config.axis_steppers() {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("bad stepper configuration: {}", e);
            return ExitCode::FAILURE;
        }
    };
    let default_dir: i32 = if config.printer.geometry == "linear_delta" { 1 } else { -1 };
    for (axis, stepper) in steppers.iter().enumerate().take(3) {
        if stepper.endstop_pin.is_some() {
            let dir = stepper.home_dir.map(|d| d as i32).unwrap_or(default_dir);
            let travel = (300.0 * stepper.steps_per_mm) as i64;
            endstops[axis] = Some(backend.add_endstop(axis, dir, travel));
        }
    }

    let mut printer = match Printer::new(&config, backend, SystemClock::new(), host, endstops) {
        Ok(p) => p,
        Err(e) => {
            tracing::error!("failed to initialize printer: {}", e);
            return ExitCode::FAILURE;
        }
    };
    printer.controller_mut().set_log_hook(Box::new(move |level| {
        let _ = reload_handle.modify(|f| *f = level);
    }));
    if let Some(gcode_path) = args.get(2) {
        if let Err(e) = printer.controller_mut().print_file(gcode_path) {
            tracing::error!("cannot open gcode file '{}': {}", gcode_path, e);
            return ExitCode::FAILURE;
        }
    }

    // the control loop owns its thread; tokio keeps the host reader and
    // the ctrl-c watcher alive around it
    let control = tokio::task::spawn_blocking(move || printer.run());
    let code = tokio::select! {
        joined = control => joined.unwrap_or(1),
        _ = tokio::signal::ctrl_c() => {
            tracing::error!("interrupted; emergency stop");
            1
        }
    };
    ExitCode::from(code as u8)
}
