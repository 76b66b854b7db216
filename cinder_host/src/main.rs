use std::env;
use std::sync::Arc;

use cinder_host::gcode::source::CommandSource;
use cinder_host::hardware::NullPins;
use cinder_host::{ExitAction, Machine};
use cinder_shared::clock::MonotonicClock;
use cinder_shared::config;

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args: Vec<String> = env::args().collect();
    let config_path = args.get(1).map(String::as_str).unwrap_or("cinder.toml");
    let gcode_file = args.get(2);

    let config = match config::load_config(config_path) {
        Ok(config) => config,
        Err(config::ConfigError::Io(err)) if err.kind() == std::io::ErrorKind::NotFound => {
            tracing::warn!(config_path, "no config file; using built-in defaults");
            config::Config::default()
        }
        Err(err) => {
            tracing::error!(config_path, %err, "failed to load config");
            return Err(Box::new(err));
        }
    };

    tracing::info!(
        "Cinder starting: {} machine{}",
        match config.printer.kinematics {
            config::MachineKind::Cartesian => "cartesian",
            config::MachineKind::Delta => "linear delta",
        },
        config
            .printer
            .printer_name
            .as_deref()
            .map(|n| format!(" ({n})"))
            .unwrap_or_default()
    );

    let root = match gcode_file {
        Some(path) => {
            tracing::info!(%path, "reading G-code from file");
            CommandSource::from_file(path)?
        }
        None => CommandSource::stdin(),
    };

    // platform pin drivers plug in here; without one, outputs are traced
    let bus = Arc::new(NullPins);
    let clock = Arc::new(MonotonicClock::new());
    let mut machine = Machine::new(&config, bus, clock, root);

    let teardown = machine.teardown_guard();
    let dispatch = machine.spawn_dispatch();

    let exit = machine.state.run();

    match exit {
        ExitAction::Clean => machine.scheduler.stop(),
        ExitAction::Emergency => machine.scheduler.abort(),
    }
    if dispatch.join().is_err() {
        tracing::error!("dispatch thread panicked");
    }
    teardown.run();

    match exit {
        ExitAction::Clean => {
            tracing::info!("clean shutdown");
            Ok(())
        }
        ExitAction::Emergency => {
            tracing::error!("emergency stop; exiting nonzero");
            std::process::exit(1);
        }
    }
}
