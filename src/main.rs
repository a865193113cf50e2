//! Reference binary: parses a `clap`-derived CLI, loads
//! a `MachineConfig` from TOML, builds a `System`, and either runs it
//! headless or hands CPU 0 to the terminal debugger, with the
//! config/logging/CLI layer a multi-CPU machine actually needs.

use clap::Parser;
use ev68core::config::MachineConfig;
use ev68core::debugger::Debugger;
use ev68core::devices::Signal;
use ev68core::System;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "ev68mon", about = "Reference monitor for the ev68core emulator")]
struct Cli {
    /// Path to a TOML machine configuration file.
    #[arg(long)]
    config: PathBuf,

    /// Physical address CPU 0 starts execution at.
    #[arg(long, default_value_t = 0x8000_0000)]
    entry: u64,

    /// Drop into the terminal debugger instead of running headless.
    #[arg(long)]
    debug: bool,

    /// Load machine state from this save file before starting.
    #[arg(long)]
    restore: Option<PathBuf>,
}

fn main() {
    env_logger::init();
    let cli = Cli::parse();

    let config = match MachineConfig::load(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            log::error!("failed to load configuration: {err}");
            std::process::exit(1);
        }
    };

    let mut system = match System::new(config) {
        Ok(system) => system,
        Err(err) => {
            log::error!("failed to build machine: {err}");
            std::process::exit(1);
        }
    };

    if let Some(path) = &cli.restore {
        match std::fs::File::open(path) {
            Ok(mut file) => {
                if let Err(err) = system.restore(&mut file) {
                    log::error!("failed to restore save file {}: {err}", path.display());
                    std::process::exit(1);
                }
            }
            Err(err) => {
                log::error!("failed to open save file {}: {err}", path.display());
                std::process::exit(1);
            }
        }
    } else {
        system.boot(cli.entry);
    }

    if cli.debug {
        let mut debugger = Debugger::new();
        system.run_under_debugger(|cpu, fabric| {
            let signal = debugger.update(cpu, fabric);
            if signal == Signal::Ok {
                cpu.tick(fabric);
            }
            signal
        });
    } else {
        system.run();
        loop {
            std::thread::sleep(std::time::Duration::from_millis(100));
            if system.any_worker_died() {
                log::error!("a CPU worker terminated unexpectedly");
                let _ = system.shutdown();
                std::process::exit(1);
            }
        }
    }
}
