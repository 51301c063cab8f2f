/*!
# DUT Supervisor

Watches a device under test over its serial status link, cross-checks every
status line against the bench power supply and the beamline interlock, appends
a combined record to a text file, and closes the interlock when the DUT reports
errors.

## Features

- DUT status line decoding (`:<errors>:<set>:<reset>`)
- SCPI current readback from the supply powering the DUT
- Interlock readback and protective close through EPICS Channel Access
- Append-only record file plus console echo (human-readable or JSON)
- Clean shutdown on Ctrl+C with all ports and files released

## Usage

### From a configuration file
```bash
dut_supervisor --config dut_supervisor.toml
```

### With explicit ports
```bash
dut_supervisor run --dut-port /dev/ttyACM0 --instrument-port /dev/ttyUSB0 --output output_file.txt
```

### Bench run without the facility network
```bash
dut_supervisor run --simulate-interlock
```

### Generate a configuration file
```bash
dut_supervisor config --output dut_supervisor.toml
```
*/

use std::path::PathBuf;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod channel;
mod config;
mod instrument;
mod interlock;
mod sink;
mod startup;
mod supervisor;

use config::AppConfig;
use interlock::{CaToolsClient, ControlSystem, MemoryControlSystem};
use supervisor::EchoMode;

#[derive(Parser)]
#[command(name = "dut_supervisor")]
#[command(about = "Supervise a DUT over serial, cross-checked against its power supply and the beamline interlock")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Configuration file path
    #[arg(short, long, default_value = "dut_supervisor.toml")]
    config: PathBuf,

    /// Diagnostic log filter (overridden by RUST_LOG)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[derive(Subcommand)]
enum Commands {
    /// Start supervising
    Run {
        /// DUT serial port
        #[arg(long)]
        dut_port: Option<String>,

        /// Power supply serial port
        #[arg(long)]
        instrument_port: Option<String>,

        /// Record file (appended)
        #[arg(short, long)]
        output: Option<String>,

        /// Write the interlock command point on a DUT fault
        #[arg(long)]
        enable_protective_write: bool,

        /// Echo records as JSON lines
        #[arg(long, conflicts_with = "quiet")]
        json: bool,

        /// Do not echo records to the console
        #[arg(short, long)]
        quiet: bool,

        /// Use an in-process interlock (open shutter) instead of Channel Access
        #[arg(long)]
        simulate_interlock: bool,
    },

    /// Generate configuration file
    Config {
        /// Output path for configuration file
        #[arg(short, long, default_value = "dut_supervisor.toml")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Diagnostics go to stderr, the record echo stays on stdout
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cli.log_level.as_str()));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Some(Commands::Run {
            dut_port,
            instrument_port,
            output,
            enable_protective_write,
            json,
            quiet,
            simulate_interlock,
        }) => {
            let mut config = AppConfig::load_or_default(&cli.config)?;
            if let Some(port) = dut_port {
                config.dut.port = port;
            }
            if let Some(port) = instrument_port {
                config.instrument.port = port;
            }
            if let Some(output) = output {
                config.log.output_file = output;
            }
            config.interlock.protective_write_enabled |= enable_protective_write;
            if json {
                config.log.echo = EchoMode::Json;
            } else if quiet {
                config.log.echo = EchoMode::Off;
            }

            run_supervisor(config, simulate_interlock)
        }

        Some(Commands::Config { output }) => {
            // Generate configuration file
            generate_config_file(output)
        }

        None => {
            let config = AppConfig::load_from_file(&cli.config)?;
            run_supervisor(config, false)
        }
    }
}

/// Build the control-system client named by the command line
fn control_system(config: &AppConfig, simulate: bool) -> Result<Box<dyn ControlSystem>, Box<dyn std::error::Error>> {
    if simulate {
        println!("🧪 Simulated interlock (shutter open, no Channel Access)");
        let cs = MemoryControlSystem::new()
            .with_point(&config.interlock.probe_point, "0")
            .with_point(&config.interlock.monitor_point, "1")
            .with_point(&config.interlock.command_point, "1")
            .link(&config.interlock.command_point, &config.interlock.monitor_point);
        return Ok(Box::new(cs));
    }

    let client = CaToolsClient::new(config.interlock.timeout()?)?;
    Ok(Box::new(client))
}

/// Bring up all links and run the loop until Ctrl+C or DUT disconnect
fn run_supervisor(config: AppConfig, simulate_interlock: bool) -> Result<(), Box<dyn std::error::Error>> {
    println!("🚀 Starting DUT supervisor");
    println!("🔌 DUT port: {} @ {}", config.dut.port, config.dut.baud_rate);
    println!("🔌 Supply port: {} @ {}", config.instrument.port, config.instrument.baud_rate);
    println!("💾 Records: {}", config.log.output_file);

    let client = control_system(&config, simulate_interlock)?;
    let started = startup::bring_up(&config, client).map_err(|e| {
        eprintln!("Failed to start supervisor: {}", e);
        e
    })?;

    let mut supervisor = started.supervisor;

    // Set up Ctrl+C handler
    let running = supervisor.get_running_flag();
    ctrlc::set_handler(move || {
        println!("\n🛑 Received Ctrl+C, stopping supervisor...");
        running.store(false, std::sync::atomic::Ordering::SeqCst);
    })?;

    let stats = match supervisor.start(started.dut) {
        Ok(stats) => stats,
        Err(e) => {
            eprintln!("Supervisor stopped with error: {:#}", e);
            return Err(format!("Supervisor failed: {}", e).into());
        }
    };

    // Release the supply link and the record file before reporting
    drop(supervisor);
    println!(
        "📊 {} records, {} faults, {} malformed lines",
        stats.frames_logged, stats.faults_detected, stats.frames_dropped
    );
    println!("Stopping supervisor program");
    Ok(())
}

/// Generate a default configuration file
fn generate_config_file(output_path: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = AppConfig::new();
    config.save_to_file(&output_path)?;

    println!("✅ Generated configuration file: {}", output_path.display());
    println!("📝 Edit the ports and control-system points, then run:");
    println!("   dut_supervisor --config {}", output_path.display());

    Ok(())
}
