/*!
Startup preconditions.

The supervisor only enters its loop once the control system has answered, the
record file is open, both serial links are open and the power supply has
identified itself. Any failure here is fatal.
*/

use shared::error::{InstrumentError, InterlockError};
use shared::InterlockState;
use thiserror::Error;
use tracing::info;

use crate::channel::{LineChannel, SerialLineChannel};
use crate::config::AppConfig;
use crate::instrument::InstrumentClient;
use crate::interlock::{ControlSystem, InterlockGateway};
use crate::sink::FileSink;
use crate::supervisor::Supervisor;

/// Why the supervisor could not start
#[derive(Error, Debug)]
pub enum StartupError {
    #[error("Control system unreachable (probe point {point}): {source}")]
    ControlSystem {
        point: String,
        #[source]
        source: InterlockError,
    },

    #[error("Cannot read interlock monitor {point}: {source}")]
    InterlockMonitor {
        point: String,
        #[source]
        source: InterlockError,
    },

    #[error("Cannot open record file {path}: {source}")]
    RecordFile {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot open {role} serial port {port}: {source}")]
    SerialPort {
        role: &'static str,
        port: String,
        #[source]
        source: serialport::Error,
    },

    #[error("Power supply did not identify itself: {0}")]
    Identity(#[source] InstrumentError),
}

/// Verify the control system and read the interlock once.
///
/// Returns the probe value and the current interlock state.
pub fn check_control_system<S: ControlSystem>(
    gateway: &mut InterlockGateway<S>,
    probe_point: &str,
) -> Result<(String, InterlockState), StartupError> {
    let probe = gateway
        .probe(probe_point)
        .map_err(|source| StartupError::ControlSystem {
            point: probe_point.to_string(),
            source,
        })?;

    let state = gateway
        .try_read_monitor()
        .map_err(|source| StartupError::InterlockMonitor {
            point: gateway.monitor_point().to_string(),
            source,
        })?;

    Ok((probe, state))
}

/// Query `*IDN?` on a freshly opened instrument link
pub fn identify_instrument<C: LineChannel>(
    instrument: &mut InstrumentClient<C>,
) -> Result<String, StartupError> {
    instrument.identify().map_err(StartupError::Identity)
}

/// Everything the loop needs, opened and checked
pub struct Started<S: ControlSystem> {
    pub supervisor: Supervisor<SerialLineChannel, S, FileSink>,
    pub dut: SerialLineChannel,
}

/// Run the full startup sequence against real serial ports
pub fn bring_up<S: ControlSystem>(
    config: &AppConfig,
    control_system: S,
) -> Result<Started<S>, StartupError> {
    let mut gateway = InterlockGateway::new(
        control_system,
        config.interlock.monitor_point.clone(),
        config.interlock.command_point.clone(),
        config.interlock.closed_value.clone(),
        config.interlock.protective_write_enabled,
    );

    let (probe, state) = check_control_system(&mut gateway, &config.interlock.probe_point)?;
    println!("Control system probe {}: {}", config.interlock.probe_point, probe);
    println!("Interlock is: {}", state);

    let sink = FileSink::open(&config.log.output_file).map_err(|source| StartupError::RecordFile {
        path: config.log.output_file.clone(),
        source,
    })?;

    let dut_settings = config.dut.serial_settings();
    let dut = SerialLineChannel::open(&dut_settings).map_err(|source| StartupError::SerialPort {
        role: "DUT",
        port: dut_settings.port.clone(),
        source,
    })?;

    let instrument_settings = config.instrument.serial_settings();
    let instrument_link =
        SerialLineChannel::open(&instrument_settings).map_err(|source| StartupError::SerialPort {
            role: "instrument",
            port: instrument_settings.port.clone(),
            source,
        })?;

    let mut instrument = InstrumentClient::new(instrument_link);
    let identity = identify_instrument(&mut instrument)?;
    println!("Instrument is: {}", identity);
    info!("Power supply identified as {:?}", identity);

    if !gateway.protective_write_enabled() {
        info!("Protective writes disabled, faults will be logged only");
    }

    let supervisor = Supervisor::new(instrument, gateway, sink, config.instrument.channel)
        .with_queue_capacity(config.log.frame_queue_capacity)
        .with_echo(config.log.echo);

    Ok(Started { supervisor, dut })
}
