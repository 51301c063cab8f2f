/*!
# Shared Types and Utilities

This crate contains the protocol types shared by the DUT supervisor: the DUT
status line decoder, interlock states, the combined log record and the error
taxonomy. Nothing here performs I/O.

## Core Types

- [`StatusFrame`] - decoded `:<errors>:<set>:<reset>` status line
- [`Decision`] - idle or protective action for a frame
- [`InterlockState`] - shutter/interlock readback
- [`LogRecord`] - one appended log line

## Modules

- [`status`] - DUT status line decoding
- [`interlock`] - interlock state parsing
- [`record`] - log record composition and parsing
- [`error`] - Common error types
*/

pub mod status;
pub mod interlock;
pub mod record;
pub mod error;

// Re-export commonly used types
pub use status::{StatusFrame, Decision, DecodeError};
pub use interlock::InterlockState;
pub use record::LogRecord;
pub use error::{SharedError, InstrumentError, InterlockError, Result};

/// Version information for the shared library
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Protocol constants
pub mod protocol {
    /// Field separator of the DUT status line
    pub const FRAME_DELIMITER: char = ':';

    /// Tokens produced by splitting a well-formed status line (leading empty token + 3 fields)
    pub const FRAME_TOKEN_COUNT: usize = 4;

    /// Line terminator for SCPI commands
    pub const SCPI_TERMINATOR: &str = "\n";

    /// Identity query issued once at startup
    pub const SCPI_IDENTIFY: &str = "*IDN?";

    /// Voltage query, issued before every current query
    pub const SCPI_MEASURE_VOLTAGE: &str = "MEAS:VOLT?";

    /// Current query
    pub const SCPI_MEASURE_CURRENT: &str = "MEAS:CURR?";

    /// Channel select command; the instrument numbers channels from 1
    pub fn scpi_select_channel(channel: usize) -> String {
        format!("INST:NSEL {}", channel + 1)
    }
}
