/*!
Common error types for the DUT supervisor components.
*/

use std::time::Duration;
use thiserror::Error;

pub use crate::status::DecodeError;

/// Common result type used throughout the shared library
pub type Result<T> = std::result::Result<T, SharedError>;

/// Failures of a request/response exchange with the power meter
#[derive(Error, Debug)]
pub enum InstrumentError {
    /// No complete response line arrived within the channel timeout
    #[error("Timeout waiting for response to {command:?}")]
    Timeout { command: String },

    /// The response line could not be parsed as a number
    #[error("Bad response to {command:?}: {response:?}")]
    BadResponse { command: String, response: String },

    /// The underlying channel failed
    #[error("Instrument I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl InstrumentError {
    pub fn timeout(command: impl Into<String>) -> Self {
        Self::Timeout {
            command: command.into().trim_end().to_string(),
        }
    }

    pub fn bad_response(command: impl Into<String>, response: impl Into<String>) -> Self {
        Self::BadResponse {
            command: command.into().trim_end().to_string(),
            response: response.into(),
        }
    }
}

/// Failures talking to the facility control system
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterlockError {
    /// The point could not be reached (network, gateway or tool failure)
    #[error("Control system point {point} unavailable: {reason}")]
    Unavailable { point: String, reason: String },

    /// The request did not complete in time
    #[error("Control system request for {point} timed out after {timeout:?}")]
    Timeout { point: String, timeout: Duration },

    /// The point returned something that is not an interlock state
    #[error("Unexpected interlock value: {0:?}")]
    BadValue(String),
}

impl InterlockError {
    pub fn unavailable(point: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Unavailable {
            point: point.into(),
            reason: reason.into(),
        }
    }
}

/// Comprehensive error type for all shared operations
#[derive(Error, Debug)]
pub enum SharedError {
    /// DUT status line errors
    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    /// Power meter errors
    #[error("Instrument error: {0}")]
    Instrument(#[from] InstrumentError),

    /// Control system errors
    #[error("Interlock error: {0}")]
    Interlock(#[from] InterlockError),

    /// I/O errors (log file, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A log line that does not match the record format
    #[error("Invalid log record: {0}")]
    InvalidRecord(String),
}

impl SharedError {
    /// Create a new invalid record error
    pub fn invalid_record(msg: impl Into<String>) -> Self {
        Self::InvalidRecord(msg.into())
    }
}
