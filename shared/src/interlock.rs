/*!
Interlock (beamline shutter) state as read back from the control system.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::InterlockError;

/// State of the safety interlock gating exposure of the DUT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum InterlockState {
    Open,
    Closed,
    /// The monitor point could not be read this iteration
    Unknown,
}

impl InterlockState {
    /// Map the boolean monitor reading, true meaning open
    pub fn from_monitor(open: bool) -> Self {
        if open {
            Self::Open
        } else {
            Self::Closed
        }
    }

    /// Parse a monitor point value.
    ///
    /// Numeric values follow truthiness (non-zero is open). The enum strings
    /// `OPEN` and `CLOSED` are accepted in any case.
    pub fn from_point_value(value: &str) -> Result<Self, InterlockError> {
        let trimmed = value.trim();

        if let Ok(number) = trimmed.parse::<f64>() {
            if number.is_nan() {
                return Err(InterlockError::BadValue(trimmed.to_string()));
            }
            return Ok(Self::from_monitor(number != 0.0));
        }

        match trimmed.to_ascii_uppercase().as_str() {
            "OPEN" => Ok(Self::Open),
            "CLOSED" => Ok(Self::Closed),
            _ => Err(InterlockError::BadValue(trimmed.to_string())),
        }
    }

    /// Token used in log lines
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Open => "OPEN",
            Self::Closed => "CLOSED",
            Self::Unknown => "UNKNOWN",
        }
    }

    pub fn is_known(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl fmt::Display for InterlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InterlockState {
    type Err = InterlockError;

    /// Inverse of [`InterlockState::as_str`]
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(Self::Open),
            "CLOSED" => Ok(Self::Closed),
            "UNKNOWN" => Ok(Self::Unknown),
            other => Err(InterlockError::BadValue(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_numeric_monitor_values() {
        assert_eq!(InterlockState::from_point_value("1").unwrap(), InterlockState::Open);
        assert_eq!(InterlockState::from_point_value("0").unwrap(), InterlockState::Closed);
        assert_eq!(InterlockState::from_point_value(" 1.0\n").unwrap(), InterlockState::Open);
        assert_eq!(InterlockState::from_point_value("0.000").unwrap(), InterlockState::Closed);
    }

    #[test]
    fn test_enum_monitor_values() {
        assert_eq!(InterlockState::from_point_value("Open").unwrap(), InterlockState::Open);
        assert_eq!(InterlockState::from_point_value("CLOSED").unwrap(), InterlockState::Closed);
    }

    #[test]
    fn test_bad_monitor_values() {
        assert!(InterlockState::from_point_value("").is_err());
        assert!(InterlockState::from_point_value("ajar").is_err());
        assert!(InterlockState::from_point_value("NaN").is_err());
    }

    #[test]
    fn test_token_roundtrip() {
        for state in [InterlockState::Open, InterlockState::Closed, InterlockState::Unknown] {
            assert_eq!(state.as_str().parse::<InterlockState>().unwrap(), state);
        }
        assert!(!InterlockState::Unknown.is_known());
    }
}
