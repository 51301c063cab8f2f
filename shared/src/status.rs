/*!
DUT status frame decoding.

The DUT test firmware prints one status line per test cycle:

```text
:<error bits>:<set bits>:<reset bits>
```

A clean cycle reports `:0:0:0`. The leading colon is part of the protocol, so
splitting a well-formed line on `:` always yields an empty first token followed
by the three counters.
*/

use serde::{Deserialize, Serialize};
use std::fmt;
use std::num::IntErrorKind;
use thiserror::Error;

use crate::protocol::{FRAME_DELIMITER, FRAME_TOKEN_COUNT};

/// Errors that can occur while decoding a DUT status line
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Malformed status frame: expected {expected} tokens, got {found}")]
    TokenCount { expected: usize, found: usize },

    #[error("Malformed status frame: field {index} is not an integer: {value:?}")]
    NotAnInteger { index: usize, value: String },
}

/// One decoded status line from the DUT
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusFrame {
    /// Total bits currently in error
    pub error_bits: i64,
    /// Bits set which should be reset
    pub set_bits: i64,
    /// Bits reset which should be set
    pub reset_bits: i64,
}

impl StatusFrame {
    pub fn new(error_bits: i64, set_bits: i64, reset_bits: i64) -> Self {
        Self {
            error_bits,
            set_bits,
            reset_bits,
        }
    }

    /// Decode a raw status line.
    ///
    /// Surrounding whitespace (including the line terminator, and padding
    /// around each field) is ignored. Any integer is accepted in each field; no
    /// bit-width or sign checks are made. Integers beyond the 64-bit range
    /// saturate, so an oversized error count still reads as a fault.
    pub fn decode(line: &str) -> Result<Self, DecodeError> {
        let tokens: Vec<&str> = line.trim().split(FRAME_DELIMITER).collect();
        if tokens.len() != FRAME_TOKEN_COUNT {
            return Err(DecodeError::TokenCount {
                expected: FRAME_TOKEN_COUNT,
                found: tokens.len(),
            });
        }

        let field = |index: usize| -> Result<i64, DecodeError> {
            match tokens[index].trim().parse::<i64>() {
                Ok(value) => Ok(value),
                Err(e) => match e.kind() {
                    IntErrorKind::PosOverflow => Ok(i64::MAX),
                    IntErrorKind::NegOverflow => Ok(i64::MIN),
                    _ => Err(DecodeError::NotAnInteger {
                        index,
                        value: tokens[index].to_string(),
                    }),
                },
            }
        };

        Ok(Self {
            error_bits: field(1)?,
            set_bits: field(2)?,
            reset_bits: field(3)?,
        })
    }

    /// Encode back to the wire form, e.g. `:3:1:2`
    pub fn to_wire(&self) -> String {
        format!(
            "{d}{}{d}{}{d}{}",
            self.error_bits,
            self.set_bits,
            self.reset_bits,
            d = FRAME_DELIMITER
        )
    }

    /// A frame reporting any error bits is a fault
    pub fn is_fault(&self) -> bool {
        self.error_bits != 0
    }

    /// Classify what the supervisor should do with this frame
    pub fn decision(&self) -> Decision {
        if self.is_fault() {
            Decision::ProtectiveAction
        } else {
            Decision::Idle
        }
    }
}

impl fmt::Display for StatusFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Errs: {}, Set: {}, Reset: {}",
            self.error_bits, self.set_bits, self.reset_bits
        )
    }
}

/// Outcome of the supervisor's decision step for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Healthy frame, nothing to do
    Idle,
    /// DUT reported errors, request the interlock closed
    ProtectiveAction,
}

impl Decision {
    pub fn is_protective(self) -> bool {
        matches!(self, Self::ProtectiveAction)
    }
}
