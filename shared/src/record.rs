/*!
Log records: one line per decoded DUT frame.

```text
Mon Aug 19 15:52:18 2024: Errs: 0, Set: 0, Reset: 0, Current (A): 0.5 shutter is:OPEN
```

The timestamp is taken once, when the frame arrives, before the power meter
and interlock are read.
*/

use chrono::{Local, NaiveDateTime, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{Result, SharedError};
use crate::interlock::InterlockState;
use crate::status::{Decision, StatusFrame};

/// asctime-style timestamp, e.g. `Mon Aug 19 15:52:18 2024`
pub const TIMESTAMP_FORMAT: &str = "%a %b %e %H:%M:%S %Y";

/// Rendered in place of the current when the power meter could not be read
pub const CURRENT_UNAVAILABLE: &str = "unavailable";

const RECORD_PATTERN: &str = r"^(?P<ts>.+?): Errs: (?P<errs>-?\d+), Set: (?P<set>-?\d+), Reset: (?P<reset>-?\d+), Current \(A\): (?P<current>\S+) shutter is:(?P<shutter>[A-Z]+)$";

static RECORD_REGEX: Lazy<std::result::Result<Regex, regex::Error>> =
    Lazy::new(|| Regex::new(RECORD_PATTERN));

/// Combined status of one frame, as appended to the log file
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    pub timestamp: NaiveDateTime,
    pub frame: StatusFrame,
    /// Supply current in amperes, `None` when the reading failed
    pub current: Option<f64>,
    pub interlock: InterlockState,
}

impl LogRecord {
    pub fn new(
        timestamp: NaiveDateTime,
        frame: StatusFrame,
        current: Option<f64>,
        interlock: InterlockState,
    ) -> Self {
        Self {
            timestamp,
            frame,
            current,
            interlock,
        }
    }

    /// Local wall-clock time, truncated to the second as the log format shows it
    pub fn now() -> NaiveDateTime {
        let now = Local::now().naive_local();
        now.with_nanosecond(0).unwrap_or(now)
    }

    pub fn decision(&self) -> Decision {
        self.frame.decision()
    }

    pub fn timestamp_string(&self) -> String {
        self.timestamp.format(TIMESTAMP_FORMAT).to_string()
    }

    /// `Current (A): <value> shutter is:<state>` part of the line, also used
    /// for the console echo
    pub fn reading_summary(&self) -> String {
        let current = match self.current {
            Some(amps) => format!("{:?}", amps),
            None => CURRENT_UNAVAILABLE.to_string(),
        };
        format!("Current (A): {} shutter is:{}", current, self.interlock)
    }

    /// Full log line without the trailing newline
    pub fn to_line(&self) -> String {
        format!(
            "{}: {}, {}",
            self.timestamp_string(),
            self.frame,
            self.reading_summary()
        )
    }

    /// Companion line recorded when a frame triggers the protective action
    pub fn intent_line(&self) -> String {
        format!("{}: Error detected. Closing shutter", self.timestamp_string())
    }

    /// Parse a line produced by [`LogRecord::to_line`]
    pub fn parse_line(line: &str) -> Result<Self> {
        let re = RECORD_REGEX
            .as_ref()
            .map_err(|e| SharedError::invalid_record(format!("record pattern: {}", e)))?;

        let line = line.trim_end_matches(['\r', '\n']);
        let caps = re
            .captures(line)
            .ok_or_else(|| SharedError::invalid_record(line.to_string()))?;

        let timestamp = NaiveDateTime::parse_from_str(&caps["ts"], TIMESTAMP_FORMAT)
            .map_err(|e| SharedError::invalid_record(format!("timestamp {:?}: {}", &caps["ts"], e)))?;

        let int = |name: &str| -> Result<i64> {
            caps[name]
                .parse::<i64>()
                .map_err(|_| SharedError::invalid_record(format!("{} field: {:?}", name, &caps[name])))
        };
        let frame = StatusFrame::new(int("errs")?, int("set")?, int("reset")?);

        let current = match &caps["current"] {
            CURRENT_UNAVAILABLE => None,
            value => Some(
                value
                    .parse::<f64>()
                    .map_err(|_| SharedError::invalid_record(format!("current: {:?}", value)))?,
            ),
        };

        let interlock = caps["shutter"].parse::<InterlockState>()?;

        Ok(Self::new(timestamp, frame, current, interlock))
    }

    /// One-line JSON rendering for machine consumers of the console echo
    pub fn to_json(&self) -> Result<String> {
        let value = serde_json::json!({
            "timestamp": self.timestamp_string(),
            "error_bits": self.frame.error_bits,
            "set_bits": self.frame.set_bits,
            "reset_bits": self.frame.reset_bits,
            "current_a": self.current,
            "shutter": self.interlock.as_str(),
            "decision": self.decision(),
        });
        Ok(serde_json::to_string(&value)?)
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_line())
    }
}
