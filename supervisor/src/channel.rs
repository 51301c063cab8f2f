/*!
Line-oriented duplex channels.

Both the DUT and the power meter talk newline-terminated ASCII over a serial
port. The supervisor only needs "read one line, with a timeout" and "write one
line", so everything above this module works against [`LineChannel`].
*/

use std::io::{self, Read, Write};
use std::time::{Duration, Instant};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};
use tracing::{debug, info, warn};

/// A duplex channel carrying newline-terminated text lines
pub trait LineChannel: Send {
    /// Read one complete line, without its terminator.
    ///
    /// Returns `Ok(None)` when the read timeout expires before a full line
    /// arrives. A closed channel is reported as `ErrorKind::UnexpectedEof`.
    fn read_line(&mut self) -> io::Result<Option<String>>;

    /// Write `line` (which must already carry its terminator) and flush
    fn write_line(&mut self, line: &str) -> io::Result<()>;

    /// Drop any buffered, not yet consumed input
    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<C: LineChannel + ?Sized> LineChannel for Box<C> {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        (**self).read_line()
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        (**self).write_line(line)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        (**self).clear_input()
    }
}

/// Serial port settings for one link (always 8N1, no flow control)
#[derive(Debug, Clone)]
pub struct SerialSettings {
    pub port: String,
    pub baud_rate: u32,
    pub timeout: Duration,
}

/// Longest run of bytes held without a line terminator before it is handed up
/// as a line of its own
pub const MAX_LINE_BYTES: usize = 4096;

/// Splits a byte stream into text lines.
///
/// `\n`, `\r` and `\r\n` all end a line. Blank lines are skipped.
#[derive(Debug, Default)]
struct LineFramer {
    /// Bytes received after the last complete line
    pending: Vec<u8>,
}

impl LineFramer {
    fn push(&mut self, bytes: &[u8]) {
        self.pending.extend_from_slice(bytes);
    }

    fn clear(&mut self) {
        self.pending.clear();
    }

    /// Take one complete line out of the pending buffer, if there is one
    fn take_line(&mut self) -> Option<String> {
        loop {
            let end = self.pending.iter().position(|&b| b == b'\n' || b == b'\r')?;
            let raw: Vec<u8> = self.pending.drain(..=end).collect();
            if end > 0 {
                return Some(String::from_utf8_lossy(&raw[..end]).into_owned());
            }
        }
    }

    /// Hand up an unterminated run once it reaches [`MAX_LINE_BYTES`]
    fn take_overflow(&mut self) -> Option<String> {
        if self.pending.len() < MAX_LINE_BYTES {
            return None;
        }
        let raw: Vec<u8> = self.pending.drain(..).collect();
        Some(String::from_utf8_lossy(&raw).into_owned())
    }
}

/// Read from `source` until `framer` holds a line or `timeout` has elapsed.
///
/// The deadline covers the whole call, so a peer streaming bytes without a
/// terminator still returns control to the caller once per timeout.
fn read_framed_line<R: Read + ?Sized>(
    source: &mut R,
    framer: &mut LineFramer,
    timeout: Duration,
    name: &str,
) -> io::Result<Option<String>> {
    if let Some(line) = framer.take_line() {
        return Ok(Some(line));
    }

    let deadline = Instant::now() + timeout;
    let mut buffer = [0u8; 256];
    loop {
        match source.read(&mut buffer) {
            Ok(0) => {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("serial port {} closed", name),
                ));
            }
            Ok(n) => {
                framer.push(&buffer[..n]);
                if let Some(line) = framer.take_line() {
                    debug!("[{}] <- {}", name, line);
                    return Ok(Some(line));
                }
                if let Some(line) = framer.take_overflow() {
                    warn!("[{}] {} bytes without a line terminator, passing them on", name, line.len());
                    return Ok(Some(line));
                }
                // A partial line stays pending for the next call
                if Instant::now() >= deadline {
                    return Ok(None);
                }
            }
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// [`LineChannel`] over a serial port
pub struct SerialLineChannel {
    name: String,
    port: Box<dyn SerialPort>,
    timeout: Duration,
    framer: LineFramer,
}

impl SerialLineChannel {
    /// Open the port described by `settings`
    pub fn open(settings: &SerialSettings) -> serialport::Result<Self> {
        let port = serialport::new(&settings.port, settings.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(settings.timeout)
            .open()?;

        info!(
            "🔌 Opened serial port {} at {} baud (timeout {:?})",
            settings.port, settings.baud_rate, settings.timeout
        );

        Ok(Self {
            name: settings.port.clone(),
            port,
            timeout: settings.timeout,
            framer: LineFramer::default(),
        })
    }
}

impl LineChannel for SerialLineChannel {
    fn read_line(&mut self) -> io::Result<Option<String>> {
        read_framed_line(&mut self.port, &mut self.framer, self.timeout, &self.name)
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        self.port.write_all(line.as_bytes())?;
        self.port.flush()?;
        debug!("[{}] -> {}", self.name, line.trim_end());
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.framer.clear();
        self.port
            .clear(ClearBuffer::Input)
            .map_err(io::Error::from)
    }
}

impl Drop for SerialLineChannel {
    fn drop(&mut self) {
        info!("🔌 Closed serial port {}", self.name);
    }
}

/// In-memory channels for exercising the supervisor without hardware
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};

    /// Plays back a fixed script of reads and records everything written.
    /// `None` entries simulate a read timeout; an exhausted script reports EOF.
    pub struct ScriptedChannel {
        script: VecDeque<Option<String>>,
        pub written: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedChannel {
        pub fn new<I, S>(lines: I) -> Self
        where
            I: IntoIterator<Item = Option<S>>,
            S: Into<String>,
        {
            Self {
                script: lines.into_iter().map(|l| l.map(Into::into)).collect(),
                written: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn lines<I, S>(lines: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self::new(lines.into_iter().map(Some))
        }
    }

    impl LineChannel for ScriptedChannel {
        fn read_line(&mut self) -> io::Result<Option<String>> {
            match self.script.pop_front() {
                Some(entry) => Ok(entry),
                None => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "script exhausted")),
            }
        }

        fn write_line(&mut self, line: &str) -> io::Result<()> {
            self.written.lock().unwrap().push(line.to_string());
            Ok(())
        }
    }

    /// Answers SCPI queries from a table; commands without `?` get no reply.
    /// Unknown queries and queries listed in `silent` produce a timeout.
    pub struct ScpiResponder {
        responses: HashMap<String, String>,
        silent: Vec<String>,
        outbox: VecDeque<String>,
        pub log: Arc<Mutex<Vec<String>>>,
        pub clears: Arc<Mutex<usize>>,
    }

    impl ScpiResponder {
        pub fn new() -> Self {
            Self {
                responses: HashMap::new(),
                silent: Vec::new(),
                outbox: VecDeque::new(),
                log: Arc::new(Mutex::new(Vec::new())),
                clears: Arc::new(Mutex::new(0)),
            }
        }

        /// A power supply reporting constant voltage and current on every channel
        pub fn supply(volts: f64, amps: f64) -> Self {
            Self::new()
                .respond("*IDN?", "KEITHLEY INSTRUMENTS,MODEL 2230-30-1,9000000,1.02")
                .respond("MEAS:VOLT?", &format!("{}", volts))
                .respond("MEAS:CURR?", &format!("{}", amps))
        }

        pub fn respond(mut self, query: &str, reply: &str) -> Self {
            self.responses.insert(query.to_string(), reply.to_string());
            self
        }

        pub fn silence(mut self, query: &str) -> Self {
            self.silent.push(query.to_string());
            self
        }

        /// Queue a reply that is not tied to any query (a late, stale answer)
        pub fn stale(mut self, reply: &str) -> Self {
            self.outbox.push_back(reply.to_string());
            self
        }
    }

    impl LineChannel for ScpiResponder {
        fn read_line(&mut self) -> io::Result<Option<String>> {
            Ok(self.outbox.pop_front())
        }

        fn write_line(&mut self, line: &str) -> io::Result<()> {
            let command = line.trim_end().to_string();
            self.log.lock().unwrap().push(command.clone());
            if command.ends_with('?') && !self.silent.contains(&command) {
                if let Some(reply) = self.responses.get(&command) {
                    self.outbox.push_back(reply.clone());
                }
            }
            Ok(())
        }

        fn clear_input(&mut self) -> io::Result<()> {
            self.outbox.clear();
            *self.clears.lock().unwrap() += 1;
            Ok(())
        }
    }
}
