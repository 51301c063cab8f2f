/*!
Supervisory monitoring loop.

Two threads, one job each:
1. DUT reader thread: owns the DUT link, stamps each arriving line with the
   local time and queues it
2. Decision loop: decodes the line, reads the interlock and the supply current,
   appends the record, and escalates faults to the protective action

Readings are only taken once a line has been dequeued, so they are always
newer than the frame they are logged with.
*/

use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use anyhow::{anyhow, Result};
use chrono::NaiveDateTime;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use serde::{Deserialize, Serialize};
use shared::{Decision, InterlockState, LogRecord, StatusFrame};
use tracing::{debug, error, info, warn};

use crate::channel::LineChannel;
use crate::instrument::InstrumentClient;
use crate::interlock::{ControlSystem, InterlockGateway};
use crate::sink::RecordSink;

/// How often blocked waits re-check the running flag
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A raw DUT line and the local time it arrived
type QueuedLine = (NaiveDateTime, String);

/// Counters reported at shutdown
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorStats {
    pub frames_logged: u64,
    /// Malformed lines dropped without a record
    pub frames_dropped: u64,
    pub faults_detected: u64,
    pub protective_writes: u64,
    pub protective_write_errors: u64,
    pub instrument_errors: u64,
    pub interlock_degraded: u64,
    pub sink_errors: u64,
    /// Lines still queued when shutdown was requested
    pub frames_discarded: u64,
}

impl SupervisorStats {
    pub fn report(&self) {
        info!("📊 Supervisor final stats:");
        info!("   Frames logged: {}", self.frames_logged);
        info!("   Malformed frames dropped: {}", self.frames_dropped);
        info!("   Faults detected: {}", self.faults_detected);
        info!("   Protective writes: {} ({} failed)", self.protective_writes, self.protective_write_errors);
        info!("   Instrument errors: {}", self.instrument_errors);
        info!("   Degraded interlock reads: {}", self.interlock_degraded);
        info!("   Record write errors: {}", self.sink_errors);
        if self.frames_discarded > 0 {
            warn!("   Frames discarded at shutdown: {}", self.frames_discarded);
        }
    }
}

/// Result of processing one well-formed frame
#[derive(Debug, Clone, PartialEq)]
pub struct FrameOutcome {
    pub record: LogRecord,
    pub decision: Decision,
}

/// How each record is echoed to the console
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EchoMode {
    Summary,
    Json,
    Off,
}

impl EchoMode {
    /// Only the human-readable echo prints the protective notice; JSON
    /// records carry it in their `decision` field
    pub fn announces_protective_action(self) -> bool {
        self == EchoMode::Summary
    }
}

/// The supervisor owns the instrument link, the interlock gateway and the
/// record sink; the DUT link is handed to [`Supervisor::start`]
pub struct Supervisor<C, S, K>
where
    C: LineChannel,
    S: ControlSystem,
    K: RecordSink,
{
    instrument: InstrumentClient<C>,
    interlock: InterlockGateway<S>,
    sink: K,
    channel: usize,
    queue_capacity: usize,
    echo: EchoMode,
    running: Arc<AtomicBool>,
    stats: SupervisorStats,
}

impl<C, S, K> Supervisor<C, S, K>
where
    C: LineChannel,
    S: ControlSystem,
    K: RecordSink,
{
    /// Create a supervisor reading supply `channel` (0-based)
    pub fn new(
        instrument: InstrumentClient<C>,
        interlock: InterlockGateway<S>,
        sink: K,
        channel: usize,
    ) -> Self {
        Self {
            instrument,
            interlock,
            sink,
            channel,
            queue_capacity: 64,
            echo: EchoMode::Summary,
            running: Arc::new(AtomicBool::new(true)),
            stats: SupervisorStats::default(),
        }
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity.max(1);
        self
    }

    pub fn with_echo(mut self, echo: EchoMode) -> Self {
        self.echo = echo;
        self
    }

    /// Get a reference to the running flag for external control
    pub fn get_running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    #[cfg(test)]
    pub fn stats(&self) -> &SupervisorStats {
        &self.stats
    }

    /// Run until the running flag is cleared or the DUT link reaches EOF.
    ///
    /// The DUT link is released by the reader thread before this returns; the
    /// instrument link, gateway and sink are released when the supervisor is
    /// dropped.
    pub fn start<D>(&mut self, dut: D) -> Result<SupervisorStats>
    where
        D: LineChannel + 'static,
    {
        let (line_tx, line_rx) = bounded::<QueuedLine>(self.queue_capacity);
        let running_reader = Arc::clone(&self.running);

        let reader_handle = thread::Builder::new()
            .name("dut-reader".to_string())
            .spawn(move || match dut_reader_thread(dut, line_tx, running_reader) {
                Ok(_) => {
                    info!("DUT reader thread finished successfully");
                    Ok(())
                }
                Err(e) => {
                    error!("DUT reader thread failed: {}", e);
                    Err(e)
                }
            })?;

        info!("👀 Supervising DUT (supply channel {})", self.channel);
        self.decision_loop(&line_rx);

        // Stop the reader whichever side finished first
        self.running.store(false, Ordering::SeqCst);
        self.stats.frames_discarded += line_rx.len() as u64;
        drop(line_rx);

        let reader_result = reader_handle
            .join()
            .map_err(|_| anyhow!("DUT reader thread panicked"))?;

        self.stats.report();
        reader_result.map_err(|e| anyhow!("DUT link failed: {}", e))?;
        Ok(self.stats.clone())
    }

    fn decision_loop(&mut self, line_rx: &Receiver<QueuedLine>) {
        while self.running.load(Ordering::SeqCst) {
            match line_rx.recv_timeout(POLL_INTERVAL) {
                Ok((arrived, line)) => {
                    self.handle_line(arrived, &line);
                }
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    info!("DUT line queue disconnected - reader has stopped");
                    break;
                }
            }
        }
    }

    /// Process one raw DUT line that arrived at `arrived`.
    ///
    /// Returns `None` for malformed lines, which are dropped without a record
    /// or any action.
    pub fn handle_line(&mut self, arrived: NaiveDateTime, line: &str) -> Option<FrameOutcome> {
        let frame = match StatusFrame::decode(line) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Dropping DUT line {:?}: {}", line, e);
                self.stats.frames_dropped += 1;
                return None;
            }
        };

        let interlock = self.interlock.read_monitor();
        if interlock == InterlockState::Unknown {
            self.stats.interlock_degraded += 1;
        }

        let current = match self.instrument.read_current(self.channel) {
            Ok(amps) => Some(amps),
            Err(e) => {
                warn!("Supply current unavailable for this frame: {}", e);
                self.stats.instrument_errors += 1;
                None
            }
        };

        let record = LogRecord::new(arrived, frame, current, interlock);
        self.append(&record.to_line());
        self.echo(&record);
        self.stats.frames_logged += 1;

        let decision = record.decision();
        if decision.is_protective() {
            self.protect(&record);
        }

        Some(FrameOutcome { record, decision })
    }

    fn protect(&mut self, record: &LogRecord) {
        self.stats.faults_detected += 1;
        if self.echo.announces_protective_action() {
            println!("Error detected. Closing shutter");
        }
        warn!("🚨 DUT fault ({}), closing interlock", record.frame);
        self.append(&record.intent_line());

        match self.interlock.write_closed() {
            Ok(true) => self.stats.protective_writes += 1,
            Ok(false) => {}
            Err(e) => {
                error!("❌ Protective write to interlock failed: {}", e);
                self.stats.protective_write_errors += 1;
            }
        }
    }

    fn append(&mut self, line: &str) {
        if let Err(e) = self.sink.append_line(line) {
            error!("❌ Failed to append record: {}", e);
            self.stats.sink_errors += 1;
        }
    }

    fn echo(&self, record: &LogRecord) {
        match self.echo {
            EchoMode::Summary => {
                println!("{}", record.frame);
                println!("{}\n", record.reading_summary());
            }
            EchoMode::Json => match record.to_json() {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("Failed to render record as JSON: {}", e),
            },
            EchoMode::Off => {}
        }
    }
}

/// DUT reader thread - waits for lines and queues them with their arrival time
fn dut_reader_thread<D: LineChannel>(
    mut dut: D,
    line_tx: Sender<QueuedLine>,
    running: Arc<AtomicBool>,
) -> io::Result<()> {
    let mut lines_read = 0u64;

    while running.load(Ordering::SeqCst) {
        let line = match dut.read_line() {
            Ok(Some(line)) => line,
            // Nothing arrived yet
            Ok(None) => continue,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                info!("DUT link closed after {} lines", lines_read);
                return Ok(());
            }
            Err(e) => return Err(e),
        };

        let arrived = LogRecord::now();
        lines_read += 1;

        let mut item = (arrived, line);
        loop {
            match line_tx.send_timeout(item, POLL_INTERVAL) {
                Ok(()) => break,
                Err(SendTimeoutError::Timeout(unsent)) => {
                    if !running.load(Ordering::SeqCst) {
                        return Ok(());
                    }
                    warn!("DUT line queue full, decision loop is falling behind");
                    item = unsent;
                }
                Err(SendTimeoutError::Disconnected(_)) => return Ok(()),
            }
        }
    }

    debug!("DUT reader stopping after {} lines", lines_read);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::mock::{ScpiResponder, ScriptedChannel};
    use crate::interlock::MemoryControlSystem;
    use crate::sink::MemorySink;
    use std::sync::Mutex;
    use tracing_subscriber::fmt::MakeWriter;

    const MONITOR: &str = "SR08ID01IS01:SHUTTEROPEN_MONITOR";
    const COMMAND: &str = "SR08ID01IS01:SHUTTEROPEN_CMD";

    fn shutter(open: &str) -> MemoryControlSystem {
        MemoryControlSystem::new()
            .with_point(MONITOR, open)
            .with_point(COMMAND, open)
            .link(COMMAND, MONITOR)
    }

    fn supervisor(
        supply: ScpiResponder,
        cs: MemoryControlSystem,
        sink: MemorySink,
        protective_write: bool,
    ) -> Supervisor<ScpiResponder, MemoryControlSystem, MemorySink> {
        let gateway = InterlockGateway::new(cs, MONITOR, COMMAND, "0", protective_write);
        Supervisor::new(InstrumentClient::new(supply), gateway, sink, 0).with_echo(EchoMode::Off)
    }

    fn records(sink: &MemorySink) -> Vec<LogRecord> {
        sink.lines()
            .iter()
            .filter_map(|line| LogRecord::parse_line(line).ok())
            .collect()
    }

    #[test]
    fn test_end_to_end_idle_fault_idle() {
        let sink = MemorySink::new();
        let mut sup = supervisor(ScpiResponder::supply(5.0, 0.5), shutter("1"), sink.clone(), false);

        let dut = ScriptedChannel::lines([":0:0:0", ":1:0:1", ":0:0:0"]);
        let stats = sup.start(dut).unwrap();

        let logged = records(&sink);
        assert_eq!(logged.len(), 3);
        let decisions: Vec<Decision> = logged.iter().map(|r| r.decision()).collect();
        assert_eq!(
            decisions,
            vec![Decision::Idle, Decision::ProtectiveAction, Decision::Idle]
        );
        for record in &logged {
            assert_eq!(record.interlock, InterlockState::Open);
            assert_eq!(record.current, Some(0.5));
        }
        assert_eq!(logged[1].frame, StatusFrame::new(1, 0, 1));

        // Record line, then the intent line for the faulted frame
        let lines = sink.lines();
        assert_eq!(lines.len(), 4);
        assert!(lines[2].ends_with("Error detected. Closing shutter"));

        assert_eq!(stats.frames_logged, 3);
        assert_eq!(stats.faults_detected, 1);
        assert_eq!(stats.protective_writes, 0);
    }

    #[test]
    fn test_malformed_lines_never_reach_decision() {
        let sink = MemorySink::new();
        let supply = ScpiResponder::supply(5.0, 0.5);
        let log = supply.log.clone();
        let mut sup = supervisor(supply, shutter("1"), sink.clone(), true);

        let dut = ScriptedChannel::new([
            Some("garbage"),
            None,
            Some(":1:2"),
            Some(""),
            Some(":9:x:0"),
        ]);
        let stats = sup.start(dut).unwrap();

        assert!(sink.lines().is_empty());
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(stats.frames_dropped, 4);
        assert_eq!(stats.frames_logged, 0);
        assert_eq!(stats.faults_detected, 0);
    }

    #[test]
    fn test_handle_line_outcomes() {
        let sink = MemorySink::new();
        let mut sup = supervisor(ScpiResponder::supply(5.0, 0.5), shutter("0"), sink.clone(), false);
        let arrived = LogRecord::now();

        let idle = sup.handle_line(arrived, ":0:0:0\r\n").unwrap();
        assert_eq!(idle.decision, Decision::Idle);
        assert_eq!(idle.record.timestamp, arrived);
        assert_eq!(idle.record.interlock, InterlockState::Closed);

        let fault = sup.handle_line(arrived, ":3:1:2").unwrap();
        assert_eq!(fault.decision, Decision::ProtectiveAction);
        assert_eq!(fault.record.frame, StatusFrame::new(3, 1, 2));

        assert!(sup.handle_line(arrived, "garbage").is_none());
        assert_eq!(sup.stats().frames_dropped, 1);
    }

    #[test]
    fn test_protective_notice_only_in_summary_echo() {
        assert!(EchoMode::Summary.announces_protective_action());
        assert!(!EchoMode::Json.announces_protective_action());
        assert!(!EchoMode::Off.announces_protective_action());
    }

    /// Log output collected in memory
    #[derive(Clone, Default)]
    struct CapturedLogs(Arc<Mutex<Vec<u8>>>);

    impl io::Write for CapturedLogs {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for CapturedLogs {
        type Writer = CapturedLogs;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    #[test]
    fn test_dropped_lines_are_logged_as_warnings() {
        let logs = CapturedLogs::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(logs.clone())
            .with_max_level(tracing::Level::WARN)
            .with_ansi(false)
            .finish();

        let mut sup = supervisor(ScpiResponder::supply(5.0, 0.5), shutter("1"), MemorySink::new(), false);
        tracing::subscriber::with_default(subscriber, || {
            assert!(sup.handle_line(LogRecord::now(), ":1:2").is_none());
        });

        let output = String::from_utf8(logs.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("WARN"));
        assert!(output.contains("Dropping DUT line \":1:2\""));
    }

    #[test]
    fn test_protective_write_closes_interlock() {
        let cs = shutter("1");
        let sink = MemorySink::new();
        let mut sup = supervisor(ScpiResponder::supply(5.0, 0.5), cs.clone(), sink.clone(), true);

        let dut = ScriptedChannel::lines([":0:0:0", ":2:1:1", ":0:0:0"]);
        let stats = sup.start(dut).unwrap();

        let logged = records(&sink);
        assert_eq!(logged[0].interlock, InterlockState::Open);
        // The monitor read for the faulted frame happens before the write
        assert_eq!(logged[1].interlock, InterlockState::Open);
        assert_eq!(logged[2].interlock, InterlockState::Closed);
        assert_eq!(cs.value(COMMAND).as_deref(), Some("0"));
        assert_eq!(stats.protective_writes, 1);
    }

    #[test]
    fn test_instrument_failure_still_logs_and_protects() {
        let sink = MemorySink::new();
        let cs = shutter("1");
        let supply = ScpiResponder::supply(5.0, 0.5).silence("MEAS:CURR?");
        let mut sup = supervisor(supply, cs.clone(), sink.clone(), true);

        let dut = ScriptedChannel::lines([":4:4:0"]);
        let stats = sup.start(dut).unwrap();

        let logged = records(&sink);
        assert_eq!(logged.len(), 1);
        assert_eq!(logged[0].current, None);
        assert_eq!(stats.instrument_errors, 1);
        assert_eq!(stats.protective_writes, 1);
        assert_eq!(cs.value(MONITOR).as_deref(), Some("0"));
    }

    #[test]
    fn test_interlock_outage_degrades_to_unknown() {
        let sink = MemorySink::new();
        let cs = shutter("1");
        cs.set_offline(true);
        let mut sup = supervisor(ScpiResponder::supply(5.0, 0.5), cs, sink.clone(), true);

        let dut = ScriptedChannel::lines([":0:0:0", ":1:1:0"]);
        let stats = sup.start(dut).unwrap();

        let logged = records(&sink);
        assert_eq!(logged.len(), 2);
        assert!(logged.iter().all(|r| r.interlock == InterlockState::Unknown));
        assert_eq!(stats.interlock_degraded, 2);
        assert_eq!(stats.protective_write_errors, 1);
    }

    #[test]
    fn test_cleared_running_flag_stops_promptly() {
        let sink = MemorySink::new();
        let mut sup = supervisor(ScpiResponder::supply(5.0, 0.5), shutter("1"), sink.clone(), false);
        sup.get_running_flag().store(false, Ordering::SeqCst);

        // A DUT that would otherwise time out forever
        let dut = ScriptedChannel::new(std::iter::repeat(None::<&str>).take(10_000));
        let stats = sup.start(dut).unwrap();

        assert!(sink.lines().is_empty());
        assert_eq!(stats.frames_logged, 0);
    }

    #[test]
    fn test_dut_link_error_is_reported() {
        struct Unplugged;
        impl LineChannel for Unplugged {
            fn read_line(&mut self) -> io::Result<Option<String>> {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
            }
            fn write_line(&mut self, _line: &str) -> io::Result<()> {
                Ok(())
            }
        }

        let mut sup = supervisor(ScpiResponder::supply(5.0, 0.5), shutter("1"), MemorySink::new(), false);
        let err = sup.start(Unplugged).unwrap_err();
        assert!(err.to_string().contains("device unplugged"));
    }
}
