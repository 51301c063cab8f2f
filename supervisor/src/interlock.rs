/*!
Interlock gateway over the facility control system.

The control system is consumed through two verbs only, GET and SET of a named
point. [`CaToolsClient`] reaches EPICS Channel Access through the standard
`caget`/`caput` tools; [`MemoryControlSystem`] is an in-process point table for
bench runs and tests.
*/

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use shared::error::InterlockError;
use shared::InterlockState;
use tokio::process::Command;
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

/// The two control-system verbs the supervisor needs
pub trait ControlSystem: Send {
    /// Read the current value of a named point
    fn get(&mut self, point: &str) -> Result<String, InterlockError>;

    /// Write a value to a named point
    fn set(&mut self, point: &str, value: &str) -> Result<(), InterlockError>;
}

impl<S: ControlSystem + ?Sized> ControlSystem for Box<S> {
    fn get(&mut self, point: &str) -> Result<String, InterlockError> {
        (**self).get(point)
    }

    fn set(&mut self, point: &str, value: &str) -> Result<(), InterlockError> {
        (**self).set(point, value)
    }
}

/// EPICS Channel Access through the `caget`/`caput` command line tools
pub struct CaToolsClient {
    runtime: Runtime,
    timeout: Duration,
    caget: String,
    caput: String,
}

impl CaToolsClient {
    pub fn new(timeout: Duration) -> std::io::Result<Self> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        Ok(Self {
            runtime,
            timeout,
            caget: "caget".to_string(),
            caput: "caput".to_string(),
        })
    }

    /// Use tool binaries other than the ones on `PATH`
    #[cfg(test)]
    pub fn with_tools(mut self, caget: impl Into<String>, caput: impl Into<String>) -> Self {
        self.caget = caget.into();
        self.caput = caput.into();
        self
    }

    /// Run one tool invocation and return its trimmed stdout
    fn run(&self, program: &str, point: &str, args: &[&str]) -> Result<String, InterlockError> {
        // -t: terse value only, -n: enums as numbers, -w: CA wait time
        let wait = format!("{}", self.timeout.as_secs_f64());
        let mut command = Command::new(program);
        command
            .args(["-t", "-n", "-w", wait.as_str()])
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Leave the tool its own wait time plus a margin to report the failure
        let deadline = self.timeout.saturating_add(Duration::from_secs(1));

        let output = self.runtime.block_on(async {
            tokio::time::timeout(deadline, command.output()).await
        });

        let output = match output {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => {
                return Err(InterlockError::unavailable(point, format!("failed to run {}: {}", program, e)));
            }
            Err(_) => {
                return Err(InterlockError::Timeout {
                    point: point.to_string(),
                    timeout: deadline,
                });
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(InterlockError::unavailable(
                point,
                format!("{} exited with {}: {}", program, output.status, stderr),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        // caget prints "Channel connect timed out" on stdout for some versions
        if stdout.contains("not connected") || stdout.contains("timed out") {
            return Err(InterlockError::unavailable(point, stdout));
        }
        Ok(stdout)
    }
}

impl ControlSystem for CaToolsClient {
    fn get(&mut self, point: &str) -> Result<String, InterlockError> {
        let value = self.run(&self.caget, point, &[point])?;
        debug!("caget {} = {}", point, value);
        Ok(value)
    }

    fn set(&mut self, point: &str, value: &str) -> Result<(), InterlockError> {
        self.run(&self.caput, point, &[point, value])?;
        debug!("caput {} {}", point, value);
        Ok(())
    }
}

/// In-process point table.
///
/// Clones share the same table. A command point may be linked to a monitor
/// point so that writes to the command show up on the monitor, the way a
/// shutter reports its new position.
#[derive(Clone, Default)]
pub struct MemoryControlSystem {
    points: Arc<Mutex<HashMap<String, String>>>,
    links: Arc<Mutex<HashMap<String, String>>>,
    offline: Arc<Mutex<bool>>,
}

impl MemoryControlSystem {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_point(self, point: &str, value: &str) -> Self {
        self.put(point, value);
        self
    }

    /// Mirror writes on `command` into `monitor`
    pub fn link(self, command: &str, monitor: &str) -> Self {
        if let Ok(mut links) = self.links.lock() {
            links.insert(command.to_string(), monitor.to_string());
        }
        self
    }

    /// Set a point directly, bypassing links
    pub fn put(&self, point: &str, value: &str) {
        if let Ok(mut points) = self.points.lock() {
            points.insert(point.to_string(), value.to_string());
        }
    }

    pub fn value(&self, point: &str) -> Option<String> {
        self.points.lock().ok()?.get(point).cloned()
    }

    /// Simulate losing the control-system network
    #[cfg(test)]
    pub fn set_offline(&self, offline: bool) {
        if let Ok(mut flag) = self.offline.lock() {
            *flag = offline;
        }
    }

    fn check_online(&self, point: &str) -> Result<(), InterlockError> {
        let offline = self.offline.lock().map(|flag| *flag).unwrap_or(true);
        if offline {
            Err(InterlockError::unavailable(point, "control system offline"))
        } else {
            Ok(())
        }
    }
}

impl ControlSystem for MemoryControlSystem {
    fn get(&mut self, point: &str) -> Result<String, InterlockError> {
        self.check_online(point)?;
        self.value(point)
            .ok_or_else(|| InterlockError::unavailable(point, "no such point"))
    }

    fn set(&mut self, point: &str, value: &str) -> Result<(), InterlockError> {
        self.check_online(point)?;
        self.put(point, value);
        let linked = self.links.lock().ok().and_then(|links| links.get(point).cloned());
        if let Some(monitor) = linked {
            self.put(&monitor, value);
        }
        Ok(())
    }
}

/// Narrow interlock interface used by the supervisor loop
pub struct InterlockGateway<S: ControlSystem> {
    client: S,
    monitor_point: String,
    command_point: String,
    closed_value: String,
    protective_write_enabled: bool,
}

impl<S: ControlSystem> InterlockGateway<S> {
    pub fn new(
        client: S,
        monitor_point: impl Into<String>,
        command_point: impl Into<String>,
        closed_value: impl Into<String>,
        protective_write_enabled: bool,
    ) -> Self {
        Self {
            client,
            monitor_point: monitor_point.into(),
            command_point: command_point.into(),
            closed_value: closed_value.into(),
            protective_write_enabled,
        }
    }

    /// Read an arbitrary point; used once at startup to prove connectivity
    pub fn probe(&mut self, point: &str) -> Result<String, InterlockError> {
        self.client.get(point)
    }

    /// Read the interlock monitor point, propagating failures
    pub fn try_read_monitor(&mut self) -> Result<InterlockState, InterlockError> {
        let value = self.client.get(&self.monitor_point)?;
        InterlockState::from_point_value(&value)
    }

    /// Read the interlock monitor point, degrading any failure to
    /// [`InterlockState::Unknown`]
    pub fn read_monitor(&mut self) -> InterlockState {
        match self.try_read_monitor() {
            Ok(state) => state,
            Err(e) => {
                warn!("Interlock monitor {} unreadable: {}", self.monitor_point, e);
                InterlockState::Unknown
            }
        }
    }

    /// Command the interlock closed.
    ///
    /// Returns `Ok(false)` without touching the control system while
    /// protective writes are disabled. Writing closed when already closed is
    /// harmless.
    pub fn write_closed(&mut self) -> Result<bool, InterlockError> {
        if !self.protective_write_enabled {
            info!(
                "Protective write disabled, not writing {} to {}",
                self.closed_value, self.command_point
            );
            return Ok(false);
        }

        self.client.set(&self.command_point, &self.closed_value)?;
        info!("🛡️ Wrote {} to {}", self.closed_value, self.command_point);
        Ok(true)
    }

    pub fn protective_write_enabled(&self) -> bool {
        self.protective_write_enabled
    }

    pub fn monitor_point(&self) -> &str {
        &self.monitor_point
    }
}
