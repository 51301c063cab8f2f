/*!
Append-only record sink.

Every line is composed in full before it is written and the file is flushed
after each write, so a shutdown between frames never leaves a half line.
*/

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// Destination for composed log lines
pub trait RecordSink: Send {
    /// Append one line (no trailing newline) and make it durable
    fn append_line(&mut self, line: &str) -> io::Result<()>;
}

impl<K: RecordSink + ?Sized> RecordSink for Box<K> {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        (**self).append_line(line)
    }
}

/// Text file opened in append mode
pub struct FileSink {
    path: PathBuf,
    file: File,
    lines_written: u64,
}

impl FileSink {
    /// Open `path` for appending, creating it if needed
    pub fn open<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!("📝 Appending records to {}", path.display());

        Ok(Self {
            path,
            file,
            lines_written: 0,
        })
    }

    #[cfg(test)]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl RecordSink for FileSink {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        let mut buffer = String::with_capacity(line.len() + 1);
        buffer.push_str(line);
        buffer.push('\n');
        self.file.write_all(buffer.as_bytes())?;
        self.file.flush()?;
        self.lines_written += 1;
        Ok(())
    }
}

impl Drop for FileSink {
    fn drop(&mut self) {
        let _ = self.file.sync_all();
        info!(
            "📝 Closed {} ({} lines written this session)",
            self.path.display(),
            self.lines_written
        );
    }
}

/// Collects lines in memory; clones share the same buffer
#[cfg(test)]
#[derive(Clone, Default)]
pub struct MemorySink {
    lines: std::sync::Arc<std::sync::Mutex<Vec<String>>>,
}

#[cfg(test)]
impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }
}

#[cfg(test)]
impl RecordSink for MemorySink {
    fn append_line(&mut self, line: &str) -> io::Result<()> {
        self.lines
            .lock()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "memory sink poisoned"))?
            .push(line.to_string());
        Ok(())
    }
}
