//! Log setup: `tracing` events formatted by `tracing-subscriber`, written to
//! stderr or through a lossy background appender when a log file is given.
//!
//! The appender never blocks the reactor. Lines that do not fit its queue are
//! counted and the count is written ahead of the next line that does fit.

use anyhow::{anyhow, Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use tracing_subscriber::fmt::format::Writer;
use tracing_subscriber::fmt::time::FormatTime;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// Queued lines before new ones are dropped
pub const LOG_QUEUE_LINES: usize = 8192;

struct Shared {
    tx: SyncSender<Vec<u8>>,
    dropped: AtomicU64,
}

#[derive(Clone)]
pub struct LossyFileWriter {
    shared: Arc<Shared>,
}

impl LossyFileWriter {
    /// Open `path` for appending (creating parents) and start the appender thread
    pub fn open(path: &Path, capacity: usize) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open log file {}", path.display()))?;
        let (writer, rx) = Self::unstarted(capacity);
        std::thread::Builder::new()
            .name("sgw-log".into())
            .spawn(move || append_lines(file, rx))
            .context("spawn log appender")?;
        Ok(writer)
    }

    fn unstarted(capacity: usize) -> (Self, Receiver<Vec<u8>>) {
        let (tx, rx) = mpsc::sync_channel(capacity.max(1));
        let writer = Self {
            shared: Arc::new(Shared {
                tx,
                dropped: AtomicU64::new(0),
            }),
        };
        (writer, rx)
    }

    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    fn offer(&self, line: Vec<u8>) -> bool {
        match self.shared.tx.try_send(line) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => false,
        }
    }
}

fn append_lines(mut file: File, rx: Receiver<Vec<u8>>) {
    for line in rx {
        // A failed append has nowhere left to be reported
        let _ = file.write_all(&line);
    }
    let _ = file.flush();
}

impl Write for LossyFileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let lost = self.shared.dropped.swap(0, Ordering::Relaxed);
        if lost > 0 {
            let notice = format!("[log] {} lines dropped\n", lost).into_bytes();
            if !self.offer(notice) {
                self.shared.dropped.fetch_add(lost, Ordering::Relaxed);
            }
        }
        if !self.offer(buf.to_vec()) {
            self.shared.dropped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for LossyFileWriter {
    type Writer = LossyFileWriter;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Local wall-clock timestamps with millisecond precision
struct LocalTime;

impl FormatTime for LocalTime {
    fn format_time(&self, w: &mut Writer<'_>) -> std::fmt::Result {
        write!(w, "{}", chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"))
    }
}

/// Install the global subscriber. `RUST_LOG` overrides the default `info`.
pub fn init(log_file: Option<&Path>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(LocalTime)
        .with_thread_names(true)
        .with_target(false);
    let installed = match log_file {
        Some(path) => builder
            .with_ansi(false)
            .with_writer(LossyFileWriter::open(path, LOG_QUEUE_LINES)?)
            .try_init(),
        None => builder.with_writer(io::stderr).try_init(),
    };
    installed.map_err(|e| anyhow!("install log subscriber: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn full_queue_drops_and_reports() {
        let (mut w, rx) = LossyFileWriter::unstarted(2);
        w.write_all(b"one\n").unwrap();
        w.write_all(b"two\n").unwrap();
        w.write_all(b"three\n").unwrap();
        assert_eq!(w.dropped(), 1);

        assert_eq!(rx.recv().unwrap(), b"one\n");
        assert_eq!(rx.recv().unwrap(), b"two\n");
        w.write_all(b"four\n").unwrap();
        assert_eq!(w.dropped(), 0);
        assert_eq!(rx.recv().unwrap(), b"[log] 1 lines dropped\n");
        assert_eq!(rx.recv().unwrap(), b"four\n");
    }

    #[test]
    fn appends_under_created_parent() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("logs/nested/sgw.log");
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, "earlier\n").unwrap();

        let (tx_writer, rx) = LossyFileWriter::unstarted(16);
        let file = OpenOptions::new().append(true).open(&path).unwrap();
        let mut w = tx_writer;
        w.write_all(b"later\n").unwrap();
        drop(w);
        append_lines(file, rx);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "earlier\nlater\n");

        let fresh = temp_dir.path().join("other/dir/sgw.log");
        LossyFileWriter::open(&fresh, 4).unwrap();
        assert!(fresh.exists());
    }
}
