//! Log collection: date-ordered replay of `LogMsg` frames.
//!
//! Messages from different agents arrive interleaved; the collector buffers
//! them for a short window, sorts by date and only releases entries old
//! enough that a straggler can no longer outrank them.

use chrono::{DateTime, Duration, Utc};

/// One collected log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogEntry {
    pub date: DateTime<Utc>,
    pub src: String,
    pub msg: String,
}

impl LogEntry {
    /// `[iso-date][src] message`, the logger's output format.
    pub fn render(&self) -> String {
        format!(
            "[{}][{}] {}",
            self.date.format("%Y-%m-%dT%H:%M:%S%.6f"),
            self.src,
            self.msg
        )
    }
}

/// Reorder buffer with a fixed window.
#[derive(Debug)]
pub struct ReorderBuffer {
    window: Duration,
    entries: Vec<LogEntry>,
}

impl ReorderBuffer {
    /// `window` is how long an entry is held back waiting for older
    /// stragglers; the logger uses 200 ms.
    pub fn new(window: std::time::Duration) -> Self {
        Self {
            window: Duration::from_std(window).expect("reorder window out of range"),
            entries: Vec::new(),
        }
    }

    pub fn push(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Releases, in date order, every entry older than the window.
    pub fn drain_ready(&mut self, now: DateTime<Utc>) -> Vec<LogEntry> {
        self.entries.sort_by_key(|e| e.date);
        let cutoff = now - self.window;
        let ready = self.entries.iter().take_while(|e| e.date < cutoff).count();
        self.entries.drain(..ready).collect()
    }

    /// Releases everything, ordered; used at shutdown.
    pub fn drain_all(&mut self) -> Vec<LogEntry> {
        self.entries.sort_by_key(|e| e.date);
        std::mem::take(&mut self.entries)
    }
}
