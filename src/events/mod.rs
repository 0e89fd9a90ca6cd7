//! Call journal for RPC dispatch.
//!
//! The server can be handed an opaque line sink; every external dispatch
//! writes one request line and one outcome line. Sinks receive plain text so
//! the transport, file, or collector behind them is the deployment's choice.

use std::sync::Mutex;

/// A line sink for the RPC call journal.
pub trait CallLog: Send + Sync {
    /// Record one journal line.
    fn line(&self, line: &str);
}

/// Call log that retains lines in memory, for tests and inspection.
#[derive(Default)]
pub struct MemoryCallLog {
    lines: Mutex<Vec<String>>,
}

impl MemoryCallLog {
    /// Create an empty in-memory call log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of all recorded lines.
    pub fn lines(&self) -> Vec<String> {
        self.lines.lock().map(|l| l.clone()).unwrap_or_default()
    }

    /// Number of recorded lines.
    pub fn len(&self) -> usize {
        self.lines.lock().map(|l| l.len()).unwrap_or(0)
    }

    /// Whether no lines have been recorded.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl CallLog for MemoryCallLog {
    fn line(&self, line: &str) {
        if let Ok(mut lines) = self.lines.lock() {
            lines.push(line.to_string());
        }
    }
}

/// Call log that forwards lines to the `tracing` subscriber.
pub struct TracingCallLog;

impl CallLog for TracingCallLog {
    fn line(&self, line: &str) {
        tracing::info!(target: "quarry::calls", "{}", line);
    }
}
