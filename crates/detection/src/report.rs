//! Reporting interface between the detection core and the delivery layer.

use tracing::{error, warn};

/// Fire-and-forget outlet for findings and errors. Delivery (console,
/// FIFO, mail) is the embedding binary's concern; the core never learns
/// whether an event arrived.
pub trait ReportSink {
    fn emit_finding(&mut self, source: &str, message: &str);
    fn emit_error(&mut self, source: &str, message: &str);
}

/// Forwards events to the `tracing` facade.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

impl ReportSink for LogSink {
    fn emit_finding(&mut self, source: &str, message: &str) {
        warn!(source, "{message}");
    }

    fn emit_error(&mut self, source: &str, message: &str) {
        error!(source, "{message}");
    }
}

/// Buffers events in memory, for embedders that deliver in batch and for
/// tests.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    pub findings: Vec<(String, String)>,
    pub errors: Vec<(String, String)>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ReportSink for MemorySink {
    fn emit_finding(&mut self, source: &str, message: &str) {
        self.findings.push((source.to_string(), message.to_string()));
    }

    fn emit_error(&mut self, source: &str, message: &str) {
        self.errors.push((source.to_string(), message.to_string()));
    }
}
