//! Per-request access logging.
//!
//! One line is produced for each matched request/reply pair and handed to an
//! external sink. The format is stable single-line JSON so downstream
//! tooling can parse it without a schema. Sink writes are fire-and-forget:
//! a failing sink never touches the data path.

use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use serde_json::json;

/// Destination for formatted access-log lines.
///
/// The host typically backs this with an async file writer; errors are the
/// sink's problem and must not propagate.
pub trait LogSink: Send + Sync {
    /// Write one formatted line. Best-effort.
    fn write(&self, line: &str);
}

/// A completed request/reply pair, ready to be formatted.
#[derive(Debug, Clone)]
pub struct AccessLogEntry<'a> {
    /// Operation name (`"query"`).
    pub operation: &'static str,
    /// Full collection namespace, or the command name for `$cmd` queries.
    pub namespace: &'a str,
    /// Caller annotation extracted from `$comment`, when present.
    pub callsite: Option<&'a str>,
    /// Request flag bits as seen on the wire.
    pub flags: u32,
    /// Wire `request_id` of the request.
    pub request_id: i32,
    /// Number of documents in the matched reply.
    pub reply_documents: u64,
    /// Total encoded size of the reply documents in bytes.
    pub reply_size_bytes: u64,
    /// Wall clock from request decode to reply decode.
    pub reply_duration: Duration,
}

/// Formats completed requests and hands them to the sink.
///
/// Shared by every filter on a listener; cloning the `Arc` is the intended
/// way to distribute it.
pub struct AccessLog {
    sink: Arc<dyn LogSink>,
}

impl AccessLog {
    /// An access log writing through `sink`.
    pub fn new(sink: Arc<dyn LogSink>) -> Self {
        Self { sink }
    }

    /// Format and emit one record.
    pub fn log_request(&self, entry: &AccessLogEntry<'_>) {
        let line = json!({
            "time": Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true),
            "operation": entry.operation,
            "namespace": entry.namespace,
            "callsite": entry.callsite,
            "flags": format!("{:#x}", entry.flags),
            "request_id": entry.request_id,
            "reply_num_docs": entry.reply_documents,
            "reply_size": entry.reply_size_bytes,
            "reply_time_ms": entry.reply_duration.as_millis() as u64,
        })
        .to_string();
        self.sink.write(&line);
    }
}

/// Sink that retains lines in memory, for tests and diagnostics.
#[derive(Debug, Default)]
pub struct InMemorySink {
    lines: Mutex<Vec<String>>,
}

impl InMemorySink {
    /// An empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the lines written so far.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

impl LogSink for InMemorySink {
    fn write(&self, line: &str) {
        self.lines
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(line.to_string());
    }
}
