//! Structured sandbox events.
//!
//! The sandbox never formats log lines for the host. It hands [`SandboxEvent`]
//! values to an [`EventSink`]:
//! - validation violations and warnings,
//! - one [`ExecutionRecord`] per invocation (UUID, SHA-256 of the source,
//!   a short preview, outcome, duration, peak memory),
//! - a [`ForcedTermination`] notice whenever the watchdog stops a worker.
//!
//! [`JsonLinesEventSink`] writes newline-delimited JSON to any `AsyncWrite`.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::result::ExecutionResult;
use crate::validator::{SecurityViolation, SecurityWarning};

/// Maximum length of the source preview in execution records.
const SOURCE_PREVIEW_MAX: usize = 500;

/// Event delivered to an [`EventSink`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
#[non_exhaustive]
pub enum SandboxEvent {
    /// A hard validation failure; the script never ran.
    Violation(SecurityViolation),
    /// An advisory validation finding.
    Warning(SecurityWarning),
    /// Summary of a finished invocation.
    Execution(ExecutionRecord),
    /// The watchdog forcibly stopped a worker.
    ForcedTermination(ForcedTermination),
}

/// Why a worker was forcibly stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    /// Deadline reached.
    Timeout,
    /// Memory budget exceeded.
    MemoryLimit,
    /// External cancellation grace expired.
    Cancelled,
}

impl TerminationReason {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::MemoryLimit => "memory_limit",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Notice that a worker was stopped without its cooperation.
#[derive(Debug, Clone, Serialize)]
pub struct ForcedTermination {
    /// Script the worker ran.
    pub script_id: String,
    /// Execution the worker belonged to.
    pub execution_id: String,
    /// Why it was stopped.
    pub reason: TerminationReason,
    /// `"thread"` or `"process"`.
    pub unit: &'static str,
    /// Time from invocation start to termination.
    pub elapsed_ms: u64,
}

/// Summary of one invocation.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionRecord {
    /// Unique execution identifier.
    pub execution_id: String,
    /// Script that ran.
    pub script_id: String,
    /// When execution started.
    pub timestamp: DateTime<Utc>,
    /// SHA-256 of the submitted source.
    pub source_hash: String,
    /// First characters of the source, for human review.
    pub source_preview: String,
    /// Entry point that was invoked.
    pub entry_point: String,
    /// `completed` or the error kind.
    pub outcome: String,
    /// Whether the watchdog stopped the worker at its deadline.
    pub timed_out: bool,
    /// Total time including validation and compilation.
    pub duration_ms: u64,
    /// Peak memory of the invocation.
    pub peak_memory_bytes: u64,
}

/// Receiver for sandbox events. Must not block for long; it is awaited on
/// the execution path.
#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    /// Deliver one event.
    async fn emit(&self, event: &SandboxEvent);
}

/// Discards every event.
pub struct NoopEventSink;

#[async_trait::async_trait]
impl EventSink for NoopEventSink {
    async fn emit(&self, _event: &SandboxEvent) {}
}

/// Re-emits events as `tracing` events with structured fields.
///
/// Execution records are logged at INFO with `audit = true`; violations and
/// forced terminations at WARN; warnings at DEBUG.
pub struct TracingEventSink;

#[async_trait::async_trait]
impl EventSink for TracingEventSink {
    async fn emit(&self, event: &SandboxEvent) {
        match event {
            SandboxEvent::Violation(v) => tracing::warn!(
                script_id = %v.script_id,
                kind = ?v.kind,
                construct = %v.violating_construct,
                location = ?v.source_location,
                reason = %v.reason,
                "security violation"
            ),
            SandboxEvent::Warning(w) => tracing::debug!(
                script_id = %w.script_id,
                kind = ?w.kind,
                construct = %w.construct,
                location = ?w.source_location,
                "security warning"
            ),
            SandboxEvent::Execution(r) => tracing::info!(
                audit = true,
                execution_id = %r.execution_id,
                script_id = %r.script_id,
                source_hash = %r.source_hash,
                entry_point = %r.entry_point,
                outcome = %r.outcome,
                timed_out = r.timed_out,
                duration_ms = r.duration_ms,
                peak_memory_bytes = r.peak_memory_bytes,
                "execution"
            ),
            SandboxEvent::ForcedTermination(t) => tracing::warn!(
                execution_id = %t.execution_id,
                script_id = %t.script_id,
                reason = t.reason.as_str(),
                unit = t.unit,
                elapsed_ms = t.elapsed_ms,
                "worker forcibly terminated"
            ),
        }
    }
}

/// Writes events as newline-delimited JSON to an `AsyncWrite` sink.
pub struct JsonLinesEventSink<W: AsyncWrite + Unpin + Send> {
    writer: Mutex<W>,
}

impl<W: AsyncWrite + Unpin + Send> JsonLinesEventSink<W> {
    /// Sink writing to `writer`.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Recover the writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait::async_trait]
impl<W: AsyncWrite + Unpin + Send + 'static> EventSink for JsonLinesEventSink<W> {
    async fn emit(&self, event: &SandboxEvent) {
        let mut line = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                tracing::warn!(error = %e, "failed to serialize sandbox event");
                return;
            }
        };
        line.push('\n');

        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.write_all(line.as_bytes()).await {
            tracing::warn!(error = %e, "failed to write sandbox event");
        }
        let _ = writer.flush().await;
    }
}

/// SHA-256 of a string as lowercase hex.
pub fn sha256_hex(data: &str) -> String {
    let digest = Sha256::digest(data.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// First [`SOURCE_PREVIEW_MAX`] bytes of `source`, cut on a char boundary,
/// with `...` appended when truncated.
pub fn source_preview(source: &str) -> String {
    if source.len() <= SOURCE_PREVIEW_MAX {
        return source.to_string();
    }
    let mut end = SOURCE_PREVIEW_MAX;
    while !source.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &source[..end])
}

/// Collects the fields of an [`ExecutionRecord`] while an invocation runs.
pub(crate) struct ExecutionRecordBuilder {
    execution_id: String,
    script_id: String,
    timestamp: DateTime<Utc>,
    source_hash: String,
    source_preview: String,
    entry_point: String,
    start: Instant,
}

impl ExecutionRecordBuilder {
    pub fn new(script_id: &str, source: &str, entry_point: &str) -> Self {
        Self {
            execution_id: Uuid::new_v4().to_string(),
            script_id: script_id.to_string(),
            timestamp: Utc::now(),
            source_hash: sha256_hex(source),
            source_preview: source_preview(source),
            entry_point: entry_point.to_string(),
            start: Instant::now(),
        }
    }

    pub fn execution_id(&self) -> &str {
        &self.execution_id
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn forced(&self, reason: TerminationReason, unit: &'static str, elapsed: Duration) -> ForcedTermination {
        ForcedTermination {
            script_id: self.script_id.clone(),
            execution_id: self.execution_id.clone(),
            reason,
            unit,
            elapsed_ms: elapsed.as_millis() as u64,
        }
    }

    pub fn finish(self, result: &ExecutionResult) -> ExecutionRecord {
        ExecutionRecord {
            execution_id: self.execution_id,
            script_id: self.script_id,
            timestamp: self.timestamp,
            source_hash: self.source_hash,
            source_preview: self.source_preview,
            entry_point: self.entry_point,
            outcome: result.outcome().to_string(),
            timed_out: result.timed_out,
            duration_ms: self.start.elapsed().as_millis() as u64,
            peak_memory_bytes: result.peak_memory_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::ErrorInfo;
    use crate::validator::ViolationKind;

    #[test]
    fn sha256_hex_produces_correct_hash() {
        assert_eq!(
            sha256_hex("hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn preview_leaves_short_source_unchanged() {
        assert_eq!(source_preview("return 42;"), "return 42;");
        let exact = "a".repeat(SOURCE_PREVIEW_MAX);
        assert_eq!(source_preview(&exact), exact);
    }

    #[test]
    fn preview_truncates_on_char_boundary() {
        let mut source = "a".repeat(499);
        source.push('\u{1F600}');
        source.push_str(&"b".repeat(100));
        let preview = source_preview(&source);
        assert_eq!(preview, format!("{}...", "a".repeat(499)));

        let cjk = "\u{4E00}".repeat(200);
        assert!(source_preview(&cjk).ends_with("..."));
    }

    #[test]
    fn record_captures_outcome() {
        let builder = ExecutionRecordBuilder::new("mod-a", "class A {}", "Run");
        assert!(Uuid::parse_str(builder.execution_id()).is_ok());
        let result = ExecutionResult::timed_out(
            Duration::from_millis(5),
            Duration::from_millis(6),
            128,
        );
        let record = builder.finish(&result);
        assert_eq!(record.outcome, "timeout");
        assert!(record.timed_out);
        assert_eq!(record.peak_memory_bytes, 128);
        assert_eq!(record.source_hash, sha256_hex("class A {}"));
    }

    #[tokio::test]
    async fn json_lines_sink_writes_one_object_per_event() {
        let sink = JsonLinesEventSink::new(Vec::<u8>::new());
        sink.emit(&SandboxEvent::Violation(SecurityViolation {
            script_id: "mod-a".into(),
            kind: ViolationKind::NamespaceDenied,
            violating_construct: "System.IO".into(),
            reason: "denied".into(),
            source_location: None,
        }))
        .await;
        let record = ExecutionRecordBuilder::new("mod-a", "src", "Run").finish(
            &ExecutionResult::failed(ErrorInfo::cancelled(), Duration::ZERO, 0),
        );
        sink.emit(&SandboxEvent::Execution(record)).await;

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<serde_json::Value> = output
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["event"], "violation");
        assert_eq!(lines[0]["violating_construct"], "System.IO");
        assert_eq!(lines[1]["event"], "execution");
        assert_eq!(lines[1]["outcome"], "cancelled");
    }

    #[tokio::test]
    async fn tracing_sink_accepts_every_event() {
        let builder = ExecutionRecordBuilder::new("mod-a", "src", "Run");
        let forced = builder.forced(TerminationReason::Timeout, "thread", Duration::from_millis(500));
        TracingEventSink
            .emit(&SandboxEvent::ForcedTermination(forced))
            .await;
        NoopEventSink
            .emit(&SandboxEvent::Execution(builder.finish(&ExecutionResult::completed(
                serde_json::json!(1),
                Duration::ZERO,
                0,
            ))))
            .await;
    }
}
