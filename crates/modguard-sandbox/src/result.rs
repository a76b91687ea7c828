//! Execution results.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::script::{Diagnostic, ScriptFault};
use crate::validator::SecurityViolation;

/// Why an invocation did not succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[non_exhaustive]
pub enum ErrorKind {
    /// Static validation rejected the source.
    SecurityViolation,
    /// The compiler reported diagnostics.
    Compilation,
    /// Script logic raised an uncaught error or panicked.
    ScriptFault,
    /// The watchdog stopped the worker at its deadline.
    Timeout,
    /// The memory budget was exceeded.
    MemoryLimitExceeded,
    /// External cancellation stopped the invocation.
    Cancelled,
    /// No permission set is registered for the script id.
    UnknownScript,
    /// Sandbox infrastructure failed (thread or process spawn, IPC).
    Internal,
}

impl ErrorKind {
    /// Stable snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SecurityViolation => "security_violation",
            Self::Compilation => "compilation",
            Self::ScriptFault => "script_fault",
            Self::Timeout => "timeout",
            Self::MemoryLimitExceeded => "memory_limit_exceeded",
            Self::Cancelled => "cancelled",
            Self::UnknownScript => "unknown_script",
            Self::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured failure carried by an unsuccessful [`ExecutionResult`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Failure class.
    pub kind: ErrorKind,
    /// Human-readable summary.
    pub message: String,
    /// Validation violations, for [`ErrorKind::SecurityViolation`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<SecurityViolation>,
    /// Compiler diagnostics, for [`ErrorKind::Compilation`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub diagnostics: Vec<Diagnostic>,
}

impl ErrorInfo {
    /// Error of `kind` with `message` and no attachments.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            violations: Vec::new(),
            diagnostics: Vec::new(),
        }
    }

    /// Rejection by the static validator.
    pub fn security(violations: Vec<SecurityViolation>) -> Self {
        let message = match violations.as_slice() {
            [only] => format!("security violation: {only}"),
            all => format!(
                "{} security violations: {}",
                all.len(),
                all.iter()
                    .map(ToString::to_string)
                    .collect::<Vec<_>>()
                    .join("; ")
            ),
        };
        Self {
            violations,
            ..Self::new(ErrorKind::SecurityViolation, message)
        }
    }

    /// Compilation failure.
    pub fn compilation(diagnostics: Vec<Diagnostic>) -> Self {
        let message = format!(
            "compilation failed with {} diagnostic(s): {}",
            diagnostics.len(),
            diagnostics
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ")
        );
        Self {
            diagnostics,
            ..Self::new(ErrorKind::Compilation, message)
        }
    }

    /// Uncaught script error.
    pub fn fault(fault: &ScriptFault) -> Self {
        Self::new(ErrorKind::ScriptFault, fault.message.clone())
    }

    /// Deadline reached.
    pub fn timeout(limit: Duration) -> Self {
        Self::new(
            ErrorKind::Timeout,
            format!(
                "operation cancelled: execution exceeded {} ms",
                limit.as_millis()
            ),
        )
    }

    /// Memory budget exceeded.
    pub fn memory(limit: u64) -> Self {
        Self::new(
            ErrorKind::MemoryLimitExceeded,
            format!("memory limit of {limit} bytes exceeded"),
        )
    }

    /// External cancellation.
    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "execution cancelled by host")
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// Outcome of one invocation. Every failure mode ends here; nothing from
/// inside a script is ever raised into the caller.
///
/// Exactly one holds: `success` with `return_value`, or `!success` with an
/// `exception` (a timeout also sets `timed_out`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    /// Whether the entry point returned normally within budget.
    pub success: bool,
    /// Value returned by the entry point.
    pub return_value: Option<Value>,
    /// Failure details.
    pub exception: Option<ErrorInfo>,
    /// Whether the watchdog stopped the worker at its deadline.
    pub timed_out: bool,
    /// Invocation wall time; for early rejections, time spent before rejecting.
    pub execution_time: Duration,
    /// Peak memory observed for the invocation.
    pub peak_memory_bytes: u64,
}

impl ExecutionResult {
    /// Successful completion.
    pub fn completed(value: Value, execution_time: Duration, peak_memory_bytes: u64) -> Self {
        Self {
            success: true,
            return_value: Some(value),
            exception: None,
            timed_out: false,
            execution_time,
            peak_memory_bytes,
        }
    }

    /// Failure other than a deadline.
    pub fn failed(error: ErrorInfo, execution_time: Duration, peak_memory_bytes: u64) -> Self {
        Self {
            success: false,
            return_value: None,
            exception: Some(error),
            timed_out: false,
            execution_time,
            peak_memory_bytes,
        }
    }

    /// Forced termination at the deadline.
    pub fn timed_out(limit: Duration, execution_time: Duration, peak_memory_bytes: u64) -> Self {
        Self {
            timed_out: true,
            ..Self::failed(ErrorInfo::timeout(limit), execution_time, peak_memory_bytes)
        }
    }

    /// Failure class, if any.
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.exception.as_ref().map(|e| e.kind)
    }

    /// Short label for logs and metrics.
    pub fn outcome(&self) -> &'static str {
        if self.success {
            "completed"
        } else {
            self.error_kind().map_or("faulted", |k| k.as_str())
        }
    }
}
