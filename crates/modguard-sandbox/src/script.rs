//! Compiler collaborator interface.
//!
//! The sandbox never interprets script source itself. A host supplies a
//! [`ScriptCompiler`] that turns validated source into a [`CompiledUnit`],
//! and the engine invokes entry points on that unit from an isolated worker.

use std::any::Any;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::context::ScriptContext;
use crate::validator::SourceLocation;

/// A compiler diagnostic for source that failed to compile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    /// Compiler-specific code, e.g. `CS1002`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    /// Diagnostic text.
    pub message: String,
    /// Where the problem is, if the compiler knows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
}

impl Diagnostic {
    /// Diagnostic with a message only.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            code: None,
            message: message.into(),
            location: None,
        }
    }

    /// Attach a source location.
    pub fn at(mut self, line: u32, col: u32) -> Self {
        self.location = Some(SourceLocation { line, col });
        self
    }

    /// Attach a compiler code.
    pub fn with_code(mut self, code: impl Into<String>) -> Self {
        self.code = Some(code.into());
        self
    }
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = &self.code {
            write!(f, "{code}: ")?;
        }
        write!(f, "{}", self.message)?;
        if let Some(loc) = self.location {
            write!(f, " at {loc}")?;
        }
        Ok(())
    }
}

/// An uncaught error raised by script logic.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct ScriptFault {
    /// Fault description as reported by the script runtime.
    pub message: String,
}

impl ScriptFault {
    /// Fault with the given message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }

    /// The fault a runtime reports when it unwinds after cancellation.
    pub fn cancelled() -> Self {
        Self::new("operation was cancelled")
    }

    /// Build a fault from a caught panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        Self::new(format!("script panicked: {}", panic_message(payload.as_ref())))
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}

/// Turns validated source into an invocable unit.
///
/// Only source that already passed static validation is ever passed in.
/// Implementations are shared between concurrent executions.
pub trait ScriptCompiler: Send + Sync {
    /// Compile `source`. `referenced_namespaces` lists the namespaces the
    /// validator saw, so the compiler can restrict what it resolves.
    fn compile(
        &self,
        source: &str,
        referenced_namespaces: &[String],
    ) -> Result<Box<dyn CompiledUnit>, Vec<Diagnostic>>;
}

/// A compiled script. Lives on its worker thread for one invocation.
pub trait CompiledUnit {
    /// Run `entry_point` with `args`.
    ///
    /// Long-running units must poll [`ScriptContext::interrupt_requested`]
    /// from their dispatch loop; scripts themselves see only the cooperative
    /// [`ScriptContext::cancellation`] token.
    fn invoke(
        &self,
        entry_point: &str,
        args: &[Value],
        ctx: &ScriptContext,
    ) -> Result<Value, ScriptFault>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_display_includes_code_and_location() {
        let d = Diagnostic::new("; expected").with_code("CS1002").at(3, 14);
        assert_eq!(d.to_string(), "CS1002: ; expected at 3:14");
        assert_eq!(Diagnostic::new("bad").to_string(), "bad");
    }

    #[test]
    fn panic_payloads_become_faults() {
        let fault = ScriptFault::from_panic(Box::new("boom"));
        assert_eq!(fault.message, "script panicked: boom");
        let fault = ScriptFault::from_panic(Box::new(String::from("owned")));
        assert_eq!(fault.message, "script panicked: owned");
        let fault = ScriptFault::from_panic(Box::new(7_u8));
        assert!(fault.message.contains("unknown"));
    }
}
