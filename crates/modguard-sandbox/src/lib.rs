#![warn(missing_docs)]

//! # modguard-sandbox
//!
//! Capability sandbox for untrusted mod scripts.
//!
//! A script gets an immutable [`PermissionSet`], is statically validated
//! against it before any of its code runs, and is then compiled and invoked
//! on an isolated worker under a watchdog that stops it at its deadline
//! whether or not it cooperates.
//!
//! ## Security model
//!
//! - **Escalation checks at construction**: a permission set that grants a
//!   category above its level never exists
//! - **Validation before compilation**: rejected sources never reach the compiler
//! - **Two-tier cancellation**: a cooperative token, then forced termination
//! - **Per-invocation budgets**: time and memory are enforced per worker
//! - **Bounded admission**: at most `max_concurrent` workers are outstanding,
//!   queued callers give up after `admission_timeout`, and forcibly
//!   terminated threads are capped separately so they cannot starve the queue
//! - **Typed capabilities**: host APIs are looked up by type, gated by category
//! - **Process isolation on demand**: [`ExecutionMode::ChildProcess`] trades
//!   IPC overhead for a real kill

pub mod audit;
pub mod capability;
pub mod config;
pub mod context;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod host;
pub mod ipc;
mod lexer;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod permissions;
pub mod policy;
pub mod result;
pub mod script;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod validator;
pub mod worker;

pub use audit::{
    EventSink, ExecutionRecord, ForcedTermination, JsonLinesEventSink, NoopEventSink,
    SandboxEvent, TerminationReason, TracingEventSink,
};
pub use capability::CapabilityMap;
pub use config::DefinitionError;
pub use context::{CancellationToken, MemoryMeter, ScriptContext};
pub use coordinator::{Coordinator, ExecutionRequest};
pub use error::{CapabilityError, EscalationError, MemoryLimitExceeded, SandboxError};
pub use executor::{ExecutionEngine, ExecutionMode, ExecutionState, SandboxConfig};
pub use permissions::{
    ApiCategory, ApiSet, PermissionBounds, PermissionLevel, PermissionSet, PermissionSetBuilder,
    Preset,
};
pub use policy::{is_api_allowed, is_namespace_allowed};
pub use result::{ErrorInfo, ErrorKind, ExecutionResult};
pub use script::{CompiledUnit, Diagnostic, ScriptCompiler, ScriptFault};
pub use session::SandboxContext;
pub use validator::{
    validate_source, SecurityViolation, SecurityWarning, SourceLocation, ValidationReport,
    ValidatorLimits, ViolationKind, WarningKind,
};
