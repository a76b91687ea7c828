//! Error types for the modguard sandbox.

use std::time::Duration;

use thiserror::Error;

use crate::permissions::{ApiCategory, PermissionLevel};

/// A permission set request that cannot be built.
///
/// Always fatal to that construction; nothing is partially applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum EscalationError {
    /// No script id (or a blank one) was supplied.
    #[error("permission set requires a non-empty script id")]
    MissingScriptId,

    /// An API category was requested below its minimum level.
    #[error("api category {category} requires permission level {required} or higher (requested at {actual})")]
    InsufficientLevel {
        /// The category that was requested.
        category: ApiCategory,
        /// Minimum level for that category.
        required: PermissionLevel,
        /// Level the request was made at.
        actual: PermissionLevel,
    },

    /// External assembly loading was requested below its minimum level.
    #[error("loading external assemblies requires permission level {required} or higher (requested at {actual})")]
    ExternalAssemblies {
        /// Minimum level.
        required: PermissionLevel,
        /// Level the request was made at.
        actual: PermissionLevel,
    },

    /// The timeout falls outside the configured bounds.
    #[error("execution timeout {requested:?} outside allowed range {min:?}..={max:?}")]
    TimeoutOutOfBounds {
        /// Requested timeout.
        requested: Duration,
        /// Lower bound.
        min: Duration,
        /// Upper bound.
        max: Duration,
    },

    /// The memory budget falls outside the configured bounds.
    #[error("memory budget {requested} bytes outside allowed range {min}..={max}")]
    MemoryOutOfBounds {
        /// Requested budget.
        requested: u64,
        /// Lower bound.
        min: u64,
        /// Upper bound.
        max: u64,
    },

    /// A namespace entry is empty or not a dotted identifier path.
    #[error("malformed namespace entry '{namespace}'")]
    InvalidNamespace {
        /// The offending entry.
        namespace: String,
    },
}

/// Infrastructure failures inside the execution engine.
///
/// These never escape the public execution API; they are folded into an
/// [`ExecutionResult`](crate::ExecutionResult) with
/// [`ErrorKind::Internal`](crate::ErrorKind::Internal).
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Generic execution failure.
    #[error("sandbox execution failed: {0}")]
    Execution(#[from] anyhow::Error),

    /// Worker IPC failed.
    #[error("worker ipc failed: {0}")]
    Ipc(#[from] std::io::Error),

    /// Result serialization failed.
    #[error("result serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// No admission slot freed up in time.
    #[error("no worker slot became free within {waited:?}")]
    AdmissionTimeout {
        /// How long the invocation queued.
        waited: Duration,
    },

    /// Too many forcibly terminated worker threads are still running.
    #[error("{abandoned} abandoned worker threads still running (limit {limit})")]
    TooManyAbandoned {
        /// Abandoned threads at the time of the request.
        abandoned: usize,
        /// The configured limit.
        limit: usize,
    },

    /// The worker executable could not be used.
    #[error("worker binary rejected: {reason}")]
    WorkerBinary {
        /// Why the binary was rejected.
        reason: String,
    },
}

/// A memory charge refused because it would exceed the script's budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("memory limit exceeded: {requested} bytes requested with {in_use} of {limit} bytes in use")]
pub struct MemoryLimitExceeded {
    /// Size of the refused charge.
    pub requested: u64,
    /// Bytes charged before the refused request.
    pub in_use: u64,
    /// The budget.
    pub limit: u64,
}

/// Errors from typed capability lookup and registration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[non_exhaustive]
pub enum CapabilityError {
    /// The script's permission set lacks the category the capability is filed under.
    #[error("capability {capability} requires api category {category}")]
    Denied {
        /// Type name of the requested capability.
        capability: &'static str,
        /// Category the capability is registered under.
        category: ApiCategory,
    },

    /// No provider registered the requested capability.
    #[error("capability {capability} is not registered")]
    NotRegistered {
        /// Type name of the requested capability.
        capability: &'static str,
    },

    /// A provider tried to register a capability type that already has one.
    #[error("capability {capability} already registered by '{existing}'")]
    Duplicate {
        /// Type name of the capability.
        capability: &'static str,
        /// Provider that registered it first.
        existing: String,
    },
}
