#![warn(missing_docs)]

//! # modguard-config
//!
//! Configuration loading for the modguard script sandbox.
//!
//! Supports TOML configuration files with environment variable expansion.
//! This crate only parses and validates the raw shape of the file; turning a
//! [`ScriptDefinition`] into an enforceable permission set happens in
//! `modguard-sandbox`, through the same builder every other caller uses.
//!
//! ## Example
//!
//! ```toml
//! [sandbox]
//! execution_mode = "child_process"
//! worker_program = "${GAME_HOME}/bin/modguard-worker"
//! max_concurrent = 4
//!
//! [bounds]
//! max_timeout_ms = 60000
//!
//! [scripts.weather_mod]
//! preset = "standard"
//! apis = ["GameStateRead", "Logging"]
//! allow_namespaces = ["Game"]
//! deny_namespaces = ["Game.Internal"]
//! timeout_ms = 500
//! ```

use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

/// Errors from config parsing.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file.
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    /// Failed to parse TOML.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Invalid configuration value.
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Top-level modguard configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModguardConfig {
    /// Engine and coordinator settings.
    #[serde(default)]
    pub sandbox: SandboxOverrides,

    /// Construction-time bounds for permission budgets.
    #[serde(default)]
    pub bounds: BoundsOverrides,

    /// Per-script permission definitions, keyed by script id.
    #[serde(default)]
    pub scripts: BTreeMap<String, ScriptDefinition>,
}

/// Sandbox runtime overrides. Unset fields keep the engine defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxOverrides {
    /// Execution mode: "in_process" (default) or "child_process".
    #[serde(default)]
    pub execution_mode: Option<String>,

    /// Worker executable for child-process mode. Must be an absolute path.
    #[serde(default)]
    pub worker_program: Option<String>,

    /// Maximum number of outstanding script workers.
    #[serde(default)]
    pub max_concurrent: Option<usize>,

    /// How long an invocation may wait for a free worker slot.
    #[serde(default)]
    pub admission_timeout_ms: Option<u64>,

    /// Forcibly terminated worker threads tolerated before new in-process
    /// invocations are refused.
    #[serde(default)]
    pub max_abandoned_workers: Option<usize>,

    /// Maximum script source size in bytes.
    #[serde(default)]
    pub max_source_size: Option<usize>,

    /// Maximum bracket nesting depth accepted by the validator.
    #[serde(default)]
    pub max_nesting_depth: Option<usize>,

    /// Branch count above which the validator emits a complexity warning.
    #[serde(default)]
    pub max_branch_complexity: Option<usize>,

    /// Watchdog memory sampling period in milliseconds.
    #[serde(default)]
    pub memory_sample_interval_ms: Option<u64>,

    /// Extra time granted to a child worker past its deadline before it is killed.
    #[serde(default)]
    pub kill_grace_ms: Option<u64>,

    /// Time a cooperatively cancelled script gets to return on its own.
    #[serde(default)]
    pub cancel_grace_ms: Option<u64>,

    /// Resident memory allowance for the worker process runtime itself.
    #[serde(default)]
    pub rss_baseline_bytes: Option<u64>,
}

/// Bounds applied when permission sets are built.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BoundsOverrides {
    /// Smallest accepted execution timeout.
    #[serde(default)]
    pub min_timeout_ms: Option<u64>,
    /// Largest accepted execution timeout.
    #[serde(default)]
    pub max_timeout_ms: Option<u64>,
    /// Smallest accepted memory budget.
    #[serde(default)]
    pub min_memory_bytes: Option<u64>,
    /// Largest accepted memory budget.
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,
}

/// Permission definition for one script, as written in the config file.
///
/// Every field is optional; a definition without a preset starts from an
/// empty `Restricted`-level set.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ScriptDefinition {
    /// Starting preset: "restricted", "standard", "elevated" or "unrestricted".
    #[serde(default)]
    pub preset: Option<String>,

    /// Permission level name, overriding the preset's level.
    #[serde(default)]
    pub level: Option<String>,

    /// API categories added on top of the preset.
    #[serde(default)]
    pub apis: Vec<String>,

    /// API categories removed from the preset.
    #[serde(default)]
    pub deny_apis: Vec<String>,

    /// Namespaces added to the allow list.
    #[serde(default)]
    pub allow_namespaces: Vec<String>,

    /// Namespaces added to the deny list.
    #[serde(default)]
    pub deny_namespaces: Vec<String>,

    /// Execution timeout in milliseconds.
    #[serde(default)]
    pub timeout_ms: Option<u64>,

    /// Memory budget in bytes.
    #[serde(default)]
    pub max_memory_bytes: Option<u64>,

    /// Whether the script may load external assemblies.
    #[serde(default)]
    pub external_assemblies: Option<bool>,
}

impl ModguardConfig {
    /// Parse a config from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self, ConfigError> {
        let config: ModguardConfig = toml::from_str(toml_str)?;
        config.validate()?;
        Ok(config)
    }

    /// Load config from a file path.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse a config from a TOML string, expanding `${ENV_VAR}` references.
    pub fn from_toml_with_env(toml_str: &str) -> Result<Self, ConfigError> {
        let expanded = expand_env_vars(toml_str);
        Self::from_toml(&expanded)
    }

    /// Load config from a file path, expanding environment variables.
    pub fn from_file_with_env(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_with_env(&content)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let sandbox = &self.sandbox;
        match sandbox.execution_mode.as_deref() {
            None | Some("in_process") => {}
            Some("child_process") => match sandbox.worker_program.as_deref() {
                None => {
                    return Err(ConfigError::Invalid(
                        "child_process execution mode requires 'worker_program'".into(),
                    ))
                }
                Some(path) if !Path::new(path).is_absolute() => {
                    return Err(ConfigError::Invalid(format!(
                        "worker_program must be an absolute path, got '{path}'"
                    )))
                }
                Some(_) => {}
            },
            Some(other) => {
                return Err(ConfigError::Invalid(format!(
                    "unsupported execution_mode '{other}', supported: in_process, child_process"
                )))
            }
        }

        if sandbox.max_concurrent == Some(0) {
            return Err(ConfigError::Invalid("max_concurrent must be at least 1".into()));
        }
        if sandbox.admission_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "admission_timeout_ms must be at least 1".into(),
            ));
        }
        if sandbox.memory_sample_interval_ms == Some(0) {
            return Err(ConfigError::Invalid(
                "memory_sample_interval_ms must be at least 1".into(),
            ));
        }

        let bounds = &self.bounds;
        if let (Some(min), Some(max)) = (bounds.min_timeout_ms, bounds.max_timeout_ms) {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "min_timeout_ms ({min}) exceeds max_timeout_ms ({max})"
                )));
            }
        }
        if let (Some(min), Some(max)) = (bounds.min_memory_bytes, bounds.max_memory_bytes) {
            if min > max {
                return Err(ConfigError::Invalid(format!(
                    "min_memory_bytes ({min}) exceeds max_memory_bytes ({max})"
                )));
            }
        }

        for (id, script) in &self.scripts {
            if id.trim().is_empty() {
                return Err(ConfigError::Invalid("script id must not be empty".into()));
            }
            if let Some(preset) = script.preset.as_deref() {
                if !matches!(
                    preset,
                    "restricted" | "standard" | "elevated" | "unrestricted"
                ) {
                    return Err(ConfigError::Invalid(format!(
                        "script '{id}': unknown preset '{preset}'"
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Replace each `${NAME}` with the value of environment variable `NAME`.
///
/// Unset variables and an unterminated `${` are left as written, so
/// validation reports the literal reference.
fn expand_env_vars(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(open) = rest.find("${") {
        out.push_str(&rest[..open]);
        let after = &rest[open + 2..];
        let Some(close) = after.find('}') else {
            rest = &rest[open..];
            break;
        };
        let name = &after[..close];
        match std::env::var(name) {
            Ok(value) => out.push_str(&value),
            Err(_) => out.push_str(&rest[open..open + close + 3]),
        }
        rest = &after[close + 1..];
    }
    out.push_str(rest);
    out
}
