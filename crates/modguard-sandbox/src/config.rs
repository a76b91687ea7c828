//! Bridges `modguard-config` files into engine settings and permission sets.
//!
//! Script definitions go through [`PermissionSetBuilder`], so a config file
//! is held to the same escalation rules as code.

use std::path::PathBuf;
use std::time::Duration;

use modguard_config::{BoundsOverrides, ModguardConfig, SandboxOverrides, ScriptDefinition};
use thiserror::Error;

use crate::error::EscalationError;
use crate::executor::{ExecutionMode, SandboxConfig};
use crate::permissions::{
    ApiCategory, PermissionBounds, PermissionLevel, PermissionSet, PermissionSetBuilder, Preset,
};
use crate::session::SandboxContext;

/// A script definition that cannot become a permission set.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// A preset, level or api name is not recognised.
    #[error("script '{script_id}': {message}")]
    UnknownName {
        /// The definition's script id.
        script_id: String,
        /// What failed to parse.
        message: String,
    },

    /// The definition asks for more than its level allows.
    #[error("script '{script_id}': {source}")]
    Escalation {
        /// The definition's script id.
        script_id: String,
        /// The builder's refusal.
        #[source]
        source: EscalationError,
    },
}

impl SandboxConfig {
    /// Defaults with every set override applied.
    pub fn from_overrides(overrides: &SandboxOverrides) -> Self {
        let mut config = Self::default();
        if overrides.execution_mode.as_deref() == Some("child_process") {
            if let Some(program) = &overrides.worker_program {
                config.execution_mode = ExecutionMode::ChildProcess {
                    program: PathBuf::from(program),
                };
            }
        }
        if let Some(concurrent) = overrides.max_concurrent {
            config.max_concurrent = concurrent;
        }
        if let Some(ms) = overrides.admission_timeout_ms {
            config.admission_timeout = Duration::from_millis(ms);
        }
        if let Some(abandoned) = overrides.max_abandoned_workers {
            config.max_abandoned_workers = abandoned;
        }
        if let Some(size) = overrides.max_source_size {
            config.max_source_size = size;
        }
        if let Some(depth) = overrides.max_nesting_depth {
            config.max_nesting_depth = depth;
        }
        if let Some(branches) = overrides.max_branch_complexity {
            config.max_branch_complexity = branches;
        }
        if let Some(ms) = overrides.memory_sample_interval_ms {
            config.memory_sample_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.kill_grace_ms {
            config.kill_grace = Duration::from_millis(ms);
        }
        if let Some(ms) = overrides.cancel_grace_ms {
            config.cancel_grace = Duration::from_millis(ms);
        }
        if let Some(bytes) = overrides.rss_baseline_bytes {
            config.rss_baseline = bytes;
        }
        config
    }
}

/// Engine settings from a parsed config file.
pub fn sandbox_config(config: &ModguardConfig) -> SandboxConfig {
    SandboxConfig::from_overrides(&config.sandbox)
}

/// Default bounds with every set override applied.
pub fn permission_bounds(overrides: &BoundsOverrides) -> PermissionBounds {
    let mut bounds = PermissionBounds::default();
    if let Some(ms) = overrides.min_timeout_ms {
        bounds.min_timeout = Duration::from_millis(ms);
    }
    if let Some(ms) = overrides.max_timeout_ms {
        bounds.max_timeout = Duration::from_millis(ms);
    }
    if let Some(bytes) = overrides.min_memory_bytes {
        bounds.min_memory_bytes = bytes;
    }
    if let Some(bytes) = overrides.max_memory_bytes {
        bounds.max_memory_bytes = bytes;
    }
    bounds
}

/// Build the permission set a config file describes for `script_id`.
///
/// Without a preset the definition starts from an empty `Restricted` set.
pub fn permission_set(
    script_id: &str,
    definition: &ScriptDefinition,
    bounds: PermissionBounds,
) -> Result<PermissionSet, DefinitionError> {
    let unknown = |message: String| DefinitionError::UnknownName {
        script_id: script_id.to_string(),
        message,
    };

    let mut builder = match definition.preset.as_deref() {
        Some(name) => name.parse::<Preset>().map_err(unknown)?.builder(script_id),
        None => PermissionSetBuilder::new()
            .with_script_id(script_id)
            .with_level(PermissionLevel::Restricted),
    };
    if let Some(level) = definition.level.as_deref() {
        builder = builder.with_level(level.parse::<PermissionLevel>().map_err(unknown)?);
    }
    for name in &definition.apis {
        builder = builder.allow_api(name.parse::<ApiCategory>().map_err(unknown)?);
    }
    for name in &definition.deny_apis {
        builder = builder.deny_api(name.parse::<ApiCategory>().map_err(unknown)?);
    }
    for namespace in &definition.allow_namespaces {
        builder = builder.allow_namespace(namespace.as_str());
    }
    for namespace in &definition.deny_namespaces {
        builder = builder.deny_namespace(namespace.as_str());
    }
    if let Some(ms) = definition.timeout_ms {
        builder = builder.with_timeout(Duration::from_millis(ms));
    }
    if let Some(bytes) = definition.max_memory_bytes {
        builder = builder.with_max_memory(bytes);
    }
    if let Some(allowed) = definition.external_assemblies {
        builder = builder.with_external_assemblies(allowed);
    }

    builder
        .with_bounds(bounds)
        .build()
        .map_err(|source| DefinitionError::Escalation {
            script_id: script_id.to_string(),
            source,
        })
}

/// Build and register every script in `config`.
///
/// All definitions are built before any is registered; one bad definition
/// leaves `context` untouched.
pub fn load_scripts(
    config: &ModguardConfig,
    context: &SandboxContext,
) -> Result<usize, DefinitionError> {
    let bounds = permission_bounds(&config.bounds);
    let sets = config
        .scripts
        .iter()
        .map(|(id, definition)| permission_set(id, definition, bounds))
        .collect::<Result<Vec<_>, _>>()?;
    let count = sets.len();
    for set in sets {
        context.register_script(set);
    }
    tracing::info!(scripts = count, "script permissions loaded");
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::is_namespace_allowed;

    fn parse(toml: &str) -> ModguardConfig {
        ModguardConfig::from_toml(toml).unwrap()
    }

    #[test]
    fn overrides_default_to_engine_defaults() {
        let config = SandboxConfig::from_overrides(&SandboxOverrides::default());
        let default = SandboxConfig::default();
        assert_eq!(config.execution_mode, default.execution_mode);
        assert_eq!(config.max_concurrent, default.max_concurrent);
        assert_eq!(config.kill_grace, default.kill_grace);
        assert_eq!(config.rss_baseline, default.rss_baseline);
    }

    #[test]
    fn overrides_apply() {
        let config = sandbox_config(&parse(
            r#"
            [sandbox]
            execution_mode = "child_process"
            worker_program = "/opt/game/modguard-worker"
            max_concurrent = 2
            memory_sample_interval_ms = 5
            cancel_grace_ms = 40
            admission_timeout_ms = 750
            max_abandoned_workers = 3
            "#,
        ));
        assert_eq!(
            config.execution_mode,
            ExecutionMode::ChildProcess {
                program: PathBuf::from("/opt/game/modguard-worker")
            }
        );
        assert_eq!(config.max_concurrent, 2);
        assert_eq!(config.memory_sample_interval, Duration::from_millis(5));
        assert_eq!(config.cancel_grace, Duration::from_millis(40));
        assert_eq!(config.admission_timeout, Duration::from_millis(750));
        assert_eq!(config.max_abandoned_workers, 3);
    }

    #[test]
    fn preset_definition_matches_preset() {
        let config = parse("[scripts.weather]\npreset = \"standard\"\n");
        let set = permission_set(
            "weather",
            &config.scripts["weather"],
            PermissionBounds::default(),
        )
        .unwrap();
        assert_eq!(set, Preset::Standard.build("weather").unwrap());
    }

    #[test]
    fn definition_layers_on_preset() {
        let config = parse(
            r#"
            [scripts.weather]
            preset = "standard"
            deny_apis = ["Random"]
            allow_namespaces = ["Game"]
            deny_namespaces = ["Game.Internal"]
            timeout_ms = 500
            "#,
        );
        let set = permission_set(
            "weather",
            &config.scripts["weather"],
            PermissionBounds::default(),
        )
        .unwrap();
        assert!(!set.allowed_apis().contains(ApiCategory::Random));
        assert_eq!(set.max_execution_time(), Duration::from_millis(500));
        assert!(is_namespace_allowed(&set, "Game.World"));
        assert!(!is_namespace_allowed(&set, "Game.Internal.Saves"));
    }

    #[test]
    fn config_cannot_escalate() {
        let config = parse("[scripts.sneaky]\npreset = \"standard\"\napis = [\"FileIO\"]\n");
        let err = permission_set(
            "sneaky",
            &config.scripts["sneaky"],
            PermissionBounds::default(),
        )
        .unwrap_err();
        assert!(matches!(
            err,
            DefinitionError::Escalation {
                source: EscalationError::InsufficientLevel { .. },
                ..
            }
        ));
        assert!(err.to_string().contains("sneaky"));
    }

    #[test]
    fn unknown_api_name_is_reported() {
        let config = parse("[scripts.a]\napis = [\"Telepathy\"]\n");
        let err =
            permission_set("a", &config.scripts["a"], PermissionBounds::default()).unwrap_err();
        assert!(err.to_string().contains("Telepathy"), "{err}");
    }

    #[test]
    fn bounds_come_from_config() {
        let config = parse(
            "[bounds]\nmax_timeout_ms = 1000\n\n[scripts.a]\npreset = \"restricted\"\ntimeout_ms = 2000\n",
        );
        let bounds = permission_bounds(&config.bounds);
        assert_eq!(bounds.max_timeout, Duration::from_secs(1));
        let err = permission_set("a", &config.scripts["a"], bounds).unwrap_err();
        assert!(matches!(
            err,
            DefinitionError::Escalation {
                source: EscalationError::TimeoutOutOfBounds { .. },
                ..
            }
        ));
    }

    #[test]
    fn load_scripts_is_all_or_nothing() {
        let context = SandboxContext::new();
        let bad = parse(
            "[scripts.good]\npreset = \"restricted\"\n\n[scripts.bad]\napis = [\"Unsafe\"]\n",
        );
        assert!(load_scripts(&bad, &context).is_err());
        assert!(context.script_ids().is_empty());

        let good = parse("[scripts.a]\npreset = \"restricted\"\n\n[scripts.b]\npreset = \"elevated\"\n");
        assert_eq!(load_scripts(&good, &context).unwrap(), 2);
        assert_eq!(context.script_ids(), vec!["a", "b"]);
        assert_eq!(
            context.permissions("b").unwrap().level(),
            PermissionLevel::Elevated
        );
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("modguard.toml");
        std::fs::write(&path, "[scripts.weather]\npreset = \"standard\"\ntimeout_ms = 250\n")
            .unwrap();
        let config = ModguardConfig::from_file(&path).unwrap();
        let context = SandboxContext::new();
        load_scripts(&config, &context).unwrap();
        assert_eq!(
            context.permissions("weather").unwrap().max_execution_time(),
            Duration::from_millis(250)
        );
    }
}
