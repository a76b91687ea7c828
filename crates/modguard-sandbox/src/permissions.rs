//! Permission model: trust levels, API categories, and immutable permission sets.
//!
//! A [`PermissionSet`] is created once per script at load time through
//! [`PermissionSetBuilder`], which re-checks every invariant in `build()`.
//! There is no way to obtain a partially-valid instance: deserialization goes
//! through the same builder.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::EscalationError;

/// Ordered trust level of a script.
///
/// Higher levels express broader intent but never grant API categories on
/// their own; categories must still be requested explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PermissionLevel {
    /// No trust at all.
    None,
    /// Sandboxed gameplay logic with a minimal API surface.
    Restricted,
    /// May observe but not mutate host state.
    ReadOnly,
    /// Regular mod scripts.
    Standard,
    /// Trusted scripts that may touch files, network, reflection and threads.
    Elevated,
    /// Fully trusted; the only level that may be granted `Unsafe`.
    Unrestricted,
}

impl PermissionLevel {
    /// Every level, lowest first.
    pub const ALL: [PermissionLevel; 6] = [
        Self::None,
        Self::Restricted,
        Self::ReadOnly,
        Self::Standard,
        Self::Elevated,
        Self::Unrestricted,
    ];

    /// Canonical lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Restricted => "restricted",
            Self::ReadOnly => "read_only",
            Self::Standard => "standard",
            Self::Elevated => "elevated",
            Self::Unrestricted => "unrestricted",
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = normalize_name(s);
        Self::ALL
            .into_iter()
            .find(|level| normalize_name(level.as_str()) == key)
            .ok_or_else(|| format!("unknown permission level '{s}'"))
    }
}

/// A named bucket of host functionality.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ApiCategory {
    /// Language core. Always granted.
    Core,
    /// Collections and LINQ-style helpers.
    Collections,
    /// Reading game state.
    GameStateRead,
    /// Mutating game state.
    GameStateWrite,
    /// Structured logging.
    Logging,
    /// Random number generation.
    Random,
    /// Clocks and calendars.
    DateTime,
    /// JSON/XML serialization.
    Serialization,
    /// Filesystem access.
    FileIO,
    /// Network access.
    Network,
    /// Runtime reflection.
    Reflection,
    /// Thread and task creation.
    Threading,
    /// Pointers, unsafe blocks and native interop.
    Unsafe,
}

impl ApiCategory {
    /// Every category in declaration order.
    pub const ALL: [ApiCategory; 13] = [
        Self::Core,
        Self::Collections,
        Self::GameStateRead,
        Self::GameStateWrite,
        Self::Logging,
        Self::Random,
        Self::DateTime,
        Self::Serialization,
        Self::FileIO,
        Self::Network,
        Self::Reflection,
        Self::Threading,
        Self::Unsafe,
    ];

    const fn bit(self) -> u16 {
        1 << (self as u16)
    }

    /// Minimum level a script needs before this category may be granted.
    pub fn minimum_level(self) -> PermissionLevel {
        match self {
            Self::FileIO | Self::Network | Self::Reflection | Self::Threading => {
                PermissionLevel::Elevated
            }
            Self::Unsafe => PermissionLevel::Unrestricted,
            _ => PermissionLevel::None,
        }
    }

    /// Canonical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Core => "Core",
            Self::Collections => "Collections",
            Self::GameStateRead => "GameStateRead",
            Self::GameStateWrite => "GameStateWrite",
            Self::Logging => "Logging",
            Self::Random => "Random",
            Self::DateTime => "DateTime",
            Self::Serialization => "Serialization",
            Self::FileIO => "FileIO",
            Self::Network => "Network",
            Self::Reflection => "Reflection",
            Self::Threading => "Threading",
            Self::Unsafe => "Unsafe",
        }
    }
}

impl fmt::Display for ApiCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ApiCategory {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = normalize_name(s);
        Self::ALL
            .into_iter()
            .find(|category| normalize_name(category.as_str()) == key)
            .ok_or_else(|| format!("unknown api category '{s}'"))
    }
}

fn normalize_name(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

/// Set of [`ApiCategory`] flags stored as a bitmask.
///
/// `Core` is always a member.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ApiSet(u16);

impl ApiSet {
    /// The set containing only `Core`.
    pub const CORE: Self = Self(ApiCategory::Core.bit());

    /// Every category, including `Unsafe`.
    pub fn all() -> Self {
        ApiCategory::ALL.into_iter().collect()
    }

    /// Whether `category` is a member.
    pub const fn contains(&self, category: ApiCategory) -> bool {
        self.0 & category.bit() != 0
    }

    /// Add a category.
    pub fn insert(&mut self, category: ApiCategory) {
        self.0 |= category.bit();
    }

    /// Remove a category. `Core` cannot be removed.
    pub fn remove(&mut self, category: ApiCategory) {
        if category != ApiCategory::Core {
            self.0 &= !category.bit();
        }
    }

    /// Returns this set plus `category`.
    pub fn with(mut self, category: ApiCategory) -> Self {
        self.insert(category);
        self
    }

    /// Union of two sets.
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    /// Members in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = ApiCategory> + '_ {
        ApiCategory::ALL.into_iter().filter(|c| self.contains(*c))
    }

    /// Raw bitmask.
    pub const fn bits(&self) -> u16 {
        self.0
    }
}

impl Default for ApiSet {
    fn default() -> Self {
        Self::CORE
    }
}

impl fmt::Debug for ApiSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

impl FromIterator<ApiCategory> for ApiSet {
    fn from_iter<I: IntoIterator<Item = ApiCategory>>(iter: I) -> Self {
        let mut set = Self::CORE;
        for category in iter {
            set.insert(category);
        }
        set
    }
}

impl Serialize for ApiSet {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(self.iter())
    }
}

impl<'de> Deserialize<'de> for ApiSet {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let categories = Vec::<ApiCategory>::deserialize(deserializer)?;
        Ok(categories.into_iter().collect())
    }
}

/// Construction-time bounds for execution budgets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionBounds {
    /// Smallest accepted timeout.
    pub min_timeout: Duration,
    /// Largest accepted timeout.
    pub max_timeout: Duration,
    /// Smallest accepted memory budget.
    pub min_memory_bytes: u64,
    /// Largest accepted memory budget.
    pub max_memory_bytes: u64,
}

impl Default for PermissionBounds {
    fn default() -> Self {
        Self {
            min_timeout: Duration::from_millis(1),
            max_timeout: Duration::from_secs(5 * 60),
            min_memory_bytes: 1,
            max_memory_bytes: 1024 * 1024 * 1024, // 1 GiB
        }
    }
}

/// Immutable description of what one script may do and consume.
///
/// Built with [`PermissionSetBuilder`] or one of the presets; equality is by
/// value, so two builds of the same request compare equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "PermissionSpec", into = "PermissionSpec")]
pub struct PermissionSet {
    script_id: String,
    level: PermissionLevel,
    allowed_apis: ApiSet,
    allowed_namespaces: BTreeSet<String>,
    denied_namespaces: BTreeSet<String>,
    max_execution_time: Duration,
    max_memory_bytes: u64,
    can_load_external_assemblies: bool,
    bounds: PermissionBounds,
}

impl PermissionSet {
    /// Start a new builder.
    pub fn builder() -> PermissionSetBuilder {
        PermissionSetBuilder::new()
    }

    /// The `Restricted` preset.
    pub fn restricted(script_id: impl Into<String>) -> Result<Self, EscalationError> {
        Preset::Restricted.build(script_id)
    }

    /// The `Standard` preset.
    pub fn standard(script_id: impl Into<String>) -> Result<Self, EscalationError> {
        Preset::Standard.build(script_id)
    }

    /// The `Elevated` preset.
    pub fn elevated(script_id: impl Into<String>) -> Result<Self, EscalationError> {
        Preset::Elevated.build(script_id)
    }

    /// The explicit `Unrestricted` preset.
    pub fn unrestricted(script_id: impl Into<String>) -> Result<Self, EscalationError> {
        Preset::Unrestricted.build(script_id)
    }

    /// Script this set belongs to.
    pub fn script_id(&self) -> &str {
        &self.script_id
    }

    /// Trust level.
    pub fn level(&self) -> PermissionLevel {
        self.level
    }

    /// Granted API categories (always includes `Core`).
    pub fn allowed_apis(&self) -> ApiSet {
        self.allowed_apis
    }

    /// Allow-list of namespaces. Empty means "everything not denied".
    pub fn allowed_namespaces(&self) -> &BTreeSet<String> {
        &self.allowed_namespaces
    }

    /// Deny-list of namespaces. Takes precedence over the allow-list.
    pub fn denied_namespaces(&self) -> &BTreeSet<String> {
        &self.denied_namespaces
    }

    /// Wall-clock budget per invocation.
    pub fn max_execution_time(&self) -> Duration {
        self.max_execution_time
    }

    /// Memory budget per invocation.
    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_bytes
    }

    /// Whether `Assembly.Load*` style calls are permitted.
    pub fn can_load_external_assemblies(&self) -> bool {
        self.can_load_external_assemblies
    }

    /// Bounds this set was validated against.
    pub fn bounds(&self) -> PermissionBounds {
        self.bounds
    }

    /// A builder seeded with every field of this set.
    pub fn to_builder(&self) -> PermissionSetBuilder {
        PermissionSetBuilder {
            script_id: Some(self.script_id.clone()),
            level: self.level,
            allowed_apis: self.allowed_apis,
            allowed_namespaces: self.allowed_namespaces.clone(),
            denied_namespaces: self.denied_namespaces.clone(),
            timeout: self.max_execution_time,
            max_memory_bytes: self.max_memory_bytes,
            external_assemblies: self.can_load_external_assemblies,
            bounds: self.bounds,
        }
    }
}

/// Builder for [`PermissionSet`]. All validation happens in [`build`](Self::build).
#[derive(Debug, Clone)]
pub struct PermissionSetBuilder {
    script_id: Option<String>,
    level: PermissionLevel,
    allowed_apis: ApiSet,
    allowed_namespaces: BTreeSet<String>,
    denied_namespaces: BTreeSet<String>,
    timeout: Duration,
    max_memory_bytes: u64,
    external_assemblies: bool,
    bounds: PermissionBounds,
}

impl Default for PermissionSetBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionSetBuilder {
    /// Default timeout when none is requested.
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);
    /// Default memory budget when none is requested.
    pub const DEFAULT_MAX_MEMORY: u64 = 64 * 1024 * 1024;

    /// A builder at level `None` with only `Core` granted.
    pub fn new() -> Self {
        Self {
            script_id: None,
            level: PermissionLevel::None,
            allowed_apis: ApiSet::CORE,
            allowed_namespaces: BTreeSet::new(),
            denied_namespaces: BTreeSet::new(),
            timeout: Self::DEFAULT_TIMEOUT,
            max_memory_bytes: Self::DEFAULT_MAX_MEMORY,
            external_assemblies: false,
            bounds: PermissionBounds::default(),
        }
    }

    /// Set the owning script id.
    pub fn with_script_id(mut self, id: impl Into<String>) -> Self {
        self.script_id = Some(id.into());
        self
    }

    /// Set the trust level.
    pub fn with_level(mut self, level: PermissionLevel) -> Self {
        self.level = level;
        self
    }

    /// Replace the granted API categories. `Core` is always kept.
    pub fn with_apis(mut self, apis: impl IntoIterator<Item = ApiCategory>) -> Self {
        self.allowed_apis = apis.into_iter().collect();
        self
    }

    /// Grant one category.
    pub fn allow_api(mut self, category: ApiCategory) -> Self {
        self.allowed_apis.insert(category);
        self
    }

    /// Revoke one category.
    pub fn deny_api(mut self, category: ApiCategory) -> Self {
        self.allowed_apis.remove(category);
        self
    }

    /// Add a namespace to the allow-list.
    pub fn allow_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.allowed_namespaces.insert(namespace.into().trim().to_string());
        self
    }

    /// Add a namespace to the deny-list.
    pub fn deny_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.denied_namespaces.insert(namespace.into().trim().to_string());
        self
    }

    /// Remove a deny-list entry, such as one inherited from a preset.
    ///
    /// Only the entry naming exactly `namespace` (ignoring case) is removed;
    /// denials of narrower or wider namespaces stay. A namespace owned by a
    /// gated API category still needs that category granted.
    pub fn clear_denied_namespace(mut self, namespace: &str) -> Self {
        let namespace = namespace.trim();
        self.denied_namespaces.retain(|entry| {
            !(crate::policy::namespace_matches(entry, namespace)
                && crate::policy::namespace_matches(namespace, entry))
        });
        self
    }

    /// Set the wall-clock budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the memory budget.
    pub fn with_max_memory(mut self, bytes: u64) -> Self {
        self.max_memory_bytes = bytes;
        self
    }

    /// Allow or forbid loading external assemblies.
    pub fn with_external_assemblies(mut self, allowed: bool) -> Self {
        self.external_assemblies = allowed;
        self
    }

    /// Validate budgets against custom bounds instead of the defaults.
    pub fn with_bounds(mut self, bounds: PermissionBounds) -> Self {
        self.bounds = bounds;
        self
    }

    /// Validate every invariant and produce the immutable set.
    ///
    /// Fails on the first broken invariant; requested capabilities are never
    /// silently dropped or downgraded.
    pub fn build(self) -> Result<PermissionSet, EscalationError> {
        let script_id = match self.script_id {
            Some(id) if !id.trim().is_empty() => id,
            _ => return Err(EscalationError::MissingScriptId),
        };

        for category in self.allowed_apis.iter() {
            let required = category.minimum_level();
            if self.level < required {
                return Err(EscalationError::InsufficientLevel {
                    category,
                    required,
                    actual: self.level,
                });
            }
        }

        if self.external_assemblies && self.level < PermissionLevel::Elevated {
            return Err(EscalationError::ExternalAssemblies {
                required: PermissionLevel::Elevated,
                actual: self.level,
            });
        }

        let bounds = self.bounds;
        if self.timeout < bounds.min_timeout || self.timeout > bounds.max_timeout {
            return Err(EscalationError::TimeoutOutOfBounds {
                requested: self.timeout,
                min: bounds.min_timeout,
                max: bounds.max_timeout,
            });
        }
        if self.max_memory_bytes < bounds.min_memory_bytes
            || self.max_memory_bytes > bounds.max_memory_bytes
        {
            return Err(EscalationError::MemoryOutOfBounds {
                requested: self.max_memory_bytes,
                min: bounds.min_memory_bytes,
                max: bounds.max_memory_bytes,
            });
        }

        for namespace in self.allowed_namespaces.iter().chain(&self.denied_namespaces) {
            if !is_well_formed_namespace(namespace) {
                return Err(EscalationError::InvalidNamespace {
                    namespace: namespace.clone(),
                });
            }
        }

        Ok(PermissionSet {
            script_id,
            level: self.level,
            allowed_apis: self.allowed_apis,
            allowed_namespaces: self.allowed_namespaces,
            denied_namespaces: self.denied_namespaces,
            max_execution_time: self.timeout,
            max_memory_bytes: self.max_memory_bytes,
            can_load_external_assemblies: self.external_assemblies,
            bounds,
        })
    }
}

fn is_well_formed_namespace(namespace: &str) -> bool {
    !namespace.is_empty()
        && namespace.split('.').all(|segment| {
            !segment.is_empty()
                && segment
                    .chars()
                    .all(|c| c.is_alphanumeric() || c == '_' || c == '`')
        })
}

/// Namespaces denied by the lower-trust presets.
pub const SENSITIVE_NAMESPACES: &[&str] = &[
    "System.IO",
    "System.Net",
    "System.Reflection",
    "System.Threading",
    "System.Diagnostics.Process",
    "System.Runtime.InteropServices",
];

/// Named starting points for permission sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Preset {
    /// Minimal gameplay logic.
    Restricted,
    /// Regular mods.
    Standard,
    /// Trusted tooling mods.
    Elevated,
    /// Everything, including `Unsafe` and external assemblies.
    Unrestricted,
}

impl Preset {
    /// A builder pre-populated with this preset's fields.
    pub fn builder(self, script_id: impl Into<String>) -> PermissionSetBuilder {
        use ApiCategory::*;

        let builder = PermissionSet::builder().with_script_id(script_id);
        match self {
            Self::Restricted => SENSITIVE_NAMESPACES
                .iter()
                .fold(builder, |b, ns| b.deny_namespace(*ns))
                .with_level(PermissionLevel::Restricted)
                .with_apis([Core, Collections, Logging])
                .with_timeout(Duration::from_secs(1))
                .with_max_memory(16 * 1024 * 1024),
            Self::Standard => SENSITIVE_NAMESPACES
                .iter()
                .fold(builder, |b, ns| b.deny_namespace(*ns))
                .with_level(PermissionLevel::Standard)
                .with_apis([
                    Core,
                    Collections,
                    GameStateRead,
                    GameStateWrite,
                    Logging,
                    Random,
                    DateTime,
                    Serialization,
                ])
                .with_timeout(Duration::from_secs(5))
                .with_max_memory(64 * 1024 * 1024),
            Self::Elevated => builder
                .with_level(PermissionLevel::Elevated)
                .with_apis([
                    Core,
                    Collections,
                    GameStateRead,
                    GameStateWrite,
                    Logging,
                    Random,
                    DateTime,
                    Serialization,
                    FileIO,
                    Network,
                    Reflection,
                    Threading,
                ])
                .deny_namespace("System.Diagnostics.Process")
                .deny_namespace("System.Runtime.InteropServices")
                .deny_namespace("System.Reflection.Emit")
                .with_timeout(Duration::from_secs(30))
                .with_max_memory(256 * 1024 * 1024),
            Self::Unrestricted => builder
                .with_level(PermissionLevel::Unrestricted)
                .with_apis(ApiCategory::ALL)
                .with_external_assemblies(true)
                .with_timeout(Duration::from_secs(5 * 60))
                .with_max_memory(1024 * 1024 * 1024),
        }
    }

    /// Build this preset for `script_id` with default bounds.
    pub fn build(self, script_id: impl Into<String>) -> Result<PermissionSet, EscalationError> {
        self.builder(script_id).build()
    }
}

impl FromStr for Preset {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match normalize_name(s).as_str() {
            "restricted" => Ok(Self::Restricted),
            "standard" => Ok(Self::Standard),
            "elevated" => Ok(Self::Elevated),
            "unrestricted" => Ok(Self::Unrestricted),
            _ => Err(format!("unknown preset '{s}'")),
        }
    }
}

/// Plain serialized form of a [`PermissionSet`]; converted back through the builder.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct PermissionSpec {
    script_id: String,
    level: PermissionLevel,
    allowed_apis: ApiSet,
    allowed_namespaces: BTreeSet<String>,
    denied_namespaces: BTreeSet<String>,
    max_execution_time: Duration,
    max_memory_bytes: u64,
    can_load_external_assemblies: bool,
    bounds: PermissionBounds,
}

impl From<PermissionSet> for PermissionSpec {
    fn from(set: PermissionSet) -> Self {
        Self {
            script_id: set.script_id,
            level: set.level,
            allowed_apis: set.allowed_apis,
            allowed_namespaces: set.allowed_namespaces,
            denied_namespaces: set.denied_namespaces,
            max_execution_time: set.max_execution_time,
            max_memory_bytes: set.max_memory_bytes,
            can_load_external_assemblies: set.can_load_external_assemblies,
            bounds: set.bounds,
        }
    }
}

impl TryFrom<PermissionSpec> for PermissionSet {
    type Error = EscalationError;

    fn try_from(spec: PermissionSpec) -> Result<Self, Self::Error> {
        let builder = spec
            .allowed_namespaces
            .into_iter()
            .fold(PermissionSet::builder(), |b, ns| b.allow_namespace(ns));
        spec.denied_namespaces
            .into_iter()
            .fold(builder, |b, ns| b.deny_namespace(ns))
            .with_script_id(spec.script_id)
            .with_level(spec.level)
            .with_apis(spec.allowed_apis.iter())
            .with_timeout(spec.max_execution_time)
            .with_max_memory(spec.max_memory_bytes)
            .with_external_assemblies(spec.can_load_external_assemblies)
            .with_bounds(spec.bounds)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ELEVATED_ONLY: [ApiCategory; 4] = [
        ApiCategory::FileIO,
        ApiCategory::Network,
        ApiCategory::Reflection,
        ApiCategory::Threading,
    ];

    fn base(level: PermissionLevel) -> PermissionSetBuilder {
        PermissionSet::builder()
            .with_script_id("test-script")
            .with_level(level)
    }

    #[test]
    fn levels_are_totally_ordered() {
        for pair in PermissionLevel::ALL.windows(2) {
            assert!(pair[0] < pair[1], "{} should be below {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn elevated_categories_require_elevated_level() {
        for category in ELEVATED_ONLY {
            for level in PermissionLevel::ALL {
                let result = base(level).allow_api(category).build();
                if level < PermissionLevel::Elevated {
                    match result {
                        Err(EscalationError::InsufficientLevel { category: c, required, .. }) => {
                            assert_eq!(c, category);
                            assert_eq!(required, PermissionLevel::Elevated);
                        }
                        other => panic!("{category} at {level} should fail, got {other:?}"),
                    }
                } else {
                    assert!(result.is_ok(), "{category} at {level} should build");
                }
            }
        }
    }

    #[test]
    fn unsafe_requires_unrestricted() {
        for level in PermissionLevel::ALL {
            let result = base(level).allow_api(ApiCategory::Unsafe).build();
            assert_eq!(result.is_ok(), level == PermissionLevel::Unrestricted, "level {level}");
        }
    }

    #[test]
    fn escalation_error_names_category_and_level() {
        let err = base(PermissionLevel::Standard)
            .allow_api(ApiCategory::Network)
            .build()
            .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("Network"), "{msg}");
        assert!(msg.contains("elevated"), "{msg}");
    }

    #[test]
    fn core_is_always_granted() {
        let set = base(PermissionLevel::None)
            .with_apis(Vec::new())
            .deny_api(ApiCategory::Core)
            .build()
            .unwrap();
        assert!(set.allowed_apis().contains(ApiCategory::Core));
    }

    #[test]
    fn deny_api_removes_previously_allowed() {
        let set = base(PermissionLevel::Standard)
            .allow_api(ApiCategory::Random)
            .deny_api(ApiCategory::Random)
            .build()
            .unwrap();
        assert!(!set.allowed_apis().contains(ApiCategory::Random));
    }

    #[test]
    fn missing_script_id_fails() {
        assert!(matches!(
            PermissionSet::builder().build(),
            Err(EscalationError::MissingScriptId)
        ));
        assert!(matches!(
            PermissionSet::builder().with_script_id("   ").build(),
            Err(EscalationError::MissingScriptId)
        ));
    }

    #[test]
    fn timeout_bounds_enforced() {
        assert!(base(PermissionLevel::Standard)
            .with_timeout(Duration::ZERO)
            .build()
            .is_err());
        assert!(base(PermissionLevel::Standard)
            .with_timeout(Duration::from_millis(1))
            .build()
            .is_ok());
        assert!(base(PermissionLevel::Standard)
            .with_timeout(Duration::from_secs(300))
            .build()
            .is_ok());
        assert!(matches!(
            base(PermissionLevel::Standard)
                .with_timeout(Duration::from_secs(301))
                .build(),
            Err(EscalationError::TimeoutOutOfBounds { .. })
        ));
    }

    #[test]
    fn memory_bounds_enforced() {
        assert!(base(PermissionLevel::Standard).with_max_memory(0).build().is_err());
        assert!(base(PermissionLevel::Standard).with_max_memory(1).build().is_ok());
        assert!(base(PermissionLevel::Standard)
            .with_max_memory(1024 * 1024 * 1024)
            .build()
            .is_ok());
        assert!(matches!(
            base(PermissionLevel::Standard)
                .with_max_memory(1024 * 1024 * 1024 + 1)
                .build(),
            Err(EscalationError::MemoryOutOfBounds { .. })
        ));
    }

    #[test]
    fn custom_bounds_are_honored() {
        let bounds = PermissionBounds {
            max_timeout: Duration::from_secs(2),
            ..PermissionBounds::default()
        };
        assert!(base(PermissionLevel::Standard)
            .with_bounds(bounds)
            .with_timeout(Duration::from_secs(3))
            .build()
            .is_err());
    }

    #[test]
    fn external_assemblies_require_elevated() {
        assert!(matches!(
            base(PermissionLevel::Standard).with_external_assemblies(true).build(),
            Err(EscalationError::ExternalAssemblies { .. })
        ));
        assert!(base(PermissionLevel::Elevated)
            .with_external_assemblies(true)
            .build()
            .is_ok());
    }

    #[test]
    fn malformed_namespace_rejected() {
        for bad in ["", "System..IO", ".System", "System.", "Sys tem"] {
            let result = base(PermissionLevel::Standard).deny_namespace(bad).build();
            assert!(
                matches!(result, Err(EscalationError::InvalidNamespace { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn presets_build_and_budgets_increase() {
        let presets = [
            PermissionSet::restricted("m").unwrap(),
            PermissionSet::standard("m").unwrap(),
            PermissionSet::elevated("m").unwrap(),
            PermissionSet::unrestricted("m").unwrap(),
        ];
        for pair in presets.windows(2) {
            assert!(pair[0].max_execution_time() < pair[1].max_execution_time());
            assert!(pair[0].max_memory_bytes() < pair[1].max_memory_bytes());
            assert!(pair[0].level() < pair[1].level());
        }
        assert!(presets[3].allowed_apis().contains(ApiCategory::Unsafe));
        assert!(presets[3].can_load_external_assemblies());
    }

    #[test]
    fn standard_preset_is_value_equal_across_builds() {
        let a = PermissionSet::standard("weather").unwrap();
        let b = PermissionSet::standard("weather").unwrap();
        assert_eq!(a, b);
        for ns in [
            "System.IO",
            "System.Net",
            "System.Reflection",
            "System.Threading",
        ] {
            assert!(a.denied_namespaces().contains(ns), "{ns} should be denied");
        }
    }

    #[test]
    fn parse_names_case_insensitively() {
        assert_eq!("FILE_IO".parse::<ApiCategory>().unwrap(), ApiCategory::FileIO);
        assert_eq!("gamestateread".parse::<ApiCategory>().unwrap(), ApiCategory::GameStateRead);
        assert_eq!("ReadOnly".parse::<PermissionLevel>().unwrap(), PermissionLevel::ReadOnly);
        assert_eq!("read_only".parse::<PermissionLevel>().unwrap(), PermissionLevel::ReadOnly);
        assert!("root".parse::<PermissionLevel>().is_err());
        assert_eq!("Elevated".parse::<Preset>().unwrap(), Preset::Elevated);
    }

    #[test]
    fn serde_roundtrip_revalidates() {
        let set = PermissionSet::elevated("tools").unwrap();
        let json = serde_json::to_value(&set).unwrap();
        let back: PermissionSet = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(back, set);

        // Tampering with the level must not yield an escalated set.
        let mut tampered = json;
        tampered["level"] = serde_json::json!("Standard");
        assert!(serde_json::from_value::<PermissionSet>(tampered).is_err());
    }

    #[test]
    fn to_builder_preserves_fields() {
        let set = PermissionSet::standard("a").unwrap();
        let rebuilt = set.to_builder().build().unwrap();
        assert_eq!(rebuilt, set);
    }

    #[test]
    fn preset_denial_can_be_cleared_exactly() {
        let set = Preset::Standard
            .builder("io-tool")
            .with_level(PermissionLevel::Elevated)
            .allow_api(ApiCategory::FileIO)
            .clear_denied_namespace("system.io")
            .build()
            .unwrap();
        assert!(!set.denied_namespaces().contains("System.IO"));
        assert!(set.denied_namespaces().contains("System.Net"));
        assert!(crate::policy::is_namespace_allowed(&set, "System.IO.File"));
    }

    #[test]
    fn clearing_a_denial_does_not_grant_its_category() {
        let err = Preset::Standard
            .builder("io-tool")
            .clear_denied_namespace("System.IO")
            .allow_api(ApiCategory::FileIO)
            .build()
            .unwrap_err();
        assert!(matches!(
            err,
            EscalationError::InsufficientLevel {
                category: ApiCategory::FileIO,
                ..
            }
        ));
    }
}
