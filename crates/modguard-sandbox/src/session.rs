//! Host-session context.
//!
//! Holds the permission sets of loaded scripts, the capability map and the
//! event sink. One instance per host session, handed to the coordinator at
//! construction; nothing here is process-global.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use crate::audit::{EventSink, TracingEventSink};
use crate::capability::CapabilityMap;
use crate::error::CapabilityError;
#[cfg(feature = "metrics")]
use crate::metrics::SandboxMetrics;
use crate::permissions::{ApiCategory, PermissionSet};

/// Session-scoped registry shared by every execution of a host session.
pub struct SandboxContext {
    scripts: RwLock<HashMap<String, Arc<PermissionSet>>>,
    // Copy-on-write: executions take a snapshot, registration swaps in a new map.
    capabilities: RwLock<Arc<CapabilityMap>>,
    events: Arc<dyn EventSink>,
    #[cfg(feature = "metrics")]
    metrics: Option<Arc<SandboxMetrics>>,
}

impl Default for SandboxContext {
    fn default() -> Self {
        Self::new()
    }
}

impl SandboxContext {
    /// Context that reports events through `tracing`.
    pub fn new() -> Self {
        Self::with_event_sink(Arc::new(TracingEventSink))
    }

    /// Context reporting events to `events`.
    pub fn with_event_sink(events: Arc<dyn EventSink>) -> Self {
        Self {
            scripts: RwLock::new(HashMap::new()),
            capabilities: RwLock::new(Arc::new(CapabilityMap::new())),
            events,
            #[cfg(feature = "metrics")]
            metrics: None,
        }
    }

    /// Attach Prometheus metrics.
    #[cfg(feature = "metrics")]
    pub fn with_metrics(mut self, metrics: Arc<SandboxMetrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Attached metrics, if any.
    #[cfg(feature = "metrics")]
    pub fn metrics(&self) -> Option<&SandboxMetrics> {
        self.metrics.as_deref()
    }

    /// Register a loaded script's permission set. Returns the set it replaces.
    pub fn register_script(&self, permissions: PermissionSet) -> Option<Arc<PermissionSet>> {
        let script_id = permissions.script_id().to_string();
        tracing::debug!(
            script_id = %script_id,
            level = %permissions.level(),
            "script registered"
        );
        self.scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(script_id, Arc::new(permissions))
    }

    /// Unload a script: drop its permission set and every capability it provided.
    pub fn unregister_script(&self, script_id: &str) -> Option<Arc<PermissionSet>> {
        let removed = self
            .scripts
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(script_id);
        let mut capabilities = self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if capabilities.contains_provider(script_id) {
            Arc::make_mut(&mut *capabilities).unregister_provider(script_id);
        }
        removed
    }

    /// Permission set registered for `script_id`.
    pub fn permissions(&self, script_id: &str) -> Option<Arc<PermissionSet>> {
        self.scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(script_id)
            .cloned()
    }

    /// Ids of all registered scripts, sorted.
    pub fn script_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .scripts
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Register a capability implementation. Executions already running keep
    /// the map they started with.
    pub fn register_capability<T>(
        &self,
        provider: impl Into<String>,
        category: ApiCategory,
        capability: Arc<T>,
    ) -> Result<(), CapabilityError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let mut guard = self
            .capabilities
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        Arc::make_mut(&mut *guard).register(provider, category, capability)
    }

    /// Snapshot of the capability map.
    pub fn capabilities(&self) -> Arc<CapabilityMap> {
        self.capabilities
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// The session's event sink.
    pub fn events(&self) -> &Arc<dyn EventSink> {
        &self.events
    }
}
