//! Capability-typed interface map.
//!
//! Mods register the capability interfaces they implement at load time,
//! keyed by the interface type. Scripts look them up by type through their
//! [`ScriptContext`](crate::ScriptContext); each lookup is a typed map read
//! gated on the API category the capability was registered under.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::CapabilityError;
use crate::permissions::{ApiCategory, PermissionSet};
use crate::policy::is_api_allowed;

#[derive(Clone)]
struct Entry {
    provider: String,
    category: ApiCategory,
    type_name: &'static str,
    // Always an `Arc<T>` for the `T` the entry is keyed by.
    value: Arc<dyn Any + Send + Sync>,
}

/// Typed registry of host and mod capabilities.
#[derive(Clone, Default)]
pub struct CapabilityMap {
    entries: HashMap<TypeId, Entry>,
}

impl CapabilityMap {
    /// Empty map.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `capability` as the implementation of `T`, filed under `category`.
    ///
    /// `T` is usually a trait object type such as `dyn WeatherApi`. Each type
    /// has at most one provider.
    pub fn register<T>(
        &mut self,
        provider: impl Into<String>,
        category: ApiCategory,
        capability: Arc<T>,
    ) -> Result<(), CapabilityError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let key = TypeId::of::<T>();
        if let Some(existing) = self.entries.get(&key) {
            return Err(CapabilityError::Duplicate {
                capability: type_name::<T>(),
                existing: existing.provider.clone(),
            });
        }
        let provider = provider.into();
        tracing::debug!(
            capability = type_name::<T>(),
            provider = %provider,
            category = %category,
            "capability registered"
        );
        self.entries.insert(
            key,
            Entry {
                provider,
                category,
                type_name: type_name::<T>(),
                value: Arc::new(capability),
            },
        );
        Ok(())
    }

    /// Remove every capability registered by `provider`. Returns how many were removed.
    pub fn unregister_provider(&mut self, provider: &str) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.provider != provider);
        before - self.entries.len()
    }

    /// Whether `provider` registered anything.
    pub fn contains_provider(&self, provider: &str) -> bool {
        self.entries.values().any(|entry| entry.provider == provider)
    }

    /// Look up `T` on behalf of a script holding `permissions`.
    pub fn get<T>(&self, permissions: &PermissionSet) -> Result<Arc<T>, CapabilityError>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        let entry = self
            .entries
            .get(&TypeId::of::<T>())
            .ok_or(CapabilityError::NotRegistered {
                capability: type_name::<T>(),
            })?;
        if !is_api_allowed(permissions, entry.category) {
            return Err(CapabilityError::Denied {
                capability: type_name::<T>(),
                category: entry.category,
            });
        }
        entry
            .value
            .downcast_ref::<Arc<T>>()
            .cloned()
            .ok_or(CapabilityError::NotRegistered {
                capability: type_name::<T>(),
            })
    }

    /// Category `T` is filed under, if registered.
    pub fn category_of<T>(&self) -> Option<ApiCategory>
    where
        T: ?Sized + 'static,
    {
        self.entries.get(&TypeId::of::<T>()).map(|e| e.category)
    }

    /// Whether `T` has a provider.
    pub fn contains<T>(&self) -> bool
    where
        T: ?Sized + 'static,
    {
        self.entries.contains_key(&TypeId::of::<T>())
    }

    /// Number of registered capabilities.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for CapabilityMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self
            .entries
            .values()
            .map(|e| (e.type_name, e.provider.as_str(), e.category))
            .collect();
        names.sort();
        f.debug_struct("CapabilityMap")
            .field("entries", &names)
            .finish()
    }
}
