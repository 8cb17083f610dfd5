//! Backend registry: built once at startup, read-only afterwards.
//!
//! The job loop looks backends up by the `backend_type` a claimed job
//! declares.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::Backend;

/// Collects backends before the harness starts.
#[derive(Default)]
pub struct BackendRegistryBuilder {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a backend under [`Backend::name`]. A later registration
    /// with the same name replaces the earlier one.
    pub fn register(mut self, backend: impl Backend + 'static) -> Self {
        self.backends
            .insert(backend.name().to_string(), Arc::new(backend));
        self
    }

    /// Register an already shared backend.
    pub fn register_shared(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backends.insert(backend.name().to_string(), backend);
        self
    }

    pub fn build(self) -> BackendRegistry {
        BackendRegistry {
            backends: self.backends,
        }
    }
}

/// Immutable map from backend type name to backend.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn Backend>>,
}

impl BackendRegistry {
    pub fn builder() -> BackendRegistryBuilder {
        BackendRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Backend>> {
        self.backends.get(name).cloned()
    }

    pub fn supports(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Registered names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.backends.keys().cloned().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn Backend>> {
        self.backends.values()
    }

    pub fn len(&self) -> usize {
        self.backends.len()
    }

    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .finish()
    }
}
