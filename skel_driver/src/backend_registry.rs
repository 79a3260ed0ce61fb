//! Back-end registry.
//!
//! Maps the back-end name from `[driver] backend = "..."` to a factory that
//! builds the bus and callback set. Constructed at startup and passed by
//! value, no global state.

use crate::backends;
use skel_common::driver::backend::{Backend, BackendFactory};
use skel_common::driver::error::DriverError;
use std::collections::HashMap;

/// Registry of available back-ends.
pub struct BackendRegistry {
    factories: HashMap<&'static str, BackendFactory>,
}

impl BackendRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Registry holding every back-end shipped with the crate.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(backends::simulation::NAME, backends::simulation::backend);
        registry
    }

    /// Register a back-end factory.
    ///
    /// # Panics
    /// Panics if a back-end with the same name is already registered.
    pub fn register(&mut self, name: &'static str, factory: BackendFactory) {
        if self.factories.contains_key(name) {
            panic!("Backend '{name}' is already registered");
        }
        self.factories.insert(name, factory);
    }

    /// Get a factory by name.
    pub fn get_factory(&self, name: &str) -> Option<BackendFactory> {
        self.factories.get(name).copied()
    }

    /// Build a back-end by name.
    ///
    /// # Errors
    /// `NotSupported` if no back-end with that name is registered.
    pub fn create(&self, name: &str) -> Result<Backend, DriverError> {
        let factory = self
            .get_factory(name)
            .ok_or_else(|| DriverError::NotSupported(format!("backend '{name}'")))?;
        Ok(factory())
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}
