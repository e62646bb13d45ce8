//! BackendRegistry: selects the active primary backend by name.

use std::collections::HashMap;

use crate::backend::kv::KvBackend;

/// Holds every primary backend an embedding application has registered, and
/// tracks which one is currently active.
pub struct BackendRegistry {
    backends: HashMap<String, KvBackend>,
    active: Option<String>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        BackendRegistry {
            backends: HashMap::new(),
            active: None,
        }
    }

    /// Register a primary backend under `name`, making it selectable.
    pub fn register_backend(&mut self, name: impl Into<String>, backend: KvBackend) {
        self.backends.insert(name.into(), backend);
    }

    /// True iff a backend with this name was registered.
    pub fn backend_exists(&self, name: &str) -> bool {
        self.backends.contains_key(name)
    }

    /// Select the active primary backend by name.
    pub fn set_backend(&mut self, name: &str) -> Result<(), UnknownBackend> {
        if self.backends.contains_key(name) {
            self.active = Some(name.to_owned());
            Ok(())
        } else {
            Err(UnknownBackend(name.to_owned()))
        }
    }

    /// The currently active primary backend, if one has been selected.
    pub fn active(&self) -> Option<&KvBackend> {
        self.active.as_deref().and_then(|name| self.backends.get(name))
    }

    pub fn active_mut(&mut self) -> Option<&mut KvBackend> {
        let name = self.active.clone()?;
        self.backends.get_mut(&name)
    }
}

impl Default for BackendRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Raised by [`BackendRegistry::set_backend`] when the name was never
/// registered.
#[derive(Debug, thiserror::Error)]
#[error("no backend registered under the name '{0}'")]
pub struct UnknownBackend(pub String);
