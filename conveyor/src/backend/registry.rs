//! Name-indexed set of execution backends.

use std::collections::BTreeMap;
use std::sync::Arc;

use super::ExecutionBackend;
use crate::errors::SubmitError;

/// Backends available to the scheduler, keyed by name.
///
/// The first backend registered becomes the default for jobs that do not
/// name one.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    backends: BTreeMap<String, Arc<dyn ExecutionBackend>>,
    default: Option<String>,
}

impl BackendRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a backend under its own name, replacing any previous one.
    #[must_use]
    pub fn register(mut self, backend: Arc<dyn ExecutionBackend>) -> Self {
        let name = backend.name().to_string();
        if self.default.is_none() {
            self.default = Some(name.clone());
        }
        self.backends.insert(name, backend);
        self
    }

    /// Overrides the default backend.
    #[must_use]
    pub fn with_default(mut self, name: impl Into<String>) -> Self {
        self.default = Some(name.into());
        self
    }

    /// Returns the backend registered as `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn ExecutionBackend>> {
        self.backends.get(name).cloned()
    }

    /// Resolves a job's requested backend to a registered name.
    ///
    /// # Errors
    ///
    /// Returns [`SubmitError::UnknownBackend`] if the requested (or default)
    /// backend is not registered.
    pub fn resolve_name(&self, requested: Option<&str>) -> Result<String, SubmitError> {
        let name = requested
            .or(self.default.as_deref())
            .ok_or_else(|| SubmitError::UnknownBackend("<default>".to_string()))?;
        if self.backends.contains_key(name) {
            Ok(name.to_string())
        } else {
            Err(SubmitError::UnknownBackend(name.to_string()))
        }
    }

    /// Returns registered names in sorted order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.backends.keys().map(String::as_str)
    }

    /// Returns true if nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.backends.is_empty()
    }
}

impl std::fmt::Debug for BackendRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendRegistry")
            .field("backends", &self.backends.keys().collect::<Vec<_>>())
            .field("default", &self.default)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ScriptedBackend;

    #[test]
    fn test_first_registered_is_default() {
        let registry = BackendRegistry::new()
            .register(Arc::new(ScriptedBackend::named("local")))
            .register(Arc::new(ScriptedBackend::named("cluster")));

        assert_eq!(registry.resolve_name(None).unwrap(), "local");
        assert_eq!(registry.resolve_name(Some("cluster")).unwrap(), "cluster");
        assert_eq!(registry.names().collect::<Vec<_>>(), vec!["cluster", "local"]);
    }

    #[test]
    fn test_unknown_backend() {
        let registry = BackendRegistry::new().register(Arc::new(ScriptedBackend::named("local")));
        let err = registry.resolve_name(Some("gpu")).unwrap_err();
        assert_eq!(err, SubmitError::UnknownBackend("gpu".to_string()));

        let empty = BackendRegistry::new();
        assert!(empty.resolve_name(None).is_err());
        assert!(empty.is_empty());
    }

    #[test]
    fn test_with_default_override() {
        let registry = BackendRegistry::new()
            .register(Arc::new(ScriptedBackend::named("local")))
            .register(Arc::new(ScriptedBackend::named("cluster")))
            .with_default("cluster");
        assert_eq!(registry.resolve_name(None).unwrap(), "cluster");
        assert!(registry.get("local").is_some());
    }
}
