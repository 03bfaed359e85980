//! Transport registry for resolving transports by name.

use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use recordsync_common::{Error, Result};

use crate::http::{HttpConfig, HttpTransport};
use crate::memory::ScriptedTransport;
use crate::provider::RemoteTransport;

/// Factory function type for creating transports.
pub type TransportFactory = Box<dyn Fn(Value) -> Result<Arc<dyn RemoteTransport>> + Send + Sync>;

/// Registry for transport factories.
///
/// Lets a configuration file name its transport (`"http"`, `"memory"`)
/// and pass transport-specific settings as raw JSON.
pub struct TransportRegistry {
    factories: HashMap<String, TransportFactory>,
}

impl TransportRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            factories: HashMap::new(),
        }
    }

    /// Register a transport factory.
    ///
    /// # Errors
    /// - `AlreadyExists` if the name is taken
    pub fn register(&mut self, name: impl Into<String>, factory: TransportFactory) -> Result<()> {
        let name = name.into();
        if self.factories.contains_key(&name) {
            return Err(Error::AlreadyExists(format!(
                "Transport '{}' is already registered",
                name
            )));
        }
        self.factories.insert(name, factory);
        Ok(())
    }

    /// Build a transport by name from its configuration.
    ///
    /// # Errors
    /// - `NotFound` if no factory has that name
    /// - whatever the factory reports for an invalid configuration
    pub fn resolve(&self, name: &str, config: Value) -> Result<Arc<dyn RemoteTransport>> {
        let factory = self
            .factories
            .get(name)
            .ok_or_else(|| Error::NotFound(format!("Transport '{}' is not registered", name)))?;
        factory(config)
    }

    /// Names of registered transports, sorted.
    pub fn transports(&self) -> Vec<String> {
        let mut names: Vec<String> = self.factories.keys().cloned().collect();
        names.sort();
        names
    }

    /// Check if a transport is registered.
    pub fn has_transport(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }
}

impl Default for TransportRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn memory_factory() -> TransportFactory {
    Box::new(|_config| Ok(Arc::new(ScriptedTransport::new())))
}

fn http_factory() -> TransportFactory {
    Box::new(|config| {
        let config: HttpConfig = serde_json::from_value(config)
            .map_err(|e| Error::InvalidInput(format!("Invalid http transport config: {}", e)))?;
        Ok(Arc::new(HttpTransport::new(&config)?))
    })
}

/// Create a registry with the built-in transports.
pub fn create_default_registry() -> TransportRegistry {
    let factories = HashMap::from([
        ("memory".to_string(), memory_factory()),
        ("http".to_string(), http_factory()),
    ]);
    TransportRegistry { factories }
}
