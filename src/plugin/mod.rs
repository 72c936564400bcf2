//! Plugins
//!
//! A plugin exports values for item keys, collects data on its own period,
//! or both. The capability set is fixed when the plugin is registered and
//! the scheduler dispatches on it without further inspection.
//!
//! Built-in plugins:
//!
//! - [`agent`]: agent self-information (`agent.ping`, `agent.version`, ...)
//! - [`system`]: host information read through `sysinfo`
//! - [`cpu`]: CPU utilisation sampled once per second

pub mod agent;
pub mod cpu;
pub mod system;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::Value;
use crate::expression::Expressions;

/// Concurrent exporter tasks a plugin accepts unless configured otherwise
pub const DEFAULT_CAPACITY: u32 = 100;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Unsupported item key.")]
    UnsupportedKey,

    #[error("{0}")]
    InvalidParameters(String),

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Failed(String),

    #[error("Timeout occurred while gathering data.")]
    Timeout,

    #[error("key \"{key}\" is already provided by plugin \"{plugin}\"")]
    DuplicateKey { key: String, plugin: String },
}

/// Data available to an exporter call
#[derive(Debug, Clone)]
pub struct ExportContext {
    pub itemid: u64,
    pub client_id: u64,
    pub timeout: Duration,
    pub expressions: Arc<Expressions>,
}

impl ExportContext {
    pub fn single_shot(timeout: Duration) -> Self {
        Self {
            itemid: 0,
            client_id: 0,
            timeout,
            expressions: Arc::new(Expressions::default()),
        }
    }
}

/// Produces a value on demand for one item key
#[async_trait]
pub trait Exporter: Send + Sync {
    async fn export(
        &self,
        key: &str,
        params: &[String],
        context: &ExportContext,
    ) -> Result<Value, PluginError>;
}

/// Gathers data on its own fixed period
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect(&self) -> Result<(), PluginError>;

    fn period(&self) -> Duration;
}

/// What a plugin can do, resolved at registration
#[derive(Clone)]
pub enum Capabilities {
    Exporter(Arc<dyn Exporter>),
    Collector(Arc<dyn Collector>),
    CollectorExporter {
        collector: Arc<dyn Collector>,
        exporter: Arc<dyn Exporter>,
    },
}

impl Capabilities {
    pub fn exporter(&self) -> Option<&Arc<dyn Exporter>> {
        match self {
            Capabilities::Exporter(exporter)
            | Capabilities::CollectorExporter { exporter, .. } => Some(exporter),
            Capabilities::Collector(_) => None,
        }
    }

    pub fn collector(&self) -> Option<&Arc<dyn Collector>> {
        match self {
            Capabilities::Collector(collector)
            | Capabilities::CollectorExporter { collector, .. } => Some(collector),
            Capabilities::Exporter(_) => None,
        }
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Capabilities::Exporter(_) => write!(f, "Exporter"),
            Capabilities::Collector(_) => write!(f, "Collector"),
            Capabilities::CollectorExporter { .. } => write!(f, "CollectorExporter"),
        }
    }
}

/// An item key a plugin answers to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyInfo {
    pub key: String,
    pub description: String,
    /// Full key used by `--print`, when the bare key needs parameters
    pub example: Option<String>,
}

impl KeyInfo {
    pub fn new(key: &str, description: &str) -> Self {
        Self {
            key: key.to_string(),
            description: description.to_string(),
            example: None,
        }
    }

    pub fn with_example(mut self, example: &str) -> Self {
        self.example = Some(example.to_string());
        self
    }
}

#[derive(Debug)]
pub struct Plugin {
    pub name: String,
    pub keys: Vec<KeyInfo>,
    pub capabilities: Capabilities,
    pub capacity: u32,
}

impl Plugin {
    pub fn new(name: &str, keys: Vec<KeyInfo>, capabilities: Capabilities) -> Self {
        Self {
            name: name.to_string(),
            keys,
            capabilities,
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Registered plugins indexed by key
#[derive(Debug, Default)]
pub struct Registry {
    plugins: Vec<Arc<Plugin>>,
    by_key: HashMap<String, usize>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the agent, system and cpu plugins
    pub fn with_builtins(hostname: &str) -> Self {
        let mut registry = Self::new();
        for plugin in [
            agent::plugin(hostname),
            system::plugin(),
            cpu::plugin(),
        ] {
            // built-in key sets are disjoint
            if let Err(e) = registry.register(plugin) {
                debug!("skipping built-in plugin: {}", e);
            }
        }
        registry
    }

    pub fn register(&mut self, plugin: Plugin) -> Result<(), PluginError> {
        for info in &plugin.keys {
            if let Some(&index) = self.by_key.get(&info.key) {
                return Err(PluginError::DuplicateKey {
                    key: info.key.clone(),
                    plugin: self.plugins[index].name.clone(),
                });
            }
        }

        let index = self.plugins.len();
        for info in &plugin.keys {
            self.by_key.insert(info.key.clone(), index);
        }
        debug!(
            "registered plugin {} ({:?}, {} keys)",
            plugin.name,
            plugin.capabilities,
            plugin.keys.len()
        );
        self.plugins.push(Arc::new(plugin));
        Ok(())
    }

    /// Override the capacity of a registered plugin; must be called before
    /// the registry is shared
    pub fn set_capacity(&mut self, name: &str, capacity: u32) -> bool {
        let Some(plugin) = self.plugins.iter_mut().find(|p| p.name == name) else {
            return false;
        };
        match Arc::get_mut(plugin) {
            Some(plugin) => {
                plugin.capacity = capacity.max(1);
                true
            }
            None => false,
        }
    }

    pub fn lookup(&self, key: &str) -> Option<Arc<Plugin>> {
        self.by_key.get(key).map(|&index| self.plugins[index].clone())
    }

    pub fn plugins(&self) -> &[Arc<Plugin>] {
        &self.plugins
    }

    /// Keys to evaluate for `--print`, in registration order
    pub fn printable_keys(&self) -> Vec<String> {
        self.plugins
            .iter()
            .flat_map(|p| p.keys.iter())
            .map(|k| k.example.clone().unwrap_or_else(|| k.key.clone()))
            .collect()
    }
}

/// Reject any parameters for keys that take none
pub(crate) fn no_parameters(params: &[String]) -> Result<(), PluginError> {
    if params.iter().any(|p| !p.is_empty()) || params.len() > 1 {
        return Err(PluginError::InvalidParameters("Too many parameters.".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    struct Fixed;

    #[async_trait]
    impl Exporter for Fixed {
        async fn export(
            &self,
            _key: &str,
            _params: &[String],
            _context: &ExportContext,
        ) -> Result<Value, PluginError> {
            Ok(Value::Unsigned(1))
        }
    }

    fn fixed(name: &str, key: &str) -> Plugin {
        Plugin::new(
            name,
            vec![KeyInfo::new(key, "test")],
            Capabilities::Exporter(Arc::new(Fixed)),
        )
    }

    #[test]
    fn test_lookup_by_key() {
        let mut registry = Registry::new();
        registry.register(fixed("a", "test.a")).unwrap();
        assert_eq!(registry.lookup("test.a").unwrap().name, "a");
        assert!(registry.lookup("test.b").is_none());
    }

    #[test]
    fn test_duplicate_keys_rejected() {
        let mut registry = Registry::new();
        registry.register(fixed("a", "test.a")).unwrap();
        assert_matches!(
            registry.register(fixed("b", "test.a")),
            Err(PluginError::DuplicateKey { .. })
        );
        assert_eq!(registry.plugins().len(), 1);
    }

    #[test]
    fn test_capacity_override() {
        let mut registry = Registry::new();
        registry.register(fixed("a", "test.a")).unwrap();
        assert!(registry.set_capacity("a", 3));
        assert!(!registry.set_capacity("missing", 3));
        assert_eq!(registry.lookup("test.a").unwrap().capacity, 3);
    }

    #[test]
    fn test_capabilities() {
        let plugin = fixed("a", "test.a");
        assert!(plugin.capabilities.exporter().is_some());
        assert!(plugin.capabilities.collector().is_none());
    }

    #[test]
    fn test_builtins_are_registered() {
        let registry = Registry::with_builtins("host");
        for key in ["agent.ping", "system.uname", "system.cpu.util", "vm.memory.size"] {
            assert!(registry.lookup(key).is_some(), "{key} missing");
        }
        let cpu = registry.lookup("system.cpu.util").unwrap();
        assert_matches!(cpu.capabilities, Capabilities::CollectorExporter { .. });
    }

    #[test]
    fn test_no_parameters() {
        assert!(no_parameters(&[]).is_ok());
        assert!(no_parameters(&[String::new()]).is_ok());
        assert!(no_parameters(&["x".to_string()]).is_err());
    }
}
