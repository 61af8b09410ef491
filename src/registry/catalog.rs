//! Component catalog: type name → constructor, declared defaults, and the
//! typed construction context.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde_json::{Map, Value};

use crate::canonical::CanonicalConfig;
use crate::error::CoreError;
use crate::lifecycle::ComponentInstance;
use crate::producer::DataProducer;
use crate::schedule::Schedule;

use super::{ComponentRegistry, Descriptor};

pub type Constructor =
    Arc<dyn Fn(&ConstructContext<'_>) -> Result<Arc<dyn DataProducer>, CoreError> + Send + Sync>;

/// Everything the daemon knows about one component type.
#[derive(Clone)]
pub struct ComponentSpec {
    type_name: Arc<str>,
    constructor: Constructor,
    default_schedule: Schedule,
    default_config: Value,
    required: Vec<String>,
}

impl ComponentSpec {
    pub fn new<F>(type_name: impl Into<Arc<str>>, constructor: F) -> Self
    where
        F: Fn(&ConstructContext<'_>) -> Result<Arc<dyn DataProducer>, CoreError> + Send + Sync + 'static,
    {
        Self {
            type_name: type_name.into(),
            constructor: Arc::new(constructor),
            default_schedule: Schedule::once(),
            default_config: Value::Object(Map::new()),
            required: Vec::new(),
        }
    }

    pub fn with_default_schedule(mut self, schedule: Schedule) -> Self {
        self.default_schedule = schedule;
        self
    }

    /// Fields absent from a submitted config take these values before the
    /// descriptor is computed.
    pub fn with_default_config(mut self, config: Value) -> Self {
        self.default_config = config;
        self
    }

    /// Declare a config field that must be present.
    pub fn require(mut self, field: impl Into<String>) -> Self {
        self.required.push(field.into());
        self
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    pub fn default_schedule(&self) -> Schedule {
        self.default_schedule
    }

    pub fn default_config(&self) -> &Value {
        &self.default_config
    }

    pub(crate) fn constructor(&self) -> &Constructor {
        &self.constructor
    }

    pub(crate) fn check_required(&self, config: &Value) -> Result<(), CoreError> {
        for field in &self.required {
            if config.get(field).is_none_or(Value::is_null) {
                return Err(CoreError::config(format!(
                    "component '{}' requires field '{field}'",
                    self.type_name
                )));
            }
        }
        Ok(())
    }
}

impl fmt::Debug for ComponentSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComponentSpec")
            .field("type_name", &self.type_name)
            .field("default_schedule", &self.default_schedule)
            .field("default_config", &self.default_config)
            .field("required", &self.required)
            .finish_non_exhaustive()
    }
}

/// Startup-populated table of component types.
#[derive(Debug, Clone, Default)]
pub struct ComponentCatalog {
    specs: HashMap<String, ComponentSpec>,
}

impl ComponentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a type.
    pub fn register(&mut self, spec: ComponentSpec) -> &mut Self {
        self.specs.insert(spec.type_name().to_string(), spec);
        self
    }

    pub fn with(mut self, spec: ComponentSpec) -> Self {
        self.register(spec);
        self
    }

    pub fn get(&self, type_name: &str) -> Option<&ComponentSpec> {
        self.specs.get(type_name)
    }

    pub fn lookup(&self, type_name: &str) -> Result<&ComponentSpec, CoreError> {
        self.get(type_name)
            .ok_or_else(|| CoreError::config(format!("unknown component type '{type_name}'")))
    }

    pub fn type_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.specs.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }
}

// ── Capabilities ─────────────────────────────────────────────────────────────

/// Typed injection table for non-config constructor arguments (runtime
/// handles, device access, shared clients).
#[derive(Clone, Default)]
pub struct Capabilities {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Capabilities {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Clone + Send + Sync + 'static>(&mut self, value: T) -> &mut Self {
        self.entries.insert(TypeId::of::<T>(), Arc::new(value));
        self
    }

    pub fn with<T: Clone + Send + Sync + 'static>(mut self, value: T) -> Self {
        self.insert(value);
        self
    }

    pub fn get<T: Clone + 'static>(&self) -> Option<T> {
        self.entries
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Capabilities").field("len", &self.entries.len()).finish()
    }
}

// ── ConstructContext ─────────────────────────────────────────────────────────

/// Handed to a [`Constructor`]: typed access to the descriptor's config, the
/// capability table, and nested component resolution.
pub struct ConstructContext<'a> {
    registry: &'a ComponentRegistry,
    descriptor: &'a Descriptor,
}

impl<'a> ConstructContext<'a> {
    pub(crate) fn new(registry: &'a ComponentRegistry, descriptor: &'a Descriptor) -> Self {
        Self { registry, descriptor }
    }

    pub fn descriptor(&self) -> &Descriptor {
        self.descriptor
    }

    /// The canonical config, defaults applied, annotations removed.
    pub fn config(&self) -> &CanonicalConfig {
        self.descriptor.config()
    }

    /// Deserialize an optional field.
    pub fn field<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, CoreError> {
        match self.config().get(name) {
            None | Some(Value::Null) => Ok(None),
            Some(v) => serde_json::from_value(v.clone()).map(Some).map_err(|e| {
                CoreError::config(format!(
                    "component '{}': malformed field '{name}': {e}",
                    self.descriptor.type_name()
                ))
            }),
        }
    }

    /// Deserialize a field that must be present.
    pub fn require<T: DeserializeOwned>(&self, name: &str) -> Result<T, CoreError> {
        self.field(name)?.ok_or_else(|| {
            CoreError::config(format!(
                "component '{}' requires field '{name}'",
                self.descriptor.type_name()
            ))
        })
    }

    /// Look up an injected capability by type.
    pub fn capability<T: Clone + 'static>(&self) -> Result<T, CoreError> {
        self.registry.capabilities().get::<T>().ok_or_else(|| {
            CoreError::config(format!(
                "component '{}' needs capability {} which is not available",
                self.descriptor.type_name(),
                type_name::<T>()
            ))
        })
    }

    /// Resolve the nested component described by field `name` (an object
    /// carrying its own `@type`) through the same registry.
    pub fn component(&self, name: &str) -> Result<Arc<ComponentInstance>, CoreError> {
        let nested = self.config().get(name).ok_or_else(|| {
            CoreError::config(format!(
                "component '{}' requires sub-component '{name}'",
                self.descriptor.type_name()
            ))
        })?;
        self.registry.resolve_value(nested)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn capabilities_are_keyed_by_type() {
        #[derive(Clone, Debug, PartialEq)]
        struct Port(u16);

        let caps = Capabilities::new().with(Port(7)).with(String::from("hub"));
        assert_eq!(caps.get::<Port>(), Some(Port(7)));
        assert_eq!(caps.get::<String>().as_deref(), Some("hub"));
        assert!(caps.get::<u32>().is_none());
        assert_eq!(caps.len(), 2);
    }

    #[test]
    fn required_fields_are_checked() {
        let spec = ComponentSpec::new("gps", |_| Err(CoreError::config("unused"))).require("rate");
        assert!(spec.check_required(&json!({"rate": 1})).is_ok());
        assert!(spec.check_required(&json!({})).is_err());
        assert!(spec.check_required(&json!({"rate": null})).is_err());
    }

    #[test]
    fn unknown_type_is_config_invalid() {
        let catalog = ComponentCatalog::new();
        assert!(matches!(catalog.lookup("nope"), Err(CoreError::ConfigInvalid(_))));
    }

    #[test]
    fn type_names_are_sorted() {
        fn ctor(_: &ConstructContext<'_>) -> Result<Arc<dyn DataProducer>, CoreError> {
            Err(CoreError::config("unused"))
        }
        let catalog = ComponentCatalog::new()
            .with(ComponentSpec::new("wifi", ctor))
            .with(ComponentSpec::new("gps", ctor));
        assert_eq!(catalog.type_names(), vec!["gps", "wifi"]);
    }
}
