//! Component registry: resolves configs to unique, cached instances.
//!
//! Resolution pipeline for a submitted config:
//!
//! 1. look the type name up in the [`ComponentCatalog`],
//! 2. overlay the type's declared default config,
//! 3. strip annotation members (`@type`, `@schedule`),
//! 4. canonicalize into a [`Descriptor`],
//! 5. return the cached instance for that descriptor, constructing it on
//!    first use.
//!
//! Construction runs outside the cache lock. The first resolver of a
//! descriptor reserves a pending slot; concurrent resolvers of the same
//! descriptor wait on that slot instead of constructing a second instance.
//!
//! A constructor that resolves its own descriptor (directly or through a
//! nested component) fails with `ConfigInvalid`. Cycle detection is per
//! thread: two threads that start constructing A and B at the same time,
//! where A needs B and B needs A, each wait on the other's slot forever.
//! The coordinator resolves from a single task, so it never builds two
//! descriptors at once.

pub mod catalog;
mod descriptor;

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::canonical::{self, ANNOTATION_PREFIX, CanonicalConfig};
use crate::error::CoreError;
use crate::lifecycle::ComponentInstance;

pub use catalog::{Capabilities, ComponentCatalog, ComponentSpec, ConstructContext, Constructor};
pub use descriptor::Descriptor;

/// Annotation naming the component type of a submitted config.
pub const TYPE_KEY: &str = "@type";

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

enum SlotState {
    Pending(ThreadId),
    Ready(Arc<ComponentInstance>),
    Failed(CoreError),
}

struct Slot {
    state: Mutex<SlotState>,
    ready: Condvar,
}

impl Slot {
    fn pending() -> Self {
        Self {
            state: Mutex::new(SlotState::Pending(thread::current().id())),
            ready: Condvar::new(),
        }
    }

    fn ready_instance(&self) -> Option<Arc<ComponentInstance>> {
        match &*lock(&self.state) {
            SlotState::Ready(instance) => Some(instance.clone()),
            _ => None,
        }
    }

    fn publish(&self, state: SlotState) {
        *lock(&self.state) = state;
        self.ready.notify_all();
    }

    /// Block until the constructing thread publishes.
    fn wait(&self, descriptor: &Descriptor) -> Result<Arc<ComponentInstance>, CoreError> {
        let mut state = lock(&self.state);
        loop {
            let owner = match &*state {
                SlotState::Ready(instance) => return Ok(instance.clone()),
                SlotState::Failed(err) => return Err(err.clone()),
                SlotState::Pending(owner) => *owner,
            };
            if owner == thread::current().id() {
                return Err(CoreError::config(format!(
                    "component {descriptor} references itself"
                )));
            }
            state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }
}

/// Cache of live component instances keyed by descriptor.
pub struct ComponentRegistry {
    catalog: Arc<ComponentCatalog>,
    capabilities: Capabilities,
    slots: Mutex<HashMap<Descriptor, Arc<Slot>>>,
}

impl ComponentRegistry {
    pub fn new(catalog: ComponentCatalog, capabilities: Capabilities) -> Self {
        Self {
            catalog: Arc::new(catalog),
            capabilities,
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn catalog(&self) -> &ComponentCatalog {
        &self.catalog
    }

    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    pub fn spec(&self, type_name: &str) -> Result<&ComponentSpec, CoreError> {
        self.catalog.lookup(type_name)
    }

    /// Compute the descriptor for `config` of type `type_name` without
    /// constructing anything.
    pub fn describe(&self, type_name: &str, config: &Value) -> Result<Descriptor, CoreError> {
        let spec = self.spec(type_name)?;
        let merged = canonical::overlay(spec.default_config(), &canonical::without_annotations(config));
        spec.check_required(&merged)?;
        Ok(Descriptor::new(spec.type_name(), CanonicalConfig::canonicalize(&merged)))
    }

    /// [`describe`](Self::describe) with the type taken from `@type`.
    pub fn describe_value(&self, config: &Value) -> Result<Descriptor, CoreError> {
        self.describe(type_of(config)?, config)
    }

    /// Return the unique live instance for `(type_name, config)`.
    pub fn resolve(&self, type_name: &str, config: &Value) -> Result<Arc<ComponentInstance>, CoreError> {
        let descriptor = self.describe(type_name, config)?;
        self.resolve_descriptor(&descriptor)
    }

    /// [`resolve`](Self::resolve) with the type taken from `@type`.
    pub fn resolve_value(&self, config: &Value) -> Result<Arc<ComponentInstance>, CoreError> {
        self.resolve(type_of(config)?, config)
    }

    /// Return the cached instance for `descriptor`, constructing it if absent.
    ///
    /// Blocks while another thread constructs the same descriptor. Callers
    /// resolving from several threads must not share nested components that
    /// reference each other; see the module docs.
    pub fn resolve_descriptor(&self, descriptor: &Descriptor) -> Result<Arc<ComponentInstance>, CoreError> {
        let (slot, constructing) = {
            let mut slots = lock(&self.slots);
            match slots.get(descriptor) {
                Some(slot) => (slot.clone(), false),
                None => {
                    let slot = Arc::new(Slot::pending());
                    slots.insert(descriptor.clone(), slot.clone());
                    (slot, true)
                }
            }
        };

        if !constructing {
            return slot.wait(descriptor);
        }

        match self.construct(descriptor) {
            Ok(instance) => {
                slot.publish(SlotState::Ready(instance.clone()));
                info!(component = %descriptor, "component constructed");
                Ok(instance)
            }
            Err(err) => {
                {
                    let mut slots = lock(&self.slots);
                    if slots.get(descriptor).is_some_and(|s| Arc::ptr_eq(s, &slot)) {
                        slots.remove(descriptor);
                    }
                }
                slot.publish(SlotState::Failed(err.clone()));
                warn!(component = %descriptor, error = %err, "component construction failed");
                Err(err)
            }
        }
    }

    fn construct(&self, descriptor: &Descriptor) -> Result<Arc<ComponentInstance>, CoreError> {
        let spec = self.spec(descriptor.type_name())?;
        let ctx = ConstructContext::new(self, descriptor);
        let producer = catch_unwind(AssertUnwindSafe(|| (spec.constructor())(&ctx))).map_err(|_| {
            CoreError::config(format!("constructor for '{}' panicked", descriptor.type_name()))
        })??;
        ComponentInstance::spawn(descriptor.clone(), producer)
    }

    /// The cached instance for `descriptor`, if constructed.
    pub fn get(&self, descriptor: &Descriptor) -> Option<Arc<ComponentInstance>> {
        let slot = lock(&self.slots).get(descriptor).cloned()?;
        slot.ready_instance()
    }

    /// Every constructed instance.
    pub fn instances(&self) -> Vec<Arc<ComponentInstance>> {
        let slots: Vec<Arc<Slot>> = lock(&self.slots).values().cloned().collect();
        slots.iter().filter_map(|s| s.ready_instance()).collect()
    }

    /// Drop `descriptor` from the cache, disabling and shutting down its
    /// instance. Returns whether anything was cached.
    ///
    /// A slot still under construction on another thread is waited for,
    /// and the instance it publishes is shut down.
    pub fn evict(&self, descriptor: &Descriptor) -> bool {
        let Some(slot) = lock(&self.slots).remove(descriptor) else {
            return false;
        };
        retire(descriptor, &slot);
        true
    }

    pub fn evict_all(&self) -> usize {
        let drained: Vec<(Descriptor, Arc<Slot>)> = lock(&self.slots).drain().collect();
        let n = drained.len();
        for (descriptor, slot) in drained {
            retire(&descriptor, &slot);
        }
        n
    }

    pub fn len(&self) -> usize {
        lock(&self.slots).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.slots).is_empty()
    }
}

/// Shut down whatever an evicted slot holds or is about to hold.
fn retire(descriptor: &Descriptor, slot: &Slot) {
    match slot.wait(descriptor) {
        Ok(instance) => {
            instance.shutdown();
            debug!(component = %descriptor, "component evicted");
        }
        Err(e) => debug!(component = %descriptor, error = %e, "evicted slot held no instance"),
    }
}

/// Read the `@type` annotation.
pub fn type_of(config: &Value) -> Result<&str, CoreError> {
    match config.get(TYPE_KEY) {
        Some(Value::String(t)) if !t.is_empty() => Ok(t),
        Some(_) => Err(CoreError::config(format!("'{TYPE_KEY}' must be a non-empty string"))),
        None => Err(CoreError::config(format!("config has no '{TYPE_KEY}' annotation"))),
    }
}

/// Read an annotation other than `@type` (e.g. `@schedule`).
pub fn annotation<'v>(config: &'v Value, name: &str) -> Option<&'v Value> {
    config.as_object()?.iter().find_map(|(k, v)| {
        (k.strip_prefix(ANNOTATION_PREFIX) == Some(name)).then_some(v)
    })
}
