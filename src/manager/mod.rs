//! Request manager: the orchestration core.
//!
//! Owns every [`RequestSet`] (one per descriptor) and the periodic action
//! table. It is not thread-safe on purpose: the coordinator task owns it and
//! feeds it requests, unrequests and wake events one at a time.
//!
//! On each activation wake it delivers to exactly the requests whose own
//! interval has elapsed, drives the shared instance to Running, optionally
//! schedules the end of the cycle, and re-submits the merged trigger if
//! demand changed.

mod request;
mod status;

use std::collections::{BTreeMap, HashMap};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::error::CoreError;
use crate::producer::{Checkpoint, ListenerHandle, ListenerId};
use crate::registry::{self, ComponentRegistry, Descriptor};
use crate::schedule::{self, Schedule};
use crate::wake::{WakeEvent, WakeScheduler};

pub use request::{DataRequest, RequestSet};
pub use status::{ComponentStatus, DaemonStatus, PeriodicStatus, RequestStatus};

/// Non-sensing periodic work, invoked with the nominal fire instant.
/// Runs on the coordinator; must not block.
pub type PeriodicCallback = Arc<dyn Fn(Instant) + Send + Sync>;

struct PeriodicAction {
    schedule: Schedule,
    callback: PeriodicCallback,
    runs: u64,
}

pub struct RequestManager {
    registry: Arc<ComponentRegistry>,
    wakes: WakeScheduler,
    sets: HashMap<Descriptor, RequestSet>,
    periodic: BTreeMap<(String, String), PeriodicAction>,
    next_cycle: u64,
}

impl RequestManager {
    pub fn new(registry: Arc<ComponentRegistry>, wakes: WakeScheduler) -> Self {
        Self {
            registry,
            wakes,
            sets: HashMap::new(),
            periodic: BTreeMap::new(),
            next_cycle: 0,
        }
    }

    pub fn registry(&self) -> &Arc<ComponentRegistry> {
        &self.registry
    }

    pub fn request_set(&self, descriptor: &Descriptor) -> Option<&RequestSet> {
        self.sets.get(descriptor)
    }

    // ── Requests ─────────────────────────────────────────────────────────

    /// Register (or replace) `listener`'s request for the component
    /// described by `config`. Returns the resolved descriptor.
    ///
    /// Without an explicit `schedule` the catalog default applies, overlaid
    /// by any `@schedule` annotation in `config`.
    pub fn request_data(
        &mut self,
        listener: ListenerHandle,
        config: &Value,
        schedule: Option<Schedule>,
        checkpoint: Option<Checkpoint>,
    ) -> Result<Descriptor, CoreError> {
        if listener.id().is_empty() {
            return Err(CoreError::config("listener id must not be empty"));
        }
        let type_name = registry::type_of(config)?;
        let schedule = match schedule {
            Some(s) => s,
            None => self.default_schedule(type_name, config)?,
        };
        let instance = self.registry.resolve(type_name, config)?;
        let descriptor = instance.descriptor().clone();

        let set = self.sets.entry(descriptor.clone()).or_default();
        let mut request = DataRequest::new(listener.clone(), schedule).with_checkpoint(checkpoint);
        // A replaced request that is mid-cycle stays in that cycle.
        request.active_cycle = set.get(listener.id()).and_then(|r| r.active_cycle);
        let replaced = set.upsert(request).is_some();

        if schedule.opportunistic {
            if !instance.register_passive(listener.clone()) {
                debug!(component = %descriptor, listener = %listener.id(), "component has no passive mode");
            }
        } else if instance.unregister_passive(listener.id()) {
            debug!(component = %descriptor, listener = %listener.id(), "passive registration removed");
        }

        info!(
            component = %descriptor,
            listener = %listener.id(),
            replaced,
            "data requested"
        );
        self.reschedule(&descriptor)?;
        Ok(descriptor)
    }

    /// Remove `listener`'s requests: for one component, or for every
    /// component when `config` is `None`. Returns how many were removed.
    pub fn unrequest_data(&mut self, listener: &ListenerId, config: Option<&Value>) -> Result<usize, CoreError> {
        if listener.is_empty() {
            return Err(CoreError::config("listener id must not be empty"));
        }
        let targets: Vec<Descriptor> = match config {
            Some(c) => vec![self.registry.describe_value(c)?],
            None => self
                .sets
                .iter()
                .filter(|(_, set)| set.contains(listener))
                .map(|(d, _)| d.clone())
                .collect(),
        };

        let mut removed = 0;
        let mut first_err = None;
        for descriptor in targets {
            let Some(set) = self.sets.get_mut(&descriptor) else {
                continue;
            };
            let Some(request) = set.remove(listener) else {
                continue;
            };
            removed += 1;

            if let Some(instance) = self.registry.get(&descriptor) {
                instance.unregister_passive(listener);
                if request.active_cycle.is_some() {
                    instance.deactivate(vec![listener.clone()]);
                }
                if set.is_empty() {
                    instance.disable();
                }
            }
            info!(component = %descriptor, %listener, "data unrequested");

            if let Err(e) = self.reschedule(&descriptor) {
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(removed),
        }
    }

    fn default_schedule(&self, type_name: &str, config: &Value) -> Result<Schedule, CoreError> {
        let base = self.registry.spec(type_name)?.default_schedule();
        match registry::annotation(config, "schedule") {
            Some(annotated) => base.overlay(annotated),
            None => Ok(base),
        }
    }

    /// Bring the descriptor's trigger in line with its request set.
    ///
    /// An empty set has its trigger cancelled and is dropped; a set with no
    /// live request keeps its requests but loses its trigger. On failure
    /// the set is kept so [`reload`](Self::reload) can retry.
    fn reschedule(&mut self, descriptor: &Descriptor) -> Result<(), CoreError> {
        let merged = match self.sets.get(descriptor) {
            None => return self.wakes.cancel_activate(descriptor),
            Some(set) if set.is_empty() => {
                self.wakes.cancel_activate(descriptor)?;
                self.sets.remove(descriptor);
                debug!(component = %descriptor, "request set removed");
                return Ok(());
            }
            Some(set) => set.merged(),
        };
        match merged {
            Some(m) => {
                self.wakes.set_activate(descriptor, &m)?;
            }
            None => self.wakes.cancel_activate(descriptor)?,
        }
        Ok(())
    }

    // ── Wakes ────────────────────────────────────────────────────────────

    pub fn handle_wake(&mut self, event: WakeEvent) -> Result<(), CoreError> {
        match event {
            WakeEvent::Activate { descriptor, at } => self.activate(&descriptor, at),
            WakeEvent::Deactivate { descriptor, cycle, .. } => {
                self.wakes.note_deactivated(&descriptor, cycle);
                self.deactivate(&descriptor, cycle);
                Ok(())
            }
            WakeEvent::Periodic { owner, action, at } => self.run_periodic(&owner, &action, at),
        }
    }

    fn activate(&mut self, descriptor: &Descriptor, now: Instant) -> Result<(), CoreError> {
        self.wakes.note_fired(descriptor);
        if !self.sets.contains_key(descriptor) {
            trace!(component = %descriptor, "stale activation wake");
            return self.wakes.cancel_activate(descriptor);
        }
        let instance = self.registry.resolve_descriptor(descriptor)?;

        let cycle = self.next_cycle;
        let Some(set) = self.sets.get_mut(descriptor) else {
            return Ok(());
        };
        let merged = set.merged();
        // Due requests join this cycle; requests still active from an
        // earlier cycle are passed along so the instance keeps set order.
        let mut listeners = Vec::new();
        let mut candidates = Vec::new();
        let mut due = 0;
        for request in set.iter_mut() {
            if request.is_due(now) {
                request.last_satisfied_at = Some(now);
                request.active_cycle = Some(cycle);
                candidates.extend(request.checkpoint.take());
                due += 1;
            } else if request.active_cycle.is_none() {
                continue;
            }
            listeners.push(request.listener.clone());
        }

        if due == 0 {
            trace!(component = %descriptor, "wake with nothing due");
            return self.reschedule(descriptor);
        }
        self.next_cycle += 1;

        let checkpoint = if instance.is_resumable() {
            Checkpoint::most_recent(instance.latest_checkpoint().into_iter().chain(candidates))
        } else {
            None
        };
        debug!(
            component = %descriptor,
            cycle,
            listeners = due,
            resumed = checkpoint.is_some(),
            "activating"
        );
        instance.activate(listeners, checkpoint);

        // A zero-duration cycle is a single sample: the deactivation queues
        // right behind the activation on the instance's worker.
        let duration = merged.map_or(Duration::ZERO, |m| m.duration);
        let mut deferral = Ok(());
        if duration.is_zero() {
            self.deactivate(descriptor, cycle);
        } else if let Err(e) = self.wakes.defer_deactivate(descriptor, cycle, duration) {
            warn!(component = %descriptor, cycle, error = %e, "cannot defer deactivation, ending cycle now");
            self.deactivate(descriptor, cycle);
            deferral = Err(e);
        }

        self.reschedule(descriptor)?;
        deferral
    }

    fn deactivate(&mut self, descriptor: &Descriptor, cycle: u64) {
        let Some(set) = self.sets.get_mut(descriptor) else {
            return;
        };
        let ids: Vec<ListenerId> = set
            .in_cycle_mut(cycle)
            .map(|r| {
                r.active_cycle = None;
                r.id().clone()
            })
            .collect();
        if ids.is_empty() {
            return;
        }
        debug!(component = %descriptor, cycle, listeners = ids.len(), "deactivating");
        if let Some(instance) = self.registry.get(descriptor) {
            instance.deactivate(ids);
        }
    }

    // ── Periodic actions ─────────────────────────────────────────────────

    pub fn register_periodic_action(
        &mut self,
        owner: &str,
        action: &str,
        schedule: Schedule,
        callback: PeriodicCallback,
    ) -> Result<(), CoreError> {
        if owner.is_empty() || action.is_empty() {
            return Err(CoreError::config("periodic action needs an owner and a name"));
        }
        let key = (owner.to_string(), action.to_string());
        let runs = self.periodic.get(&key).map_or(0, |a| a.runs);
        self.periodic.insert(key, PeriodicAction { schedule, callback, runs });
        info!(owner, action, "periodic action registered");
        self.schedule_periodic(owner, action, schedule)
    }

    pub fn unregister_periodic_action(&mut self, owner: &str, action: &str) -> Result<bool, CoreError> {
        let removed = self
            .periodic
            .remove(&(owner.to_string(), action.to_string()))
            .is_some();
        self.wakes.cancel_periodic(owner, action)?;
        if removed {
            info!(owner, action, "periodic action unregistered");
        }
        Ok(removed)
    }

    fn schedule_periodic(&mut self, owner: &str, action: &str, schedule: Schedule) -> Result<(), CoreError> {
        match schedule::merge([&schedule]) {
            Some(m) => self.wakes.set_periodic(owner, action, &m).map(|_| ()),
            None => Ok(()),
        }
    }

    fn run_periodic(&mut self, owner: &str, action: &str, at: Instant) -> Result<(), CoreError> {
        let key = (owner.to_string(), action.to_string());
        let Some(entry) = self.periodic.get_mut(&key) else {
            trace!(owner, action, "stale periodic wake");
            return self.wakes.cancel_periodic(owner, action);
        };
        entry.runs += 1;
        let callback = entry.callback.clone();
        let fire_once = entry.schedule.is_fire_once();

        if catch_unwind(AssertUnwindSafe(|| callback(at))).is_err() {
            error!(owner, action, "periodic action panicked");
        }
        if fire_once {
            self.periodic.remove(&key);
            self.wakes.cancel_periodic(owner, action)?;
        }
        Ok(())
    }

    // ── Maintenance ──────────────────────────────────────────────────────

    /// Re-submit every trigger from current demand, e.g. after the timer
    /// service was unavailable.
    pub fn reload(&mut self) -> Result<(), CoreError> {
        self.wakes.forget_all();
        let mut first_err = None;

        let descriptors: Vec<Descriptor> = self.sets.keys().cloned().collect();
        for descriptor in &descriptors {
            if let Err(e) = self.reschedule(descriptor) {
                warn!(component = %descriptor, error = %e, "reload: reschedule failed");
                first_err.get_or_insert(e);
            }
        }
        let actions: Vec<(String, String, Schedule)> = self
            .periodic
            .iter()
            .map(|((o, a), p)| (o.clone(), a.clone(), p.schedule))
            .collect();
        for (owner, action, schedule) in actions {
            if let Err(e) = self.schedule_periodic(&owner, &action, schedule) {
                warn!(owner, action, error = %e, "reload: periodic reschedule failed");
                first_err.get_or_insert(e);
            }
        }

        info!(
            components = descriptors.len(),
            periodic = self.periodic.len(),
            "triggers reloaded"
        );
        first_err.map_or(Ok(()), Err)
    }

    pub fn status(&self) -> DaemonStatus {
        let mut components: Vec<ComponentStatus> = self
            .sets
            .iter()
            .map(|(descriptor, set)| {
                let instance = self.registry.get(descriptor);
                ComponentStatus {
                    descriptor: descriptor.clone(),
                    state: instance.as_ref().map(|i| i.state()),
                    merged: set.merged(),
                    trigger: self.wakes.activation(descriptor).map(|s| s.to_string()),
                    requests: set
                        .iter()
                        .map(|r| RequestStatus {
                            listener: r.id().to_string(),
                            schedule: r.schedule,
                            satisfied: r.last_satisfied_at.is_some(),
                            active: r.active_cycle.is_some(),
                        })
                        .collect(),
                    active_listeners: instance.as_ref().map_or(0, |i| i.active_count()),
                    passive_listeners: instance.as_ref().map_or(0, |i| i.passive_count()),
                }
            })
            .collect();
        components.sort_by_key(|c| c.descriptor.key());

        let periodic = self
            .periodic
            .iter()
            .map(|((owner, action), p)| PeriodicStatus {
                owner: owner.clone(),
                action: action.clone(),
                schedule: p.schedule,
                runs: p.runs,
                trigger: self.wakes.periodic(owner, action).map(|s| s.to_string()),
            })
            .collect();

        DaemonStatus {
            components,
            periodic,
            cached_instances: self.registry.len(),
        }
    }

    /// Cancel every trigger, drop all requests and periodic actions, and
    /// evict every cached instance.
    pub fn teardown(&mut self) {
        if let Err(e) = self.wakes.cancel_all() {
            warn!(error = %e, "teardown: could not cancel every timer");
        }
        let requests: usize = self.sets.values().map(RequestSet::len).sum();
        self.sets.clear();
        self.periodic.clear();
        let evicted = self.registry.evict_all();
        info!(requests, evicted, "request manager torn down");
    }
}
