//! Component lifecycle: per-instance state machine and sequential worker.
//!
//! Every [`ComponentInstance`] owns one dedicated worker thread. The four
//! lifecycle calls ([`enable`](ComponentInstance::enable),
//! [`start`](ComponentInstance::start), [`stop`](ComponentInstance::stop),
//! [`disable`](ComponentInstance::disable)) and the request manager's
//! activate/deactivate calls are queued to that worker and applied one at a
//! time in FIFO order, so producer hooks never interleave and callers on any
//! thread never block on acquisition.
//!
//! The worker applies events through the pure [`state::transition`] table
//! and runs the returned effects as producer hooks:
//!
//! - stopping completes every active listener (`on_data_completed`, with the
//!   latest checkpoint),
//! - disabling releases the passive listeners.
//!
//! The worker exits on [`ComponentInstance::shutdown`] or when the instance
//! is dropped, disabling the producer on the way out.

pub mod state;

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};

use tokio::sync::{mpsc, watch};
use tracing::{debug, error, trace, warn};

use crate::canonical::CanonicalConfig;
use crate::error::CoreError;
use crate::producer::{
    Acquisition, Checkpoint, DataProducer, Emitter, ListenerHandle, ListenerId, ProducerContext,
};
use crate::registry::Descriptor;

pub use state::{Effect, LifecycleEvent, LifecycleState, transition};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ── Worker commands ──────────────────────────────────────────────────────────

pub(crate) enum WorkerCommand {
    Lifecycle(LifecycleEvent),
    Activate {
        listeners: Vec<ListenerHandle>,
        checkpoint: Option<Checkpoint>,
    },
    Deactivate {
        listeners: Vec<ListenerId>,
    },
    Finished,
    Shutdown,
}

// ── Shared instance state ────────────────────────────────────────────────────

#[derive(Default)]
struct ListenerSets {
    active: Vec<ListenerHandle>,
    passive: Vec<ListenerHandle>,
}

/// State shared between the instance handle, its worker, and emitters.
pub(crate) struct InstanceShared {
    config: CanonicalConfig,
    listeners: Mutex<ListenerSets>,
    checkpoint: Mutex<Option<Checkpoint>>,
    state: watch::Sender<LifecycleState>,
}

impl InstanceShared {
    pub(crate) fn config(&self) -> &CanonicalConfig {
        &self.config
    }

    /// Everyone who should see emitted data: active listeners first, then
    /// passive listeners not already active.
    pub(crate) fn receivers(&self) -> Vec<ListenerHandle> {
        let sets = lock(&self.listeners);
        let mut out = sets.active.clone();
        for p in &sets.passive {
            if !out.iter().any(|l| l.id() == p.id()) {
                out.push(p.clone());
            }
        }
        out
    }

    pub(crate) fn set_checkpoint(&self, checkpoint: Checkpoint) {
        *lock(&self.checkpoint) = Some(checkpoint);
    }

    fn checkpoint(&self) -> Option<Checkpoint> {
        lock(&self.checkpoint).clone()
    }

    /// Put `listeners` at the front of the active set, in the given order.
    /// Active listeners not named keep their relative order behind them.
    fn add_active(&self, listeners: Vec<ListenerHandle>) {
        let mut sets = lock(&self.listeners);
        let previous = std::mem::take(&mut sets.active);
        for l in listeners {
            if !sets.active.iter().any(|a| a.id() == l.id()) {
                sets.active.push(l);
            }
        }
        for l in previous {
            if !sets.active.iter().any(|a| a.id() == l.id()) {
                sets.active.push(l);
            }
        }
    }

    fn take_active(&self, ids: &[ListenerId]) -> Vec<ListenerHandle> {
        let mut sets = lock(&self.listeners);
        let (taken, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut sets.active)
            .into_iter()
            .partition(|l| ids.contains(l.id()));
        sets.active = kept;
        taken
    }

    fn take_all_active(&self) -> Vec<ListenerHandle> {
        std::mem::take(&mut lock(&self.listeners).active)
    }

    fn clear_passive(&self) -> usize {
        let mut sets = lock(&self.listeners);
        let n = sets.passive.len();
        sets.passive.clear();
        n
    }

    fn active_is_empty(&self) -> bool {
        lock(&self.listeners).active.is_empty()
    }
}

// ── ComponentInstance ────────────────────────────────────────────────────────

/// One live acquisition instance, unique per [`Descriptor`].
pub struct ComponentInstance {
    descriptor: Descriptor,
    supports_passive: bool,
    resumable: bool,
    shared: Arc<InstanceShared>,
    tx: mpsc::UnboundedSender<WorkerCommand>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl ComponentInstance {
    /// Wrap `producer` and start its worker thread.
    pub fn spawn(descriptor: Descriptor, producer: Arc<dyn DataProducer>) -> Result<Arc<Self>, CoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(LifecycleState::Disabled);
        let shared = Arc::new(InstanceShared {
            config: descriptor.to_config(),
            listeners: Mutex::new(ListenerSets::default()),
            checkpoint: Mutex::new(None),
            state: state_tx,
        });

        let ctx = ProducerContext::new(
            shared.config.clone(),
            Emitter::new(Arc::downgrade(&shared), tx.downgrade()),
        );
        let worker = Worker {
            label: descriptor.to_string(),
            supports_passive: producer.supports_passive(),
            resumable: producer.is_resumable(),
            producer,
            shared: shared.clone(),
            ctx,
            state: LifecycleState::Disabled,
        };
        let supports_passive = worker.supports_passive;
        let resumable = worker.resumable;

        let handle = thread::Builder::new()
            .name(format!("component-{}", descriptor.key()))
            .spawn(move || worker.run(rx))
            .map_err(|e| CoreError::WorkerUnavailable(format!("{descriptor}: {e}")))?;

        debug!(component = %descriptor, "component instance created");
        Ok(Arc::new(Self {
            descriptor,
            supports_passive,
            resumable,
            shared,
            tx,
            worker: Mutex::new(Some(handle)),
        }))
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn state(&self) -> LifecycleState {
        *self.shared.state.borrow()
    }

    pub fn supports_passive(&self) -> bool {
        self.supports_passive
    }

    pub fn is_resumable(&self) -> bool {
        self.resumable
    }

    /// The most recent checkpoint recorded by the producer.
    pub fn latest_checkpoint(&self) -> Option<Checkpoint> {
        self.shared.checkpoint()
    }

    pub fn enable(&self) {
        self.post(WorkerCommand::Lifecycle(LifecycleEvent::Enable));
    }

    pub fn start(&self) {
        self.post(WorkerCommand::Lifecycle(LifecycleEvent::Start));
    }

    pub fn stop(&self) {
        self.post(WorkerCommand::Lifecycle(LifecycleEvent::Stop));
    }

    pub fn disable(&self) {
        self.post(WorkerCommand::Lifecycle(LifecycleEvent::Disable));
    }

    /// Add `listeners` to the active set and start acquisition, resuming
    /// from `checkpoint` first when the producer supports it.
    pub fn activate(&self, listeners: Vec<ListenerHandle>, checkpoint: Option<Checkpoint>) {
        self.post(WorkerCommand::Activate { listeners, checkpoint });
    }

    /// Complete and remove `listeners` from the active set; stops the
    /// instance once no active listener remains.
    pub fn deactivate(&self, listeners: Vec<ListenerId>) {
        self.post(WorkerCommand::Deactivate { listeners });
    }

    /// Register `listener` for passive delivery and enable the instance.
    ///
    /// Returns `false` (and registers nothing) if the producer has no
    /// passive mode.
    pub fn register_passive(&self, listener: ListenerHandle) -> bool {
        if !self.supports_passive {
            return false;
        }
        {
            let mut sets = lock(&self.shared.listeners);
            match sets.passive.iter_mut().find(|p| p.id() == listener.id()) {
                Some(slot) => *slot = listener,
                None => sets.passive.push(listener),
            }
        }
        self.enable();
        true
    }

    pub fn unregister_passive(&self, id: &ListenerId) -> bool {
        let mut sets = lock(&self.shared.listeners);
        let before = sets.passive.len();
        sets.passive.retain(|p| p.id() != id);
        sets.passive.len() != before
    }

    pub fn passive_count(&self) -> usize {
        lock(&self.shared.listeners).passive.len()
    }

    pub fn active_count(&self) -> usize {
        lock(&self.shared.listeners).active.len()
    }

    /// Disable the producer and stop the worker thread.
    ///
    /// Waits for queued commands to drain unless called from the worker
    /// itself. Further lifecycle calls are ignored.
    pub fn shutdown(&self) {
        self.post(WorkerCommand::Shutdown);
        let handle = lock(&self.worker).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                error!(component = %self.descriptor, "component worker panicked");
            }
        }
    }

    fn post(&self, cmd: WorkerCommand) {
        if self.tx.send(cmd).is_err() {
            trace!(component = %self.descriptor, "worker gone, command dropped");
        }
    }
}

impl Drop for ComponentInstance {
    fn drop(&mut self) {
        let _ = self.tx.send(WorkerCommand::Shutdown);
    }
}

impl std::fmt::Debug for ComponentInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComponentInstance")
            .field("descriptor", &self.descriptor)
            .field("state", &self.state())
            .finish()
    }
}

// ── Worker ───────────────────────────────────────────────────────────────────

struct Worker {
    label: String,
    producer: Arc<dyn DataProducer>,
    supports_passive: bool,
    resumable: bool,
    shared: Arc<InstanceShared>,
    ctx: ProducerContext,
    state: LifecycleState,
}

impl Worker {
    fn run(mut self, mut rx: mpsc::UnboundedReceiver<WorkerCommand>) {
        trace!(component = %self.label, "worker running");
        while let Some(cmd) = rx.blocking_recv() {
            match cmd {
                WorkerCommand::Lifecycle(event) => self.apply(event),
                WorkerCommand::Activate { listeners, checkpoint } => {
                    if let Some(cp) = checkpoint.filter(|_| self.resumable) {
                        debug!(component = %self.label, checkpoint = %cp.value, "resuming");
                        let producer = self.producer.clone();
                        self.guarded("resume_from", || producer.resume_from(&cp.value));
                    }
                    self.shared.add_active(listeners);
                    self.apply(LifecycleEvent::Start);
                }
                WorkerCommand::Deactivate { listeners } => {
                    let done = self.shared.take_active(&listeners);
                    self.complete(done);
                    if self.state == LifecycleState::Running && self.shared.active_is_empty() {
                        self.apply(LifecycleEvent::Stop);
                    }
                }
                WorkerCommand::Finished => {
                    if self.state == LifecycleState::Running {
                        self.apply(LifecycleEvent::Stop);
                    }
                }
                WorkerCommand::Shutdown => break,
            }
        }
        self.apply(LifecycleEvent::Disable);
        debug!(component = %self.label, "worker exited");
    }

    fn apply(&mut self, event: LifecycleEvent) {
        let from = self.state;
        let (next, effects) = transition(from, event);
        let mut finished = false;

        for &effect in effects {
            let producer = self.producer.clone();
            match effect {
                Effect::OnEnable => {
                    self.guarded("on_enable", || producer.on_enable(&self.ctx));
                }
                Effect::OnStart => {
                    let outcome = catch_unwind(AssertUnwindSafe(|| producer.on_start(&self.ctx)));
                    finished = match outcome {
                        Ok(Ok(Acquisition::Continuous)) => false,
                        Ok(Ok(Acquisition::Complete)) => true,
                        Ok(Err(e)) => {
                            warn!(component = %self.label, error = %e, "acquisition failed to start");
                            true
                        }
                        Err(_) => {
                            error!(component = %self.label, "on_start panicked");
                            true
                        }
                    };
                }
                Effect::OnStop => {
                    self.guarded("on_stop", || producer.on_stop(&self.ctx));
                    let done = self.shared.take_all_active();
                    self.complete(done);
                }
                Effect::OnDisable => {
                    self.guarded("on_disable", || producer.on_disable(&self.ctx));
                    let released = self.shared.clear_passive();
                    if released > 0 {
                        debug!(component = %self.label, released, "passive listeners released");
                    }
                }
            }
        }

        self.state = next;
        self.shared.state.send_replace(next);
        if from != next {
            debug!(component = %self.label, from = from.as_str(), to = next.as_str(), "lifecycle transition");
        }

        if finished && self.state == LifecycleState::Running {
            self.apply(LifecycleEvent::Stop);
        }
    }

    /// Deliver `on_data_completed` with the latest checkpoint.
    fn complete(&self, listeners: Vec<ListenerHandle>) {
        if listeners.is_empty() {
            return;
        }
        let checkpoint = self.shared.checkpoint();
        let cp = checkpoint.as_ref().map(|c| &c.value);
        for l in listeners {
            l.deliver_completed(self.shared.config(), cp);
        }
    }

    fn guarded(&self, hook: &str, f: impl FnOnce()) {
        if catch_unwind(AssertUnwindSafe(f)).is_err() {
            error!(component = %self.label, hook, "producer hook panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::*;
    use serde_json::json;

    fn instance(producer: Arc<RecordingProducer>) -> Arc<ComponentInstance> {
        let d = Descriptor::new("test", CanonicalConfig::canonicalize(&json!({"id": 1})));
        ComponentInstance::spawn(d, producer).unwrap()
    }

    fn settle(inst: &ComponentInstance, want: LifecycleState) {
        wait_until(&format!("state {want:?}"), || inst.state() == want);
    }

    #[test]
    fn one_shot_activation_delivers_then_completes() {
        let producer = Arc::new(RecordingProducer::new(Acquisition::Complete).resumable());
        let inst = instance(producer.clone());
        let (l1, r1) = recording("l1");
        let (l2, r2) = recording("l2");

        inst.activate(vec![l1, l2], None);
        wait_until("completion", || r2.completed_count() == 1);

        assert_eq!(r1.data_count(), 1);
        assert_eq!(r1.completed_count(), 1);
        let cp = r1.completed.lock().unwrap()[0].clone().unwrap();
        assert_eq!(cp.as_str(), r#"{"start":1}"#);
        settle(&inst, LifecycleState::Enabled);
        assert_eq!(
            producer.effects(),
            vec![Effect::OnEnable, Effect::OnStart, Effect::OnStop]
        );
        assert_eq!(inst.active_count(), 0);
        inst.shutdown();
    }

    #[test]
    fn continuous_instance_stops_when_last_active_listener_leaves() {
        let producer = Arc::new(RecordingProducer::new(Acquisition::Continuous));
        let inst = instance(producer.clone());
        let (a, ra) = recording("a");
        let (b, rb) = recording("b");

        inst.activate(vec![a, b], None);
        settle(&inst, LifecycleState::Running);

        inst.deactivate(vec![ListenerId::from("a")]);
        wait_until("a completed", || ra.completed_count() == 1);
        assert_eq!(inst.state(), LifecycleState::Running);
        assert_eq!(rb.completed_count(), 0);

        inst.deactivate(vec![ListenerId::from("b")]);
        wait_until("b completed", || rb.completed_count() == 1);
        settle(&inst, LifecycleState::Enabled);
        inst.shutdown();
    }

    #[test]
    fn activation_order_decides_delivery_order() {
        let producer = Arc::new(RecordingProducer::new(Acquisition::Continuous));
        let inst = instance(producer);
        let (a, _) = recording("a");
        let (b, _) = recording("b");
        let (c, _) = recording("c");

        inst.activate(vec![b.clone(), c], None);
        settle(&inst, LifecycleState::Running);
        inst.activate(vec![a, b], None);
        wait_until("a active", || inst.active_count() == 3);

        let order: Vec<String> = inst.shared.receivers().iter().map(|l| l.id().to_string()).collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        inst.shutdown();
    }

    #[test]
    fn disable_from_running_stops_first() {
        let producer = Arc::new(RecordingProducer::new(Acquisition::Continuous));
        let inst = instance(producer.clone());
        inst.start();
        settle(&inst, LifecycleState::Running);
        inst.disable();
        settle(&inst, LifecycleState::Disabled);
        assert_eq!(
            producer.effects(),
            vec![Effect::OnEnable, Effect::OnStart, Effect::OnStop, Effect::OnDisable]
        );
        inst.shutdown();
    }

    #[test]
    fn calls_from_many_threads_apply_in_valid_order() {
        let producer = Arc::new(RecordingProducer::new(Acquisition::Continuous));
        let inst = instance(producer.clone());

        let threads: Vec<_> = (0..8)
            .map(|i| {
                let inst = inst.clone();
                thread::spawn(move || {
                    for j in 0..50 {
                        match (i + j) % 4 {
                            0 => inst.enable(),
                            1 => inst.start(),
                            2 => inst.stop(),
                            _ => inst.disable(),
                        }
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }
        inst.shutdown();

        let effects = producer.effects();
        assert!(!effects.is_empty());
        assert_eq!(
            state::replay(LifecycleState::Disabled, &effects),
            Some(LifecycleState::Disabled),
            "invalid effect sequence: {effects:?}"
        );
    }

    #[test]
    fn passive_listener_receives_and_is_released_on_disable() {
        let producer = Arc::new(RecordingProducer::new(Acquisition::Complete).passive());
        let inst = instance(producer.clone());
        let (p, rp) = recording("passive");

        assert!(inst.register_passive(p));
        settle(&inst, LifecycleState::Enabled);

        // An active cycle reaches passive listeners too, but does not complete them.
        let (a, _ra) = recording("active");
        inst.activate(vec![a], None);
        wait_until("passive data", || rp.data_count() == 1);
        settle(&inst, LifecycleState::Enabled);
        assert_eq!(rp.completed_count(), 0);
        assert_eq!(inst.passive_count(), 1);

        inst.disable();
        settle(&inst, LifecycleState::Disabled);
        assert_eq!(inst.passive_count(), 0);
        inst.shutdown();
    }

    #[test]
    fn passive_registration_refused_without_passive_mode() {
        let inst = instance(Arc::new(RecordingProducer::new(Acquisition::Complete)));
        let (p, _) = recording("p");
        assert!(!inst.register_passive(p));
        assert_eq!(inst.passive_count(), 0);
        inst.shutdown();
    }

    #[test]
    fn checkpoint_is_handed_to_resumable_producer() {
        let producer = Arc::new(RecordingProducer::new(Acquisition::Complete).resumable());
        let inst = instance(producer.clone());
        let (l, rl) = recording("l");
        let cp = Checkpoint::new(CanonicalConfig::canonicalize(&json!({"start": 41})));

        inst.activate(vec![l], Some(cp));
        wait_until("completion", || rl.completed_count() == 1);
        assert_eq!(producer.resumed.lock().unwrap()[0].as_str(), r#"{"start":41}"#);
        inst.shutdown();
    }

    #[test]
    fn shutdown_disables_and_ignores_later_calls() {
        let producer = Arc::new(RecordingProducer::new(Acquisition::Continuous));
        let inst = instance(producer.clone());
        inst.start();
        inst.shutdown();
        assert_eq!(inst.state(), LifecycleState::Disabled);
        inst.start();
        assert_eq!(producer.effects().last(), Some(&Effect::OnDisable));
    }
}
