//! Producer and listener contracts.
//!
//! A [`DataProducer`] is the acquisition side of a component: the registry
//! constructs one per descriptor and the instance's worker calls its hooks
//! as the lifecycle moves. A [`DataListener`] is the consumer side: the
//! request manager hands it to instances, which push data through the
//! [`Emitter`].

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Weak};

use serde_json::Value;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::time::Instant;
use tracing::{trace, warn};

use crate::canonical::CanonicalConfig;
use crate::error::CoreError;
use crate::lifecycle::{InstanceShared, WorkerCommand};

// ── Producer ─────────────────────────────────────────────────────────────────

/// Outcome of [`DataProducer::on_start`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquisition {
    /// All data for this cycle has been emitted; the instance stops.
    Complete,
    /// Acquisition keeps running until stopped, deactivated, or
    /// [`Emitter::finish`] is called.
    Continuous,
}

/// The acquisition capability of a component.
///
/// Hooks run only on the instance's worker thread, one at a time, in the
/// order the lifecycle transitions require. Blocking inside a hook stalls
/// only this instance.
pub trait DataProducer: Send + Sync + 'static {
    /// Set up passive/opportunistic plumbing.
    fn on_enable(&self, _ctx: &ProducerContext) {}

    /// Begin active acquisition.
    fn on_start(&self, ctx: &ProducerContext) -> Result<Acquisition, CoreError>;

    /// Halt active acquisition. Passive plumbing stays up.
    fn on_stop(&self, _ctx: &ProducerContext) {}

    /// Release everything `on_enable` allocated.
    fn on_disable(&self, _ctx: &ProducerContext) {}

    /// Whether the producer emits on its own while enabled.
    fn supports_passive(&self) -> bool {
        false
    }

    /// Whether the producer can continue from a checkpoint.
    fn is_resumable(&self) -> bool {
        false
    }

    /// Continue from `checkpoint` on the next start.
    fn resume_from(&self, _checkpoint: &CanonicalConfig) {}
}

/// What a producer hook can see and do.
pub struct ProducerContext {
    config: CanonicalConfig,
    emitter: Emitter,
}

impl ProducerContext {
    pub(crate) fn new(config: CanonicalConfig, emitter: Emitter) -> Self {
        Self { config, emitter }
    }

    /// The descriptor config (with `@type`).
    pub fn config(&self) -> &CanonicalConfig {
        &self.config
    }

    pub fn emitter(&self) -> &Emitter {
        &self.emitter
    }

    pub fn emit(&self, data: Value) {
        self.emitter.emit(data);
    }
}

/// Cloneable handle a producer uses to push data out of its instance.
///
/// Holds only weak references so a producer task that outlives its instance
/// does not keep the instance alive; emitting after teardown is a no-op.
#[derive(Clone)]
pub struct Emitter {
    shared: Weak<InstanceShared>,
    worker: WeakUnboundedSender<WorkerCommand>,
}

impl Emitter {
    pub(crate) fn new(shared: Weak<InstanceShared>, worker: WeakUnboundedSender<WorkerCommand>) -> Self {
        Self { shared, worker }
    }

    /// Deliver `data` to every active and passive listener.
    pub fn emit(&self, data: Value) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let data = CanonicalConfig::canonicalize(&data);
        let listeners = shared.receivers();
        trace!(count = listeners.len(), "emitting data");
        for listener in listeners {
            listener.deliver_data(shared.config(), &data);
        }
    }

    /// Record a resumption checkpoint for this instance.
    pub fn checkpoint(&self, value: Value) {
        if let Some(shared) = self.shared.upgrade() {
            shared.set_checkpoint(Checkpoint::new(CanonicalConfig::canonicalize(&value)));
        }
    }

    /// Signal that continuous acquisition has ended on its own.
    pub fn finish(&self) {
        if let Some(tx) = self.worker.upgrade() {
            let _ = tx.send(WorkerCommand::Finished);
        }
    }
}

// ── Checkpoint ───────────────────────────────────────────────────────────────

/// An opaque resumption token plus the instant it was recorded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Checkpoint {
    pub value: CanonicalConfig,
    pub recorded_at: Instant,
}

impl Checkpoint {
    pub fn new(value: CanonicalConfig) -> Self {
        Self { value, recorded_at: Instant::now() }
    }

    pub fn at(value: CanonicalConfig, recorded_at: Instant) -> Self {
        Self { value, recorded_at }
    }

    /// Join policy for several candidate checkpoints: the most recent wins.
    pub fn most_recent<I>(candidates: I) -> Option<Checkpoint>
    where
        I: IntoIterator<Item = Checkpoint>,
    {
        candidates.into_iter().max_by_key(|c| c.recorded_at)
    }
}

// ── Listener ─────────────────────────────────────────────────────────────────

pub type ListenerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// Consumer callback contract.
pub trait DataListener: Send + Sync + 'static {
    fn on_data_received(&self, config: &CanonicalConfig, data: &CanonicalConfig) -> ListenerResult;

    fn on_data_completed(
        &self,
        _config: &CanonicalConfig,
        _checkpoint: Option<&CanonicalConfig>,
    ) -> ListenerResult {
        Ok(())
    }
}

/// Stable listener identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(Arc<str>);

impl ListenerId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    /// A fresh id of the form `{prefix}-{uuid}` for callers that have no
    /// stable name of their own.
    pub fn unique(prefix: &str) -> Self {
        Self::new(format!("{prefix}-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ListenerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// A listener together with its identity.
#[derive(Clone)]
pub struct ListenerHandle {
    id: ListenerId,
    listener: Arc<dyn DataListener>,
}

impl ListenerHandle {
    pub fn new(id: impl Into<ListenerId>, listener: Arc<dyn DataListener>) -> Self {
        Self { id: id.into(), listener }
    }

    pub fn id(&self) -> &ListenerId {
        &self.id
    }

    /// Deliver data, isolating failures and panics to this listener.
    pub(crate) fn deliver_data(&self, config: &CanonicalConfig, data: &CanonicalConfig) {
        self.isolated("on_data_received", || self.listener.on_data_received(config, data));
    }

    pub(crate) fn deliver_completed(&self, config: &CanonicalConfig, checkpoint: Option<&CanonicalConfig>) {
        self.isolated("on_data_completed", || self.listener.on_data_completed(config, checkpoint));
    }

    fn isolated(&self, callback: &str, f: impl FnOnce() -> ListenerResult) {
        let err = match catch_unwind(AssertUnwindSafe(f)) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => CoreError::ListenerError {
                listener: self.id.to_string(),
                message: e.to_string(),
            },
            Err(_) => CoreError::ListenerError {
                listener: self.id.to_string(),
                message: format!("{callback} panicked"),
            },
        };
        warn!(listener = %self.id, callback, error = %err, "listener callback failed");
    }
}

impl fmt::Debug for ListenerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ListenerHandle").field(&self.id).finish()
    }
}

impl From<String> for ListenerId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}
