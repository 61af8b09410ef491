//! Built-in synthetic components and the logging listener used by the daemon.
//!
//! None of these touch hardware; they exist so a fresh daemon has something
//! to schedule, and so every lifecycle shape (one-shot, continuous with
//! passive delivery, resumable, nested) is exercised end to end.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde_json::{Value, json};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::canonical::CanonicalConfig;
use crate::error::CoreError;
use crate::lifecycle::ComponentInstance;
use crate::producer::{
    Acquisition, DataListener, DataProducer, Emitter, ListenerHandle, ListenerId, ListenerResult,
    ProducerContext,
};
use crate::registry::{Capabilities, ComponentCatalog, ComponentSpec, ConstructContext};
use crate::schedule::Schedule;

/// Capability handed to constructors that need to run async work.
#[derive(Clone)]
pub struct Environment {
    pub runtime: Handle,
}

impl Environment {
    pub fn new(runtime: Handle) -> Self {
        Self { runtime }
    }
}

/// The catalog of every built-in component type.
pub fn catalog() -> ComponentCatalog {
    ComponentCatalog::new()
        .with(
            ComponentSpec::new("clock", Clock::construct)
                .with_default_config(json!({ "label": "clock" }))
                .with_default_schedule(Schedule::every(Duration::from_secs(60))),
        )
        .with(
            ComponentSpec::new("heartbeat", Heartbeat::construct)
                .with_default_config(json!({ "period_ms": 1000 }))
                .with_default_schedule(Schedule::every(Duration::from_secs(30)).with_duration(Duration::from_secs(5))),
        )
        .with(
            ComponentSpec::new("counter", Counter::construct)
                .with_default_config(json!({ "step": 1 }))
                .with_default_schedule(Schedule::every(Duration::from_secs(60))),
        )
        .with(
            ComponentSpec::new("composite", Composite::construct)
                .require("source")
                .with_default_schedule(Schedule::every(Duration::from_secs(60)).with_duration(Duration::from_secs(1))),
        )
}

pub fn capabilities(env: Environment) -> Capabilities {
    Capabilities::new().with(env)
}

fn unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ── clock ────────────────────────────────────────────────────────────────────

/// Emits one timestamp per activation.
pub struct Clock {
    label: String,
}

impl Clock {
    fn construct(ctx: &ConstructContext<'_>) -> Result<Arc<dyn DataProducer>, CoreError> {
        let label = ctx.field::<String>("label")?.unwrap_or_else(|| "clock".into());
        Ok(Arc::new(Self { label }))
    }
}

impl DataProducer for Clock {
    fn on_start(&self, ctx: &ProducerContext) -> Result<Acquisition, CoreError> {
        ctx.emit(json!({ "label": self.label, "unix_ms": unix_ms() }));
        Ok(Acquisition::Complete)
    }
}

// ── heartbeat ────────────────────────────────────────────────────────────────

/// Ticks on its own while enabled; active listeners get the ticks for the
/// duration of a cycle, passive listeners get them whenever they happen.
pub struct Heartbeat {
    period: Duration,
    runtime: Handle,
    ticker: Mutex<Option<CancellationToken>>,
    beats: Arc<AtomicU64>,
}

impl Heartbeat {
    fn construct(ctx: &ConstructContext<'_>) -> Result<Arc<dyn DataProducer>, CoreError> {
        let env: Environment = ctx.capability()?;
        let period_ms: u64 = ctx.field("period_ms")?.unwrap_or(1000);
        if period_ms == 0 {
            return Err(CoreError::config("heartbeat period_ms must be positive"));
        }
        Ok(Arc::new(Self {
            period: Duration::from_millis(period_ms),
            runtime: env.runtime,
            ticker: Mutex::new(None),
            beats: Arc::new(AtomicU64::new(0)),
        }))
    }

    fn ticker(&self) -> MutexGuard<'_, Option<CancellationToken>> {
        self.ticker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn beat(beats: &AtomicU64, emitter: &Emitter) {
        let n = beats.fetch_add(1, Ordering::Relaxed) + 1;
        emitter.emit(json!({ "beat": n, "unix_ms": unix_ms() }));
    }
}

impl DataProducer for Heartbeat {
    fn on_enable(&self, ctx: &ProducerContext) {
        let token = CancellationToken::new();
        let child = token.clone();
        let emitter = ctx.emitter().clone();
        let beats = self.beats.clone();
        let period = self.period;

        self.runtime.spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            loop {
                tokio::select! {
                    _ = child.cancelled() => break,
                    _ = interval.tick() => Self::beat(&beats, &emitter),
                }
            }
            debug!("heartbeat ticker stopped");
        });

        if let Some(old) = self.ticker().replace(token) {
            old.cancel();
        }
    }

    fn on_start(&self, ctx: &ProducerContext) -> Result<Acquisition, CoreError> {
        Self::beat(&self.beats, ctx.emitter());
        Ok(Acquisition::Continuous)
    }

    fn on_disable(&self, _ctx: &ProducerContext) {
        if let Some(token) = self.ticker().take() {
            token.cancel();
        }
    }

    fn supports_passive(&self) -> bool {
        true
    }
}

// ── counter ──────────────────────────────────────────────────────────────────

/// Counts activations. Each cycle checkpoints the count so a restarted
/// instance can continue where the last one stopped.
pub struct Counter {
    step: u64,
    count: AtomicU64,
}

impl Counter {
    fn construct(ctx: &ConstructContext<'_>) -> Result<Arc<dyn DataProducer>, CoreError> {
        let step = ctx.field::<u64>("step")?.unwrap_or(1);
        Ok(Arc::new(Self { step, count: AtomicU64::new(0) }))
    }
}

impl DataProducer for Counter {
    fn on_start(&self, ctx: &ProducerContext) -> Result<Acquisition, CoreError> {
        let count = self.count.fetch_add(self.step, Ordering::SeqCst) + self.step;
        ctx.emit(json!({ "count": count }));
        ctx.emitter().checkpoint(json!({ "count": count }));
        Ok(Acquisition::Complete)
    }

    fn is_resumable(&self) -> bool {
        true
    }

    fn resume_from(&self, checkpoint: &CanonicalConfig) {
        if let Some(count) = checkpoint.get("count").and_then(Value::as_u64) {
            self.count.store(count, Ordering::SeqCst);
        }
    }
}

// ── composite ────────────────────────────────────────────────────────────────

/// Wraps the sub-component configured under `source` and re-emits its data
/// as `{"source": <data>}`.
pub struct Composite {
    source: Arc<ComponentInstance>,
    forward_id: ListenerId,
}

impl Composite {
    fn construct(ctx: &ConstructContext<'_>) -> Result<Arc<dyn DataProducer>, CoreError> {
        let source = ctx.component("source")?;
        let forward_id = ListenerId::new(format!("composite/{}", ctx.descriptor().key()));
        Ok(Arc::new(Self { source, forward_id }))
    }
}

impl DataProducer for Composite {
    fn on_start(&self, ctx: &ProducerContext) -> Result<Acquisition, CoreError> {
        let forward = Forward { emitter: ctx.emitter().clone() };
        self.source
            .activate(vec![ListenerHandle::new(self.forward_id.clone(), Arc::new(forward))], None);
        Ok(Acquisition::Continuous)
    }

    fn on_stop(&self, _ctx: &ProducerContext) {
        self.source.deactivate(vec![self.forward_id.clone()]);
    }
}

struct Forward {
    emitter: Emitter,
}

impl DataListener for Forward {
    fn on_data_received(&self, _config: &CanonicalConfig, data: &CanonicalConfig) -> ListenerResult {
        self.emitter.emit(json!({ "source": data.value() }));
        Ok(())
    }

    fn on_data_completed(&self, _config: &CanonicalConfig, _checkpoint: Option<&CanonicalConfig>) -> ListenerResult {
        self.emitter.finish();
        Ok(())
    }
}

// ── listener ─────────────────────────────────────────────────────────────────

/// Logs everything it receives. Used for config-file subscriptions.
pub struct LogListener {
    name: String,
}

impl LogListener {
    pub fn handle(name: &str) -> ListenerHandle {
        ListenerHandle::new(name, Arc::new(Self { name: name.to_string() }))
    }
}

impl DataListener for LogListener {
    fn on_data_received(&self, config: &CanonicalConfig, data: &CanonicalConfig) -> ListenerResult {
        info!(listener = %self.name, component = %config, data = %data, "data received");
        Ok(())
    }

    fn on_data_completed(&self, config: &CanonicalConfig, checkpoint: Option<&CanonicalConfig>) -> ListenerResult {
        match checkpoint {
            Some(cp) => info!(listener = %self.name, component = %config, checkpoint = %cp, "cycle completed"),
            None => info!(listener = %self.name, component = %config, "cycle completed"),
        }
        Ok(())
    }
}
