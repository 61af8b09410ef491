//! Test doubles shared by the unit tests of several modules.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant as StdInstant};

use serde_json::json;

use crate::canonical::CanonicalConfig;
use crate::error::CoreError;
use crate::lifecycle::Effect;
use crate::producer::{
    Acquisition, DataListener, DataProducer, ListenerHandle, ListenerResult, ProducerContext,
};

/// Records every callback it receives.
#[derive(Default)]
pub struct RecordingListener {
    pub data: Mutex<Vec<CanonicalConfig>>,
    pub completed: Mutex<Vec<Option<CanonicalConfig>>>,
}

impl RecordingListener {
    pub fn data_count(&self) -> usize {
        self.data.lock().unwrap().len()
    }

    pub fn completed_count(&self) -> usize {
        self.completed.lock().unwrap().len()
    }
}

impl DataListener for RecordingListener {
    fn on_data_received(&self, _config: &CanonicalConfig, data: &CanonicalConfig) -> ListenerResult {
        self.data.lock().unwrap().push(data.clone());
        Ok(())
    }

    fn on_data_completed(
        &self,
        _config: &CanonicalConfig,
        checkpoint: Option<&CanonicalConfig>,
    ) -> ListenerResult {
        self.completed.lock().unwrap().push(checkpoint.cloned());
        Ok(())
    }
}

/// Fails or panics on every delivery.
pub struct FaultyListener {
    pub panic: bool,
}

impl DataListener for FaultyListener {
    fn on_data_received(&self, _config: &CanonicalConfig, _data: &CanonicalConfig) -> ListenerResult {
        if self.panic {
            panic!("listener exploded");
        }
        Err("listener refused data".into())
    }
}

pub fn recording(id: &str) -> (ListenerHandle, Arc<RecordingListener>) {
    let rec = Arc::new(RecordingListener::default());
    (ListenerHandle::new(id, rec.clone()), rec)
}

/// Producer that logs its hooks and emits `{"start": n}` on every start.
pub struct RecordingProducer {
    pub effects: Mutex<Vec<Effect>>,
    pub starts: AtomicUsize,
    pub resumed: Mutex<Vec<CanonicalConfig>>,
    mode: Acquisition,
    passive: bool,
    resumable: bool,
}

impl RecordingProducer {
    pub fn new(mode: Acquisition) -> Self {
        Self {
            effects: Mutex::new(Vec::new()),
            starts: AtomicUsize::new(0),
            resumed: Mutex::new(Vec::new()),
            mode,
            passive: false,
            resumable: false,
        }
    }

    pub fn passive(mut self) -> Self {
        self.passive = true;
        self
    }

    pub fn resumable(mut self) -> Self {
        self.resumable = true;
        self
    }

    pub fn effects(&self) -> Vec<Effect> {
        self.effects.lock().unwrap().clone()
    }

    fn record(&self, effect: Effect) {
        self.effects.lock().unwrap().push(effect);
    }
}

impl DataProducer for RecordingProducer {
    fn on_enable(&self, _ctx: &ProducerContext) {
        self.record(Effect::OnEnable);
    }

    fn on_start(&self, ctx: &ProducerContext) -> Result<Acquisition, CoreError> {
        self.record(Effect::OnStart);
        let n = self.starts.fetch_add(1, Ordering::SeqCst) + 1;
        ctx.emit(json!({ "start": n }));
        if self.resumable {
            ctx.emitter().checkpoint(json!({ "start": n }));
        }
        Ok(self.mode)
    }

    fn on_stop(&self, _ctx: &ProducerContext) {
        self.record(Effect::OnStop);
    }

    fn on_disable(&self, _ctx: &ProducerContext) {
        self.record(Effect::OnDisable);
    }

    fn supports_passive(&self) -> bool {
        self.passive
    }

    fn is_resumable(&self) -> bool {
        self.resumable
    }

    fn resume_from(&self, checkpoint: &CanonicalConfig) {
        self.resumed.lock().unwrap().push(checkpoint.clone());
    }
}

/// Poll `cond` until it holds or a generous deadline passes.
pub fn wait_until(what: &str, mut cond: impl FnMut() -> bool) {
    let deadline = StdInstant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(StdInstant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(2));
    }
}
