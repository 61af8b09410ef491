//! Wake scheduling: turns merged schedules into timer requests.
//!
//! The [`WakeScheduler`] is the only caller of the [`TimerService`]. It maps
//! three kinds of work onto stable timer ids:
//!
//! - `activate/{digest}`: the repeating (or one-shot) trigger of a descriptor,
//! - `deactivate/{digest}/{cycle}`: the end of one activation cycle,
//! - `periodic/{owner}/{action}`: non-sensing periodic work.
//!
//! Every fire is posted as a [`WakeEvent`] into an unbounded channel read by
//! the coordinator, carrying the nominal instant the timer was scheduled for.

mod manual;
mod timer;

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::CoreError;
use crate::registry::Descriptor;
use crate::schedule::MergedSchedule;

pub use manual::ManualTimerService;
pub use timer::{TimerInfo, TokioTimerService};

/// How the timer service should fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireStrategy {
    /// Fire once after `delay`.
    Once { delay: Duration },
    /// Fire now, then exactly every `interval`.
    Exact { interval: Duration },
    /// Fire now, then every `interval`; each fire may be delayed so it can
    /// be batched with others, never early.
    Inexact { interval: Duration },
}

impl FireStrategy {
    /// The strategy that drives a merged schedule.
    pub fn for_schedule(merged: &MergedSchedule) -> Self {
        match merged.interval.filter(|i| !i.is_zero()) {
            None => FireStrategy::Once { delay: Duration::ZERO },
            Some(interval) if merged.strict => FireStrategy::Exact { interval },
            Some(interval) => FireStrategy::Inexact { interval },
        }
    }

    pub fn is_once(&self) -> bool {
        matches!(self, FireStrategy::Once { .. })
    }
}

impl fmt::Display for FireStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FireStrategy::Once { delay } => write!(f, "once after {delay:?}"),
            FireStrategy::Exact { interval } => write!(f, "exact every {interval:?}"),
            FireStrategy::Inexact { interval } => write!(f, "inexact every {interval:?}"),
        }
    }
}

/// Invoked by the timer service with the nominal fire instant.
pub type WakeCallback = Arc<dyn Fn(Instant) + Send + Sync>;

/// External at-least-once wake primitive.
///
/// `set` replaces any timer already registered under `id`; `cancel` of an
/// unknown id is not an error.
pub trait TimerService: Send + Sync {
    fn set(&self, id: &str, strategy: FireStrategy, callback: WakeCallback) -> Result<(), CoreError>;

    fn cancel(&self, id: &str) -> Result<(), CoreError>;
}

/// A timer fire, routed back to the coordinator.
#[derive(Debug, Clone)]
pub enum WakeEvent {
    Activate {
        descriptor: Descriptor,
        at: Instant,
    },
    Deactivate {
        descriptor: Descriptor,
        cycle: u64,
        at: Instant,
    },
    Periodic {
        owner: String,
        action: String,
        at: Instant,
    },
}

pub fn activate_id(descriptor: &Descriptor) -> String {
    format!("activate/{}", descriptor.digest())
}

pub fn deactivate_id(descriptor: &Descriptor, cycle: u64) -> String {
    format!("deactivate/{}/{cycle}", descriptor.digest())
}

pub fn periodic_id(owner: &str, action: &str) -> String {
    format!("periodic/{owner}/{action}")
}

/// Tracks what was last submitted to the timer service so unchanged
/// schedules are not re-submitted, and which cycle ends are still pending.
pub struct WakeScheduler {
    timer: Arc<dyn TimerService>,
    sink: mpsc::UnboundedSender<WakeEvent>,
    submitted: HashMap<String, FireStrategy>,
    deferred: HashSet<String>,
}

impl WakeScheduler {
    pub fn new(timer: Arc<dyn TimerService>, sink: mpsc::UnboundedSender<WakeEvent>) -> Self {
        Self {
            timer,
            sink,
            submitted: HashMap::new(),
            deferred: HashSet::new(),
        }
    }

    /// Point the descriptor's trigger at `merged`. Returns whether the timer
    /// service was called.
    ///
    /// A fire-once schedule is always submitted: each call asks for a new
    /// one-shot wake.
    pub fn set_activate(&mut self, descriptor: &Descriptor, merged: &MergedSchedule) -> Result<bool, CoreError> {
        let strategy = FireStrategy::for_schedule(merged);
        let sink = self.sink.clone();
        let target = descriptor.clone();
        self.submit(activate_id(descriptor), strategy, move |at| {
            let _ = sink.send(WakeEvent::Activate {
                descriptor: target.clone(),
                at,
            });
        })
    }

    /// Remove the descriptor's trigger. Idempotent.
    pub fn cancel_activate(&mut self, descriptor: &Descriptor) -> Result<(), CoreError> {
        self.withdraw(&activate_id(descriptor))
    }

    /// Record that a one-shot activation has fired and is no longer pending.
    pub fn note_fired(&mut self, descriptor: &Descriptor) {
        let id = activate_id(descriptor);
        if self.submitted.get(&id).is_some_and(FireStrategy::is_once) {
            self.submitted.remove(&id);
        }
    }

    /// The strategy currently submitted for the descriptor's trigger.
    pub fn activation(&self, descriptor: &Descriptor) -> Option<FireStrategy> {
        self.submitted.get(&activate_id(descriptor)).copied()
    }

    pub fn is_scheduled(&self, descriptor: &Descriptor) -> bool {
        self.activation(descriptor).is_some()
    }

    /// One-shot wake that ends activation cycle `cycle` after `delay`.
    pub fn defer_deactivate(&mut self, descriptor: &Descriptor, cycle: u64, delay: Duration) -> Result<(), CoreError> {
        let sink = self.sink.clone();
        let target = descriptor.clone();
        let callback: WakeCallback = Arc::new(move |at| {
            let _ = sink.send(WakeEvent::Deactivate {
                descriptor: target.clone(),
                cycle,
                at,
            });
        });
        let id = deactivate_id(descriptor, cycle);
        trace!(timer = %id, ?delay, "deferring deactivation");
        self.timer.set(&id, FireStrategy::Once { delay }, callback)?;
        self.deferred.insert(id);
        Ok(())
    }

    /// Record that the end of cycle `cycle` has fired.
    pub fn note_deactivated(&mut self, descriptor: &Descriptor, cycle: u64) {
        self.deferred.remove(&deactivate_id(descriptor, cycle));
    }

    /// Number of cycle ends still waiting on the timer service.
    pub fn pending_deactivations(&self) -> usize {
        self.deferred.len()
    }

    pub fn set_periodic(&mut self, owner: &str, action: &str, merged: &MergedSchedule) -> Result<bool, CoreError> {
        let strategy = FireStrategy::for_schedule(merged);
        let sink = self.sink.clone();
        let (o, a) = (owner.to_string(), action.to_string());
        self.submit(periodic_id(owner, action), strategy, move |at| {
            let _ = sink.send(WakeEvent::Periodic {
                owner: o.clone(),
                action: a.clone(),
                at,
            });
        })
    }

    pub fn periodic(&self, owner: &str, action: &str) -> Option<FireStrategy> {
        self.submitted.get(&periodic_id(owner, action)).copied()
    }

    pub fn cancel_periodic(&mut self, owner: &str, action: &str) -> Result<(), CoreError> {
        self.withdraw(&periodic_id(owner, action))
    }

    /// Forget what was submitted so the next `set_*` calls re-submit.
    /// Pending cycle ends are kept.
    pub fn forget_all(&mut self) {
        self.submitted.clear();
    }

    /// Cancel every tracked timer, pending cycle ends included, returning
    /// the first failure.
    pub fn cancel_all(&mut self) -> Result<(), CoreError> {
        let ids: Vec<String> = self
            .submitted
            .drain()
            .map(|(id, _)| id)
            .chain(self.deferred.drain())
            .collect();
        let mut first_err = None;
        for id in ids {
            if let Err(e) = self.timer.cancel(&id) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn submit<F>(&mut self, id: String, strategy: FireStrategy, callback: F) -> Result<bool, CoreError>
    where
        F: Fn(Instant) + Send + Sync + 'static,
    {
        if !strategy.is_once() && self.submitted.get(&id) == Some(&strategy) {
            trace!(timer = %id, %strategy, "trigger unchanged");
            return Ok(false);
        }
        match self.timer.set(&id, strategy, Arc::new(callback)) {
            Ok(()) => {
                debug!(timer = %id, %strategy, "trigger submitted");
                self.submitted.insert(id, strategy);
                Ok(true)
            }
            Err(e) => {
                self.submitted.remove(&id);
                Err(e)
            }
        }
    }

    /// Untracked ids are cancelled too: a timer set before a failed call or
    /// a [`forget_all`](Self::forget_all) may still be live.
    fn withdraw(&mut self, id: &str) -> Result<(), CoreError> {
        if self.submitted.remove(id).is_some() {
            debug!(timer = %id, "trigger cancelled");
        }
        self.timer.cancel(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical::CanonicalConfig;
    use serde_json::json;

    fn descriptor() -> Descriptor {
        Descriptor::new("gps", CanonicalConfig::canonicalize(&json!({"rate": 1})))
    }

    fn merged(interval: Option<u64>, strict: bool) -> MergedSchedule {
        MergedSchedule {
            interval: interval.map(Duration::from_secs),
            duration: Duration::ZERO,
            strict,
        }
    }

    fn scheduler() -> (WakeScheduler, Arc<ManualTimerService>, mpsc::UnboundedReceiver<WakeEvent>) {
        let timer = Arc::new(ManualTimerService::new());
        let (tx, rx) = mpsc::unbounded_channel();
        (WakeScheduler::new(timer.clone(), tx), timer, rx)
    }

    #[test]
    fn strategy_follows_schedule() {
        assert_eq!(
            FireStrategy::for_schedule(&merged(None, true)),
            FireStrategy::Once { delay: Duration::ZERO }
        );
        assert_eq!(
            FireStrategy::for_schedule(&merged(Some(30), true)),
            FireStrategy::Exact { interval: Duration::from_secs(30) }
        );
        assert_eq!(
            FireStrategy::for_schedule(&merged(Some(30), false)),
            FireStrategy::Inexact { interval: Duration::from_secs(30) }
        );
    }

    #[test]
    fn unchanged_repeating_schedule_is_not_resubmitted() {
        let (mut wakes, timer, _rx) = scheduler();
        let d = descriptor();
        assert!(wakes.set_activate(&d, &merged(Some(60), false)).unwrap());
        assert!(!wakes.set_activate(&d, &merged(Some(60), false)).unwrap());
        assert!(wakes.set_activate(&d, &merged(Some(30), false)).unwrap());
        assert_eq!(timer.submissions(), 2);
        assert!(wakes.set_activate(&d, &merged(None, false)).unwrap());
        assert!(wakes.set_activate(&d, &merged(None, false)).unwrap());
        assert_eq!(timer.submissions(), 4);
    }

    #[test]
    fn cancel_is_idempotent() {
        let (mut wakes, timer, _rx) = scheduler();
        let d = descriptor();
        wakes.set_activate(&d, &merged(Some(60), false)).unwrap();
        wakes.cancel_activate(&d).unwrap();
        wakes.cancel_activate(&d).unwrap();
        assert!(!timer.is_set(&activate_id(&d)));
        assert!(!wakes.is_scheduled(&d));
    }

    #[tokio::test]
    async fn fires_are_routed_with_nominal_instant() {
        let (mut wakes, timer, mut rx) = scheduler();
        let d = descriptor();
        wakes.set_activate(&d, &merged(Some(10), true)).unwrap();
        wakes.defer_deactivate(&d, 7, Duration::from_secs(5)).unwrap();
        wakes.set_periodic("archive", "upload", &merged(Some(3600), false)).unwrap();

        let t0 = Instant::now();
        assert!(timer.fire(&activate_id(&d), t0));
        assert!(timer.fire(&deactivate_id(&d, 7), t0));
        assert!(timer.fire(&periodic_id("archive", "upload"), t0));

        match rx.recv().await.unwrap() {
            WakeEvent::Activate { descriptor, at } => {
                assert_eq!(descriptor, d);
                assert_eq!(at, t0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await.unwrap(), WakeEvent::Deactivate { cycle: 7, .. }));
        assert!(matches!(rx.recv().await.unwrap(), WakeEvent::Periodic { .. }));
        // One-shot deactivation timers are gone after firing.
        assert!(!timer.is_set(&deactivate_id(&d, 7)));
    }

    #[test]
    fn failed_submission_is_not_recorded() {
        let (mut wakes, timer, _rx) = scheduler();
        let d = descriptor();
        timer.fail_next();
        assert!(matches!(
            wakes.set_activate(&d, &merged(Some(60), false)),
            Err(CoreError::SchedulerUnavailable(_))
        ));
        assert!(!wakes.is_scheduled(&d));
        assert!(wakes.set_activate(&d, &merged(Some(60), false)).unwrap());
    }

    #[test]
    fn cancel_all_covers_pending_cycle_ends() {
        let (mut wakes, timer, _rx) = scheduler();
        let d = descriptor();
        wakes.set_activate(&d, &merged(Some(60), false)).unwrap();
        wakes.defer_deactivate(&d, 0, Duration::from_secs(5)).unwrap();
        wakes.defer_deactivate(&d, 1, Duration::from_secs(5)).unwrap();
        wakes.note_deactivated(&d, 0);
        assert_eq!(wakes.pending_deactivations(), 1);

        // Reload keeps the pending end of cycle 1.
        wakes.forget_all();
        assert_eq!(wakes.pending_deactivations(), 1);

        wakes.cancel_all().unwrap();
        assert_eq!(wakes.pending_deactivations(), 0);
        assert!(!timer.is_set(&deactivate_id(&d, 1)));
        assert!(!timer.is_set(&activate_id(&d)));
    }
}
