//! In-memory timer service driven by hand. Used by tests and by embedders
//! that own their own clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::time::Instant;

use super::{FireStrategy, TimerService, WakeCallback};
use crate::error::CoreError;

/// Records timers instead of running them; [`fire`](Self::fire) invokes a
/// callback with any instant the caller chooses.
#[derive(Default)]
pub struct ManualTimerService {
    timers: Mutex<HashMap<String, (FireStrategy, WakeCallback)>>,
    submissions: AtomicUsize,
    fail_next: AtomicBool,
}

impl ManualTimerService {
    pub fn new() -> Self {
        Self::default()
    }

    fn timers(&self) -> MutexGuard<'_, HashMap<String, (FireStrategy, WakeCallback)>> {
        self.timers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Invoke the timer registered under `id` as if it fired at `at`.
    /// One-shot timers are removed. Returns `false` if nothing is set.
    pub fn fire(&self, id: &str, at: Instant) -> bool {
        let callback = {
            let mut timers = self.timers();
            match timers.get(id) {
                Some((strategy, _)) if strategy.is_once() => timers.remove(id).map(|(_, cb)| cb),
                Some((_, cb)) => Some(cb.clone()),
                None => None,
            }
        };
        match callback {
            Some(cb) => {
                cb(at);
                true
            }
            None => false,
        }
    }

    pub fn is_set(&self, id: &str) -> bool {
        self.timers().contains_key(id)
    }

    pub fn strategy(&self, id: &str) -> Option<FireStrategy> {
        self.timers().get(id).map(|(s, _)| *s)
    }

    /// Number of successful `set` calls so far.
    pub fn submissions(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Make the next `set` or `cancel` fail with `SchedulerUnavailable`.
    pub fn fail_next(&self) {
        self.fail_next.store(true, Ordering::SeqCst);
    }

    fn check(&self) -> Result<(), CoreError> {
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(CoreError::SchedulerUnavailable("manual timer refused".into()));
        }
        Ok(())
    }
}

impl TimerService for ManualTimerService {
    fn set(&self, id: &str, strategy: FireStrategy, callback: WakeCallback) -> Result<(), CoreError> {
        self.check()?;
        self.timers().insert(id.to_string(), (strategy, callback));
        self.submissions.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn cancel(&self, id: &str) -> Result<(), CoreError> {
        self.check()?;
        self.timers().remove(id);
        Ok(())
    }
}
