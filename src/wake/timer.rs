//! In-process timer service: one background task with deadline queues.
//!
//! Exact and one-shot timers live in one `BTreeMap<Instant, id>`, inexact
//! timers in another, keyed by their deadline plus a coalescing slack. The
//! task sleeps until the earliest key; every wake fires each timer whose
//! nominal deadline has passed, so inexact timers ride along with any
//! earlier fire. Zero polling.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::{FireStrategy, TimerService, WakeCallback};
use crate::error::CoreError;

// ── Commands ─────────────────────────────────────────────────────────────────

enum TimerCommand {
    Set {
        id: String,
        strategy: FireStrategy,
        callback: WakeCallback,
    },
    Cancel {
        id: String,
    },
    List {
        reply: oneshot::Sender<Vec<TimerInfo>>,
    },
}

/// One registered timer, as reported by [`TokioTimerService::list`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerInfo {
    pub id: String,
    pub strategy: FireStrategy,
    pub next_due: Instant,
}

// ── Handle ───────────────────────────────────────────────────────────────────

/// Handle to the background timer task. Cheap to clone.
#[derive(Clone)]
pub struct TokioTimerService {
    cmd_tx: mpsc::UnboundedSender<TimerCommand>,
}

impl TokioTimerService {
    /// Spawn the timer task on the current runtime.
    ///
    /// The command queue is unbounded: `set` and `cancel` are called from
    /// synchronous code and only fail once the task has stopped.
    pub fn spawn(inexact_window: Duration, shutdown: CancellationToken) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let task = TimerTask {
            cmd_rx,
            shutdown,
            window: inexact_window,
            entries: HashMap::new(),
            exact: BTreeMap::new(),
            inexact: BTreeMap::new(),
        };
        tokio::spawn(task.run());
        debug!(?inexact_window, "timer service started");
        Self { cmd_tx }
    }

    /// Snapshot of every registered timer, ordered by next deadline.
    pub async fn list(&self) -> Result<Vec<TimerInfo>, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.post(TimerCommand::List { reply })?;
        rx.await.map_err(|_| unavailable("timer task dropped the reply"))
    }

    fn post(&self, cmd: TimerCommand) -> Result<(), CoreError> {
        self.cmd_tx.send(cmd).map_err(|_| unavailable("timer task stopped"))
    }
}

impl TimerService for TokioTimerService {
    fn set(&self, id: &str, strategy: FireStrategy, callback: WakeCallback) -> Result<(), CoreError> {
        self.post(TimerCommand::Set {
            id: id.to_string(),
            strategy,
            callback,
        })
    }

    fn cancel(&self, id: &str) -> Result<(), CoreError> {
        self.post(TimerCommand::Cancel { id: id.to_string() })
    }
}

fn unavailable(msg: &str) -> CoreError {
    CoreError::SchedulerUnavailable(msg.to_string())
}

// ── Task ─────────────────────────────────────────────────────────────────────

struct Entry {
    strategy: FireStrategy,
    callback: WakeCallback,
    /// Nominal deadline; the queue key may be nudged past it.
    due: Instant,
    key: Instant,
}

struct TimerTask {
    cmd_rx: mpsc::UnboundedReceiver<TimerCommand>,
    shutdown: CancellationToken,
    window: Duration,
    entries: HashMap<String, Entry>,
    exact: BTreeMap<Instant, String>,
    inexact: BTreeMap<Instant, String>,
}

impl TimerTask {
    async fn run(mut self) {
        info!("timer service running");

        loop {
            let next_wake = self.next_wake();

            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("timer service shutting down ({} timers dropped)", self.entries.len());
                    break;
                }

                cmd = self.cmd_rx.recv() => {
                    match cmd {
                        Some(TimerCommand::Set { id, strategy, callback }) => {
                            let due = Instant::now() + first_delay(strategy);
                            self.insert(id.clone(), strategy, callback, due);
                            debug!(timer = %id, %strategy, "timer set");
                        }
                        Some(TimerCommand::Cancel { id }) => {
                            if self.remove(&id).is_some() {
                                debug!(timer = %id, "timer cancelled");
                            } else {
                                trace!(timer = %id, "cancel: not found");
                            }
                        }
                        Some(TimerCommand::List { reply }) => {
                            let _ = reply.send(self.list());
                        }
                        None => {
                            debug!("timer handles dropped, stopping");
                            break;
                        }
                    }
                }

                _ = async {
                    match next_wake {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.fire_due(Instant::now());
                }
            }
        }
    }

    fn next_wake(&self) -> Option<Instant> {
        let exact = self.exact.keys().next().copied();
        let inexact = self.inexact.keys().next().copied();
        match (exact, inexact) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Slack an inexact timer may be held back by: the coalescing window,
    /// capped at half its interval.
    fn slack(&self, strategy: FireStrategy) -> Duration {
        match strategy {
            FireStrategy::Inexact { interval } => self.window.min(interval / 2),
            FireStrategy::Once { .. } | FireStrategy::Exact { .. } => Duration::ZERO,
        }
    }

    fn fire_due(&mut self, now: Instant) {
        let mut due: Vec<String> = Vec::new();
        while let Some(entry) = self.exact.first_entry() {
            if *entry.key() > now {
                break;
            }
            due.push(entry.remove());
        }
        // Inexact timers whose nominal deadline has passed ride along.
        let riding: Vec<(Instant, String)> = self
            .inexact
            .iter()
            .filter(|(_, id)| self.entries.get(*id).is_some_and(|e| e.due <= now))
            .map(|(key, id)| (*key, id.clone()))
            .collect();
        for (key, id) in riding {
            self.inexact.remove(&key);
            due.push(id);
        }

        for id in due {
            let Some(entry) = self.entries.remove(&id) else {
                continue;
            };
            trace!(timer = %id, late = ?now.saturating_duration_since(entry.due), "timer firing");
            (entry.callback)(entry.due);

            if let Some(interval) = repeat_interval(entry.strategy) {
                let mut next = entry.due + interval;
                if next <= now {
                    let behind = now.saturating_duration_since(next);
                    let skipped = (behind.as_nanos() / interval.as_nanos()) as u32 + 1;
                    warn!(timer = %id, skipped, "timer fell behind, skipping missed fires");
                    next += interval * skipped;
                }
                self.insert(id, entry.strategy, entry.callback, next);
            }
        }
    }

    fn insert(&mut self, id: String, strategy: FireStrategy, callback: WakeCallback, due: Instant) {
        self.remove(&id);
        let slack = self.slack(strategy);
        let queue = match strategy {
            FireStrategy::Inexact { .. } => &mut self.inexact,
            FireStrategy::Once { .. } | FireStrategy::Exact { .. } => &mut self.exact,
        };
        let key = insert_unique(queue, due + slack, id.clone());
        self.entries.insert(id, Entry { strategy, callback, due, key });
    }

    fn remove(&mut self, id: &str) -> Option<Entry> {
        let entry = self.entries.remove(id)?;
        match entry.strategy {
            FireStrategy::Inexact { .. } => self.inexact.remove(&entry.key),
            _ => self.exact.remove(&entry.key),
        };
        Some(entry)
    }

    fn list(&self) -> Vec<TimerInfo> {
        let mut out: Vec<TimerInfo> = self
            .entries
            .iter()
            .map(|(id, e)| TimerInfo {
                id: id.clone(),
                strategy: e.strategy,
                next_due: e.due,
            })
            .collect();
        out.sort_by(|a, b| a.next_due.cmp(&b.next_due).then_with(|| a.id.cmp(&b.id)));
        out
    }
}

fn first_delay(strategy: FireStrategy) -> Duration {
    match strategy {
        FireStrategy::Once { delay } => delay,
        FireStrategy::Exact { .. } | FireStrategy::Inexact { .. } => Duration::ZERO,
    }
}

fn repeat_interval(strategy: FireStrategy) -> Option<Duration> {
    match strategy {
        FireStrategy::Once { .. } => None,
        FireStrategy::Exact { interval } | FireStrategy::Inexact { interval } => {
            Some(interval).filter(|i| !i.is_zero())
        }
    }
}

/// Insert into the BTreeMap, nudging the key by 1ns if it already exists
/// to guarantee unique keys. Returns the actual key used.
fn insert_unique(queue: &mut BTreeMap<Instant, String>, mut deadline: Instant, id: String) -> Instant {
    while queue.contains_key(&deadline) {
        deadline += Duration::from_nanos(1);
    }
    queue.insert(deadline, id);
    deadline
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tokio::time;

    type Fires = Arc<Mutex<Vec<(String, Instant)>>>;

    fn recorder(fires: &Fires, name: &str) -> WakeCallback {
        let fires = fires.clone();
        let name = name.to_string();
        Arc::new(move |at| fires.lock().unwrap().push((name.clone(), at)))
    }

    fn names(fires: &Fires) -> Vec<String> {
        fires.lock().unwrap().iter().map(|(n, _)| n.clone()).collect()
    }

    async fn settle() {
        // Let the timer task drain its queue.
        for _ in 0..50 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn exact_timer_fires_now_then_every_interval() {
        let shutdown = CancellationToken::new();
        let svc = TokioTimerService::spawn(Duration::from_secs(5), shutdown.clone());
        let fires: Fires = Arc::default();
        let t0 = Instant::now();

        svc.set("a", FireStrategy::Exact { interval: Duration::from_secs(10) }, recorder(&fires, "a"))
            .unwrap();
        settle().await;
        time::advance(Duration::from_secs(25)).await;
        settle().await;

        let fired = fires.lock().unwrap().clone();
        assert_eq!(fired.len(), 3);
        assert_eq!(fired[0].1, t0);
        assert_eq!(fired[1].1, t0 + Duration::from_secs(10));
        assert_eq!(fired[2].1, t0 + Duration::from_secs(20));
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn once_fires_after_delay_and_is_removed() {
        let shutdown = CancellationToken::new();
        let svc = TokioTimerService::spawn(Duration::from_secs(5), shutdown.clone());
        let fires: Fires = Arc::default();

        svc.set("once", FireStrategy::Once { delay: Duration::from_secs(3) }, recorder(&fires, "once"))
            .unwrap();
        settle().await;
        time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert!(fires.lock().unwrap().is_empty());

        time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(names(&fires), vec!["once"]);
        assert!(svc.list().await.unwrap().is_empty());
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn inexact_timers_are_batched_and_never_early() {
        let shutdown = CancellationToken::new();
        let svc = TokioTimerService::spawn(Duration::from_secs(5), shutdown.clone());
        let fires: Fires = Arc::default();
        let t0 = Instant::now();

        svc.set("slow", FireStrategy::Inexact { interval: Duration::from_secs(60) }, recorder(&fires, "slow"))
            .unwrap();
        settle().await;
        // First fire is "now", delayed at most by the window.
        time::advance(Duration::from_secs(6)).await;
        settle().await;
        assert_eq!(names(&fires), vec!["slow"]);
        assert_eq!(fires.lock().unwrap()[0].1, t0);

        // Not early: nothing before t0 + 60s.
        time::advance(Duration::from_secs(50)).await;
        settle().await;
        assert_eq!(fires.lock().unwrap().len(), 1);

        time::advance(Duration::from_secs(10)).await;
        settle().await;
        assert_eq!(fires.lock().unwrap().len(), 2);
        assert_eq!(fires.lock().unwrap()[1].1, t0 + Duration::from_secs(60));
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn inexact_rides_along_with_exact_fire() {
        let shutdown = CancellationToken::new();
        let svc = TokioTimerService::spawn(Duration::from_secs(30), shutdown.clone());
        let fires: Fires = Arc::default();
        let t0 = Instant::now();

        svc.set("inexact", FireStrategy::Inexact { interval: Duration::from_secs(100) }, recorder(&fires, "inexact"))
            .unwrap();
        svc.set("exact", FireStrategy::Once { delay: Duration::from_secs(2) }, recorder(&fires, "exact"))
            .unwrap();
        settle().await;
        time::advance(Duration::from_secs(3)).await;
        settle().await;

        // Due at t0 with 30s of slack, fired together with the t0+2s one-shot.
        let fired = fires.lock().unwrap().clone();
        assert_eq!(fired.len(), 2, "{fired:?}");
        let inexact = fired.iter().find(|(n, _)| n == "inexact").unwrap();
        assert_eq!(inexact.1, t0);
        assert!(fired.iter().any(|(n, _)| n == "exact"));
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn set_replaces_and_cancel_removes() {
        let shutdown = CancellationToken::new();
        let svc = TokioTimerService::spawn(Duration::from_secs(5), shutdown.clone());
        let fires: Fires = Arc::default();

        svc.set("x", FireStrategy::Once { delay: Duration::from_secs(100) }, recorder(&fires, "x"))
            .unwrap();
        svc.set("x", FireStrategy::Once { delay: Duration::from_secs(200) }, recorder(&fires, "x"))
            .unwrap();
        svc.set("y", FireStrategy::Exact { interval: Duration::from_secs(50) }, recorder(&fires, "y"))
            .unwrap();
        svc.cancel("y").unwrap();
        svc.cancel("unknown").unwrap();

        let listed = svc.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, "x");
        assert_eq!(listed[0].strategy, FireStrategy::Once { delay: Duration::from_secs(200) });
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn stopped_service_reports_unavailable() {
        let shutdown = CancellationToken::new();
        let svc = TokioTimerService::spawn(Duration::from_secs(5), shutdown.clone());
        shutdown.cancel();
        settle().await;
        let cb: WakeCallback = Arc::new(|_| {});
        assert!(matches!(
            svc.set("x", FireStrategy::Once { delay: Duration::ZERO }, cb),
            Err(CoreError::SchedulerUnavailable(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_sets_is_never_rejected() {
        let shutdown = CancellationToken::new();
        let svc = TokioTimerService::spawn(Duration::from_secs(5), shutdown.clone());
        let fires: Fires = Arc::default();

        // No yield in between: the task cannot drain until the burst is done.
        for i in 0..200 {
            let id = format!("t{i}");
            svc.set(&id, FireStrategy::Once { delay: Duration::from_secs(1) }, recorder(&fires, &id))
                .unwrap();
        }
        assert_eq!(svc.list().await.unwrap().len(), 200);

        time::advance(Duration::from_secs(2)).await;
        settle().await;
        assert_eq!(fires.lock().unwrap().len(), 200);
        shutdown.cancel();
    }
}
