//! Data requests and the per-descriptor request set.

use tokio::time::Instant;

use crate::producer::{Checkpoint, ListenerHandle, ListenerId};
use crate::schedule::{self, MergedSchedule, Schedule};

/// One listener's standing request for one descriptor.
#[derive(Debug, Clone)]
pub struct DataRequest {
    pub listener: ListenerHandle,
    pub schedule: Schedule,
    pub last_satisfied_at: Option<Instant>,
    /// Resumption point supplied with the request, consumed on its next
    /// activation.
    pub checkpoint: Option<Checkpoint>,
    /// Activation cycle this listener currently belongs to.
    pub active_cycle: Option<u64>,
}

impl DataRequest {
    pub fn new(listener: ListenerHandle, schedule: Schedule) -> Self {
        Self {
            listener,
            schedule,
            last_satisfied_at: None,
            checkpoint: None,
            active_cycle: None,
        }
    }

    pub fn with_checkpoint(mut self, checkpoint: Option<Checkpoint>) -> Self {
        self.checkpoint = checkpoint;
        self
    }

    pub fn id(&self) -> &ListenerId {
        self.listener.id()
    }

    /// Whether a wake at `now` should deliver to this request: never
    /// satisfied, or its own interval has elapsed since the last delivery.
    pub fn is_due(&self, now: Instant) -> bool {
        match (self.last_satisfied_at, self.schedule.repeat_interval()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(last), Some(interval)) => now.saturating_duration_since(last) >= interval,
        }
    }

    /// Whether the request still needs timer wakes. A satisfied fire-once
    /// request stays registered (for passive delivery) but no longer does.
    pub fn is_live(&self) -> bool {
        !(self.schedule.is_fire_once() && self.last_satisfied_at.is_some())
    }
}

/// Requests for one descriptor, in insertion order, at most one per listener.
#[derive(Debug, Clone, Default)]
pub struct RequestSet {
    requests: Vec<DataRequest>,
}

impl RequestSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert `request`, replacing (in place) any request from the same
    /// listener. Returns the replaced request.
    pub fn upsert(&mut self, request: DataRequest) -> Option<DataRequest> {
        match self.requests.iter_mut().find(|r| r.id() == request.id()) {
            Some(slot) => Some(std::mem::replace(slot, request)),
            None => {
                self.requests.push(request);
                None
            }
        }
    }

    pub fn remove(&mut self, id: &ListenerId) -> Option<DataRequest> {
        let idx = self.requests.iter().position(|r| r.id() == id)?;
        Some(self.requests.remove(idx))
    }

    pub fn get(&self, id: &ListenerId) -> Option<&DataRequest> {
        self.requests.iter().find(|r| r.id() == id)
    }

    pub fn contains(&self, id: &ListenerId) -> bool {
        self.get(id).is_some()
    }

    /// Requests in insertion order.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DataRequest> {
        self.requests.iter_mut()
    }

    /// Requests that belong to activation cycle `cycle`.
    pub fn in_cycle_mut(&mut self, cycle: u64) -> impl Iterator<Item = &mut DataRequest> {
        self.requests.iter_mut().filter(move |r| r.active_cycle == Some(cycle))
    }

    pub fn live_schedules(&self) -> impl Iterator<Item = &Schedule> {
        self.requests.iter().filter(|r| r.is_live()).map(|r| &r.schedule)
    }

    /// The merged schedule of every live request; `None` when nothing
    /// needs a timer.
    pub fn merged(&self) -> Option<MergedSchedule> {
        schedule::merge(self.live_schedules())
    }

    pub fn iter(&self) -> impl Iterator<Item = &DataRequest> {
        self.requests.iter()
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::recording;
    use std::time::Duration;

    fn req(id: &str, schedule: Schedule) -> DataRequest {
        DataRequest::new(recording(id).0, schedule)
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut set = RequestSet::new();
        assert!(set.upsert(req("a", Schedule::every(Duration::from_secs(10)))).is_none());
        assert!(set.upsert(req("b", Schedule::once())).is_none());
        let old = set.upsert(req("a", Schedule::every(Duration::from_secs(20)))).unwrap();

        assert_eq!(old.schedule.interval, Some(Duration::from_secs(10)));
        assert_eq!(set.len(), 2);
        let ids: Vec<&str> = set.iter().map(|r| r.id().as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);
        assert_eq!(set.get(&"a".into()).unwrap().schedule.interval, Some(Duration::from_secs(20)));
    }

    #[test]
    fn due_respects_each_interval() {
        let t0 = Instant::now();
        let mut r = req("a", Schedule::every(Duration::from_secs(30)));
        assert!(r.is_due(t0));
        r.last_satisfied_at = Some(t0);
        assert!(!r.is_due(t0 + Duration::from_secs(10)));
        assert!(r.is_due(t0 + Duration::from_secs(30)));
    }

    #[test]
    fn satisfied_fire_once_is_no_longer_live() {
        let t0 = Instant::now();
        let mut r = req("a", Schedule::once());
        assert!(r.is_live());
        r.last_satisfied_at = Some(t0);
        assert!(!r.is_live());
        assert!(!r.is_due(t0 + Duration::from_secs(3600)));
    }

    #[test]
    fn merged_ignores_satisfied_fire_once() {
        let t0 = Instant::now();
        let mut set = RequestSet::new();
        set.upsert(req("once", Schedule::once().with_duration(Duration::from_secs(5))));
        set.upsert(req("rep", Schedule::every(Duration::from_secs(60))));
        assert_eq!(set.merged().unwrap().duration, Duration::from_secs(5));

        for r in set.iter_mut().filter(|r| r.is_due(t0)) {
            r.last_satisfied_at = Some(t0);
        }
        let merged = set.merged().unwrap();
        assert_eq!(merged.interval, Some(Duration::from_secs(60)));
        assert_eq!(merged.duration, Duration::ZERO);

        set.remove(&"rep".into());
        assert!(set.merged().is_none());
        assert_eq!(set.len(), 1);
    }
}
