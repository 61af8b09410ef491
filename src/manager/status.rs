//! Serializable snapshot of the request manager, for `status` callers.

use serde::Serialize;

use crate::lifecycle::LifecycleState;
use crate::registry::Descriptor;
use crate::schedule::{MergedSchedule, Schedule};

#[derive(Debug, Clone, Serialize)]
pub struct DaemonStatus {
    /// One entry per descriptor with registered requests, ordered by key.
    pub components: Vec<ComponentStatus>,
    pub periodic: Vec<PeriodicStatus>,
    /// Instances in the registry cache, including idle ones.
    pub cached_instances: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub descriptor: Descriptor,
    /// `None` when the instance was evicted but requests remain.
    pub state: Option<LifecycleState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged: Option<MergedSchedule>,
    /// The timer currently submitted for this descriptor, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    pub requests: Vec<RequestStatus>,
    pub active_listeners: usize,
    pub passive_listeners: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RequestStatus {
    pub listener: String,
    pub schedule: Schedule,
    pub satisfied: bool,
    pub active: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct PeriodicStatus {
    pub owner: String,
    pub action: String,
    pub schedule: Schedule,
    pub runs: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
}

impl DaemonStatus {
    pub fn request_count(&self) -> usize {
        self.components.iter().map(|c| c.requests.len()).sum()
    }

    pub fn component(&self, descriptor: &Descriptor) -> Option<&ComponentStatus> {
        self.components.iter().find(|c| &c.descriptor == descriptor)
    }
}
