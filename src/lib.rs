//! sensehub: a shared sensing daemon core.
//!
//! Consumers ask for data from a component described by a JSON config. The
//! [`registry`] maps equivalent configs to one shared instance, the
//! [`manager`] merges every consumer's [`schedule`] into one trigger per
//! instance, and [`lifecycle`] drives each instance's producer through
//! enable, start, stop and disable. The [`coordinator`] serializes all of it
//! behind a cloneable [`DaemonHandle`].

pub mod builtin;
pub mod canonical;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod lifecycle;
pub mod logger;
pub mod manager;
pub mod producer;
pub mod registry;
pub mod schedule;
pub mod wake;

#[cfg(test)]
mod testing;

pub use canonical::CanonicalConfig;
pub use coordinator::DaemonHandle;
pub use error::{AppError, CoreError};
pub use lifecycle::{ComponentInstance, LifecycleState};
pub use manager::DaemonStatus;
pub use producer::{
    Acquisition, Checkpoint, DataListener, DataProducer, Emitter, ListenerHandle, ListenerId,
    ListenerResult, ProducerContext,
};
pub use registry::{Capabilities, ComponentCatalog, ComponentRegistry, ComponentSpec, ConstructContext, Descriptor};
pub use schedule::{MergedSchedule, Schedule};
pub use wake::{FireStrategy, ManualTimerService, TimerService, TokioTimerService};
