//! Coordinator: the single task that owns the [`RequestManager`].
//!
//! Every request, unrequest, periodic action change and timer wake is
//! serialized through one tokio task, so the request sets never need a
//! lock. Callers use the cloneable [`DaemonHandle`], which posts a command
//! and awaits the reply; timer callbacks post [`WakeEvent`]s into a separate
//! unbounded channel so a fire is never dropped.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::CoreError;
use crate::manager::{DaemonStatus, PeriodicCallback, RequestManager};
use crate::producer::{Checkpoint, ListenerHandle, ListenerId};
use crate::registry::{ComponentRegistry, Descriptor};
use crate::schedule::Schedule;
use crate::wake::{TimerService, WakeEvent, WakeScheduler};

type Reply<T> = oneshot::Sender<Result<T, CoreError>>;

enum Command {
    Request {
        listener: ListenerHandle,
        config: Value,
        schedule: Option<Schedule>,
        checkpoint: Option<Checkpoint>,
        reply: Reply<Descriptor>,
    },
    Unrequest {
        listener: ListenerId,
        config: Option<Value>,
        reply: Reply<usize>,
    },
    RegisterPeriodic {
        owner: String,
        action: String,
        schedule: Schedule,
        callback: PeriodicCallback,
        reply: Reply<()>,
    },
    UnregisterPeriodic {
        owner: String,
        action: String,
        reply: Reply<bool>,
    },
    Reload {
        reply: Reply<()>,
    },
    Status {
        reply: oneshot::Sender<DaemonStatus>,
    },
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

/// Client-facing handle to the coordinator. Cheap to clone.
#[derive(Clone)]
pub struct DaemonHandle {
    tx: mpsc::Sender<Command>,
}

impl DaemonHandle {
    /// Start a coordinator task on the current runtime.
    ///
    /// The task runs until [`shutdown`](Self::shutdown) is called, every
    /// handle is dropped, or `shutdown` is cancelled; it tears down all
    /// requests and evicts every instance on the way out.
    pub fn spawn(
        registry: Arc<ComponentRegistry>,
        timer: Arc<dyn TimerService>,
        buffer: usize,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let (wake_tx, wake_rx) = mpsc::unbounded_channel();
        let manager = RequestManager::new(registry, WakeScheduler::new(timer, wake_tx));
        let coordinator = Coordinator {
            manager,
            rx,
            wakes: wake_rx,
            shutdown,
        };
        let task = tokio::spawn(coordinator.run());
        (Self { tx }, task)
    }

    /// Request data with the component's default schedule (overlaid by any
    /// `@schedule` annotation in `config`).
    pub async fn request_data(&self, listener: ListenerHandle, config: Value) -> Result<Descriptor, CoreError> {
        self.request_data_with(listener, config, None, None).await
    }

    pub async fn request_data_with(
        &self,
        listener: ListenerHandle,
        config: Value,
        schedule: Option<Schedule>,
        checkpoint: Option<Checkpoint>,
    ) -> Result<Descriptor, CoreError> {
        self.call(|reply| Command::Request {
            listener,
            config,
            schedule,
            checkpoint,
            reply,
        })
        .await
    }

    /// Remove a listener's request for `config`, or every request of that
    /// listener when `config` is `None`.
    pub async fn unrequest_data(
        &self,
        listener: impl Into<ListenerId>,
        config: Option<Value>,
    ) -> Result<usize, CoreError> {
        let listener = listener.into();
        self.call(|reply| Command::Unrequest { listener, config, reply }).await
    }

    pub async fn register_periodic_action(
        &self,
        owner: &str,
        action: &str,
        schedule: Schedule,
        callback: PeriodicCallback,
    ) -> Result<(), CoreError> {
        let (owner, action) = (owner.to_string(), action.to_string());
        self.call(|reply| Command::RegisterPeriodic {
            owner,
            action,
            schedule,
            callback,
            reply,
        })
        .await
    }

    pub async fn unregister_periodic_action(&self, owner: &str, action: &str) -> Result<bool, CoreError> {
        let (owner, action) = (owner.to_string(), action.to_string());
        self.call(|reply| Command::UnregisterPeriodic { owner, action, reply })
            .await
    }

    /// Re-submit every trigger from current demand.
    pub async fn reload(&self) -> Result<(), CoreError> {
        self.call(|reply| Command::Reload { reply }).await
    }

    pub async fn status(&self) -> Result<DaemonStatus, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Status { reply }).await?;
        rx.await.map_err(|_| CoreError::CoordinatorClosed)
    }

    /// Tear everything down and stop the coordinator. Waits for teardown.
    pub async fn shutdown(&self) -> Result<(), CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| CoreError::CoordinatorClosed)
    }

    async fn call<T>(&self, make: impl FnOnce(Reply<T>) -> Command) -> Result<T, CoreError> {
        let (reply, rx) = oneshot::channel();
        self.send(make(reply)).await?;
        rx.await.map_err(|_| CoreError::CoordinatorClosed)?
    }

    async fn send(&self, cmd: Command) -> Result<(), CoreError> {
        self.tx.send(cmd).await.map_err(|_| CoreError::CoordinatorClosed)
    }
}

struct Coordinator {
    manager: RequestManager,
    rx: mpsc::Receiver<Command>,
    wakes: mpsc::UnboundedReceiver<WakeEvent>,
    shutdown: CancellationToken,
}

impl Coordinator {
    async fn run(mut self) {
        info!("coordinator running");

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.cancelled() => {
                    info!("coordinator shutting down");
                    break;
                }

                cmd = self.rx.recv() => {
                    match cmd {
                        Some(Command::Shutdown { reply }) => {
                            self.manager.teardown();
                            let _ = reply.send(());
                            info!("coordinator stopped on request");
                            return;
                        }
                        Some(cmd) => self.handle(cmd),
                        None => {
                            debug!("all daemon handles dropped");
                            break;
                        }
                    }
                }

                Some(event) = self.wakes.recv() => {
                    if let Err(e) = self.manager.handle_wake(event) {
                        warn!(error = %e, "wake handling failed");
                    }
                }
            }
        }

        self.manager.teardown();
    }

    fn handle(&mut self, cmd: Command) {
        match cmd {
            Command::Request {
                listener,
                config,
                schedule,
                checkpoint,
                reply,
            } => {
                let result = self
                    .manager
                    .request_data(listener, &config, schedule, checkpoint);
                if let Err(e) = &result {
                    warn!(error = %e, "request rejected");
                }
                let _ = reply.send(result);
            }
            Command::Unrequest { listener, config, reply } => {
                let _ = reply.send(self.manager.unrequest_data(&listener, config.as_ref()));
            }
            Command::RegisterPeriodic {
                owner,
                action,
                schedule,
                callback,
                reply,
            } => {
                let _ = reply.send(self.manager.register_periodic_action(&owner, &action, schedule, callback));
            }
            Command::UnregisterPeriodic { owner, action, reply } => {
                let _ = reply.send(self.manager.unregister_periodic_action(&owner, &action));
            }
            Command::Reload { reply } => {
                let _ = reply.send(self.manager.reload());
            }
            Command::Status { reply } => {
                let _ = reply.send(self.manager.status());
            }
            // Handled by the run loop.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }
}
