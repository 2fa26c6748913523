//! The supervisor core
//!
//! All container state lives in a table owned by a single event loop; every
//! mutation travels through the bounded task queue, so handlers see the table
//! as if it were single-threaded. Kernel-level signals (process exits, OOM
//! kills) are bridged into the same queue by forwarder tasks, and every
//! observable change is emitted through the event journal.

mod handlers;
mod restore;
mod task;

pub use task::{
    AddProcessTask, Completion, CompletionHandle, ContainerInfo, CreateCheckpointTask,
    DeleteCheckpointTask, DeleteTask, ExecExitTask, ExitTask, GetContainersTask, OomTask,
    SignalTask, StartTask, StatsTask, Task, UpdateContainerTask, UpdateProcessTask,
};

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::error::{Result, SupervisorError};
use crate::events::{EventLog, Subscription};
use crate::metrics::{Metrics, MetricsSnapshot};
use crate::monitor::ProcessMonitor;
use crate::runtime::{Container, ContainerState, Runtime};

/// One row of the container table
struct ContainerEntry {
    container: Arc<dyn Container>,
    state: ContainerState,
}

/// Result of dispatching one task
enum Outcome {
    /// The handler finished; the loop writes the completion
    Done(Completion, Result<()>),

    /// The handler spawned a worker that now owns the task's channels
    Pending,
}

/// The supervisor: owner of the container table and consumer of the task
/// queue. Constructed with [`Supervisor::new`], optionally fed by
/// [`Supervisor::restore`], then consumed by [`Supervisor::start`].
pub struct Supervisor {
    state_dir: PathBuf,
    runtime: Arc<dyn Runtime>,
    monitor: Arc<ProcessMonitor>,
    events: Arc<EventLog>,
    metrics: Arc<Metrics>,
    containers: HashMap<String, ContainerEntry>,
    task_tx: mpsc::Sender<Task>,
    task_rx: mpsc::Receiver<Task>,
    shutdown: CancellationToken,
}

impl Supervisor {
    /// Build a supervisor and its producer handle
    pub fn new(
        config: &Configuration,
        runtime: Arc<dyn Runtime>,
    ) -> std::io::Result<(Supervisor, SupervisorHandle)> {
        let metrics = Arc::new(Metrics::new());
        let events = Arc::new(EventLog::open(
            &config.journal_path(),
            config.subscriber_capacity,
            metrics.clone(),
        )?);
        let monitor = Arc::new(ProcessMonitor::new(
            config.monitor.poll_interval(),
            config.monitor.exit_capacity,
        ));
        let (task_tx, task_rx) = mpsc::channel(config.task_capacity);
        let shutdown = CancellationToken::new();

        let handle = SupervisorHandle {
            tasks: task_tx.clone(),
            events: events.clone(),
            metrics: metrics.clone(),
            shutdown: shutdown.clone(),
        };

        let supervisor = Supervisor {
            state_dir: config.state_dir.clone(),
            runtime,
            monitor,
            events,
            metrics,
            containers: HashMap::new(),
            task_tx,
            task_rx,
            shutdown,
        };

        Ok((supervisor, handle))
    }

    /// Start the event loop and the exit/OOM forwarders, consuming the
    /// supervisor. Tasks enqueued by [`Supervisor::restore`] are dispatched
    /// first, in order.
    pub fn start(mut self, oom: Option<mpsc::Receiver<String>>) -> JoinHandle<()> {
        // Bridge process exits into the queue
        if let Some(mut exits) = self.monitor.exits() {
            let tx = self.task_tx.clone();
            tokio::spawn(async move {
                while let Some(process) = exits.recv().await {
                    let (task, _handle) = Task::exit(process);
                    if tx.send(task).await.is_err() {
                        return;
                    }
                }
            });
        } else {
            warn!("Monitor exits channel already taken; exit bridging disabled");
        }

        // Bridge OOM notifications into the queue
        if let Some(mut oom) = oom {
            let tx = self.task_tx.clone();
            tokio::spawn(async move {
                while let Some(id) = oom.recv().await {
                    let (task, _handle) = Task::oom(id);
                    if tx.send(task).await.is_err() {
                        return;
                    }
                }
            });
        }

        info!("Supervisor event loop started");
        tokio::spawn(async move {
            loop {
                let task = tokio::select! {
                    biased;
                    _ = self.shutdown.cancelled() => {
                        // Stop intake, then drain what is already queued
                        self.task_rx.close();
                        self.task_rx.recv().await
                    }
                    task = self.task_rx.recv() => task,
                };

                match task {
                    Some(task) => self.dispatch(task).await,
                    None => break,
                }
            }
            self.monitor.shutdown();
            info!("Supervisor event loop stopped");
        })
    }

    async fn dispatch(&mut self, task: Task) {
        let kind = task.kind();
        self.metrics.task_dispatched();
        debug!("Dispatching {} task", kind);

        match self.handle(task).await {
            Outcome::Done(completion, result) => {
                if let Err(e) = &result {
                    self.metrics.task_failed();
                    debug!("{} task failed: {}", kind, e);
                }
                completion.complete(result);
            }
            Outcome::Pending => {}
        }
    }

    fn entry(&self, id: &str) -> Result<&ContainerEntry> {
        self.containers
            .get(id)
            .ok_or_else(|| SupervisorError::ContainerNotFound(id.to_string()))
    }

    /// Runtime handle for `id`, cloned out of the table so handlers can await
    /// on it without holding a table borrow
    fn container(&self, id: &str) -> Result<Arc<dyn Container>> {
        Ok(self.entry(id)?.container.clone())
    }
}

/// Cloneable producer handle to a running supervisor
#[derive(Clone)]
pub struct SupervisorHandle {
    tasks: mpsc::Sender<Task>,
    events: Arc<EventLog>,
    metrics: Arc<Metrics>,
    shutdown: CancellationToken,
}

impl SupervisorHandle {
    /// Enqueue a task. Blocks when the queue is full; that is the
    /// backpressure signal to producers. Fails only after [`stop`].
    ///
    /// [`stop`]: SupervisorHandle::stop
    pub async fn send(&self, task: Task) -> Result<()> {
        self.tasks
            .send(task)
            .await
            .map_err(|_| SupervisorError::Shutdown)
    }

    /// Subscribe to the event stream, optionally replaying journalled
    /// history newer than `from`
    pub fn events(&self, from: Option<DateTime<Utc>>) -> Subscription {
        self.events.subscribe(from)
    }

    /// Remove a subscription; idempotent
    pub fn unsubscribe(&self, subscription_id: u64) {
        self.events.unsubscribe(subscription_id);
    }

    /// Stop accepting new tasks and let the loop drain. In-flight deferred
    /// workers keep running until their channels are served.
    pub fn stop(&self) {
        info!("Supervisor stop requested");
        self.shutdown.cancel();
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }
}
