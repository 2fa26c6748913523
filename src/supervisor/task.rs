//! Task types and completion channels
//!
//! A task is a single-use request for a state transition. It carries its own
//! completion slot: a one-shot error channel written exactly once per task,
//! plus a one-shot result channel for the task kinds that return data,
//! written at most once and only on success. The caller keeps the receive
//! ends; the supervisor (or a worker it spawns) consumes the send ends.

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::debug;

use crate::error::{Result, SupervisorError};
use crate::runtime::{Checkpoint, ContainerState, Process, ProcessSpec, Resources, Stat};

/// Send side of a task's error channel
pub struct Completion {
    tx: oneshot::Sender<Result<()>>,
}

impl Completion {
    pub fn new() -> (Completion, CompletionHandle) {
        let (tx, rx) = oneshot::channel();
        (Completion { tx }, CompletionHandle { rx })
    }

    /// Write the task's outcome. Consumes the slot, so a task can complete
    /// only once.
    pub fn complete(self, result: Result<()>) {
        if self.tx.send(result).is_err() {
            debug!("Task submitter went away before completion");
        }
    }
}

/// Receive side of a task's error channel
pub struct CompletionHandle {
    rx: oneshot::Receiver<Result<()>>,
}

impl CompletionHandle {
    /// Wait for the task to finish. A dropped task (supervisor shut down
    /// before dispatch) reads as [`SupervisorError::Shutdown`].
    pub async fn wait(self) -> Result<()> {
        match self.rx.await {
            Ok(result) => result,
            Err(_) => Err(SupervisorError::Shutdown),
        }
    }
}

/// Summary of a container entry, returned by GetContainers
#[derive(Debug, Clone, Serialize)]
pub struct ContainerInfo {
    pub id: String,
    pub state: ContainerState,
    pub bundle: String,
    pub processes: Vec<String>,
}

/// A requested state transition. The set is closed; every variant operates
/// on at most one container entry.
pub enum Task {
    Start(StartTask),
    Exit(ExitTask),
    ExecExit(ExecExitTask),
    Delete(DeleteTask),
    GetContainers(GetContainersTask),
    Signal(SignalTask),
    AddProcess(AddProcessTask),
    UpdateContainer(UpdateContainerTask),
    UpdateProcess(UpdateProcessTask),
    CreateCheckpoint(CreateCheckpointTask),
    DeleteCheckpoint(DeleteCheckpointTask),
    Stats(StatsTask),
    Oom(OomTask),
}

pub struct StartTask {
    pub id: String,
    pub bundle: PathBuf,
    pub completion: Completion,
}

pub struct ExitTask {
    pub process: Arc<dyn Process>,
    pub completion: Completion,
}

pub struct ExecExitTask {
    pub process: Arc<dyn Process>,
    pub completion: Completion,
}

pub struct DeleteTask {
    pub id: String,
    pub completion: Completion,
}

pub struct GetContainersTask {
    /// Restrict the listing to a single container
    pub id: Option<String>,
    pub completion: Completion,
    pub result: oneshot::Sender<Vec<ContainerInfo>>,
}

pub struct SignalTask {
    pub id: String,
    pub process_id: String,
    pub signal: i32,
    pub completion: Completion,
}

pub struct AddProcessTask {
    pub id: String,
    pub process_id: String,
    pub spec: ProcessSpec,
    pub completion: Completion,
}

pub struct UpdateContainerTask {
    pub id: String,
    /// Requested lifecycle state: `Paused` suspends, `Running` resumes
    pub state: Option<ContainerState>,
    pub resources: Option<Resources>,
    pub completion: Completion,
}

pub struct UpdateProcessTask {
    pub id: String,
    pub process_id: String,
    pub close_stdin: bool,
    pub resize: Option<(u32, u32)>,
    pub completion: Completion,
}

pub struct CreateCheckpointTask {
    pub id: String,
    pub checkpoint: Checkpoint,
    pub completion: Completion,
}

pub struct DeleteCheckpointTask {
    pub id: String,
    pub name: String,
    pub completion: Completion,
}

pub struct StatsTask {
    pub id: String,
    pub completion: Completion,
    pub result: oneshot::Sender<Stat>,
}

pub struct OomTask {
    pub id: String,
    pub completion: Completion,
}

impl Task {
    /// Task kind, for logging and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Task::Start(_) => "start",
            Task::Exit(_) => "exit",
            Task::ExecExit(_) => "exec-exit",
            Task::Delete(_) => "delete",
            Task::GetContainers(_) => "get-containers",
            Task::Signal(_) => "signal",
            Task::AddProcess(_) => "add-process",
            Task::UpdateContainer(_) => "update-container",
            Task::UpdateProcess(_) => "update-process",
            Task::CreateCheckpoint(_) => "create-checkpoint",
            Task::DeleteCheckpoint(_) => "delete-checkpoint",
            Task::Stats(_) => "stats",
            Task::Oom(_) => "oom",
        }
    }

    pub fn start(id: impl Into<String>, bundle: impl Into<PathBuf>) -> (Task, CompletionHandle) {
        let (completion, handle) = Completion::new();
        (
            Task::Start(StartTask {
                id: id.into(),
                bundle: bundle.into(),
                completion,
            }),
            handle,
        )
    }

    pub fn exit(process: Arc<dyn Process>) -> (Task, CompletionHandle) {
        let (completion, handle) = Completion::new();
        (Task::Exit(ExitTask { process, completion }), handle)
    }

    pub fn exec_exit(process: Arc<dyn Process>) -> (Task, CompletionHandle) {
        let (completion, handle) = Completion::new();
        (Task::ExecExit(ExecExitTask { process, completion }), handle)
    }

    pub fn delete(id: impl Into<String>) -> (Task, CompletionHandle) {
        let (completion, handle) = Completion::new();
        (Task::Delete(DeleteTask { id: id.into(), completion }), handle)
    }

    pub fn get_containers(
        id: Option<String>,
    ) -> (Task, CompletionHandle, oneshot::Receiver<Vec<ContainerInfo>>) {
        let (completion, handle) = Completion::new();
        let (result_tx, result_rx) = oneshot::channel();
        (
            Task::GetContainers(GetContainersTask {
                id,
                completion,
                result: result_tx,
            }),
            handle,
            result_rx,
        )
    }

    pub fn signal(
        id: impl Into<String>,
        process_id: impl Into<String>,
        signal: i32,
    ) -> (Task, CompletionHandle) {
        let (completion, handle) = Completion::new();
        (
            Task::Signal(SignalTask {
                id: id.into(),
                process_id: process_id.into(),
                signal,
                completion,
            }),
            handle,
        )
    }

    pub fn add_process(
        id: impl Into<String>,
        process_id: impl Into<String>,
        spec: ProcessSpec,
    ) -> (Task, CompletionHandle) {
        let (completion, handle) = Completion::new();
        (
            Task::AddProcess(AddProcessTask {
                id: id.into(),
                process_id: process_id.into(),
                spec,
                completion,
            }),
            handle,
        )
    }

    pub fn update_container(
        id: impl Into<String>,
        state: Option<ContainerState>,
        resources: Option<Resources>,
    ) -> (Task, CompletionHandle) {
        let (completion, handle) = Completion::new();
        (
            Task::UpdateContainer(UpdateContainerTask {
                id: id.into(),
                state,
                resources,
                completion,
            }),
            handle,
        )
    }

    pub fn update_process(
        id: impl Into<String>,
        process_id: impl Into<String>,
        close_stdin: bool,
        resize: Option<(u32, u32)>,
    ) -> (Task, CompletionHandle) {
        let (completion, handle) = Completion::new();
        (
            Task::UpdateProcess(UpdateProcessTask {
                id: id.into(),
                process_id: process_id.into(),
                close_stdin,
                resize,
                completion,
            }),
            handle,
        )
    }

    pub fn create_checkpoint(
        id: impl Into<String>,
        checkpoint: Checkpoint,
    ) -> (Task, CompletionHandle) {
        let (completion, handle) = Completion::new();
        (
            Task::CreateCheckpoint(CreateCheckpointTask {
                id: id.into(),
                checkpoint,
                completion,
            }),
            handle,
        )
    }

    pub fn delete_checkpoint(
        id: impl Into<String>,
        name: impl Into<String>,
    ) -> (Task, CompletionHandle) {
        let (completion, handle) = Completion::new();
        (
            Task::DeleteCheckpoint(DeleteCheckpointTask {
                id: id.into(),
                name: name.into(),
                completion,
            }),
            handle,
        )
    }

    pub fn stats(id: impl Into<String>) -> (Task, CompletionHandle, oneshot::Receiver<Stat>) {
        let (completion, handle) = Completion::new();
        let (result_tx, result_rx) = oneshot::channel();
        (
            Task::Stats(StatsTask {
                id: id.into(),
                completion,
                result: result_tx,
            }),
            handle,
            result_rx,
        )
    }

    pub fn oom(id: impl Into<String>) -> (Task, CompletionHandle) {
        let (completion, handle) = Completion::new();
        (Task::Oom(OomTask { id: id.into(), completion }), handle)
    }
}
