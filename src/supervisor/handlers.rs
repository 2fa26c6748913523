//! Task handlers
//!
//! One handler per task kind, all running on the event loop. Handlers mutate
//! the container table directly (the loop is the only writer) and emit events
//! through the journal. The only handler allowed to outlive its dispatch is
//! Stats, which hands its channels to a worker task and reports `Pending`.

use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use tracing::debug;

use crate::error::{Result, SupervisorError};
use crate::events::{Event, EventKind};
use crate::runtime::{Checkpoint, ContainerState, Process, ProcessSpec, Resources};

use super::task::{StatsTask, Task};
use super::{ContainerEntry, Outcome, Supervisor};

impl Supervisor {
    pub(super) async fn handle(&mut self, task: Task) -> Outcome {
        match task {
            Task::Start(t) => {
                let result = self.start_container(&t.id, &t.bundle).await;
                Outcome::Done(t.completion, result)
            }
            Task::Exit(t) => {
                let result = self.process_exited(t.process).await;
                Outcome::Done(t.completion, result)
            }
            Task::ExecExit(t) => {
                let result = self.exec_exited(t.process).await;
                Outcome::Done(t.completion, result)
            }
            Task::Delete(t) => {
                let result = self.delete_container(&t.id).await;
                Outcome::Done(t.completion, result)
            }
            Task::GetContainers(t) => match self.list_containers(t.id.as_deref()).await {
                Ok(infos) => {
                    let _ = t.result.send(infos);
                    Outcome::Done(t.completion, Ok(()))
                }
                Err(e) => Outcome::Done(t.completion, Err(e)),
            },
            Task::Signal(t) => {
                let result = self.signal_process(&t.id, &t.process_id, t.signal).await;
                Outcome::Done(t.completion, result)
            }
            Task::AddProcess(t) => {
                let result = self.add_process(&t.id, &t.process_id, t.spec).await;
                Outcome::Done(t.completion, result)
            }
            Task::UpdateContainer(t) => {
                let result = self.update_container(&t.id, t.state, t.resources).await;
                Outcome::Done(t.completion, result)
            }
            Task::UpdateProcess(t) => {
                let result = self
                    .update_process(&t.id, &t.process_id, t.close_stdin, t.resize)
                    .await;
                Outcome::Done(t.completion, result)
            }
            Task::CreateCheckpoint(t) => {
                let result = self.create_checkpoint(&t.id, t.checkpoint).await;
                Outcome::Done(t.completion, result)
            }
            Task::DeleteCheckpoint(t) => {
                let result = self.delete_checkpoint(&t.id, &t.name).await;
                Outcome::Done(t.completion, result)
            }
            Task::Stats(t) => self.collect_stats(t),
            Task::Oom(t) => {
                let result = self.oom(&t.id);
                Outcome::Done(t.completion, result)
            }
        }
    }

    /// Create a runtime container, put all of its processes under watch and
    /// insert it into the table
    async fn start_container(&mut self, id: &str, bundle: &Path) -> Result<()> {
        if self.containers.contains_key(id) {
            return Err(SupervisorError::ContainerExists(id.to_string()));
        }

        let container = self.runtime.create(id, bundle).await?;
        let processes = container.processes().await?;
        for process in &processes {
            self.monitor.monitor(process.clone())?;
        }

        self.containers.insert(
            id.to_string(),
            ContainerEntry {
                container,
                state: ContainerState::Running,
            },
        );
        self.metrics.container_added();

        self.events.notify(Event::new(id, EventKind::StartContainer));
        for process in &processes {
            self.events
                .notify(Event::new(id, EventKind::StartProcess).with_pid(process.id()));
        }
        Ok(())
    }

    /// A watched process exited. Init exits move the container to `exited`;
    /// every other process takes the exec-exit path.
    async fn process_exited(&mut self, process: Arc<dyn Process>) -> Result<()> {
        if !process.is_init() {
            return self.exec_exited(process).await;
        }

        let status = process
            .exit_status()
            .await?
            .ok_or(SupervisorError::ProcessNotExited)?;
        let id = process.container_id().to_string();

        let entry = self
            .containers
            .get_mut(&id)
            .ok_or_else(|| SupervisorError::ContainerNotFound(id.clone()))?;
        entry.state = ContainerState::Exited;

        self.events.notify(
            Event::new(&id, EventKind::Exit)
                .with_pid(process.id())
                .with_status(status),
        );
        Ok(())
    }

    /// A non-init process exited; the container keeps running
    async fn exec_exited(&mut self, process: Arc<dyn Process>) -> Result<()> {
        let status = process
            .exit_status()
            .await?
            .ok_or(SupervisorError::ProcessNotExited)?;
        let id = process.container_id();

        if !self.containers.contains_key(id) {
            return Err(SupervisorError::ContainerNotFound(id.to_string()));
        }

        self.events.notify(
            Event::new(id, EventKind::Exit)
                .with_pid(process.id())
                .with_status(status),
        );
        Ok(())
    }

    /// Remove a container after the runtime released its resources. Emits a
    /// container-level exit marker with an empty pid and status zero.
    async fn delete_container(&mut self, id: &str) -> Result<()> {
        let container = self.container(id)?;
        container.delete().await?;

        self.containers.remove(id);
        self.metrics.container_removed();
        debug!("Deleted container {}", id);

        self.events
            .notify(Event::new(id, EventKind::Exit).with_pid("").with_status(0));
        Ok(())
    }

    async fn list_containers(&mut self, filter: Option<&str>) -> Result<Vec<super::ContainerInfo>> {
        let mut infos = Vec::new();
        match filter {
            Some(id) => {
                let entry = self.entry(id)?;
                infos.push(container_info(id, entry).await?);
            }
            None => {
                for (id, entry) in &self.containers {
                    infos.push(container_info(id, entry).await?);
                }
            }
        }
        Ok(infos)
    }

    async fn signal_process(&mut self, id: &str, process_id: &str, signal: i32) -> Result<()> {
        let container = self.container(id)?;
        let process = container.process(process_id).await?;
        process.signal(signal).await
    }

    /// Exec an additional process in a running container and watch it
    async fn add_process(&mut self, id: &str, process_id: &str, spec: ProcessSpec) -> Result<()> {
        let entry = self.entry(id)?;
        if entry.state == ContainerState::Exited {
            return Err(SupervisorError::ContainerExited(id.to_string()));
        }
        let container = entry.container.clone();

        let process = container.exec(process_id, spec).await?;
        self.monitor.monitor(process.clone())?;

        self.events
            .notify(Event::new(id, EventKind::StartProcess).with_pid(process.id()));
        Ok(())
    }

    async fn update_container(
        &mut self,
        id: &str,
        state: Option<ContainerState>,
        resources: Option<Resources>,
    ) -> Result<()> {
        let container = self.container(id)?;

        match state {
            Some(ContainerState::Paused) => {
                container.pause().await?;
                self.set_state(id, ContainerState::Paused);
            }
            Some(ContainerState::Running) => {
                container.resume().await?;
                self.set_state(id, ContainerState::Running);
            }
            Some(ContainerState::Exited) => {
                return Err(SupervisorError::Other(
                    "cannot transition a container to exited".to_string(),
                ));
            }
            None => {}
        }

        if let Some(resources) = resources {
            container.update(&resources).await?;
        }
        Ok(())
    }

    async fn update_process(
        &mut self,
        id: &str,
        process_id: &str,
        close_stdin: bool,
        resize: Option<(u32, u32)>,
    ) -> Result<()> {
        let container = self.container(id)?;
        let process = container.process(process_id).await?;

        if close_stdin {
            process.close_stdin().await?;
        }
        if let Some((width, height)) = resize {
            process.resize(width, height).await?;
        }
        Ok(())
    }

    async fn create_checkpoint(&mut self, id: &str, checkpoint: Checkpoint) -> Result<()> {
        let entry = self.entry(id)?;
        if entry.state == ContainerState::Exited {
            return Err(SupervisorError::ContainerExited(id.to_string()));
        }
        let container = entry.container.clone();

        if container
            .checkpoints()
            .await?
            .iter()
            .any(|name| name == &checkpoint.name)
        {
            return Err(SupervisorError::CheckpointExists(checkpoint.name));
        }

        container.checkpoint(&checkpoint).await?;
        self.events.notify(Event::new(id, EventKind::Checkpoint));
        Ok(())
    }

    async fn delete_checkpoint(&mut self, id: &str, name: &str) -> Result<()> {
        let container = self.container(id)?;
        if !container.checkpoints().await?.iter().any(|n| n == name) {
            return Err(SupervisorError::CheckpointNotExists(name.to_string()));
        }
        container.delete_checkpoint(name).await
    }

    /// Stats collection is latency-bound and read-only, so it runs on a
    /// worker task that owns the completion channels
    fn collect_stats(&mut self, task: StatsTask) -> Outcome {
        let StatsTask {
            id,
            completion,
            result,
        } = task;

        let container = match self.container(&id) {
            Ok(container) => container,
            Err(e) => return Outcome::Done(completion, Err(e)),
        };
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            let started = Instant::now();
            match container.stats().await {
                Ok(stat) => {
                    metrics.stats_collected(started.elapsed());
                    let _ = result.send(stat);
                    completion.complete(Ok(()));
                }
                Err(e) => {
                    metrics.task_failed();
                    debug!("stats collection for {} failed: {}", id, e);
                    completion.complete(Err(e));
                }
            }
        });

        Outcome::Pending
    }

    fn oom(&mut self, id: &str) -> Result<()> {
        self.events.notify(Event::new(id, EventKind::Oom));
        Ok(())
    }

    fn set_state(&mut self, id: &str, state: ContainerState) {
        if let Some(entry) = self.containers.get_mut(id) {
            entry.state = state;
        }
    }
}

async fn container_info(id: &str, entry: &ContainerEntry) -> Result<super::ContainerInfo> {
    let processes = entry.container.processes().await?;
    Ok(super::ContainerInfo {
        id: id.to_string(),
        state: entry.state,
        bundle: entry.container.bundle().display().to_string(),
        processes: processes.iter().map(|p| p.id().to_string()).collect(),
    })
}
