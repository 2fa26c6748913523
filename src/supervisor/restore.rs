//! Startup state restoration
//!
//! Walks the state directory, rehydrates every container into the table,
//! puts still-live processes back under the monitor and synthesises one Exit
//! task per process that died while the supervisor was down. Runs to
//! completion before the event loop accepts external tasks; the Exit tasks it
//! enqueues are the first ones the loop dispatches.

use std::sync::Arc;

use tracing::{debug, info};

use crate::error::{Result, SupervisorError};
use crate::runtime::{ContainerState, Process};

use super::task::Task;
use super::{ContainerEntry, Supervisor};

impl Supervisor {
    /// Rebuild in-memory state from the state directory. Any I/O or load
    /// failure is fatal; a half-restored table is worse than a clean refusal
    /// to start.
    pub async fn restore(&mut self) -> Result<()> {
        let mut entries = tokio::fs::read_dir(&self.state_dir).await?;
        let mut restored = 0usize;

        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_dir() {
                // events.log and friends live alongside container dirs
                continue;
            }
            let id = entry.file_name().to_string_lossy().into_owned();

            let container = self.runtime.load(&id).await?;
            let processes = container.processes().await?;

            let mut exited: Vec<Arc<dyn Process>> = Vec::new();
            for process in processes {
                match process.exit_status().await? {
                    None => self.monitor.monitor(process)?,
                    Some(status) => {
                        debug!(
                            "Process {}/{} exited with status {} while down",
                            id,
                            process.id(),
                            status
                        );
                        exited.push(process);
                    }
                }
            }

            self.containers.insert(
                id.clone(),
                ContainerEntry {
                    container,
                    state: ContainerState::Running,
                },
            );
            self.metrics.container_added();

            // Init exits last; the kernel reaps every other process first.
            // The sort is stable, so non-init processes keep their
            // enumeration order.
            exited.sort_by_key(|process| process.is_init());
            for process in exited {
                let (task, _handle) = Task::exit(process);
                self.task_tx
                    .send(task)
                    .await
                    .map_err(|_| SupervisorError::Shutdown)?;
            }

            restored += 1;
            info!("Restored container {}", id);
        }

        info!("Restore complete, {} containers", restored);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config;
    use crate::events::EventKind;
    use crate::runtime::testing::FakeRuntime;
    use crate::runtime::INIT_PROCESS_ID;
    use chrono::TimeZone;
    use chrono::Utc;
    use std::time::Duration;
    use tokio::time::timeout;

    async fn setup(
        ids: &[&str],
    ) -> (Supervisor, super::super::SupervisorHandle, Arc<FakeRuntime>, tempfile::TempDir) {
        let tmp = tempfile::tempdir().unwrap();
        for id in ids {
            std::fs::create_dir_all(tmp.path().join(id)).unwrap();
        }
        let mut config = config::for_state_dir(tmp.path());
        config.monitor.poll_interval_ms = 5;
        let runtime = FakeRuntime::new();
        let (supervisor, handle) = Supervisor::new(&config, runtime.clone()).unwrap();
        (supervisor, handle, runtime, tmp)
    }

    #[tokio::test]
    async fn test_restore_live_container() {
        let (mut supervisor, handle, runtime, _tmp) = setup(&["c1"]).await;
        let container = runtime.add_container("c1");
        let init = container.add_process(INIT_PROCESS_ID, 100);

        supervisor.restore().await.unwrap();
        supervisor.start(None);

        // Nothing happened yet: no events to replay
        let mut sub = handle.events(Some(Utc.timestamp_opt(0, 0).unwrap()));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(sub.try_recv().is_err());

        // The table has the entry
        let (task, done, result) = Task::get_containers(None);
        handle.send(task).await.unwrap();
        done.wait().await.unwrap();
        let infos = result.await.unwrap();
        assert_eq!(infos.len(), 1);
        assert_eq!(infos[0].id, "c1");
        assert_eq!(infos[0].state, ContainerState::Running);

        // The live process went back under the monitor: its exit surfaces
        init.set_exited(0);
        let event = timeout(Duration::from_secs(2), sub.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind, EventKind::Exit);
        assert_eq!(event.pid.as_deref(), Some(INIT_PROCESS_ID));
    }

    #[tokio::test]
    async fn test_restore_exited_processes_init_last() {
        let (mut supervisor, handle, runtime, _tmp) = setup(&["c1"]).await;
        let container = runtime.add_container("c1");
        // Enumeration order puts init first; the restore sort must still
        // deliver it last
        container.add_process(INIT_PROCESS_ID, 100).set_exited(0);
        container.add_process("x1", 101).set_exited(0);

        supervisor.restore().await.unwrap();
        supervisor.start(None);

        let mut sub = handle.events(Some(Utc.timestamp_opt(0, 0).unwrap()));
        let first = sub.recv().await.unwrap();
        let second = sub.recv().await.unwrap();

        assert_eq!(first.kind, EventKind::Exit);
        assert_eq!(first.pid.as_deref(), Some("x1"));
        assert_eq!(second.kind, EventKind::Exit);
        assert_eq!(second.pid.as_deref(), Some(INIT_PROCESS_ID));

        // Init's exit marked the container exited
        let (task, done, result) = Task::get_containers(Some("c1".into()));
        handle.send(task).await.unwrap();
        done.wait().await.unwrap();
        assert_eq!(result.await.unwrap()[0].state, ContainerState::Exited);
    }

    #[tokio::test]
    async fn test_restore_populates_all_containers() {
        let (mut supervisor, handle, runtime, _tmp) = setup(&["c1", "c2", "c3"]).await;
        for id in ["c1", "c2", "c3"] {
            runtime.add_container(id).add_process(INIT_PROCESS_ID, 100);
        }

        supervisor.restore().await.unwrap();
        supervisor.start(None);

        let (task, done, result) = Task::get_containers(None);
        handle.send(task).await.unwrap();
        done.wait().await.unwrap();
        assert_eq!(result.await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_restore_load_failure_is_fatal() {
        // Directory exists on disk but the runtime knows nothing about it
        let (mut supervisor, _handle, _runtime, _tmp) = setup(&["ghost"]).await;
        assert!(supervisor.restore().await.is_err());
    }

    #[tokio::test]
    async fn test_restore_ignores_journal_file() {
        let (mut supervisor, _handle, _runtime, tmp) = setup(&[]).await;
        std::fs::write(tmp.path().join("events.log"), "").unwrap();
        supervisor.restore().await.unwrap();
    }
}
