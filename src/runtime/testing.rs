//! In-memory fakes for the runtime traits, used by supervisor and monitor
//! tests.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;

use crate::error::{Result, SupervisorError};

use super::{Checkpoint, Container, Process, ProcessSpec, Resources, Runtime, Stat, INIT_PROCESS_ID};

#[derive(Default)]
pub(crate) struct FakeRuntime {
    containers: Mutex<HashMap<String, Arc<FakeContainer>>>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Pre-register a container so `load` can find it (restore tests)
    pub fn add_container(&self, id: &str) -> Arc<FakeContainer> {
        let container = Arc::new(FakeContainer::new(id));
        self.containers.lock().insert(id.to_string(), container.clone());
        container
    }

    pub fn get(&self, id: &str) -> Option<Arc<FakeContainer>> {
        self.containers.lock().get(id).cloned()
    }
}

#[async_trait]
impl Runtime for FakeRuntime {
    async fn create(&self, id: &str, _bundle: &Path) -> Result<Arc<dyn Container>> {
        let container = Arc::new(FakeContainer::new(id));
        container.add_process(INIT_PROCESS_ID, 1000);
        self.containers.lock().insert(id.to_string(), container.clone());
        Ok(container)
    }

    async fn load(&self, id: &str) -> Result<Arc<dyn Container>> {
        self.containers
            .lock()
            .get(id)
            .cloned()
            .map(|c| c as Arc<dyn Container>)
            .ok_or_else(|| SupervisorError::ContainerNotFound(id.to_string()))
    }
}

#[derive(Debug)]
pub(crate) struct FakeContainer {
    id: String,
    processes: Mutex<Vec<Arc<FakeProcess>>>,
    paused: AtomicBool,
    deleted: AtomicBool,
    checkpoints: Mutex<Vec<String>>,
    stats_delay: Mutex<Duration>,
}

impl FakeContainer {
    fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            processes: Mutex::new(Vec::new()),
            paused: AtomicBool::new(false),
            deleted: AtomicBool::new(false),
            checkpoints: Mutex::new(Vec::new()),
            stats_delay: Mutex::new(Duration::from_millis(0)),
        }
    }

    pub fn add_process(&self, id: &str, pid: u32) -> Arc<FakeProcess> {
        let process = Arc::new(FakeProcess {
            id: id.to_string(),
            container_id: self.id.clone(),
            pid,
            exit: Mutex::new(None),
            signals: Mutex::new(Vec::new()),
        });
        self.processes.lock().push(process.clone());
        process
    }

    /// Concrete handle for a process, so tests can flip its exit status
    pub fn fake_process(&self, id: &str) -> Option<Arc<FakeProcess>> {
        self.processes.lock().iter().find(|p| p.id == id).cloned()
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn set_stats_delay(&self, delay: Duration) {
        *self.stats_delay.lock() = delay;
    }
}

#[async_trait]
impl Container for FakeContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn bundle(&self) -> &Path {
        Path::new("/tmp/bundle")
    }

    async fn processes(&self) -> Result<Vec<Arc<dyn Process>>> {
        Ok(self
            .processes
            .lock()
            .iter()
            .map(|p| p.clone() as Arc<dyn Process>)
            .collect())
    }

    async fn process(&self, id: &str) -> Result<Arc<dyn Process>> {
        self.processes
            .lock()
            .iter()
            .find(|p| p.id == id)
            .map(|p| p.clone() as Arc<dyn Process>)
            .ok_or_else(|| SupervisorError::ProcessNotFound(id.to_string()))
    }

    async fn exec(&self, id: &str, spec: ProcessSpec) -> Result<Arc<dyn Process>> {
        if spec.terminal {
            return Err(SupervisorError::TerminalsNotSupported);
        }
        let pid = 2000 + self.processes.lock().len() as u32;
        Ok(self.add_process(id, pid))
    }

    async fn stats(&self) -> Result<Stat> {
        let delay = *self.stats_delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(Stat {
            timestamp: Utc::now(),
            memory_bytes: 4096,
            cpu_absolute: 1.5,
            process_count: self.processes.lock().len() as u32,
        })
    }

    async fn pause(&self) -> Result<()> {
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn update(&self, _resources: &Resources) -> Result<()> {
        Ok(())
    }

    async fn checkpoints(&self) -> Result<Vec<String>> {
        Ok(self.checkpoints.lock().clone())
    }

    async fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.checkpoints.lock().push(checkpoint.name.clone());
        Ok(())
    }

    async fn delete_checkpoint(&self, name: &str) -> Result<()> {
        self.checkpoints.lock().retain(|n| n != name);
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.deleted.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[derive(Debug)]
pub(crate) struct FakeProcess {
    id: String,
    container_id: String,
    pid: u32,
    exit: Mutex<Option<i32>>,
    signals: Mutex<Vec<i32>>,
}

impl FakeProcess {
    pub fn standalone(container_id: &str, id: &str, pid: u32) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            container_id: container_id.to_string(),
            pid,
            exit: Mutex::new(None),
            signals: Mutex::new(Vec::new()),
        })
    }

    pub fn set_exited(&self, status: i32) {
        *self.exit.lock() = Some(status);
    }

    pub fn signals(&self) -> Vec<i32> {
        self.signals.lock().clone()
    }
}

#[async_trait]
impl Process for FakeProcess {
    fn id(&self) -> &str {
        &self.id
    }

    fn container_id(&self) -> &str {
        &self.container_id
    }

    fn pid(&self) -> u32 {
        self.pid
    }

    async fn exit_status(&self) -> Result<Option<i32>> {
        Ok(*self.exit.lock())
    }

    async fn signal(&self, signal: i32) -> Result<()> {
        if self.exit.lock().is_some() {
            return Err(SupervisorError::ProcessExited);
        }
        self.signals.lock().push(signal);
        Ok(())
    }

    async fn resize(&self, _width: u32, _height: u32) -> Result<()> {
        Ok(())
    }

    async fn close_stdin(&self) -> Result<()> {
        Ok(())
    }
}
