//! Filesystem-backed runtime
//!
//! Keeps the supervisor's view of runtime state in plain files under the
//! state directory, the same shape a shim process would maintain:
//!
//! ```text
//! <state>/<container-id>/
//!     runtime                          backend marker, validated on load
//!     bundle                           path of the container bundle
//!     processes/<process-id>/pid       OS pid
//!     processes/<process-id>/spec.json recorded process spec
//!     processes/<process-id>/exit-status
//!     checkpoints/<name>/checkpoint.json
//! ```
//!
//! The exit-status file is written by the spawn waiter when the process is
//! reaped and is read non-destructively any number of times. The init spec is
//! read from `<bundle>/process.json`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use sysinfo::{ProcessRefreshKind, ProcessesToUpdate, System};
use tracing::{debug, warn};

use crate::error::{Result, SupervisorError};

use super::{Checkpoint, Container, Process, ProcessSpec, Resources, Runtime, Stat, INIT_PROCESS_ID};

/// Marker written to `<state>/<id>/runtime`
const RUNTIME_KIND: &str = "shim-v1";

/// Status recorded for adopted processes that died without an exit file
const UNKNOWN_EXIT_STATUS: i32 = 255;

/// Filesystem-backed [`Runtime`]
pub struct BundleRuntime {
    state_dir: PathBuf,
}

impl BundleRuntime {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }

    fn container_dir(&self, id: &str) -> PathBuf {
        self.state_dir.join(id)
    }
}

#[async_trait]
impl Runtime for BundleRuntime {
    async fn create(&self, id: &str, bundle: &Path) -> Result<Arc<dyn Container>> {
        let dir = self.container_dir(id);
        if dir.exists() {
            return Err(SupervisorError::ContainerExists(id.to_string()));
        }

        tokio::fs::create_dir_all(dir.join("processes")).await?;
        tokio::fs::write(dir.join("runtime"), RUNTIME_KIND).await?;
        tokio::fs::write(dir.join("bundle"), bundle.display().to_string()).await?;

        let container = ShimContainer {
            id: id.to_string(),
            dir,
            bundle: bundle.to_path_buf(),
        };

        // The init spec comes with the bundle
        let spec_raw = tokio::fs::read(bundle.join("process.json")).await?;
        let spec: ProcessSpec = serde_json::from_slice(&spec_raw)
            .map_err(|e| SupervisorError::Spawn(format!("invalid init spec: {}", e)))?;

        container.spawn(INIT_PROCESS_ID, &spec).await?;
        debug!("Created container {} from bundle {}", id, bundle.display());

        Ok(Arc::new(container))
    }

    async fn load(&self, id: &str) -> Result<Arc<dyn Container>> {
        let dir = self.container_dir(id);

        let kind = tokio::fs::read_to_string(dir.join("runtime")).await?;
        if kind.trim() != RUNTIME_KIND {
            return Err(SupervisorError::InvalidContainerType(kind.trim().to_string()));
        }

        let bundle = tokio::fs::read_to_string(dir.join("bundle")).await?;
        Ok(Arc::new(ShimContainer {
            id: id.to_string(),
            dir,
            bundle: PathBuf::from(bundle.trim()),
        }))
    }
}

/// Container handle over a state directory
#[derive(Debug)]
pub struct ShimContainer {
    id: String,
    dir: PathBuf,
    bundle: PathBuf,
}

impl ShimContainer {
    fn process_dir(&self, process_id: &str) -> PathBuf {
        self.dir.join("processes").join(process_id)
    }

    fn checkpoint_dir(&self, name: &str) -> PathBuf {
        self.dir.join("checkpoints").join(name)
    }

    /// Spawn a process and arrange for its exit status to be recorded
    async fn spawn(&self, process_id: &str, spec: &ProcessSpec) -> Result<Arc<ShimProcess>> {
        if spec.terminal {
            return Err(SupervisorError::TerminalsNotSupported);
        }
        let program = spec
            .args
            .first()
            .ok_or_else(|| SupervisorError::Spawn("empty argument list".to_string()))?;

        let proc_dir = self.process_dir(process_id);
        if proc_dir.exists() {
            return Err(SupervisorError::Other(format!(
                "process {} already exists in container {}",
                process_id, self.id
            )));
        }
        tokio::fs::create_dir_all(&proc_dir).await?;

        let mut command = tokio::process::Command::new(program);
        command
            .args(&spec.args[1..])
            .envs(&spec.env)
            .current_dir(spec.cwd.as_deref().unwrap_or(&self.bundle))
            .stdin(std::process::Stdio::null())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null());

        let mut child = command
            .spawn()
            .map_err(|e| SupervisorError::Spawn(format!("{}: {}", program, e)))?;
        let pid = child
            .id()
            .ok_or_else(|| SupervisorError::Spawn("child exited before pid read".to_string()))?;

        tokio::fs::write(proc_dir.join("pid"), pid.to_string()).await?;
        tokio::fs::write(proc_dir.join("spec.json"), serde_json::to_vec(spec).unwrap_or_default())
            .await?;

        // Reap the child and record its exit status for non-destructive reads
        let status_path = proc_dir.join("exit-status");
        let id = format!("{}/{}", self.id, process_id);
        tokio::spawn(async move {
            let status = match child.wait().await {
                Ok(status) => exit_code(status),
                Err(e) => {
                    warn!("Failed to wait on process {}: {}", id, e);
                    UNKNOWN_EXIT_STATUS
                }
            };
            if let Err(e) = tokio::fs::write(&status_path, status.to_string()).await {
                warn!("Failed to record exit status for {}: {}", id, e);
            }
        });

        Ok(Arc::new(ShimProcess {
            id: process_id.to_string(),
            container_id: self.id.clone(),
            dir: proc_dir,
            pid,
        }))
    }

    /// Processes that have not recorded an exit yet
    async fn live_processes(&self) -> Result<Vec<Arc<dyn Process>>> {
        let mut live = Vec::new();
        for process in self.processes().await? {
            if process.exit_status().await?.is_none() {
                live.push(process);
            }
        }
        Ok(live)
    }

    async fn signal_live(&self, signal: i32) -> Result<()> {
        for process in self.live_processes().await? {
            if let Err(e) = process.signal(signal).await {
                warn!(
                    "Failed to signal process {} of {}: {}",
                    process.id(),
                    self.id,
                    e
                );
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Container for ShimContainer {
    fn id(&self) -> &str {
        &self.id
    }

    fn bundle(&self) -> &Path {
        &self.bundle
    }

    async fn processes(&self) -> Result<Vec<Arc<dyn Process>>> {
        let processes_dir = self.dir.join("processes");
        let mut names = Vec::new();
        let mut entries = tokio::fs::read_dir(&processes_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        // Directory order is not stable; keep enumeration deterministic
        names.sort();

        let mut processes: Vec<Arc<dyn Process>> = Vec::with_capacity(names.len());
        for name in names {
            processes.push(load_process(&self.id, &processes_dir.join(&name), &name).await?);
        }
        Ok(processes)
    }

    async fn process(&self, id: &str) -> Result<Arc<dyn Process>> {
        let dir = self.process_dir(id);
        if !dir.is_dir() {
            return Err(SupervisorError::ProcessNotFound(id.to_string()));
        }
        load_process(&self.id, &dir, id).await
    }

    async fn exec(&self, id: &str, spec: ProcessSpec) -> Result<Arc<dyn Process>> {
        let process = self.spawn(id, &spec).await?;
        Ok(process)
    }

    async fn stats(&self) -> Result<Stat> {
        let live = self.live_processes().await?;
        let pids: Vec<sysinfo::Pid> = live
            .iter()
            .map(|p| sysinfo::Pid::from_u32(p.pid()))
            .collect();

        let refresh = ProcessRefreshKind::new().with_memory().with_cpu();
        let mut system = System::new();
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&pids), true, refresh);
        // CPU usage is a delta between two samples
        tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
        system.refresh_processes_specifics(ProcessesToUpdate::Some(&pids), true, refresh);

        let mut stat = Stat {
            timestamp: Utc::now(),
            memory_bytes: 0,
            cpu_absolute: 0.0,
            process_count: 0,
        };
        for pid in &pids {
            if let Some(process) = system.process(*pid) {
                stat.memory_bytes += process.memory();
                stat.cpu_absolute += f64::from(process.cpu_usage());
                stat.process_count += 1;
            }
        }
        Ok(stat)
    }

    async fn pause(&self) -> Result<()> {
        self.signal_live(libc_signal(Signal::SIGSTOP)).await
    }

    async fn resume(&self) -> Result<()> {
        self.signal_live(libc_signal(Signal::SIGCONT)).await
    }

    async fn update(&self, resources: &Resources) -> Result<()> {
        let raw = serde_json::to_vec(resources)
            .map_err(|e| SupervisorError::Other(format!("invalid resources: {}", e)))?;
        tokio::fs::write(self.dir.join("resources.json"), raw).await?;
        Ok(())
    }

    async fn checkpoints(&self) -> Result<Vec<String>> {
        let dir = self.dir.join("checkpoints");
        let mut names = Vec::new();
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(names),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                names.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        names.sort();
        Ok(names)
    }

    async fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        let dir = self.checkpoint_dir(&checkpoint.name);
        tokio::fs::create_dir_all(&dir).await?;
        let raw = serde_json::to_vec_pretty(checkpoint)
            .map_err(|e| SupervisorError::Other(format!("invalid checkpoint: {}", e)))?;
        tokio::fs::write(dir.join("checkpoint.json"), raw).await?;

        if checkpoint.exit {
            self.signal_live(libc_signal(Signal::SIGKILL)).await?;
        }
        Ok(())
    }

    async fn delete_checkpoint(&self, name: &str) -> Result<()> {
        let dir = self.checkpoint_dir(name);
        if !dir.is_dir() {
            return Err(SupervisorError::CheckpointNotExists(name.to_string()));
        }
        tokio::fs::remove_dir_all(&dir).await?;
        Ok(())
    }

    async fn delete(&self) -> Result<()> {
        self.signal_live(libc_signal(Signal::SIGKILL)).await?;
        tokio::fs::remove_dir_all(&self.dir).await?;
        debug!("Deleted container state for {}", self.id);
        Ok(())
    }
}

/// Process handle over a process state directory
#[derive(Debug)]
pub struct ShimProcess {
    id: String,
    container_id: String,
    dir: PathBuf,
    pid: u32,
}

#[async_trait]
impl Process for ShimProcess {
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
        let status_path = self.dir.join("exit-status");
        if let Some(status) = read_status(&status_path).await? {
            return Ok(Some(status));
        }

        // No exit record yet; check whether the pid is still around
        match kill(Pid::from_raw(self.pid as i32), None) {
            Ok(()) => Ok(None),
            Err(nix::errno::Errno::EPERM) => Ok(None),
            Err(_) => {
                // Dead. The waiter may have written the record between the
                // two checks; prefer it over the unknown status.
                match read_status(&status_path).await? {
                    Some(status) => Ok(Some(status)),
                    None => Ok(Some(UNKNOWN_EXIT_STATUS)),
                }
            }
        }
    }

    async fn signal(&self, signal: i32) -> Result<()> {
        let signal = Signal::try_from(signal)
            .map_err(|e| SupervisorError::Other(format!("invalid signal {}: {}", signal, e)))?;
        match kill(Pid::from_raw(self.pid as i32), signal) {
            Ok(()) => Ok(()),
            Err(nix::errno::Errno::ESRCH) => Err(SupervisorError::ProcessExited),
            Err(nix::errno::Errno::EPERM) => Err(SupervisorError::NotChildProcess),
            Err(e) => Err(SupervisorError::Other(format!(
                "kill({}, {}) failed: {}",
                self.pid, signal, e
            ))),
        }
    }

    async fn resize(&self, _width: u32, _height: u32) -> Result<()> {
        Err(SupervisorError::TerminalsNotSupported)
    }

    async fn close_stdin(&self) -> Result<()> {
        // Processes are spawned with a null stdin; nothing is held open
        Ok(())
    }
}

async fn load_process(container_id: &str, dir: &Path, id: &str) -> Result<Arc<dyn Process>> {
    let raw = tokio::fs::read_to_string(dir.join("pid")).await?;
    let pid: u32 = raw
        .trim()
        .parse()
        .map_err(|_| SupervisorError::Other(format!("malformed pid file for {}", id)))?;
    Ok(Arc::new(ShimProcess {
        id: id.to_string(),
        container_id: container_id.to_string(),
        dir: dir.to_path_buf(),
        pid,
    }))
}

async fn read_status(path: &Path) -> Result<Option<i32>> {
    match tokio::fs::read_to_string(path).await {
        Ok(raw) => {
            let status = raw.trim().parse().map_err(|_| {
                SupervisorError::Other(format!("malformed exit-status file {}", path.display()))
            })?;
            Ok(Some(status))
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        // Killed by signal: report 128 + signo, the shell convention
        None => status.signal().map_or(UNKNOWN_EXIT_STATUS, |sig| 128 + sig),
    }
}

fn libc_signal(signal: Signal) -> i32 {
    signal as i32
}
