//! Container runtime trait definitions
//!
//! The supervisor is agnostic of the underlying container technology; it
//! drives these traits and nothing else. A filesystem-backed reference
//! implementation lives in [`bundle`].

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub mod bundle;

#[cfg(test)]
pub(crate) mod testing;

/// Identifier of a container's init process
pub const INIT_PROCESS_ID: &str = "init";

/// Lifecycle state of a container as tracked by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    Running,
    Paused,
    Exited,
}

impl std::fmt::Display for ContainerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContainerState::Running => write!(f, "running"),
            ContainerState::Paused => write!(f, "paused"),
            ContainerState::Exited => write!(f, "exited"),
        }
    }
}

/// Specification for a process to execute inside a container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessSpec {
    /// Command and arguments
    pub args: Vec<String>,

    /// Environment variables
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Working directory
    #[serde(default)]
    pub cwd: Option<PathBuf>,

    /// Whether the process wants a terminal attached
    #[serde(default)]
    pub terminal: bool,
}

/// Resource limits applied to a running container
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Resources {
    /// Memory limit in bytes (0 for unlimited)
    #[serde(default)]
    pub memory: u64,

    /// CPU shares (relative weight)
    #[serde(default)]
    pub cpu_shares: u64,

    /// PIDs limit (0 for unlimited)
    #[serde(default)]
    pub pids_limit: u64,
}

/// Checkpoint descriptor
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Checkpoint name, unique per container
    pub name: String,

    /// Stop the container after checkpointing
    #[serde(default)]
    pub exit: bool,

    /// Dump established TCP connections
    #[serde(default)]
    pub tcp: bool,

    /// Dump unix domain sockets
    #[serde(default)]
    pub unix_sockets: bool,

    /// Dump shell jobs
    #[serde(default)]
    pub shell: bool,
}

/// One-shot resource statistics for a container
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stat {
    /// Collection time
    pub timestamp: DateTime<Utc>,

    /// Resident memory across all live processes, in bytes
    pub memory_bytes: u64,

    /// CPU usage as absolute percentage (100 = 1 core)
    pub cpu_absolute: f64,

    /// Number of live processes
    pub process_count: u32,
}

impl Default for Stat {
    fn default() -> Self {
        Self {
            timestamp: Utc::now(),
            memory_bytes: 0,
            cpu_absolute: 0.0,
            process_count: 0,
        }
    }
}

/// Factory for runtime containers
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create a new container for the given bundle
    async fn create(&self, id: &str, bundle: &Path) -> Result<Arc<dyn Container>>;

    /// Load an existing container from the state directory
    async fn load(&self, id: &str) -> Result<Arc<dyn Container>>;
}

/// A runtime container handle
#[async_trait]
pub trait Container: Send + Sync + std::fmt::Debug {
    /// Container ID, unique within the host
    fn id(&self) -> &str;

    /// Bundle directory backing the container
    fn bundle(&self) -> &Path;

    /// All processes known to the container, init included
    async fn processes(&self) -> Result<Vec<Arc<dyn Process>>>;

    /// Look up a single process by its process ID
    async fn process(&self, id: &str) -> Result<Arc<dyn Process>>;

    /// Execute an additional process inside the container
    async fn exec(&self, id: &str, spec: ProcessSpec) -> Result<Arc<dyn Process>>;

    /// Collect resource statistics
    async fn stats(&self) -> Result<Stat>;

    /// Suspend all processes
    async fn pause(&self) -> Result<()>;

    /// Resume all processes
    async fn resume(&self) -> Result<()>;

    /// Apply new resource limits
    async fn update(&self, resources: &Resources) -> Result<()>;

    /// Names of existing checkpoints
    async fn checkpoints(&self) -> Result<Vec<String>>;

    /// Create a checkpoint
    async fn checkpoint(&self, checkpoint: &Checkpoint) -> Result<()>;

    /// Delete a checkpoint by name
    async fn delete_checkpoint(&self, name: &str) -> Result<()>;

    /// Release all OS resources held by the container
    async fn delete(&self) -> Result<()>;
}

/// A single process within a container
#[async_trait]
pub trait Process: Send + Sync + std::fmt::Debug {
    /// Process ID within the container ("init" for the init process)
    fn id(&self) -> &str;

    /// ID of the owning container
    fn container_id(&self) -> &str;

    /// OS pid
    fn pid(&self) -> u32;

    /// Whether this is the container's init process
    fn is_init(&self) -> bool {
        self.id() == INIT_PROCESS_ID
    }

    /// Non-destructive read of the exit status; `None` while the process is
    /// still running. Safe to call any number of times.
    async fn exit_status(&self) -> Result<Option<i32>>;

    /// Deliver a signal
    async fn signal(&self, signal: i32) -> Result<()>;

    /// Resize the process terminal, when one is attached
    async fn resize(&self, width: u32, height: u32) -> Result<()>;

    /// Close the process stdin
    async fn close_stdin(&self) -> Result<()>;
}
