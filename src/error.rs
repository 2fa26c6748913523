use thiserror::Error;

/// Errors surfaced by the supervisor and the runtime backends.
///
/// Every task submitted to the supervisor resolves to exactly one
/// `Result<(), SupervisorError>` on its completion channel.
#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("container not found: {0}")]
    ContainerNotFound(String),

    #[error("container already exists: {0}")]
    ContainerExists(String),

    #[error("container has exited: {0}")]
    ContainerExited(String),

    #[error("process not found: {0}")]
    ProcessNotFound(String),

    #[error("process has exited")]
    ProcessExited,

    #[error("process has not exited")]
    ProcessNotExited,

    #[error("checkpoint already exists: {0}")]
    CheckpointExists(String),

    #[error("checkpoint does not exist: {0}")]
    CheckpointNotExists(String),

    #[error("terminals are not supported by this runtime")]
    TerminalsNotSupported,

    #[error("process is not a child of this supervisor")]
    NotChildProcess,

    #[error("invalid container type: {0}")]
    InvalidContainerType(String),

    #[error("supervisor is shutting down")]
    Shutdown,

    #[error("monitor registration failed: {0}")]
    Monitor(String),

    #[error("failed to spawn process: {0}")]
    Spawn(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SupervisorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            SupervisorError::ContainerNotFound("c1".into()).to_string(),
            "container not found: c1"
        );
        assert_eq!(
            SupervisorError::ProcessNotExited.to_string(),
            "process has not exited"
        );
        assert_eq!(
            SupervisorError::Shutdown.to_string(),
            "supervisor is shutting down"
        );
    }
}
