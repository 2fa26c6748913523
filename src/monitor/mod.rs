//! Process exit monitoring
//!
//! Watches registered processes and delivers each one on the exits channel
//! once its runtime-recorded exit status becomes readable. The backend is a
//! portable poll of [`Process::exit_status`]; a platform-specific notifier
//! (pidfd, kqueue) could replace it behind the same interface.

mod oom;

pub use oom::OomNotifier;

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{Result, SupervisorError};
use crate::runtime::Process;

/// Watches processes for exit and multiplexes them onto one channel.
///
/// Delivery is at-least-once per registered process: the monitor itself sends
/// each process exactly once, but re-registration (for example after a
/// restart) may produce duplicates, which consumers must tolerate.
pub struct ProcessMonitor {
    exit_tx: mpsc::Sender<Arc<dyn Process>>,
    exits: Mutex<Option<mpsc::Receiver<Arc<dyn Process>>>>,
    poll_interval: Duration,
    shutdown: CancellationToken,
}

impl ProcessMonitor {
    pub fn new(poll_interval: Duration, capacity: usize) -> Self {
        let (exit_tx, exit_rx) = mpsc::channel(capacity);
        Self {
            exit_tx,
            exits: Mutex::new(Some(exit_rx)),
            poll_interval,
            shutdown: CancellationToken::new(),
        }
    }

    /// Begin watching a single process
    pub fn monitor(&self, process: Arc<dyn Process>) -> Result<()> {
        if self.shutdown.is_cancelled() || self.exit_tx.is_closed() {
            return Err(SupervisorError::Monitor("monitor is shut down".to_string()));
        }
        if process.pid() == 0 {
            return Err(SupervisorError::Monitor(format!(
                "process {}/{} has no pid",
                process.container_id(),
                process.id()
            )));
        }

        let tx = self.exit_tx.clone();
        let interval = self.poll_interval;
        let token = self.shutdown.clone();

        tokio::spawn(async move {
            loop {
                match process.exit_status().await {
                    Ok(Some(status)) => {
                        debug!(
                            "Process {}/{} exited with status {}",
                            process.container_id(),
                            process.id(),
                            status
                        );
                        if tx.send(process).await.is_err() {
                            debug!("Exits channel closed, dropping exit notification");
                        }
                        return;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            "Stopped watching process {}/{}: {}",
                            process.container_id(),
                            process.id(),
                            e
                        );
                        return;
                    }
                }

                tokio::select! {
                    _ = token.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        });

        Ok(())
    }

    /// Take the exits channel. Yields each exited process once; `None` after
    /// shutdown. Can be taken only once.
    pub fn exits(&self) -> Option<mpsc::Receiver<Arc<dyn Process>>> {
        self.exits.lock().take()
    }

    /// Stop all poll tasks
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::testing::FakeProcess;

    fn fast_monitor() -> ProcessMonitor {
        ProcessMonitor::new(Duration::from_millis(5), 16)
    }

    #[tokio::test]
    async fn test_exit_delivered_once() {
        let monitor = fast_monitor();
        let mut exits = monitor.exits().unwrap();

        let process = FakeProcess::standalone("c1", "init", 42);
        monitor.monitor(process.clone()).unwrap();

        // Still running: nothing delivered
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(exits.try_recv().is_err());

        process.set_exited(3);
        let exited = exits.recv().await.unwrap();
        assert_eq!(exited.id(), "init");
        assert_eq!(exited.container_id(), "c1");
        assert_eq!(exited.exit_status().await.unwrap(), Some(3));

        // One send per registration
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(exits.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_multiple_processes() {
        let monitor = fast_monitor();
        let mut exits = monitor.exits().unwrap();

        let a = FakeProcess::standalone("c1", "init", 10);
        let b = FakeProcess::standalone("c2", "worker", 11);
        monitor.monitor(a.clone()).unwrap();
        monitor.monitor(b.clone()).unwrap();

        b.set_exited(0);
        assert_eq!(exits.recv().await.unwrap().container_id(), "c2");

        a.set_exited(1);
        assert_eq!(exits.recv().await.unwrap().container_id(), "c1");
    }

    #[tokio::test]
    async fn test_exits_taken_once() {
        let monitor = fast_monitor();
        assert!(monitor.exits().is_some());
        assert!(monitor.exits().is_none());
    }

    #[tokio::test]
    async fn test_monitor_after_shutdown_fails() {
        let monitor = fast_monitor();
        monitor.shutdown();

        let process = FakeProcess::standalone("c1", "init", 42);
        let err = monitor.monitor(process).unwrap_err();
        assert!(matches!(err, SupervisorError::Monitor(_)));
    }

    #[tokio::test]
    async fn test_rejects_pid_zero() {
        let monitor = fast_monitor();
        let process = FakeProcess::standalone("c1", "init", 0);
        assert!(monitor.monitor(process).is_err());
    }
}
