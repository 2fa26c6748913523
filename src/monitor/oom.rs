//! Out-of-memory notification
//!
//! The runtime shim records a kernel OOM kill by dropping an `oom` marker
//! file into the container's state directory. The notifier scans for markers
//! and emits the container ID once per marker appearance; if the marker is
//! removed and reappears the ID is emitted again.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Marker file name inside a container state directory
const OOM_MARKER: &str = "oom";

/// Polling OOM notifier over the state directory
pub struct OomNotifier {
    notify_rx: Mutex<Option<mpsc::Receiver<String>>>,
    shutdown: CancellationToken,
}

impl OomNotifier {
    /// Start scanning `state_dir` every `poll_interval`
    pub fn new(state_dir: PathBuf, poll_interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(128);
        let shutdown = CancellationToken::new();
        tokio::spawn(scan_loop(state_dir, poll_interval, tx, shutdown.clone()));

        Self {
            notify_rx: Mutex::new(Some(rx)),
            shutdown,
        }
    }

    /// Take the notification channel; an infinite sequence of container IDs
    /// that have hit OOM. Can be taken only once.
    pub fn notifications(&self) -> Option<mpsc::Receiver<String>> {
        self.notify_rx.lock().take()
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

async fn scan_loop(
    state_dir: PathBuf,
    poll_interval: Duration,
    tx: mpsc::Sender<String>,
    shutdown: CancellationToken,
) {
    let mut flagged: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }

        let mut seen_now = HashSet::new();
        let mut entries = match tokio::fs::read_dir(&state_dir).await {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Failed to scan {} for OOM markers: {}", state_dir.display(), e);
                continue;
            }
        };

        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(e) => {
                    warn!("Failed to read state directory entry: {}", e);
                    break;
                }
            };
            let id = entry.file_name().to_string_lossy().into_owned();
            if entry.path().join(OOM_MARKER).is_file() {
                seen_now.insert(id);
            }
        }

        for id in &seen_now {
            if !flagged.contains(id) {
                debug!("Container {} hit OOM", id);
                if tx.send(id.clone()).await.is_err() {
                    return;
                }
            }
        }
        // A removed marker re-arms notification for that container
        flagged = seen_now;
    }
}
