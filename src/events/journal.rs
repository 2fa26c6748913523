//! Event journal and subscription fan-out
//!
//! The journal is held twice: an in-memory sequence used for replay, and an
//! append-only `events.log` file written by a dedicated writer task so disk
//! latency never reaches the event loop. Fan-out to subscribers is
//! non-blocking; a subscriber with a full channel loses the event, the
//! journal never does.

use std::collections::HashMap;
use std::io::{BufRead, BufReader};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, error, warn};

use crate::metrics::Metrics;

/// Type of an observable event.
///
/// The set is open on the consumer side: unknown strings deserialize into
/// `Other` instead of failing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum EventKind {
    StartContainer,
    StartProcess,
    Exit,
    Oom,
    Checkpoint,
    Other(String),
}

impl EventKind {
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::StartContainer => "start-container",
            EventKind::StartProcess => "start-process",
            EventKind::Exit => "exit",
            EventKind::Oom => "oom",
            EventKind::Checkpoint => "checkpoint",
            EventKind::Other(s) => s,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for EventKind {
    fn from(s: String) -> Self {
        match s.as_str() {
            "start-container" => EventKind::StartContainer,
            "start-process" => EventKind::StartProcess,
            "exit" => EventKind::Exit,
            "oom" => EventKind::Oom,
            "checkpoint" => EventKind::Checkpoint,
            _ => EventKind::Other(s),
        }
    }
}

impl From<EventKind> for String {
    fn from(kind: EventKind) -> Self {
        kind.as_str().to_owned()
    }
}

/// A journalled event record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Container the event belongs to
    pub id: String,

    /// Event type
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Emission time; monotonic within a single run
    pub timestamp: DateTime<Utc>,

    /// Process the event refers to, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<String>,

    /// Exit status, when applicable
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<i32>,
}

impl Event {
    pub fn new(id: impl Into<String>, kind: EventKind) -> Self {
        Self {
            id: id.into(),
            kind,
            timestamp: Utc::now(),
            pid: None,
            status: None,
        }
    }

    pub fn with_pid(mut self, pid: impl Into<String>) -> Self {
        self.pid = Some(pid.into());
        self
    }

    pub fn with_status(mut self, status: i32) -> Self {
        self.status = Some(status);
        self
    }
}

/// A live subscription to the event stream
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    /// Identifier to pass to [`EventLog::unsubscribe`]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Receive the next event; `None` once unsubscribed
    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive, mainly for draining in tests and pollers
    pub fn try_recv(&mut self) -> Result<Event, mpsc::error::TryRecvError> {
        self.rx.try_recv()
    }
}

/// Durable journal plus subscriber fan-out
pub struct EventLog {
    /// In-memory copy of the journal, used for replay
    journal: Mutex<Vec<Event>>,

    /// Active subscriber channels, keyed by subscription id
    subscribers: RwLock<HashMap<u64, mpsc::Sender<Event>>>,

    /// Next subscription id
    next_subscriber: AtomicU64,

    /// Feed to the journal-writer task; unbounded so persistence is never
    /// dropped and the emitter never blocks
    writer_tx: mpsc::UnboundedSender<Event>,

    /// Capacity of each subscriber channel
    capacity: usize,

    metrics: Arc<Metrics>,
}

impl EventLog {
    /// Open the journal at `path`, reloading any events from a previous run,
    /// and spawn the writer task. Must be called within a tokio runtime.
    pub fn open(path: &Path, capacity: usize, metrics: Arc<Metrics>) -> std::io::Result<Self> {
        let journal = read_journal(path)?;
        debug!("Loaded {} events from {}", journal.len(), path.display());

        let (writer_tx, writer_rx) = mpsc::unbounded_channel();
        tokio::spawn(write_journal(path.to_path_buf(), writer_rx));

        Ok(Self {
            journal: Mutex::new(journal),
            subscribers: RwLock::new(HashMap::new()),
            next_subscriber: AtomicU64::new(0),
            writer_tx,
            capacity,
            metrics,
        })
    }

    /// Append an event to the journal and fan it out to all subscribers.
    ///
    /// The in-memory append happens first, so no subscriber can observe an
    /// event the journal does not know about. Subscribers with a full channel
    /// lose the event with a warning; journal persistence is unconditional.
    pub fn notify(&self, event: Event) {
        {
            let mut journal = self.journal.lock();
            journal.push(event.clone());
        }
        self.metrics.event_logged();

        if self.writer_tx.send(event.clone()).is_err() {
            warn!("Journal writer is gone, event persisted in memory only");
        }

        let subscribers = self.subscribers.read();
        for (id, tx) in subscribers.iter() {
            match tx.try_send(event.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    self.metrics.event_dropped();
                    warn!(
                        "Subscriber {} is not keeping up, dropped {} event for {}",
                        id, event.kind, event.id
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!("Subscriber {} receiver dropped without unsubscribe", id);
                }
            }
        }
    }

    /// Subscribe to the event stream.
    ///
    /// With `from` set, every journalled event with a timestamp strictly
    /// after it is replayed into the subscription before any live event is
    /// delivered. Replay happens under the subscriber-set write lock, so live
    /// events emitted concurrently queue behind it and arrive in order.
    pub fn subscribe(&self, from: Option<DateTime<Utc>>) -> Subscription {
        let (tx, rx) = mpsc::channel(self.capacity);
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        let mut subscribers = self.subscribers.write();
        if let Some(from) = from {
            let journal = self.journal.lock();
            for event in journal.iter().filter(|e| e.timestamp > from) {
                if tx.try_send(event.clone()).is_err() {
                    self.metrics.event_dropped();
                    warn!("Replay overflow for subscriber {}, dropping remaining history", id);
                    break;
                }
            }
        }
        subscribers.insert(id, tx);
        self.metrics.subscriber_added();

        debug!("Subscriber {} registered", id);
        Subscription { id, rx }
    }

    /// Remove a subscriber; its channel closes once the sender is dropped.
    /// Idempotent.
    pub fn unsubscribe(&self, id: u64) {
        let removed = self.subscribers.write().remove(&id);
        if removed.is_some() {
            self.metrics.subscriber_removed();
            debug!("Subscriber {} removed", id);
        }
    }

    /// Number of events in the journal
    pub fn len(&self) -> usize {
        self.journal.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.journal.lock().is_empty()
    }

    /// Number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

/// Read the persisted journal, skipping lines that fail to parse
fn read_journal(path: &Path) -> std::io::Result<Vec<Event>> {
    let file = match std::fs::File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut events = Vec::new();
    for (lineno, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Event>(&line) {
            Ok(event) => events.push(event),
            Err(e) => warn!("Skipping malformed journal line {}: {}", lineno + 1, e),
        }
    }
    Ok(events)
}

/// Writer task: drains the feed into `events.log`, one JSON record per line.
/// I/O failures are logged and never propagate to the emitter.
async fn write_journal(path: std::path::PathBuf, mut rx: mpsc::UnboundedReceiver<Event>) {
    let mut file = match tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .await
    {
        Ok(f) => Some(f),
        Err(e) => {
            error!("Failed to open journal {}: {}", path.display(), e);
            None
        }
    };

    while let Some(event) = rx.recv().await {
        let Some(f) = file.as_mut() else {
            continue;
        };

        let mut line = match serde_json::to_vec(&event) {
            Ok(l) => l,
            Err(e) => {
                warn!("Failed to serialize event: {}", e);
                continue;
            }
        };
        line.push(b'\n');

        if let Err(e) = f.write_all(&line).await {
            warn!("Failed to append to journal: {}", e);
            continue;
        }
        if let Err(e) = f.flush().await {
            warn!("Failed to flush journal: {}", e);
        }
    }
}
