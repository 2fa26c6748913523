//! Supervisor metrics
//!
//! Lightweight atomic counters and timers for tasks, containers, events and
//! subscribers. Snapshots are cheap and lock-free so they can be logged or
//! exported from any task.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::time::Duration;

/// Counters and timers maintained by the supervisor
#[derive(Debug, Default)]
pub struct Metrics {
    /// Total tasks dispatched by the event loop
    tasks: AtomicU64,

    /// Tasks that completed with an error
    task_errors: AtomicU64,

    /// Containers currently in the table
    containers: AtomicI64,

    /// Events appended to the journal
    events: AtomicU64,

    /// Events dropped because a subscriber channel was full
    events_dropped: AtomicU64,

    /// Active subscribers
    subscribers: AtomicI64,

    /// Cumulative stats collection time in microseconds
    stats_time_us: AtomicU64,

    /// Number of completed stats collections
    stats_samples: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn task_dispatched(&self) {
        self.tasks.fetch_add(1, Ordering::Relaxed);
    }

    pub fn task_failed(&self) {
        self.task_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn container_added(&self) {
        self.containers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn container_removed(&self) {
        self.containers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn event_logged(&self) {
        self.events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn event_dropped(&self) {
        self.events_dropped.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_added(&self) {
        self.subscribers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn subscriber_removed(&self) {
        self.subscribers.fetch_sub(1, Ordering::Relaxed);
    }

    /// Record the latency of one stats collection
    pub fn stats_collected(&self, elapsed: Duration) {
        self.stats_time_us
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.stats_samples.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let samples = self.stats_samples.load(Ordering::Relaxed);
        let total_us = self.stats_time_us.load(Ordering::Relaxed);
        MetricsSnapshot {
            tasks: self.tasks.load(Ordering::Relaxed),
            task_errors: self.task_errors.load(Ordering::Relaxed),
            containers: self.containers.load(Ordering::Relaxed),
            events: self.events.load(Ordering::Relaxed),
            events_dropped: self.events_dropped.load(Ordering::Relaxed),
            subscribers: self.subscribers.load(Ordering::Relaxed),
            stats_samples: samples,
            mean_stats_latency_us: if samples == 0 { 0 } else { total_us / samples },
        }
    }
}

/// Point-in-time view of the supervisor metrics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub tasks: u64,
    pub task_errors: u64,
    pub containers: i64,
    pub events: u64,
    pub events_dropped: u64,
    pub subscribers: i64,
    pub stats_samples: u64,
    pub mean_stats_latency_us: u64,
}
