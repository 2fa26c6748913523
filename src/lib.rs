//! Vessel Supervisor Library
//!
//! Core of the Vessel container runtime daemon: a single-writer event loop
//! over the container table, a process exit monitor, a durable event journal
//! with subscriber fan-out, and startup state restoration.

pub mod config;
pub mod error;
pub mod events;
pub mod metrics;
pub mod monitor;
pub mod runtime;
pub mod supervisor;

// Re-export commonly used types
pub use config::Configuration;
pub use error::{Result, SupervisorError};
pub use events::{Event, EventKind, Subscription};
pub use supervisor::{Supervisor, SupervisorHandle, Task};
