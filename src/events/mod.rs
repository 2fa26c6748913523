//! Event system module
//!
//! Durable event journal plus pub/sub fan-out. Every event emitted by the
//! supervisor is appended to `events.log` and forwarded to all subscribers;
//! late subscribers can replay history from a point in time.

mod journal;

pub use journal::{Event, EventKind, EventLog, Subscription};
