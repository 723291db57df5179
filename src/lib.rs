//! Evlog event store - log scavenging subsystem.
//!
//! Scavenge physically reclaims the space of events that per-stream
//! retention metadata (max-count, max-age, truncate-before) or a
//! tombstone has made obsolete. It runs as a sequential pipeline of
//! stages over a durable [`ScavengeState`](scavenge::state::ScavengeState)
//! and is resumable from its last committed checkpoint at any point.

pub mod scavenge;

pub use scavenge::runner::{ScavengeParams, ScavengeRunner, StartResult, StopResult};
pub use scavenge::Scavenger;
