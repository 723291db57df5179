use anyhow::Error;
use serde::{Deserialize, Serialize};

/// Marker record demarcating one retention round.
///
/// Scavenge points are ordinary self-committed prepares in the
/// [`$scavenges`](crate::SCAVENGES_STREAM) stream; their event number
/// doubles as the monotonic scavenge point id.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScavengePoint {
    /// Log position of the marker record.
    pub position: i64,
    /// Event number within the scavenges stream (the id "SP-n").
    pub event_number: i64,
    /// Wall clock captured when the point was written; basis of all
    /// max-age decisions of the round.
    pub effective_now: i64,
    /// Minimum accumulated weight for a chunk rewrite. -1 forces none,
    /// 0 rewrites on any positive weight.
    pub threshold: i64,
}

impl ScavengePoint {
    /// Oldest timestamp `max_age` still keeps in this round.
    pub fn cutoff(&self, max_age: i64) -> i64 {
        self.effective_now - max_age
    }
}

impl std::fmt::Display for ScavengePoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SP-{}", self.event_number)
    }
}

/// Reads the tail of and appends to the scavenges stream.
pub trait ScavengePointSource {
    fn latest(&self) -> Result<Option<ScavengePoint>, Error>;

    fn append(&mut self, effective_now: i64, threshold: i64) -> Result<ScavengePoint, Error>;
}
