use serde::{Deserialize, Serialize};

use evl_chunklog::{ScavengePoint, StreamHandle};

/// Durable progress marker of a scavenge run.
///
/// Every variant is tagged with the scavenge point the run targets.
/// Within a run the stages advance strictly left to right; after a crash
/// the driver re-enters the stage owning the stored variant and resumes
/// from its sub-progress.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "stage", rename_all = "kebab-case")]
pub enum ScavengeCheckpoint {
    /// Sweeping the log; chunks up to and including `done_logical_chunk`
    /// are accumulated.
    Accumulating {
        scavenge_point: ScavengePoint,
        done_logical_chunk: Option<i64>,
    },
    /// Translating retention facts into discard points; streams up to
    /// and including `done_handle` (in stable handle order) are
    /// calculated. The original stream pass runs first, then the
    /// metastream weighting pass; `originals_done` says which pass
    /// `done_handle` belongs to.
    Calculating {
        scavenge_point: ScavengePoint,
        originals_done: bool,
        done_handle: Option<StreamHandle>,
    },
    /// Rewriting chunk files; physical chunks ending at or below
    /// `done_logical_chunk` are executed.
    ExecutingChunks {
        scavenge_point: ScavengePoint,
        done_logical_chunk: Option<i64>,
    },
    /// Handing adjacent small chunks to the chunk manager for merging.
    MergingChunks { scavenge_point: ScavengePoint },
    /// Rewriting the secondary index.
    ExecutingIndex { scavenge_point: ScavengePoint },
    /// Removing scavenge state without remaining retention work.
    Cleaning { scavenge_point: ScavengePoint },
    /// The round is complete; the next run starts a new one.
    Done { scavenge_point: ScavengePoint },
}

impl ScavengeCheckpoint {
    pub fn scavenge_point(&self) -> &ScavengePoint {
        match self {
            ScavengeCheckpoint::Accumulating { scavenge_point, .. } => scavenge_point,
            ScavengeCheckpoint::Calculating { scavenge_point, .. } => scavenge_point,
            ScavengeCheckpoint::ExecutingChunks { scavenge_point, .. } => scavenge_point,
            ScavengeCheckpoint::MergingChunks { scavenge_point } => scavenge_point,
            ScavengeCheckpoint::ExecutingIndex { scavenge_point } => scavenge_point,
            ScavengeCheckpoint::Cleaning { scavenge_point } => scavenge_point,
            ScavengeCheckpoint::Done { scavenge_point } => scavenge_point,
        }
    }

    pub fn stage_name(&self) -> &'static str {
        match self {
            ScavengeCheckpoint::Accumulating { .. } => "accumulating",
            ScavengeCheckpoint::Calculating { .. } => "calculating",
            ScavengeCheckpoint::ExecutingChunks { .. } => "executing chunks",
            ScavengeCheckpoint::MergingChunks { .. } => "merging chunks",
            ScavengeCheckpoint::ExecutingIndex { .. } => "executing index",
            ScavengeCheckpoint::Cleaning { .. } => "cleaning",
            ScavengeCheckpoint::Done { .. } => "done",
        }
    }
}

impl std::fmt::Display for ScavengeCheckpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.stage_name(), self.scavenge_point())
    }
}
