use serde::{Deserialize, Serialize};

use proxmox_schema::api;

#[api]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
/// How a scavenge run ended. A run that dies with its process records
/// no outcome at all; callers report such a round as interrupted and
/// the next run resumes it from its checkpoint.
pub enum ScavengeOutcome {
    /// The run completed all stages.
    Success,
    /// The run was stopped cooperatively and can be resumed.
    Stopped,
    /// The run failed; state up to the last committed checkpoint is kept.
    Errored,
}

impl std::fmt::Display for ScavengeOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ScavengeOutcome::Success => "success",
            ScavengeOutcome::Stopped => "stopped",
            ScavengeOutcome::Errored => "errored",
        })
    }
}

#[api(
    properties: {
        outcome: {
            type: ScavengeOutcome,
            optional: true,
        },
    },
)]
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
/// Scavenge run status.
pub struct ScavengeStatus {
    /// Id of the scavenge run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scavenge_id: Option<String>,
    /// Event number of the scavenge point this run targeted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scavenge_point: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<ScavengeOutcome>,
    /// Logical chunks swept by the accumulator.
    pub chunks_accumulated: usize,
    /// Original streams processed by the calculator.
    pub streams_calculated: usize,
    /// Metastreams processed by the calculator.
    pub metastreams_calculated: usize,
    /// Physical chunks rewritten.
    pub chunks_rewritten: usize,
    /// Physical chunks skipped because their weight was below the threshold.
    pub chunks_skipped: usize,
    /// Records dropped from rewritten chunks.
    pub records_discarded: u64,
    /// Bytes reclaimed by chunk rewrites.
    pub reclaimed_bytes: u64,
    /// Index entries dropped by the index executor.
    pub index_entries_dropped: u64,
    /// Scavenge state entries removed by the cleaner.
    pub state_entries_cleaned: usize,
    /// Wall time of the run in seconds.
    pub elapsed_sec: f64,
}

impl Default for ScavengeStatus {
    fn default() -> Self {
        ScavengeStatus {
            scavenge_id: None,
            scavenge_point: None,
            outcome: None,
            chunks_accumulated: 0,
            streams_calculated: 0,
            metastreams_calculated: 0,
            chunks_rewritten: 0,
            chunks_skipped: 0,
            records_discarded: 0,
            reclaimed_bytes: 0,
            index_entries_dropped: 0,
            state_entries_cleaned: 0,
            elapsed_sec: 0.0,
        }
    }
}
