//! Serde/API types shared between the scavenge core and its callers.

use serde::{Deserialize, Serialize};

use proxmox_schema::{api, IntegerSchema, Schema};

mod scavenge;
pub use scavenge::*;

pub const CHUNK_SIZE_SCHEMA: Schema =
    IntegerSchema::new("Logical chunk size in bytes (must be a power of two).")
        .minimum(4096)
        .schema();

pub const SCAVENGE_THRESHOLD_SCHEMA: Schema = IntegerSchema::new(
    "Minimum accumulated chunk weight for a chunk rewrite. -1 disables all rewrites, \
    0 rewrites chunks with any positive weight.",
)
.minimum(-1)
.default(0)
.schema();

pub const CANCELLATION_CHECK_PERIOD_SCHEMA: Schema =
    IntegerSchema::new("Number of records copied between cancellation polls.")
        .minimum(1)
        .default(1024)
        .schema();

pub const SKEW_TOLERANCE_SCHEMA: Schema = IntegerSchema::new(
    "Safety margin in seconds for age comparisons based on per-chunk timestamp ranges.",
)
.minimum(60)
.default(60)
.schema();

pub const THROTTLE_PERCENT_SCHEMA: Schema =
    IntegerSchema::new("Percentage of wall time the chunk executor is allowed to be active.")
        .minimum(1)
        .maximum(100)
        .default(100)
        .schema();

pub const HASH_CACHE_CAPACITY_SCHEMA: Schema =
    IntegerSchema::new("Entries kept in the in-memory stream hash lookup cache.")
        .minimum(1)
        .default(10_000)
        .schema();

pub const CALCULATOR_CHECKPOINT_BATCH_SCHEMA: Schema =
    IntegerSchema::new("Streams processed between calculator checkpoint commits.")
        .minimum(1)
        .default(512)
        .schema();

#[api(
    properties: {
        threshold: {
            schema: SCAVENGE_THRESHOLD_SCHEMA,
            optional: true,
        },
        "cancellation-check-period": {
            schema: CANCELLATION_CHECK_PERIOD_SCHEMA,
            optional: true,
        },
        "chunk-size": {
            schema: CHUNK_SIZE_SCHEMA,
            optional: true,
        },
        "skew-tolerance": {
            schema: SKEW_TOLERANCE_SCHEMA,
            optional: true,
        },
        "throttle-percent": {
            schema: THROTTLE_PERCENT_SCHEMA,
            optional: true,
        },
        "hash-cache-capacity": {
            schema: HASH_CACHE_CAPACITY_SCHEMA,
            optional: true,
        },
        "calculator-checkpoint-batch": {
            schema: CALCULATOR_CHECKPOINT_BATCH_SCHEMA,
            optional: true,
        },
    },
)]
#[derive(Clone, Debug, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
/// Scavenge tuning options
pub struct ScavengeTuning {
    /// Also remove tombstones and all events of hard deleted streams. This
    /// breaks the guarantee that a stream keeps its last event and cannot
    /// be undone.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unsafe_ignore_hard_deletes: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancellation_check_period: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chunk_size: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skew_tolerance: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub throttle_percent: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash_cache_capacity: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calculator_checkpoint_batch: Option<usize>,
}

impl ScavengeTuning {
    pub fn unsafe_ignore_hard_deletes(&self) -> bool {
        self.unsafe_ignore_hard_deletes.unwrap_or(false)
    }

    pub fn threshold(&self) -> i64 {
        self.threshold.unwrap_or(0)
    }

    pub fn cancellation_check_period(&self) -> usize {
        self.cancellation_check_period.unwrap_or(1024).max(1)
    }

    /// Age comparisons on whole chunks keep at least one minute of slack
    /// against clock drift between cluster members.
    pub fn skew_tolerance(&self) -> i64 {
        self.skew_tolerance.unwrap_or(60).max(60)
    }

    pub fn throttle_percent(&self) -> u8 {
        self.throttle_percent.unwrap_or(100).clamp(1, 100)
    }

    pub fn hash_cache_capacity(&self) -> usize {
        self.hash_cache_capacity.unwrap_or(10_000)
    }

    pub fn calculator_checkpoint_batch(&self) -> usize {
        self.calculator_checkpoint_batch.unwrap_or(512)
    }
}
