use evl_chunklog::StreamHandle;

/// Failure kinds a scavenge run distinguishes.
///
/// These travel inside [`anyhow::Error`]; the driver downcasts at the
/// stage boundary to decide between ending the run as stopped (resumable
/// by design) and errored. There are no in-core retries, recovery is
/// always resumption from the last committed checkpoint.
#[derive(Debug, thiserror::Error)]
pub enum ScavengeError {
    /// A logically impossible state was read, e.g. a handle that must
    /// exist cannot be resolved. The run aborts without further state
    /// mutation.
    #[error("scavenge state corrupt: {0}")]
    CorruptState(String),

    /// A tombstone was found inside a metastream.
    #[error("invalid operation: metastream '{stream}' is tombstoned (record at position {position})")]
    InvalidMetastreamOperation { stream: String, position: i64 },

    /// Chunk file i/o failed. The temp output of the current rewrite is
    /// deleted and the error re-raised.
    #[error("chunk i/o failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// The source chunk was re-replicated away mid-rewrite. Treated as a
    /// cooperative stop.
    #[error("chunk {chunk} is being deleted")]
    ChunkBeingDeleted { chunk: i64 },

    /// Cooperative cancellation from the driver.
    #[error("scavenge cancelled")]
    Cancelled,

    /// Reported by the index port; verification happens on the next
    /// index startup.
    #[error("index may be corrupt: {0}")]
    IndexMaybeCorrupt(String),

    /// Handle resolution failed where an entry must exist.
    #[error("cannot resolve stream handle {0}")]
    UnresolvableHandle(StreamHandle),
}

impl ScavengeError {
    /// Whether the run should end as stopped instead of errored.
    pub fn is_stop(&self) -> bool {
        matches!(
            self,
            ScavengeError::Cancelled | ScavengeError::ChunkBeingDeleted { .. }
        )
    }
}
