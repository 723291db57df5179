use serde::{Deserialize, Serialize};

/// Reference to a stream in scavenge state.
///
/// Nearly all streams have a unique 64-bit hash and are tracked by hash
/// alone. When two stream names share a hash, both are tracked by their
/// full name instead; the variant picks the state table side an entry
/// lives on.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamHandle {
    /// The hash is known not to collide.
    Hash(u64),
    /// The hash collides with another stream, the name disambiguates.
    Id { id: String, hash: u64 },
}

impl StreamHandle {
    pub fn hash(&self) -> u64 {
        match self {
            StreamHandle::Hash(hash) => *hash,
            StreamHandle::Id { hash, .. } => *hash,
        }
    }

    pub fn is_colliding(&self) -> bool {
        matches!(self, StreamHandle::Id { .. })
    }
}

impl std::fmt::Display for StreamHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamHandle::Hash(hash) => write!(f, "hash:{hash:016x}"),
            StreamHandle::Id { id, .. } => write!(f, "id:{id}"),
        }
    }
}
