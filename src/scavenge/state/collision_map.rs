use std::collections::BTreeMap;
use std::ops::Bound;

use serde::{Deserialize, Serialize};

use evl_chunklog::StreamHandle;

/// Per-stream map keyed by [`StreamHandle`].
///
/// Entries for streams with a unique hash live on the compact hash side;
/// entries for streams whose hash collides live on the id side keyed by
/// their full name. Enumeration chains both sides in the stable handle
/// order: hash side ascending by hash, then id side ascending by name.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct CollisionMap<V> {
    by_hash: BTreeMap<u64, V>,
    by_id: BTreeMap<String, V>,
}

impl<V> CollisionMap<V> {
    pub fn get(&self, handle: &StreamHandle) -> Option<&V> {
        match handle {
            StreamHandle::Hash(hash) => self.by_hash.get(hash),
            StreamHandle::Id { id, .. } => self.by_id.get(id),
        }
    }

    pub fn get_mut(&mut self, handle: &StreamHandle) -> Option<&mut V> {
        match handle {
            StreamHandle::Hash(hash) => self.by_hash.get_mut(hash),
            StreamHandle::Id { id, .. } => self.by_id.get_mut(id),
        }
    }

    pub fn insert(&mut self, handle: &StreamHandle, value: V) {
        match handle {
            StreamHandle::Hash(hash) => {
                self.by_hash.insert(*hash, value);
            }
            StreamHandle::Id { id, .. } => {
                self.by_id.insert(id.clone(), value);
            }
        }
    }

    pub fn remove(&mut self, handle: &StreamHandle) -> Option<V> {
        match handle {
            StreamHandle::Hash(hash) => self.by_hash.remove(hash),
            StreamHandle::Id { id, .. } => self.by_id.remove(id),
        }
    }

    /// Entry-style access: insert `default` when absent.
    pub fn get_or_insert_with(
        &mut self,
        handle: &StreamHandle,
        default: impl FnOnce() -> V,
    ) -> &mut V {
        match handle {
            StreamHandle::Hash(hash) => self.by_hash.entry(*hash).or_insert_with(default),
            StreamHandle::Id { id, .. } => self.by_id.entry(id.clone()).or_insert_with(default),
        }
    }

    /// Move the entry stored under `Hash(hash)`, if any, to the id side
    /// under the name of its owner. Called when that hash is first seen
    /// to collide.
    pub fn promote_to_id(&mut self, hash: u64, owner: &str) {
        if let Some(value) = self.by_hash.remove(&hash) {
            self.by_id.insert(owner.to_string(), value);
        }
    }

    pub fn get_by_hash(&self, hash: u64) -> Option<&V> {
        self.by_hash.get(&hash)
    }

    pub fn get_by_id(&self, id: &str) -> Option<&V> {
        self.by_id.get(id)
    }

    /// The id side only (colliding streams), ascending by name.
    pub fn iter_by_id(&self) -> impl Iterator<Item = (&String, &V)> {
        self.by_id.iter()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len() + self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty() && self.by_id.is_empty()
    }

    /// All entries in stable handle order. Id handles re-derive their
    /// hash through `hash_of` since the id side is keyed by name only.
    pub fn iter<'a>(
        &'a self,
        hash_of: &'a dyn Fn(&str) -> u64,
    ) -> impl Iterator<Item = (StreamHandle, &'a V)> + 'a {
        let hashes = self
            .by_hash
            .iter()
            .map(|(hash, value)| (StreamHandle::Hash(*hash), value));
        let ids = self.by_id.iter().map(move |(id, value)| {
            (
                StreamHandle::Id {
                    id: id.clone(),
                    hash: hash_of(id),
                },
                value,
            )
        });
        hashes.chain(ids)
    }

    /// Up to `limit` entries strictly after `after` in stable handle
    /// order. `None` starts at the beginning.
    pub fn collect_after(
        &self,
        after: Option<&StreamHandle>,
        limit: usize,
        hash_of: &dyn Fn(&str) -> u64,
    ) -> Vec<(StreamHandle, V)>
    where
        V: Clone,
    {
        let mut out = Vec::new();

        if !matches!(after, Some(StreamHandle::Id { .. })) {
            let hash_start = match after {
                Some(StreamHandle::Hash(hash)) => Bound::Excluded(*hash),
                _ => Bound::Unbounded,
            };
            for (hash, value) in self.by_hash.range((hash_start, Bound::Unbounded)) {
                if out.len() == limit {
                    return out;
                }
                out.push((StreamHandle::Hash(*hash), value.clone()));
            }
        }

        let id_start = match after {
            Some(StreamHandle::Id { id, .. }) => Bound::Excluded(id.clone()),
            _ => Bound::Unbounded,
        };
        for (id, value) in self.by_id.range::<String, _>((id_start, Bound::Unbounded)) {
            if out.len() == limit {
                break;
            }
            out.push((
                StreamHandle::Id {
                    id: id.clone(),
                    hash: hash_of(id),
                },
                value.clone(),
            ));
        }

        out
    }
}
