use anyhow::{bail, Error};
use serde::{Deserialize, Serialize};

/// The first event number of a stream that scavenge keeps.
///
/// Everything below it may be physically removed. Discard points only
/// ever move forward; combining two with [`or`](Self::or) yields the
/// point that discards whenever either would.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DiscardPoint {
    first_event_number_to_keep: i64,
}

impl DiscardPoint {
    pub const fn keep_all() -> Self {
        Self {
            first_event_number_to_keep: 0,
        }
    }

    /// Keep events with a number greater than or equal to `event_number`.
    pub fn discard_before(event_number: i64) -> Self {
        Self {
            first_event_number_to_keep: event_number.max(0),
        }
    }

    /// Keep events with a number strictly greater than `event_number`.
    pub fn discard_including(event_number: i64) -> Result<Self, Error> {
        if event_number == i64::MAX {
            bail!("cannot discard including event number {event_number}");
        }
        Ok(Self::discard_before(event_number + 1))
    }

    /// The point discarding whatever either of the two would discard.
    pub fn or(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn should_discard(&self, event_number: i64) -> bool {
        event_number < self.first_event_number_to_keep
    }

    pub fn is_keep_all(&self) -> bool {
        self.first_event_number_to_keep == 0
    }

    pub fn first_event_number_to_keep(&self) -> i64 {
        self.first_event_number_to_keep
    }
}

impl Default for DiscardPoint {
    fn default() -> Self {
        Self::keep_all()
    }
}

impl std::fmt::Display for DiscardPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_keep_all() {
            f.write_str("keep-all")
        } else {
            write!(f, "discard-before:{}", self.first_event_number_to_keep)
        }
    }
}
