use serde::{Deserialize, Serialize};

/// Retention metadata for a stream, as carried by the payload of the
/// latest event in its metastream.
///
/// Unknown keys are ignored, a malformed payload counts as empty
/// metadata (no retention).
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// Keep only the last n events.
    #[serde(rename = "$maxCount", skip_serializing_if = "Option::is_none")]
    pub max_count: Option<i64>,
    /// Drop events older than this many seconds.
    #[serde(rename = "$maxAge", skip_serializing_if = "Option::is_none")]
    pub max_age: Option<i64>,
    /// Drop events with a number below this.
    #[serde(rename = "$tb", skip_serializing_if = "Option::is_none")]
    pub truncate_before: Option<i64>,
}

impl StreamMetadata {
    pub fn parse(payload: &[u8]) -> Self {
        serde_json::from_slice(payload).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.max_count.is_none() && self.max_age.is_none() && self.truncate_before.is_none()
    }
}

/// Mapping between streams and their metastreams.
pub trait MetastreamLookup {
    fn is_metastream(&self, stream_id: &str) -> bool;

    fn metastream_of(&self, stream_id: &str) -> String;

    /// Panics if `metastream_id` is not a metastream; callers check
    /// [`is_metastream`](Self::is_metastream) first.
    fn original_stream_of<'a>(&self, metastream_id: &'a str) -> &'a str;
}

/// The standard naming scheme: the metastream of `X` is `$$X`.
#[derive(Clone, Copy, Debug, Default)]
pub struct StandardMetastreams;

const METASTREAM_PREFIX: &str = "$$";

impl MetastreamLookup for StandardMetastreams {
    fn is_metastream(&self, stream_id: &str) -> bool {
        stream_id.starts_with(METASTREAM_PREFIX)
    }

    fn metastream_of(&self, stream_id: &str) -> String {
        format!("{METASTREAM_PREFIX}{stream_id}")
    }

    fn original_stream_of<'a>(&self, metastream_id: &'a str) -> &'a str {
        metastream_id
            .strip_prefix(METASTREAM_PREFIX)
            .expect("not a metastream id")
    }
}
