//! Log entry data model shared by every stage of the pipeline.

use serde::{Deserialize, Serialize};

/// A single parsed log record.
///
/// Timestamps are signed nanoseconds since the Unix epoch. Equal timestamps
/// are legal and treated as concurrent; matchers do not enforce strict
/// ordering between them.
///
/// Serialized field names are compact (`l`, `s`, `t`, `m`) to keep captured
/// hit payloads small.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Log payload with any format framing removed.
    #[serde(rename = "l")]
    pub line: String,

    /// Source stream tag (e.g. `stdout` / `stderr`); empty when the format
    /// does not carry one.
    #[serde(rename = "s", default)]
    pub stream: String,

    /// Nanoseconds since the Unix epoch.
    #[serde(rename = "t")]
    pub timestamp: i64,

    /// Optional `[start, end)` byte offsets into `line` recorded by
    /// match-enriching collectors.
    #[serde(rename = "m", default, skip_serializing_if = "Option::is_none")]
    pub matches: Option<Vec<[usize; 2]>>,
}

// Fixed wire framing per entry: markers, field prefixes, and the encoded
// timestamp. Payload lengths are added on top.
const ENTRY_OVERHEAD: usize = 26;
const MATCH_OVERHEAD: usize = 7;
const MATCH_PAIR_SIZE: usize = 5 + 2 * 9;

impl LogEntry {
    /// Creates an entry with just a timestamp and payload.
    pub fn new(timestamp: i64, line: impl Into<String>) -> Self {
        Self {
            line: line.into(),
            timestamp,
            ..Self::default()
        }
    }

    /// Upper-bound estimate of the serialized size in bytes.
    ///
    /// Used for memory accounting in the reorder queue and size-capped
    /// collectors; it intentionally over-counts rather than under-counts.
    pub fn size(&self) -> usize {
        let mut size = ENTRY_OVERHEAD + self.line.len() + self.stream.len();
        if let Some(matches) = &self.matches {
            size += MATCH_OVERHEAD + matches.len() * MATCH_PAIR_SIZE;
        }
        size
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_scales_with_payload() {
        let small = LogEntry::new(1, "a");
        let large = LogEntry::new(1, "a".repeat(100));
        assert_eq!(large.size() - small.size(), 99);
    }

    #[test]
    fn size_counts_match_offsets() {
        let mut entry = LogEntry::new(1, "payload");
        let plain = entry.size();
        entry.matches = Some(vec![[0, 3], [4, 7]]);
        assert!(entry.size() > plain);
    }

    #[test]
    fn serde_round_trip_compact_names() {
        let entry = LogEntry {
            line: "boom".into(),
            stream: "stderr".into(),
            timestamp: 42,
            matches: None,
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert_eq!(json, r#"{"l":"boom","s":"stderr","t":42}"#);
        let back: LogEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
