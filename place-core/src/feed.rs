//! Live update payloads pushed to viewers.
//!
//! Two payload shapes exist in the wild and both must decode:
//!
//! ```text
//! A: [{"items": [{"x":1,"y":2,"color":3,...}], "sequenceNumber": 42}, ...]
//! B: [{"x":1,"y":2,"color":3,"_lsn":42}, ...]
//! ```
//!
//! Both normalise to a flat list of [`PixelUpdate`] right after decoding.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::pixel::{Pixel, TimestampMs};

/// One ordered change-log entry: a batch of pixels appended in a single write.
///
/// Also the wire form of shape A.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeLogEntry {
    pub sequence_number: u64,
    pub items: Vec<Pixel>,
}

/// A pixel together with the log position it was written at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PixelUpdate {
    pub pixel: Pixel,
    pub sequence_number: u64,
}

#[derive(Debug, Error)]
pub enum FeedDecodeError {
    #[error("invalid change payload: {0}")]
    Json(#[from] serde_json::Error),
}

/// Shape B record.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FlatRecord {
    x: u16,
    y: u16,
    color: u8,
    #[serde(default)]
    user_id: String,
    #[serde(default)]
    last_updated: TimestampMs,
    #[serde(rename = "_lsn", alias = "sequenceNumber")]
    sequence_number: u64,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum WireRecord {
    Batch(ChangeLogEntry),
    Flat(FlatRecord),
}

/// Serialize entries in shape A, preserving their order.
pub fn encode_changes(entries: &[ChangeLogEntry]) -> Result<String, serde_json::Error> {
    serde_json::to_string(entries)
}

/// Decode either payload shape into a flat, ordered list of updates.
pub fn decode_changes(payload: &str) -> Result<Vec<PixelUpdate>, FeedDecodeError> {
    let records: Vec<WireRecord> = serde_json::from_str(payload)?;
    let mut updates = Vec::with_capacity(records.len());
    for record in records {
        match record {
            WireRecord::Batch(entry) => {
                let seq = entry.sequence_number;
                updates.extend(entry.items.into_iter().map(|pixel| PixelUpdate {
                    pixel,
                    sequence_number: seq,
                }));
            }
            WireRecord::Flat(flat) => updates.push(PixelUpdate {
                pixel: Pixel {
                    x: flat.x,
                    y: flat.y,
                    color: flat.color,
                    user_id: flat.user_id,
                    last_updated: flat.last_updated,
                },
                sequence_number: flat.sequence_number,
            }),
        }
    }
    Ok(updates)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_shape_a() {
        let payload = r#"[
            {"items":[{"x":1,"y":2,"color":3,"userId":"u","lastUpdated":9}],"sequenceNumber":7},
            {"items":[{"x":4,"y":5,"color":6},{"x":0,"y":0,"color":1}],"sequenceNumber":8}
        ]"#;
        let updates = decode_changes(payload).unwrap();
        assert_eq!(updates.len(), 3);
        assert_eq!(updates[0].pixel.user_id, "u");
        assert_eq!(updates[0].sequence_number, 7);
        assert_eq!(updates[2].pixel, Pixel::new(0, 0, 1));
        assert_eq!(updates[2].sequence_number, 8);
    }

    #[test]
    fn test_decode_shape_b() {
        let payload = r#"[{"x":10,"y":20,"color":15,"_lsn":3},{"x":1,"y":1,"color":0,"sequenceNumber":4}]"#;
        let updates = decode_changes(payload).unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].pixel, Pixel::new(10, 20, 15));
        assert_eq!(updates[0].sequence_number, 3);
        assert_eq!(updates[1].sequence_number, 4);
    }

    #[test]
    fn test_decode_mixed_shapes() {
        let payload = r#"[{"items":[{"x":1,"y":1,"color":1}],"sequenceNumber":1},{"x":2,"y":2,"color":2,"_lsn":2}]"#;
        let updates = decode_changes(payload).unwrap();
        let seqs: Vec<u64> = updates.iter().map(|u| u.sequence_number).collect();
        assert_eq!(seqs, vec![1, 2]);
    }

    #[test]
    fn test_encode_is_shape_a() {
        let entries = vec![ChangeLogEntry {
            sequence_number: 5,
            items: vec![Pixel::new(1, 2, 3).authored("bob", 100)],
        }];
        let json = encode_changes(&entries).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value[0]["sequenceNumber"], 5);
        assert_eq!(value[0]["items"][0]["userId"], "bob");

        let back = decode_changes(&json).unwrap();
        assert_eq!(back[0].pixel, entries[0].items[0]);
    }

    #[test]
    fn test_decode_rejects_non_array() {
        assert!(decode_changes(r#"{"items":[],"sequenceNumber":1}"#).is_err());
        assert!(decode_changes("not json").is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_element() {
        assert!(decode_changes(r#"[{"x":1,"y":2}]"#).is_err());
        assert!(decode_changes(r#"[{"items":[]}]"#).is_err());
    }

    #[test]
    fn test_decode_empty_array() {
        assert!(decode_changes("[]").unwrap().is_empty());
    }
}
