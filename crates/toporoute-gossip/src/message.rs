//! Gossip wire formats
//!
//! Delta batches are JSON arrays of `{"op":1|2,"topic":..,"service":..}`.
//! Full-state snapshots are JSON objects mapping each topic to its owner ids.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use tracing::warn;

use toporoute_common::{Result, ToporouteError};

/// Ownership change carried by a delta
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum TopicOp {
    Add = 1,
    Del = 2,
}

impl TryFrom<u8> for TopicOp {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        match value {
            1 => Ok(TopicOp::Add),
            2 => Ok(TopicOp::Del),
            other => Err(format!("unknown topic op {}", other)),
        }
    }
}

impl From<TopicOp> for u8 {
    fn from(op: TopicOp) -> Self {
        op as u8
    }
}

impl std::fmt::Display for TopicOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TopicOp::Add => write!(f, "ADD"),
            TopicOp::Del => write!(f, "DEL"),
        }
    }
}

/// One ownership delta
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicInfo {
    #[serde(alias = "Op")]
    pub op: TopicOp,
    #[serde(alias = "Topic")]
    pub topic: String,
    /// Owning service id
    #[serde(alias = "Service")]
    pub service: String,
}

impl TopicInfo {
    pub fn new(op: TopicOp, topic: impl Into<String>, service: impl Into<String>) -> Self {
        Self {
            op,
            topic: topic.into(),
            service: service.into(),
        }
    }
}

/// Topic to owning service ids
pub type TopicSnapshot = BTreeMap<String, BTreeSet<String>>;

pub fn encode_batch(batch: &[TopicInfo]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(batch)?)
}

/// Decode a delta batch, skipping entries that do not parse.
///
/// Fails only when the payload is not a JSON array at all.
pub fn decode_batch(buf: &[u8]) -> Result<Vec<TopicInfo>> {
    let raw: Vec<serde_json::Value> = serde_json::from_slice(buf)?;

    let mut batch = Vec::with_capacity(raw.len());
    for value in raw {
        match serde_json::from_value::<TopicInfo>(value) {
            Ok(info) if !info.topic.is_empty() && !info.service.is_empty() => batch.push(info),
            Ok(info) => warn!(?info, "Skipping topic delta with empty field"),
            Err(e) => warn!(error = %e, "Skipping malformed topic delta"),
        }
    }
    Ok(batch)
}

pub fn encode_snapshot(snapshot: &TopicSnapshot) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(snapshot)?)
}

pub fn decode_snapshot(buf: &[u8]) -> Result<TopicSnapshot> {
    serde_json::from_slice(buf)
        .map_err(|e| ToporouteError::Serialization(format!("invalid topic snapshot: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_batch_wire_format() {
        let batch = vec![
            TopicInfo::new(TopicOp::Add, "topicX", "1"),
            TopicInfo::new(TopicOp::Del, "topicY", "1"),
        ];
        let encoded = encode_batch(&batch).unwrap();
        assert_eq!(
            String::from_utf8(encoded.clone()).unwrap(),
            r#"[{"op":1,"topic":"topicX","service":"1"},{"op":2,"topic":"topicY","service":"1"}]"#
        );
        assert_eq!(decode_batch(&encoded).unwrap(), batch);
    }

    #[test]
    fn test_decode_batch_skips_bad_entries() {
        let buf = br#"[
            {"op":1,"topic":"a","service":"1"},
            {"op":7,"topic":"b","service":"1"},
            {"topic":"c"},
            {"op":2,"topic":"","service":"1"},
            {"Op":2,"Topic":"d","Service":"2"}
        ]"#;
        let batch = decode_batch(buf).unwrap();
        assert_eq!(
            batch,
            vec![
                TopicInfo::new(TopicOp::Add, "a", "1"),
                TopicInfo::new(TopicOp::Del, "d", "2"),
            ]
        );
    }

    #[test]
    fn test_decode_batch_rejects_non_array() {
        assert!(decode_batch(b"{\"op\":1}").is_err());
        assert!(decode_batch(b"garbage").is_err());
    }

    #[test]
    fn test_snapshot_format() {
        let mut snapshot = TopicSnapshot::new();
        snapshot.entry("t1".to_string()).or_default().insert("2".to_string());
        snapshot.entry("t1".to_string()).or_default().insert("1".to_string());

        let encoded = encode_snapshot(&snapshot).unwrap();
        assert_eq!(String::from_utf8(encoded.clone()).unwrap(), r#"{"t1":["1","2"]}"#);
        assert_eq!(decode_snapshot(&encoded).unwrap(), snapshot);
        assert!(decode_snapshot(b"[1,2]").is_err());
    }
}
