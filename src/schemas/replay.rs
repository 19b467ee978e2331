//! Replay Chunk Schema
//!
//! Wire model for the replay topic. The `data` blob is an opaque,
//! already-compressed segment of the rrweb recording, carried base64 in
//! JSON and stored as raw bytes.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use uuid::Uuid;

/// One compressed DOM-recording segment for a session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplayChunkMessage {
    pub session_id: Uuid,
    pub project_id: String,

    /// Dense, monotonic per-session index
    pub chunk_index: u16,

    /// Milliseconds since epoch
    pub timestamp_start: i64,
    pub timestamp_end: i64,

    /// Opaque compressed payload
    #[serde(
        serialize_with = "serialize_base64",
        deserialize_with = "deserialize_base64"
    )]
    pub data: Vec<u8>,

    /// Number of rrweb events inside the blob
    #[serde(default)]
    pub event_count: u32,

    /// True when the chunk contains a full DOM snapshot, a playback seek
    /// target and a flush checkpoint
    #[serde(default)]
    pub has_full_snapshot: bool,
}

fn serialize_base64<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
    use base64::Engine;
    serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(bytes))
}

fn deserialize_base64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
    use base64::Engine;
    let encoded = String::deserialize(deserializer)?;
    base64::engine::general_purpose::STANDARD
        .decode(encoded.as_bytes())
        .map_err(serde::de::Error::custom)
}
