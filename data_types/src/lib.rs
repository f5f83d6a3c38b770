//! Shared data types for the trace store: identifiers, the wire-level span
//! model, block metadata and per-tenant limits.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use snafu::Snafu;
use std::fmt;
use uuid::Uuid;

pub mod combiner;
pub mod limits;
pub mod trace;

pub use combiner::{CombineError, ObjectCombiner, TraceCombiner};
pub use limits::{IngestionRateStrategy, Limits, Overrides};

/// Errors constructing identifiers from untrusted input.
#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum IdError {
    #[snafu(display("trace ids must be {} bytes, got {}", TraceId::LEN, len))]
    InvalidTraceIdLength { len: usize },

    #[snafu(display("tenant id must not be empty"))]
    EmptyTenantId,
}

/// A 128-bit trace identifier.
///
/// The length invariant is enforced at construction; everything downstream
/// can rely on exactly [`TraceId::LEN`] bytes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TraceId([u8; 16]);

impl TraceId {
    /// Byte length of every trace id.
    pub const LEN: usize = 16;

    /// Construct from a fixed-size array.
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// The raw bytes.
    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    /// The id as an owned byte vector, for wire payloads.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl TryFrom<&[u8]> for TraceId {
    type Error = IdError;

    fn try_from(bytes: &[u8]) -> Result<Self, Self::Error> {
        let arr: [u8; 16] = bytes
            .try_into()
            .map_err(|_| IdError::InvalidTraceIdLength { len: bytes.len() })?;
        Ok(Self(arr))
    }
}

impl fmt::Display for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{:02x}", b)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TraceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TraceId({})", self)
    }
}

impl Serialize for TraceId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for TraceId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if s.len() != Self::LEN * 2 {
            return Err(serde::de::Error::custom(format!(
                "trace id hex must be {} chars, got {}",
                Self::LEN * 2,
                s.len()
            )));
        }
        let mut bytes = [0u8; 16];
        for (i, chunk) in s.as_bytes().chunks(2).enumerate() {
            let hex = std::str::from_utf8(chunk).map_err(serde::de::Error::custom)?;
            bytes[i] = u8::from_str_radix(hex, 16).map_err(serde::de::Error::custom)?;
        }
        Ok(Self(bytes))
    }
}

/// The tenant isolation boundary. Non-empty by construction.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct TenantId(String);

impl TenantId {
    /// Construct a tenant id, rejecting the empty string.
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::EmptyTenantId);
        }
        Ok(Self(id))
    }

    /// The tenant id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl<'de> Deserialize<'de> for TenantId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

/// Compression applied to block data pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Pages stored uncompressed.
    None,
    /// Pages compressed with snappy.
    #[default]
    Snappy,
}

impl fmt::Display for Encoding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Snappy => write!(f, "snappy"),
        }
    }
}

impl std::str::FromStr for Encoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Self::None),
            "snappy" => Ok(Self::Snappy),
            other => Err(format!("unknown encoding {:?}", other)),
        }
    }
}

/// An index entry: where one trace's object lives inside a block's data
/// object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Record {
    /// The trace id the page entry belongs to.
    pub id: TraceId,
    /// Byte offset of the containing page within the data object.
    pub start: u64,
    /// Byte length of the containing page.
    pub length: u32,
}

/// Current block format version.
pub const BLOCK_VERSION: &str = "v1";

/// Inner serialization of objects stored in blocks.
pub const DATA_ENCODING_PROTO: &str = "proto";

/// Per-block manifest. Written last; its presence declares the block
/// complete and readable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockMeta {
    /// Block identity.
    #[serde(rename = "blockID")]
    pub block_id: Uuid,
    /// Owning tenant.
    #[serde(rename = "tenantID")]
    pub tenant_id: String,
    /// Block format version.
    pub version: String,
    /// Page compression.
    pub encoding: Encoding,
    /// Inner object serialization name.
    pub data_encoding: String,
    /// Number of distinct trace objects in the block.
    pub total_objects: u64,
    /// Total bytes across all four artifacts.
    pub size: u64,
    #[serde(rename = "minID")]
    pub min_id: TraceId,
    #[serde(rename = "maxID")]
    pub max_id: TraceId,
    /// Earliest span start observed, unix nanoseconds.
    pub start_time: i64,
    /// Latest span end observed, unix nanoseconds.
    pub end_time: i64,
    /// Number of bloom filter shards.
    pub bloom_shard_count: u32,
    /// Configured bloom false-positive target.
    pub bloom_false_positive: f64,
}

impl BlockMeta {
    /// Begin a new manifest for a block being written.
    pub fn new(tenant_id: &TenantId, block_id: Uuid, encoding: Encoding) -> Self {
        Self {
            block_id,
            tenant_id: tenant_id.as_str().to_string(),
            version: BLOCK_VERSION.to_string(),
            encoding,
            data_encoding: DATA_ENCODING_PROTO.to_string(),
            total_objects: 0,
            size: 0,
            min_id: TraceId::new([0xff; 16]),
            max_id: TraceId::new([0x00; 16]),
            start_time: i64::MAX,
            end_time: 0,
            bloom_shard_count: 0,
            bloom_false_positive: 0.0,
        }
    }

    /// Fold one object into the manifest's id and time ranges.
    pub fn observe_object(&mut self, id: &TraceId, start_time: i64, end_time: i64) {
        self.total_objects += 1;
        if *id < self.min_id {
            self.min_id = *id;
        }
        if *id > self.max_id {
            self.max_id = *id;
        }
        if start_time != 0 {
            self.start_time = self.start_time.min(start_time);
        }
        if end_time != 0 {
            self.end_time = self.end_time.max(end_time);
        }
    }

    /// Whether `id` can possibly be contained, by id range.
    pub fn may_contain(&self, id: &TraceId) -> bool {
        self.total_objects > 0 && *id >= self.min_id && *id <= self.max_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trace_id_length_enforced() {
        let ok = TraceId::try_from(&[1u8; 16][..]);
        assert!(ok.is_ok());

        let err = TraceId::try_from(&[1u8; 8][..]).unwrap_err();
        assert_eq!(err, IdError::InvalidTraceIdLength { len: 8 });
        assert_eq!(
            err.to_string(),
            "trace ids must be 16 bytes, got 8"
        );
    }

    #[test]
    fn trace_id_hex_round_trip() {
        let id = TraceId::new([
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08, 0x09, 0x0a, 0x0b, 0x0c, 0x0d, 0x0e,
            0x0f, 0x10,
        ]);
        assert_eq!(id.to_string(), "0102030405060708090a0b0c0d0e0f10");

        let json = serde_json::to_string(&id).unwrap();
        let back: TraceId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn trace_id_orders_bytewise() {
        let lo = TraceId::new([0u8; 16]);
        let mut hi_bytes = [0u8; 16];
        hi_bytes[0] = 1;
        let hi = TraceId::new(hi_bytes);
        assert!(lo < hi);
    }

    #[test]
    fn tenant_id_rejects_empty() {
        assert_eq!(TenantId::new("").unwrap_err(), IdError::EmptyTenantId);
        assert_eq!(TenantId::new("a").unwrap().as_str(), "a");
    }

    #[test]
    fn meta_json_stable_field_names() {
        let tenant = TenantId::new("single-tenant").unwrap();
        let mut meta = BlockMeta::new(&tenant, Uuid::nil(), Encoding::Snappy);
        meta.observe_object(&TraceId::new([3u8; 16]), 100, 200);
        meta.bloom_shard_count = 4;
        meta.bloom_false_positive = 0.01;

        let json = serde_json::to_value(&meta).unwrap();
        for field in [
            "blockID",
            "tenantID",
            "version",
            "encoding",
            "dataEncoding",
            "totalObjects",
            "size",
            "minID",
            "maxID",
            "startTime",
            "endTime",
            "bloomShardCount",
            "bloomFalsePositive",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }

        let back: BlockMeta = serde_json::from_value(json).unwrap();
        assert_eq!(back, meta);
    }

    #[test]
    fn meta_ranges() {
        let tenant = TenantId::new("t").unwrap();
        let mut meta = BlockMeta::new(&tenant, Uuid::nil(), Encoding::None);
        meta.observe_object(&TraceId::new([5u8; 16]), 50, 60);
        meta.observe_object(&TraceId::new([2u8; 16]), 40, 45);

        assert_eq!(meta.total_objects, 2);
        assert_eq!(meta.min_id, TraceId::new([2u8; 16]));
        assert_eq!(meta.max_id, TraceId::new([5u8; 16]));
        assert_eq!(meta.start_time, 40);
        assert_eq!(meta.end_time, 60);

        assert!(meta.may_contain(&TraceId::new([3u8; 16])));
        assert!(!meta.may_contain(&TraceId::new([9u8; 16])));
    }
}
