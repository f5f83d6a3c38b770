//! The sorted trace-id index.
//!
//! The index object is a run of fixed-width records in ascending id order
//! followed by an 8-byte footer:
//!
//! ```text
//! | id (16) | page offset u64 BE | page length u32 BE | ... | count u32 BE | entry_len u32 BE |
//! ```
//!
//! Fixed width makes `at(i)` a multiplication, which makes `find` a binary
//! search without scanning.

use crate::{Error, Result};
use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use data_types::{Record, TraceId};

/// On-disk length of one index record.
pub const RECORD_LEN: usize = TraceId::LEN + 8 + 4;

const FOOTER_LEN: usize = 8;

/// Serialize records (already sorted ascending) into an index object.
pub fn marshal_records(records: &[Record]) -> Vec<u8> {
    let mut out = Vec::with_capacity(records.len() * RECORD_LEN + FOOTER_LEN);
    for record in records {
        let mut entry = [0u8; RECORD_LEN];
        entry[..TraceId::LEN].copy_from_slice(record.id.as_bytes());
        BigEndian::write_u64(&mut entry[TraceId::LEN..TraceId::LEN + 8], record.start);
        BigEndian::write_u32(&mut entry[TraceId::LEN + 8..], record.length);
        out.extend_from_slice(&entry);
    }

    let mut footer = [0u8; FOOTER_LEN];
    BigEndian::write_u32(&mut footer[0..4], records.len() as u32);
    BigEndian::write_u32(&mut footer[4..8], RECORD_LEN as u32);
    out.extend_from_slice(&footer);
    out
}

/// Read-side view over a marshaled index object.
#[derive(Debug, Clone)]
pub struct IndexReader {
    bytes: Bytes,
    count: usize,
}

impl IndexReader {
    /// Validate and wrap a marshaled index.
    pub fn new(bytes: Bytes) -> Result<Self> {
        if bytes.len() < FOOTER_LEN {
            return Err(Error::IndexCorrupt {
                reason: format!("too short: {} bytes", bytes.len()),
            });
        }
        let footer = &bytes[bytes.len() - FOOTER_LEN..];
        let count = BigEndian::read_u32(&footer[0..4]) as usize;
        let entry_len = BigEndian::read_u32(&footer[4..8]) as usize;

        if entry_len != RECORD_LEN {
            return Err(Error::IndexCorrupt {
                reason: format!("unsupported entry length {entry_len}"),
            });
        }
        if bytes.len() != count * RECORD_LEN + FOOTER_LEN {
            return Err(Error::IndexCorrupt {
                reason: format!("length {} inconsistent with {} records", bytes.len(), count),
            });
        }

        Ok(Self { bytes, count })
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the index holds no records.
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// The record at position `i`, or `None` past the end.
    pub fn at(&self, i: usize) -> Option<Record> {
        if i >= self.count {
            return None;
        }
        let entry = &self.bytes[i * RECORD_LEN..(i + 1) * RECORD_LEN];
        let id = TraceId::try_from(&entry[..TraceId::LEN]).expect("fixed-width id slice");
        Some(Record {
            id,
            start: BigEndian::read_u64(&entry[TraceId::LEN..TraceId::LEN + 8]),
            length: BigEndian::read_u32(&entry[TraceId::LEN + 8..]),
        })
    }

    /// Binary search for `id`. Returns the FIRST record carrying the id and
    /// its position, so callers can walk forward over duplicates.
    pub fn find(&self, id: &TraceId) -> Option<(Record, usize)> {
        let mut lo = 0usize;
        let mut hi = self.count;
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            let record = self.at(mid).expect("mid < count");
            if record.id < *id {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }

        let record = self.at(lo)?;
        (record.id == *id).then_some((record, lo))
    }
}
