//! Page frames inside the data object.
//!
//! Each page is self-describing:
//!
//! ```text
//! | u32 payload_len | u32 crc32(payload) | payload |
//! ```
//!
//! The payload is the (optionally compressed) concatenation of entries
//!
//! ```text
//! | varint id_len | id | varint obj_len | obj |
//! ```
//!
//! sorted ascending by id. Checksums are computed over the stored
//! (compressed) payload so torn writes are detected before decompression.

use crate::{Error, Result};
use byteorder::{ByteOrder, LittleEndian};
use bytes::{Buf, Bytes};
use data_types::{Encoding, TraceId};
use prost::encoding::{decode_varint, encode_varint};

/// Fixed number of header bytes preceding every page payload.
pub const PAGE_HEADER_LEN: usize = 8;

/// Append one `(id, object)` entry to a page payload buffer.
pub fn append_entry(payload: &mut Vec<u8>, id: &TraceId, object: &[u8]) {
    encode_varint(TraceId::LEN as u64, payload);
    payload.extend_from_slice(id.as_bytes());
    encode_varint(object.len() as u64, payload);
    payload.extend_from_slice(object);
}

/// Size one entry will occupy inside a page payload.
pub fn entry_len(object_len: usize) -> usize {
    // 16 needs one varint byte; the object length varint is at most 10
    let obj_len_varint = {
        let mut scratch = Vec::with_capacity(10);
        encode_varint(object_len as u64, &mut scratch);
        scratch.len()
    };
    1 + TraceId::LEN + obj_len_varint + object_len
}

/// Frame a page payload for storage: compress per `encoding`, prefix with
/// length and checksum. Returns the complete on-disk frame.
pub fn marshal_page(payload: &[u8], encoding: Encoding) -> Result<Vec<u8>> {
    let stored: Vec<u8> = match encoding {
        Encoding::None => payload.to_vec(),
        Encoding::Snappy => snap::raw::Encoder::new()
            .compress_vec(payload)
            .context_snap()?,
    };

    let mut frame = Vec::with_capacity(PAGE_HEADER_LEN + stored.len());
    let mut header = [0u8; PAGE_HEADER_LEN];
    LittleEndian::write_u32(&mut header[0..4], stored.len() as u32);
    LittleEndian::write_u32(&mut header[4..8], crc32fast::hash(&stored));
    frame.extend_from_slice(&header);
    frame.extend_from_slice(&stored);
    Ok(frame)
}

/// Parse a stored frame back into its uncompressed payload, verifying the
/// length and checksum.
pub fn unmarshal_page(frame: &[u8], encoding: Encoding) -> Result<Vec<u8>> {
    if frame.len() < PAGE_HEADER_LEN {
        return Err(Error::PageTruncated { len: frame.len() });
    }
    let stored_len = LittleEndian::read_u32(&frame[0..4]) as usize;
    let expected = LittleEndian::read_u32(&frame[4..8]);

    let stored = &frame[PAGE_HEADER_LEN..];
    if stored.len() != stored_len {
        return Err(Error::PageTruncated { len: frame.len() });
    }

    let actual = crc32fast::hash(stored);
    if actual != expected {
        return Err(Error::PageChecksum { expected, actual });
    }

    match encoding {
        Encoding::None => Ok(stored.to_vec()),
        Encoding::Snappy => snap::raw::Decoder::new()
            .decompress_vec(stored)
            .context_snap(),
    }
}

trait SnapContext<T> {
    fn context_snap(self) -> Result<T>;
}

impl<T> SnapContext<T> for std::result::Result<T, snap::Error> {
    fn context_snap(self) -> Result<T> {
        self.map_err(|source| Error::PageDecompress { source })
    }
}

/// Iterates the `(id, object)` entries of an uncompressed page payload.
#[derive(Debug)]
pub struct PageEntries {
    payload: Bytes,
    offset: usize,
}

impl PageEntries {
    /// Iterate `payload`.
    pub fn new(payload: Bytes) -> Self {
        Self { payload, offset: 0 }
    }
}

impl Iterator for PageEntries {
    type Item = Result<(TraceId, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.payload.len() {
            return None;
        }
        Some(self.parse_next())
    }
}

impl PageEntries {
    fn parse_next(&mut self) -> Result<(TraceId, Bytes)> {
        let start = self.offset;
        let mut buf = &self.payload[self.offset..];

        let id_len = decode_varint(&mut buf).map_err(|_| Error::PageEntry { offset: start })? as usize;
        if id_len != TraceId::LEN || buf.remaining() < id_len {
            return Err(Error::PageEntry { offset: start });
        }
        let id = TraceId::try_from(&buf[..TraceId::LEN]).map_err(|_| Error::PageEntry { offset: start })?;
        buf.advance(TraceId::LEN);

        let obj_len = decode_varint(&mut buf).map_err(|_| Error::PageEntry { offset: start })? as usize;
        if buf.remaining() < obj_len {
            return Err(Error::PageEntry { offset: start });
        }

        let consumed_before_obj = self.payload.len() - start - buf.remaining();
        let obj_start = start + consumed_before_obj;
        let object = self.payload.slice(obj_start..obj_start + obj_len);

        self.offset = obj_start + obj_len;
        Ok((id, object))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> TraceId {
        TraceId::new([n; 16])
    }

    #[test]
    fn page_round_trip_uncompressed() {
        let mut payload = Vec::new();
        append_entry(&mut payload, &id(1), b"one");
        append_entry(&mut payload, &id(2), b"two-two");

        let frame = marshal_page(&payload, Encoding::None).unwrap();
        let back = unmarshal_page(&frame, Encoding::None).unwrap();
        assert_eq!(back, payload);

        let entries: Vec<_> = PageEntries::new(back.into())
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].0, id(1));
        assert_eq!(&entries[0].1[..], b"one");
        assert_eq!(entries[1].0, id(2));
        assert_eq!(&entries[1].1[..], b"two-two");
    }

    #[test]
    fn page_round_trip_snappy() {
        let mut payload = Vec::new();
        append_entry(&mut payload, &id(7), &vec![0u8; 4096]);

        let frame = marshal_page(&payload, Encoding::Snappy).unwrap();
        // 4 KiB of zeroes compresses well
        assert!(frame.len() < payload.len());

        let back = unmarshal_page(&frame, Encoding::Snappy).unwrap();
        assert_eq!(back, payload);
    }

    #[test]
    fn corrupted_page_is_detected() {
        let mut payload = Vec::new();
        append_entry(&mut payload, &id(1), b"data");
        let mut frame = marshal_page(&payload, Encoding::None).unwrap();

        let last = frame.len() - 1;
        frame[last] ^= 0xff;
        assert!(matches!(
            unmarshal_page(&frame, Encoding::None),
            Err(Error::PageChecksum { .. })
        ));
    }

    #[test]
    fn truncated_page_is_detected() {
        let mut payload = Vec::new();
        append_entry(&mut payload, &id(1), b"data");
        let frame = marshal_page(&payload, Encoding::None).unwrap();

        assert!(matches!(
            unmarshal_page(&frame[..frame.len() - 2], Encoding::None),
            Err(Error::PageTruncated { .. })
        ));
        assert!(matches!(
            unmarshal_page(&frame[..4], Encoding::None),
            Err(Error::PageTruncated { .. })
        ));
    }

    #[test]
    fn entry_len_matches_append() {
        for obj_len in [0usize, 1, 127, 128, 300, 20_000] {
            let mut payload = Vec::new();
            append_entry(&mut payload, &id(9), &vec![1u8; obj_len]);
            assert_eq!(payload.len(), entry_len(obj_len), "obj_len={obj_len}");
        }
    }
}
