//! The write-ahead log backing ingester head blocks.
//!
//! One segment file per head block, named `<block id>+<tenant>+<state>`
//! with state `open` or `sealed`. Records are framed
//!
//! ```text
//! | u32 len | u32 crc32(payload) | payload(16-byte id + data) |
//! ```
//!
//! and every append is synced before the caller is acknowledged, which is
//! what makes a quorum write durable. On restart, [`replay`] returns every
//! segment's records; a torn final record (a crash mid-append) is truncated
//! away rather than failing replay.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use byteorder::{ByteOrder, LittleEndian};
use data_types::{TenantId, TraceId};
use observability_deps::tracing::warn;
use snafu::{ResultExt, Snafu};
use std::{
    fs::{File, OpenOptions},
    io::{Read, Write},
    path::{Path, PathBuf},
};
use uuid::Uuid;

const RECORD_HEADER_LEN: usize = 8;
const STATE_OPEN: &str = "open";
const STATE_SEALED: &str = "sealed";

/// WAL errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("wal io error on {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("segment file name {:?} is malformed", name))]
    MalformedName { name: String },
}

/// Result alias for WAL operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

fn segment_file_name(block_id: Uuid, tenant: &TenantId, state: &str) -> String {
    format!("{block_id}+{tenant}+{state}")
}

/// A write handle over one open segment.
///
/// Single-writer: the owning head block serializes appends.
#[derive(Debug)]
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    block_id: Uuid,
    tenant: TenantId,
    size: u64,
}

impl SegmentWriter {
    /// Create a fresh open segment for `block_id` under `dir`.
    pub fn create(dir: &Path, block_id: Uuid, tenant: &TenantId) -> Result<Self> {
        let path = dir.join(segment_file_name(block_id, tenant, STATE_OPEN));
        let file = OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&path)
            .context(IoSnafu { path: path.clone() })?;
        Ok(Self {
            file,
            path,
            block_id,
            tenant: tenant.clone(),
            size: 0,
        })
    }

    /// The segment's block id.
    pub fn block_id(&self) -> Uuid {
        self.block_id
    }

    /// Bytes appended so far.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Append one record and sync it to disk. On return the record is
    /// durable.
    pub fn append(&mut self, id: &TraceId, data: &[u8]) -> Result<usize> {
        let payload_len = TraceId::LEN + data.len();
        let mut frame = Vec::with_capacity(RECORD_HEADER_LEN + payload_len);

        let mut header = [0u8; RECORD_HEADER_LEN];
        LittleEndian::write_u32(&mut header[0..4], payload_len as u32);

        let mut hasher = crc32fast::Hasher::new();
        hasher.update(id.as_bytes());
        hasher.update(data);
        LittleEndian::write_u32(&mut header[4..8], hasher.finalize());

        frame.extend_from_slice(&header);
        frame.extend_from_slice(id.as_bytes());
        frame.extend_from_slice(data);

        self.file
            .write_all(&frame)
            .context(IoSnafu { path: self.path.clone() })?;
        self.file
            .sync_data()
            .context(IoSnafu { path: self.path.clone() })?;

        self.size += frame.len() as u64;
        Ok(frame.len())
    }

    /// Seal the segment: sync, rename `open` → `sealed`, release the file.
    /// Returns the sealed path.
    pub fn seal(self) -> Result<PathBuf> {
        self.file
            .sync_all()
            .context(IoSnafu { path: self.path.clone() })?;
        drop(self.file);

        let sealed = self
            .path
            .with_file_name(segment_file_name(self.block_id, &self.tenant, STATE_SEALED));
        std::fs::rename(&self.path, &sealed).context(IoSnafu { path: self.path.clone() })?;
        Ok(sealed)
    }

    /// Path of the open segment file.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// One segment recovered from disk.
#[derive(Debug)]
pub struct ReplayedSegment {
    /// The head block this segment backed.
    pub block_id: Uuid,
    /// Owning tenant.
    pub tenant: TenantId,
    /// Whether the segment was sealed before the crash.
    pub sealed: bool,
    /// All intact records in append order.
    pub records: Vec<(TraceId, Vec<u8>)>,
    /// The segment file, so the caller can delete it once consumed.
    pub path: PathBuf,
}

/// Scan `dir` and recover every segment.
///
/// A torn tail (length or checksum mismatch in the final record) is
/// truncated off the file and replay continues; that is the expected
/// signature of a crash mid-append, not corruption.
pub fn replay(dir: &Path) -> Result<Vec<ReplayedSegment>> {
    std::fs::create_dir_all(dir).context(IoSnafu {
        path: dir.to_path_buf(),
    })?;

    let mut segments = Vec::new();
    let entries = std::fs::read_dir(dir).context(IoSnafu {
        path: dir.to_path_buf(),
    })?;

    for entry in entries {
        let entry = entry.context(IoSnafu {
            path: dir.to_path_buf(),
        })?;
        if !entry
            .file_type()
            .context(IoSnafu { path: entry.path() })?
            .is_file()
        {
            continue;
        }

        let name = entry.file_name().to_string_lossy().to_string();
        let (block_id, tenant, sealed) = parse_segment_name(&name)?;
        let path = entry.path();
        let records = read_segment(&path)?;
        segments.push(ReplayedSegment {
            block_id,
            tenant,
            sealed,
            records,
            path,
        });
    }

    // deterministic order for callers
    segments.sort_by_key(|s| (s.tenant.clone(), s.block_id));
    Ok(segments)
}

fn parse_segment_name(name: &str) -> Result<(Uuid, TenantId, bool)> {
    let mut parts = name.splitn(3, '+');
    let (Some(id_part), Some(tenant_part), Some(state_part)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return Err(Error::MalformedName {
            name: name.to_string(),
        });
    };

    let block_id = Uuid::parse_str(id_part).map_err(|_| Error::MalformedName {
        name: name.to_string(),
    })?;
    let tenant = TenantId::new(tenant_part).map_err(|_| Error::MalformedName {
        name: name.to_string(),
    })?;
    let sealed = match state_part {
        STATE_OPEN => false,
        STATE_SEALED => true,
        _ => {
            return Err(Error::MalformedName {
                name: name.to_string(),
            })
        }
    };
    Ok((block_id, tenant, sealed))
}

fn read_segment(path: &Path) -> Result<Vec<(TraceId, Vec<u8>)>> {
    let mut file = File::open(path).context(IoSnafu {
        path: path.to_path_buf(),
    })?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes).context(IoSnafu {
        path: path.to_path_buf(),
    })?;
    drop(file);

    let mut records = Vec::new();
    let mut offset = 0usize;
    while offset < bytes.len() {
        let valid = parse_record(&bytes[offset..]);
        match valid {
            Some((id, data, consumed)) => {
                records.push((id, data));
                offset += consumed;
            }
            None => {
                warn!(
                    path = %path.display(),
                    valid_bytes = offset,
                    torn_bytes = bytes.len() - offset,
                    "truncating torn record at end of wal segment",
                );
                let file = OpenOptions::new().write(true).open(path).context(IoSnafu {
                    path: path.to_path_buf(),
                })?;
                file.set_len(offset as u64).context(IoSnafu {
                    path: path.to_path_buf(),
                })?;
                file.sync_all().context(IoSnafu {
                    path: path.to_path_buf(),
                })?;
                break;
            }
        }
    }
    Ok(records)
}

fn parse_record(bytes: &[u8]) -> Option<(TraceId, Vec<u8>, usize)> {
    if bytes.len() < RECORD_HEADER_LEN {
        return None;
    }
    let payload_len = LittleEndian::read_u32(&bytes[0..4]) as usize;
    let expected_crc = LittleEndian::read_u32(&bytes[4..8]);
    if payload_len < TraceId::LEN || bytes.len() - RECORD_HEADER_LEN < payload_len {
        return None;
    }

    let payload = &bytes[RECORD_HEADER_LEN..RECORD_HEADER_LEN + payload_len];
    if crc32fast::hash(payload) != expected_crc {
        return None;
    }

    let id = TraceId::try_from(&payload[..TraceId::LEN]).ok()?;
    Some((
        id,
        payload[TraceId::LEN..].to_vec(),
        RECORD_HEADER_LEN + payload_len,
    ))
}

/// Delete a segment file, used once its contents are durable elsewhere.
pub fn delete_segment(path: &Path) -> Result<()> {
    std::fs::remove_file(path).context(IoSnafu {
        path: path.to_path_buf(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u8) -> TraceId {
        TraceId::new([n; 16])
    }

    fn tenant() -> TenantId {
        TenantId::new("wal-tenant").unwrap()
    }

    #[test]
    fn append_seal_replay() {
        let dir = tempfile::tempdir().unwrap();
        let block_id = Uuid::new_v4();

        let mut writer = SegmentWriter::create(dir.path(), block_id, &tenant()).unwrap();
        writer.append(&id(1), b"alpha").unwrap();
        writer.append(&id(2), b"beta").unwrap();
        assert!(writer.size() > 0);
        writer.seal().unwrap();

        let segments = replay(dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
        let segment = &segments[0];
        assert_eq!(segment.block_id, block_id);
        assert_eq!(segment.tenant, tenant());
        assert!(segment.sealed);
        assert_eq!(
            segment.records,
            vec![(id(1), b"alpha".to_vec()), (id(2), b"beta".to_vec())]
        );
    }

    #[test]
    fn open_segment_replays_unsealed() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), Uuid::new_v4(), &tenant()).unwrap();
        writer.append(&id(7), b"live").unwrap();
        drop(writer); // simulated crash: no seal

        let segments = replay(dir.path()).unwrap();
        assert_eq!(segments.len(), 1);
        assert!(!segments[0].sealed);
        assert_eq!(segments[0].records, vec![(id(7), b"live".to_vec())]);
    }

    #[test]
    fn torn_tail_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), Uuid::new_v4(), &tenant()).unwrap();
        writer.append(&id(1), b"intact").unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        // simulate a crash mid-append: half a record at the tail
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&[0x22, 0x00, 0x00, 0x00, 0xde, 0xad]).unwrap();
        drop(file);
        let torn_len = std::fs::metadata(&path).unwrap().len();

        let segments = replay(dir.path()).unwrap();
        assert_eq!(segments[0].records, vec![(id(1), b"intact".to_vec())]);

        // the torn bytes are gone from disk, so a second replay is clean
        assert!(std::fs::metadata(&path).unwrap().len() < torn_len);
        let again = replay(dir.path()).unwrap();
        assert_eq!(again[0].records.len(), 1);
    }

    #[test]
    fn corrupt_checksum_truncates_from_that_record() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SegmentWriter::create(dir.path(), Uuid::new_v4(), &tenant()).unwrap();
        writer.append(&id(1), b"keep").unwrap();
        let keep_len = writer.size();
        writer.append(&id(2), b"mangle").unwrap();
        let path = writer.path().to_path_buf();
        drop(writer);

        // flip a payload byte of the second record
        let mut bytes = std::fs::read(&path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        std::fs::write(&path, &bytes).unwrap();

        let segments = replay(dir.path()).unwrap();
        assert_eq!(segments[0].records, vec![(id(1), b"keep".to_vec())]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), keep_len);
    }

    #[test]
    fn unknown_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("not-a-segment"), b"junk").unwrap();
        assert!(matches!(
            replay(dir.path()),
            Err(Error::MalformedName { .. })
        ));
    }

    #[test]
    fn replay_on_empty_dir_creates_it() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("wal");
        let segments = replay(&nested).unwrap();
        assert!(segments.is_empty());
        assert!(nested.is_dir());
    }
}
