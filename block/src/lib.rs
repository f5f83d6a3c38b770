//! The immutable block format.
//!
//! A block is a four-artifact bundle under `<tenant>/<block id>/`:
//!
//! - `data`: a stream of checksummed, optionally compressed pages, each
//!   holding `(id, object)` entries sorted by id
//! - `index`: fixed-width records mapping every id to its page
//! - `bloom-0..bloom-(N-1)`: a sharded bloom filter, one shard fetched per
//!   point lookup
//! - `meta.json`: the manifest, written last; its presence declares the
//!   block complete
//!
//! [`writer::BlockWriter`] produces a block from an id-sorted object
//! stream, [`finder::PagedFinder`] is the point-lookup path, and
//! [`iter`] provides full scans for compaction.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{BlockMeta, TenantId};
use object_backend::{RawReader, RawWriter};
use snafu::{ResultExt, Snafu};
use uuid::Uuid;

pub mod bloom;
pub mod finder;
pub mod index;
pub mod iter;
pub mod page;
pub mod writer;

/// Leaf name of the data object.
pub const NAME_DATA: &str = "data";
/// Leaf name of the index object.
pub const NAME_INDEX: &str = "index";
/// Leaf name of the manifest.
pub const NAME_META: &str = "meta.json";
/// Leaf name of the compaction tombstone marker.
pub const NAME_COMPACTED_META: &str = "meta.compacted.json";

/// Leaf name of bloom shard `shard`.
pub fn bloom_name(shard: u32) -> String {
    format!("bloom-{shard}")
}

/// The `[tenant, block id]` keypath of a block's artifacts.
pub fn block_keypath(tenant: &TenantId, block_id: Uuid) -> Vec<String> {
    vec![tenant.as_str().to_string(), block_id.to_string()]
}

/// Errors reading or writing blocks.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("backend error: {}", source))]
    Backend { source: object_backend::Error },

    #[snafu(display("page too short: {} bytes", len))]
    PageTruncated { len: usize },

    #[snafu(display("page checksum mismatch: expected {:08x}, got {:08x}", expected, actual))]
    PageChecksum { expected: u32, actual: u32 },

    #[snafu(display("page decompression failed: {}", source))]
    PageDecompress { source: snap::Error },

    #[snafu(display("malformed page entry at offset {}", offset))]
    PageEntry { offset: usize },

    #[snafu(display("index corrupt: {}", reason))]
    IndexCorrupt { reason: String },

    #[snafu(display("bloom shard corrupt: {}", reason))]
    BloomCorrupt { reason: String },

    #[snafu(display("objects must be appended in ascending id order"))]
    OutOfOrder,

    #[snafu(display("combining objects failed: {}", source))]
    Combine { source: data_types::CombineError },

    #[snafu(display("manifest for block is malformed: {}", source))]
    MetaCorrupt { source: serde_json::Error },
}

/// Result alias for block operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Read and parse a block's manifest.
///
/// [`object_backend::Error::DoesNotExist`] passes through untranslated so
/// callers can treat an absent manifest as "block not (yet) complete".
pub async fn read_meta(
    reader: &dyn RawReader,
    tenant: &TenantId,
    block_id: Uuid,
) -> Result<BlockMeta, object_backend::Error> {
    let bytes = reader
        .read(NAME_META, &block_keypath(tenant, block_id), false)
        .await?;
    serde_json::from_slice(&bytes).map_err(|e| object_backend::Error::Backend {
        path: format!("{}/{}/{}", tenant, block_id, NAME_META),
        source: Box::new(e),
    })
}

/// Write a block's manifest, the final step that makes a block visible.
pub async fn write_meta(writer: &dyn RawWriter, meta: &BlockMeta) -> Result<()> {
    let tenant = TenantId::new(meta.tenant_id.clone()).expect("meta carries validated tenant");
    let bytes = serde_json::to_vec(meta).context(MetaCorruptSnafu)?;
    writer
        .write(
            NAME_META,
            &block_keypath(&tenant, meta.block_id),
            bytes.into(),
            false,
        )
        .await
        .context(BackendSnafu)
}
