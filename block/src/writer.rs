//! Producing a block from an id-sorted object stream.

use crate::{
    bloom::ShardedBloomFilter, bloom_name, index::marshal_records, page, BackendSnafu, Error,
    Result, NAME_DATA, NAME_INDEX,
};
use data_types::{BlockMeta, Encoding, ObjectCombiner, Record, TenantId, TraceId};
use object_backend::{AppendTracker, RawWriter};
use snafu::ResultExt;
use std::sync::Arc;
use uuid::Uuid;

/// Tunables for block production.
#[derive(Debug, Clone, Copy)]
pub struct WriteOptions {
    /// Page compression.
    pub encoding: Encoding,
    /// Target uncompressed page payload size; a new page starts once the
    /// current one would exceed this.
    pub target_page_size: usize,
    /// Bloom filter shard count.
    pub bloom_shard_count: u32,
    /// Bloom filter target false-positive rate.
    pub bloom_false_positive: f64,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::Snappy,
            target_page_size: 1024 * 1024,
            bloom_shard_count: 10,
            bloom_false_positive: 0.01,
        }
    }
}

/// Streaming block writer.
///
/// Objects MUST be appended in ascending id order; equal ids are collapsed
/// through the combiner as the block is built, which is what makes ids
/// unique within a block. Artifacts are written data, index, blooms and
/// the manifest strictly last.
pub struct BlockWriter {
    opts: WriteOptions,
    meta: BlockMeta,
    keypath: Vec<String>,
    combiner: Arc<dyn ObjectCombiner>,

    bloom: ShardedBloomFilter,
    records: Vec<Record>,

    // current page under construction
    page_payload: Vec<u8>,
    page_ids: Vec<TraceId>,

    // object held back so a following equal id can still be merged into it
    pending: Option<PendingObject>,

    tracker: Option<AppendTracker>,
    offset: u64,
}

#[derive(Debug)]
struct PendingObject {
    id: TraceId,
    object: Vec<u8>,
    start_time: i64,
    end_time: i64,
}

impl std::fmt::Debug for BlockWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockWriter")
            .field("block_id", &self.meta.block_id)
            .field("tenant_id", &self.meta.tenant_id)
            .field("records", &self.records.len())
            .field("offset", &self.offset)
            .finish()
    }
}

impl BlockWriter {
    /// Begin a block for `tenant` with identity `block_id`, sized for
    /// roughly `expected_objects`.
    pub fn new(
        tenant: &TenantId,
        block_id: Uuid,
        opts: WriteOptions,
        expected_objects: usize,
        combiner: Arc<dyn ObjectCombiner>,
    ) -> Self {
        let mut meta = BlockMeta::new(tenant, block_id, opts.encoding);
        meta.bloom_shard_count = opts.bloom_shard_count.max(1);
        meta.bloom_false_positive = opts.bloom_false_positive;

        Self {
            keypath: crate::block_keypath(tenant, block_id),
            bloom: ShardedBloomFilter::new(
                opts.bloom_shard_count,
                expected_objects,
                opts.bloom_false_positive,
            ),
            combiner,
            opts,
            meta,
            records: Vec::new(),
            page_payload: Vec::new(),
            page_ids: Vec::new(),
            pending: None,
            tracker: None,
            offset: 0,
        }
    }

    /// Append one object. `start_time`/`end_time` extend the manifest's
    /// time range (pass zeroes when unknown and use
    /// [`Self::extend_time_range`] instead).
    pub async fn append(
        &mut self,
        writer: &dyn RawWriter,
        id: TraceId,
        object: &[u8],
        start_time: i64,
        end_time: i64,
    ) -> Result<()> {
        match self.pending.take() {
            None => {
                self.pending = Some(PendingObject {
                    id,
                    object: object.to_vec(),
                    start_time,
                    end_time,
                });
            }
            Some(mut held) if held.id == id => {
                let (merged, _changed) = self
                    .combiner
                    .combine(&held.object, object)
                    .context(crate::CombineSnafu)?;
                held.object = merged;
                if start_time != 0 {
                    held.start_time = if held.start_time == 0 {
                        start_time
                    } else {
                        held.start_time.min(start_time)
                    };
                }
                held.end_time = held.end_time.max(end_time);
                self.pending = Some(held);
            }
            Some(held) => {
                if id < held.id {
                    return Err(Error::OutOfOrder);
                }
                self.write_object(writer, held).await?;
                self.pending = Some(PendingObject {
                    id,
                    object: object.to_vec(),
                    start_time,
                    end_time,
                });
            }
        }
        Ok(())
    }

    /// Extend the manifest time range without appending, used when times
    /// are known per input rather than per object.
    pub fn extend_time_range(&mut self, start_time: i64, end_time: i64) {
        if start_time != 0 {
            self.meta.start_time = self.meta.start_time.min(start_time);
        }
        if end_time != 0 {
            self.meta.end_time = self.meta.end_time.max(end_time);
        }
    }

    /// Data bytes flushed plus the page under construction, used by callers
    /// to split output by target size.
    pub fn data_len_estimate(&self) -> u64 {
        self.offset + self.page_payload.len() as u64
    }

    /// Objects appended so far.
    pub fn object_count(&self) -> u64 {
        self.meta.total_objects + u64::from(self.pending.is_some())
    }

    async fn write_object(&mut self, writer: &dyn RawWriter, held: PendingObject) -> Result<()> {
        let entry_len = page::entry_len(held.object.len());
        if !self.page_payload.is_empty()
            && self.page_payload.len() + entry_len > self.opts.target_page_size
        {
            self.cut_page(writer).await?;
        }

        page::append_entry(&mut self.page_payload, &held.id, &held.object);
        self.page_ids.push(held.id);
        self.bloom.add(&held.id);
        self.meta
            .observe_object(&held.id, held.start_time, held.end_time);
        Ok(())
    }

    async fn cut_page(&mut self, writer: &dyn RawWriter) -> Result<()> {
        if self.page_payload.is_empty() {
            return Ok(());
        }

        let frame = page::marshal_page(&self.page_payload, self.opts.encoding)?;
        let tracker = writer
            .append(NAME_DATA, &self.keypath, self.tracker.take(), &frame)
            .await
            .context(BackendSnafu)?;
        self.tracker = Some(tracker);

        for id in self.page_ids.drain(..) {
            self.records.push(Record {
                id,
                start: self.offset,
                length: frame.len() as u32,
            });
        }
        self.offset += frame.len() as u64;
        self.page_payload.clear();
        Ok(())
    }

    /// Flush everything and publish the manifest. Consumes the writer; the
    /// returned manifest is what the rest of the system trusts.
    pub async fn complete(mut self, writer: &dyn RawWriter) -> Result<BlockMeta> {
        if let Some(held) = self.pending.take() {
            self.write_object(writer, held).await?;
        }
        self.cut_page(writer).await?;

        match self.tracker.take() {
            Some(tracker) => writer.close_append(tracker).await.context(BackendSnafu)?,
            // zero-object block still gets a complete artifact set
            None => writer
                .write(NAME_DATA, &self.keypath, bytes::Bytes::new(), false)
                .await
                .context(BackendSnafu)?,
        }

        let index = marshal_records(&self.records);
        let index_len = index.len() as u64;
        writer
            .write(NAME_INDEX, &self.keypath, index.into(), true)
            .await
            .context(BackendSnafu)?;

        let mut bloom_len = 0u64;
        for (shard, bytes) in self.bloom.marshal_shards().into_iter().enumerate() {
            bloom_len += bytes.len() as u64;
            writer
                .write(&bloom_name(shard as u32), &self.keypath, bytes.into(), true)
                .await
                .context(BackendSnafu)?;
        }

        self.meta.size = self.offset + index_len + bloom_len;
        crate::write_meta(writer, &self.meta).await?;
        Ok(self.meta)
    }
}
