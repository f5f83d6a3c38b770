//! Full-block iteration and the k-way merge used by compaction.

use crate::{
    page::{unmarshal_page, PageEntries, PAGE_HEADER_LEN},
    BackendSnafu, CombineSnafu, Error, Result, NAME_DATA,
};
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use data_types::{BlockMeta, ObjectCombiner, TenantId, TraceId};
use object_backend::RawReader;
use snafu::ResultExt;
use std::sync::Arc;

/// Iterates every `(id, object)` of one block in ascending id order.
///
/// The data object is fetched and parsed up front, so iteration itself is
/// infallible; block sizes are bounded by the writer's rotation settings.
#[derive(Debug)]
pub struct BlockIterator {
    entries: std::vec::IntoIter<(TraceId, Bytes)>,
}

impl BlockIterator {
    /// Fetch and parse the block described by `meta`.
    pub async fn load(reader: &dyn RawReader, meta: &BlockMeta) -> Result<Self> {
        let tenant = TenantId::new(meta.tenant_id.clone()).expect("meta carries validated tenant");
        let keypath = crate::block_keypath(&tenant, meta.block_id);
        let data = reader
            .read(NAME_DATA, &keypath, false)
            .await
            .context(BackendSnafu)?;

        let mut entries = Vec::with_capacity(meta.total_objects as usize);
        let mut offset = 0usize;
        while offset < data.len() {
            if data.len() - offset < PAGE_HEADER_LEN {
                return Err(Error::PageTruncated {
                    len: data.len() - offset,
                });
            }
            let stored_len = LittleEndian::read_u32(&data[offset..offset + 4]) as usize;
            let frame_len = PAGE_HEADER_LEN + stored_len;
            if data.len() - offset < frame_len {
                return Err(Error::PageTruncated {
                    len: data.len() - offset,
                });
            }

            let payload = unmarshal_page(&data[offset..offset + frame_len], meta.encoding)?;
            for entry in PageEntries::new(payload.into()) {
                entries.push(entry?);
            }
            offset += frame_len;
        }

        Ok(Self {
            entries: entries.into_iter(),
        })
    }
}

impl Iterator for BlockIterator {
    type Item = (TraceId, Bytes);

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }
}

/// Merges several [`BlockIterator`]s by ascending id, reducing equal ids
/// through the combiner. The workhorse of compaction.
pub struct MultiBlockIterator {
    inputs: Vec<std::iter::Peekable<BlockIterator>>,
    combiner: Arc<dyn ObjectCombiner>,
}

impl std::fmt::Debug for MultiBlockIterator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiBlockIterator")
            .field("inputs", &self.inputs.len())
            .finish()
    }
}

impl MultiBlockIterator {
    /// Merge `inputs` using `combiner`.
    pub fn new(inputs: Vec<BlockIterator>, combiner: Arc<dyn ObjectCombiner>) -> Self {
        Self {
            inputs: inputs.into_iter().map(Iterator::peekable).collect(),
            combiner,
        }
    }

    /// The next merged `(id, object)`, or `None` when every input is
    /// exhausted.
    pub fn next_object(&mut self) -> Result<Option<(TraceId, Vec<u8>)>> {
        let min_id = self
            .inputs
            .iter_mut()
            .filter_map(|input| input.peek().map(|(id, _)| *id))
            .min();
        let Some(min_id) = min_id else {
            return Ok(None);
        };

        let mut merged: Option<Vec<u8>> = None;
        for input in &mut self.inputs {
            while matches!(input.peek(), Some((id, _)) if *id == min_id) {
                let (_, object) = input.next().expect("peeked");
                merged = Some(match merged.take() {
                    None => object.to_vec(),
                    Some(acc) => self.combiner.combine(&acc, &object).context(CombineSnafu)?.0,
                });
            }
        }

        Ok(Some((min_id, merged.expect("at least one input matched"))))
    }
}
