//! Point lookup inside one block.

use crate::{
    bloom::{shard_of, BloomFilter},
    bloom_name,
    index::IndexReader,
    page::{unmarshal_page, PageEntries},
    BackendSnafu, CombineSnafu, Result, NAME_DATA, NAME_INDEX,
};
use data_types::{BlockMeta, ObjectCombiner, TenantId, TraceId};
use object_backend::RawReader;
use snafu::ResultExt;
use std::sync::Arc;

/// Finds a single trace's object inside one block: bloom probe, index
/// binary search, one page fetch, and (with a combiner) continuation over
/// successive equal-id records.
#[derive(Debug)]
pub struct PagedFinder {
    reader: Arc<dyn RawReader>,
    meta: BlockMeta,
    keypath: Vec<String>,
    combiner: Option<Arc<dyn ObjectCombiner>>,
}

impl PagedFinder {
    /// Build a finder over the block described by `meta`.
    pub fn new(
        reader: Arc<dyn RawReader>,
        meta: BlockMeta,
        combiner: Option<Arc<dyn ObjectCombiner>>,
    ) -> Self {
        let tenant = TenantId::new(meta.tenant_id.clone()).expect("meta carries validated tenant");
        let keypath = crate::block_keypath(&tenant, meta.block_id);
        Self {
            reader,
            meta,
            keypath,
            combiner,
        }
    }

    /// Look up `id`. Absence is `Ok(None)`, not an error.
    pub async fn find(&self, id: &TraceId) -> Result<Option<Vec<u8>>> {
        if !self.meta.may_contain(id) {
            return Ok(None);
        }

        // one bloom shard per probe
        let shard = shard_of(id, self.meta.bloom_shard_count.max(1));
        let bloom_bytes = self
            .reader
            .read(&bloom_name(shard), &self.keypath, true)
            .await
            .context(BackendSnafu)?;
        if !BloomFilter::unmarshal(&bloom_bytes)?.contains(id) {
            return Ok(None);
        }

        let index_bytes = self
            .reader
            .read(NAME_INDEX, &self.keypath, true)
            .await
            .context(BackendSnafu)?;
        let index = IndexReader::new(index_bytes)?;

        let Some((mut record, mut position)) = index.find(id) else {
            return Ok(None);
        };

        let mut result: Option<Vec<u8>> = None;
        let mut last_page_start = None;

        loop {
            // records for equal ids can share a page; each page is scanned
            // once and already yields every matching entry in it
            if last_page_start != Some(record.start) {
                last_page_start = Some(record.start);

                let frame = self
                    .reader
                    .read_range(NAME_DATA, &self.keypath, record.start, record.length as usize)
                    .await
                    .context(BackendSnafu)?;
                let payload = unmarshal_page(&frame, self.meta.encoding)?;

                for entry in PageEntries::new(payload.into()) {
                    let (entry_id, object) = entry?;
                    if entry_id != *id {
                        continue;
                    }
                    match (&mut result, self.combiner.as_ref()) {
                        (None, _) => result = Some(object.to_vec()),
                        (Some(acc), Some(combiner)) => {
                            let (merged, _changed) =
                                combiner.combine(acc, &object).context(CombineSnafu)?;
                            *acc = merged;
                        }
                        // without a combiner the first match wins
                        (Some(_), None) => {}
                    }
                }
            }

            if self.combiner.is_none() && result.is_some() {
                break;
            }

            position += 1;
            match index.at(position) {
                Some(next) if next.id == *id => record = next,
                _ => break,
            }
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{BlockWriter, WriteOptions};
    use data_types::{Encoding, TraceCombiner};
    use object_backend::ObjectStoreBackend;
    use uuid::Uuid;

    fn id(n: u8) -> TraceId {
        TraceId::new([n; 16])
    }

    fn tenant() -> TenantId {
        TenantId::new("finder-tenant").unwrap()
    }

    fn proto_object(span_id: u8) -> Vec<u8> {
        use data_types::trace::{InstrumentationLibrarySpans, ResourceSpans, Span, Trace};
        Trace {
            resource_spans: vec![ResourceSpans {
                resource: None,
                instrumentation_library_spans: vec![InstrumentationLibrarySpans {
                    instrumentation_library: None,
                    spans: vec![Span {
                        trace_id: vec![9; 16],
                        span_id: vec![span_id; 8],
                        parent_span_id: vec![],
                        name: "op".into(),
                        start_time_unix_nano: 5,
                        end_time_unix_nano: 6,
                        status_code: 0,
                        attributes: vec![],
                    }],
                }],
            }],
        }
        .encode_to_bytes()
    }

    async fn block_with(
        backend: &ObjectStoreBackend,
        objects: Vec<(TraceId, Vec<u8>)>,
        opts: WriteOptions,
    ) -> BlockMeta {
        let mut writer = BlockWriter::new(
            &tenant(),
            Uuid::new_v4(),
            opts,
            objects.len(),
            Arc::new(TraceCombiner),
        );
        for (object_id, object) in &objects {
            writer
                .append(backend, *object_id, object, 5, 6)
                .await
                .unwrap();
        }
        writer.complete(backend).await.unwrap()
    }

    #[tokio::test]
    async fn finds_present_ids_and_misses_absent_ones() {
        let backend = Arc::new(ObjectStoreBackend::memory());
        let objects: Vec<_> = [1u8, 3, 5, 7]
            .iter()
            .map(|n| (id(*n), proto_object(*n)))
            .collect();
        let meta = block_with(&backend, objects.clone(), WriteOptions::default()).await;

        let finder = PagedFinder::new(Arc::clone(&backend) as Arc<dyn RawReader>, meta, None);
        for (object_id, object) in &objects {
            let got = finder.find(object_id).await.unwrap().unwrap();
            assert_eq!(&got, object);
        }
        assert!(finder.find(&id(2)).await.unwrap().is_none());
        assert!(finder.find(&id(200)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn combiner_walks_duplicate_records_across_pages() {
        // hand-assemble a block whose id appears in two pages under two
        // index records, the layout a writer without a combiner (or a
        // historic compactor) can leave behind
        use crate::{bloom::ShardedBloomFilter, index::marshal_records, page};
        use data_types::Record;
        use object_backend::RawWriter;

        let backend = Arc::new(ObjectStoreBackend::memory());
        let the_id = id(9);
        let t = tenant();
        let block_id = Uuid::new_v4();
        let keypath = crate::block_keypath(&t, block_id);

        let mut meta = BlockMeta::new(&t, block_id, Encoding::None);
        meta.bloom_shard_count = 2;

        let mut data = Vec::new();
        let mut records = Vec::new();
        for fragment in [proto_object(1), proto_object(2)] {
            let mut payload = Vec::new();
            page::append_entry(&mut payload, &the_id, &fragment);
            let frame = page::marshal_page(&payload, Encoding::None).unwrap();
            records.push(Record {
                id: the_id,
                start: data.len() as u64,
                length: frame.len() as u32,
            });
            data.extend_from_slice(&frame);
            meta.observe_object(&the_id, 5, 6);
        }

        let mut bloom = ShardedBloomFilter::new(2, 2, 0.01);
        bloom.add(&the_id);

        backend
            .write(crate::NAME_DATA, &keypath, data.into(), false)
            .await
            .unwrap();
        backend
            .write(crate::NAME_INDEX, &keypath, marshal_records(&records).into(), false)
            .await
            .unwrap();
        for (shard, bytes) in bloom.marshal_shards().into_iter().enumerate() {
            backend
                .write(&crate::bloom_name(shard as u32), &keypath, bytes.into(), false)
                .await
                .unwrap();
        }
        crate::write_meta(backend.as_ref(), &meta).await.unwrap();

        // without a combiner only the first record's fragment returns
        let finder = PagedFinder::new(
            Arc::clone(&backend) as Arc<dyn RawReader>,
            meta.clone(),
            None,
        );
        let first = finder.find(&the_id).await.unwrap().unwrap();
        assert_eq!(
            data_types::trace::Trace::decode_from_bytes(&first)
                .unwrap()
                .span_count(),
            1
        );

        // with a combiner both records are walked and merged
        let finder = PagedFinder::new(
            Arc::clone(&backend) as Arc<dyn RawReader>,
            meta,
            Some(Arc::new(TraceCombiner)),
        );
        let merged = finder.find(&the_id).await.unwrap().unwrap();
        assert_eq!(
            data_types::trace::Trace::decode_from_bytes(&merged)
                .unwrap()
                .span_count(),
            2
        );
    }

    #[tokio::test]
    async fn every_record_page_contains_its_id() {
        // index/data coherence under multi-page layout
        let backend = Arc::new(ObjectStoreBackend::memory());
        let opts = WriteOptions {
            target_page_size: 100,
            encoding: Encoding::Snappy,
            ..Default::default()
        };
        let objects: Vec<_> = (1u8..=20).map(|n| (id(n), proto_object(n))).collect();
        let meta = block_with(&backend, objects, opts).await;

        let finder = PagedFinder::new(Arc::clone(&backend) as Arc<dyn RawReader>, meta, None);
        for n in 1u8..=20 {
            assert!(finder.find(&id(n)).await.unwrap().is_some(), "id {n}");
        }
    }
}
