//! The backend-facing store: blocklist polling, block upload, and point
//! lookup across a tenant's uploaded blocks.
//!
//! Queriers, ingesters and the compactor all work against the same store:
//! the blocklist is polled periodically and published as immutable
//! snapshots (readers never block the poller), uploads publish the
//! manifest last, and deletion goes through a compacted marker plus a
//! grace window so in-flight readers are never pulled out from under.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use block::{finder::PagedFinder, NAME_COMPACTED_META, NAME_META};
use data_types::{BlockMeta, ObjectCombiner, TenantId, TraceId};
use futures::StreamExt;
use object_backend::{RawReader, RawWriter};
use observability_deps::tracing::{info, warn};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Store errors.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("backend error: {}", source))]
    Backend { source: object_backend::Error },

    #[snafu(display("block error: {}", source))]
    Block { source: block::Error },

    #[snafu(display("marker for block {} is malformed: {}", block_id, source))]
    MarkerCorrupt {
        block_id: Uuid,
        source: serde_json::Error,
    },
}

/// Result alias for store operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The tombstone written when compaction consumes a block: the original
/// manifest plus when it was consumed, so the sweeper can apply the grace
/// window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactedBlockMeta {
    /// The consumed block's manifest.
    #[serde(flatten)]
    pub block_meta: BlockMeta,
    /// Unix nanoseconds at which the block was marked.
    pub compacted_time: i64,
}

/// One tenant's blocklist snapshot.
#[derive(Debug, Clone, Default)]
pub struct TenantBlocklist {
    /// Complete, readable blocks.
    pub live: Vec<BlockMeta>,
    /// Blocks consumed by compaction, awaiting sweep.
    pub compacted: Vec<CompactedBlockMeta>,
}

/// Store tunables.
#[derive(Debug, Clone, Copy)]
pub struct StoreConfig {
    /// How often the blocklist is re-polled from the backend.
    pub blocklist_poll: Duration,
    /// Concurrent per-block lookups during a find.
    pub max_find_workers: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            blocklist_poll: Duration::from_secs(300),
            max_find_workers: 10,
        }
    }
}

/// The result of a cross-block lookup.
#[derive(Debug, Clone, PartialEq)]
pub struct FindResult {
    /// The combined trace bytes, if any block held the id.
    pub trace: Option<Vec<u8>>,
    /// True when at least one block errored and was skipped: the caller
    /// got a partial answer.
    pub partial: bool,
}

/// The store.
#[derive(Debug)]
pub struct TraceStore {
    reader: Arc<dyn RawReader>,
    writer: Arc<dyn RawWriter>,
    combiner: Arc<dyn ObjectCombiner>,
    config: StoreConfig,
    // RCU: the poller swaps whole snapshots; readers clone the Arc
    blocklists: RwLock<HashMap<String, Arc<TenantBlocklist>>>,
}

impl TraceStore {
    /// Build a store over `reader`/`writer` (typically cache- and
    /// hedge-decorated).
    pub fn new(
        reader: Arc<dyn RawReader>,
        writer: Arc<dyn RawWriter>,
        combiner: Arc<dyn ObjectCombiner>,
        config: StoreConfig,
    ) -> Self {
        Self {
            reader,
            writer,
            combiner,
            config,
            blocklists: Default::default(),
        }
    }

    /// The raw reader this store wraps.
    pub fn reader(&self) -> Arc<dyn RawReader> {
        Arc::clone(&self.reader)
    }

    /// The raw writer this store wraps.
    pub fn writer(&self) -> Arc<dyn RawWriter> {
        Arc::clone(&self.writer)
    }

    /// Tenants present in the current snapshot.
    pub fn tenants(&self) -> Vec<String> {
        self.blocklists.read().keys().cloned().collect()
    }

    /// The current snapshot for `tenant` (empty when unknown).
    pub fn blocklist(&self, tenant: &TenantId) -> Arc<TenantBlocklist> {
        self.blocklists
            .read()
            .get(tenant.as_str())
            .cloned()
            .unwrap_or_default()
    }

    /// Re-list the backend and swap in fresh snapshots.
    pub async fn poll_blocklists(&self) -> Result<()> {
        let tenants = self.reader.list(&[]).await.context(BackendSnafu)?;

        let mut next: HashMap<String, Arc<TenantBlocklist>> = HashMap::new();
        for tenant_name in tenants {
            let Ok(tenant) = TenantId::new(tenant_name.clone()) else {
                continue;
            };
            let blocklist = self.poll_tenant(&tenant).await?;
            next.insert(tenant_name, Arc::new(blocklist));
        }

        *self.blocklists.write() = next;
        Ok(())
    }

    async fn poll_tenant(&self, tenant: &TenantId) -> Result<TenantBlocklist> {
        let children = self
            .reader
            .list(&[tenant.as_str().to_string()])
            .await
            .context(BackendSnafu)?;

        let mut blocklist = TenantBlocklist::default();
        for child in children {
            let Ok(block_id) = Uuid::parse_str(&child) else {
                continue;
            };

            match block::read_meta(self.reader.as_ref(), tenant, block_id).await {
                Ok(meta) => blocklist.live.push(meta),
                Err(object_backend::Error::DoesNotExist { .. }) => {
                    // no manifest: either compacted (marker present) or a
                    // partial write that never completed; both are skipped
                    match self.read_compacted_marker(tenant, block_id).await {
                        Ok(Some(marker)) => blocklist.compacted.push(marker),
                        Ok(None) => {}
                        Err(e) => {
                            warn!(
                                tenant = %tenant,
                                block = %block_id,
                                error = %e,
                                "skipping block with unreadable marker",
                            );
                        }
                    }
                }
                Err(e) => {
                    warn!(
                        tenant = %tenant,
                        block = %block_id,
                        error = %e,
                        "skipping block with unreadable meta",
                    );
                }
            }
        }

        blocklist.live.sort_by_key(|m| m.block_id);
        Ok(blocklist)
    }

    /// Poll on a timer until shutdown.
    pub async fn poll_loop(&self, shutdown: CancellationToken) {
        loop {
            if let Err(e) = self.poll_blocklists().await {
                warn!(error = %e, "blocklist poll failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.blocklist_poll) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// Point lookup across every live block of `tenant` in the current
    /// snapshot. Per-block failures degrade to a partial result rather
    /// than failing the lookup.
    pub async fn find(&self, tenant: &TenantId, trace_id: &TraceId) -> FindResult {
        let blocklist = self.blocklist(tenant);
        let candidates: Vec<&BlockMeta> = blocklist
            .live
            .iter()
            .filter(|meta| meta.may_contain(trace_id))
            .collect();

        let mut futs: Vec<std::pin::Pin<Box<dyn std::future::Future<Output = _> + Send>>> =
            Vec::with_capacity(candidates.len());
        for meta in candidates.into_iter() {
            let finder = PagedFinder::new(
                Arc::clone(&self.reader),
                meta.clone(),
                Some(Arc::clone(&self.combiner)),
            );
            let block_id = meta.block_id;
            futs.push(Box::pin(async move {
                (block_id, finder.find(trace_id).await)
            }));
        }
        let lookups = futures::stream::iter(futs)
            .buffer_unordered(self.config.max_find_workers.max(1))
            .collect::<Vec<_>>()
            .await;

        let mut result = FindResult {
            trace: None,
            partial: false,
        };
        for (block_id, lookup) in lookups {
            match lookup {
                Ok(None) => {}
                Ok(Some(fragment)) => {
                    result.trace = Some(match result.trace.take() {
                        None => fragment,
                        Some(acc) => match self.combiner.combine(&acc, &fragment) {
                            Ok((merged, _)) => merged,
                            Err(e) => {
                                warn!(block = %block_id, error = %e, "combining fragments failed");
                                result.partial = true;
                                acc
                            }
                        },
                    });
                }
                Err(e) => {
                    warn!(block = %block_id, error = %e, "block lookup failed, continuing");
                    result.partial = true;
                }
            }
        }
        result
    }

    /// Upload a complete block from `local` to this store's backend.
    /// The manifest is copied last so readers never observe a partial
    /// block; re-running after a crash converges to the same state.
    pub async fn write_block(&self, local: &dyn RawReader, meta: &BlockMeta) -> Result<()> {
        let tenant = TenantId::new(meta.tenant_id.clone()).expect("meta carries validated tenant");
        let keypath = block::block_keypath(&tenant, meta.block_id);

        let mut names = vec![block::NAME_DATA.to_string(), block::NAME_INDEX.to_string()];
        for shard in 0..meta.bloom_shard_count {
            names.push(block::bloom_name(shard));
        }

        for name in names {
            let bytes = local
                .read(&name, &keypath, false)
                .await
                .context(BackendSnafu)?;
            let cache = name != block::NAME_DATA;
            self.writer
                .write(&name, &keypath, bytes, cache)
                .await
                .context(BackendSnafu)?;
        }

        let bytes = local
            .read(NAME_META, &keypath, false)
            .await
            .context(BackendSnafu)?;
        self.writer
            .write(NAME_META, &keypath, bytes, false)
            .await
            .context(BackendSnafu)?;

        info!(tenant = %tenant, block = %meta.block_id, size = meta.size, "uploaded block");
        Ok(())
    }

    async fn read_compacted_marker(
        &self,
        tenant: &TenantId,
        block_id: Uuid,
    ) -> Result<Option<CompactedBlockMeta>> {
        match self
            .reader
            .read(
                NAME_COMPACTED_META,
                &block::block_keypath(tenant, block_id),
                false,
            )
            .await
        {
            Ok(bytes) => {
                let marker = serde_json::from_slice(&bytes)
                    .context(MarkerCorruptSnafu { block_id })?;
                Ok(Some(marker))
            }
            Err(object_backend::Error::DoesNotExist { .. }) => Ok(None),
            Err(source) => Err(Error::Backend { source }),
        }
    }

    /// Replace a block's manifest with a compacted marker. The block's
    /// data stays readable for queriers holding older snapshots until the
    /// sweeper deletes it after the grace window.
    pub async fn mark_compacted(&self, meta: &BlockMeta, now_nanos: i64) -> Result<()> {
        let tenant = TenantId::new(meta.tenant_id.clone()).expect("meta carries validated tenant");
        let keypath = block::block_keypath(&tenant, meta.block_id);

        let marker = CompactedBlockMeta {
            block_meta: meta.clone(),
            compacted_time: now_nanos,
        };
        let bytes = serde_json::to_vec(&marker).expect("marker serializes");
        self.writer
            .write(NAME_COMPACTED_META, &keypath, bytes.into(), false)
            .await
            .context(BackendSnafu)?;
        self.writer
            .delete(NAME_META, &keypath)
            .await
            .context(BackendSnafu)?;
        Ok(())
    }

    /// Delete every artifact of a block.
    pub async fn delete_block(&self, tenant: &TenantId, block_id: Uuid) -> Result<()> {
        let keypath = block::block_keypath(tenant, block_id);
        let names = self.reader.list(&keypath).await.context(BackendSnafu)?;
        for name in names {
            self.writer
                .delete(&name, &keypath)
                .await
                .context(BackendSnafu)?;
        }
        info!(tenant = %tenant, block = %block_id, "deleted block");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use block::writer::{BlockWriter, WriteOptions};
    use data_types::{
        trace::{InstrumentationLibrarySpans, ResourceSpans, Span, Trace},
        TraceCombiner,
    };
    use object_backend::ObjectStoreBackend;

    fn tenant() -> TenantId {
        TenantId::new("store-tenant").unwrap()
    }

    fn id(n: u8) -> TraceId {
        TraceId::new([n; 16])
    }

    fn proto_object(span_id: u8) -> Vec<u8> {
        Trace {
            resource_spans: vec![ResourceSpans {
                resource: None,
                instrumentation_library_spans: vec![InstrumentationLibrarySpans {
                    instrumentation_library: None,
                    spans: vec![Span {
                        trace_id: vec![8; 16],
                        span_id: vec![span_id; 8],
                        parent_span_id: vec![],
                        name: "op".into(),
                        start_time_unix_nano: 1,
                        end_time_unix_nano: 2,
                        status_code: 0,
                        attributes: vec![],
                    }],
                }],
            }],
        }
        .encode_to_bytes()
    }

    fn store_over(backend: Arc<ObjectStoreBackend>) -> TraceStore {
        TraceStore::new(
            Arc::clone(&backend) as _,
            backend as _,
            Arc::new(TraceCombiner),
            StoreConfig::default(),
        )
    }

    async fn block_into(backend: &ObjectStoreBackend, ids: &[u8]) -> BlockMeta {
        let mut writer = BlockWriter::new(
            &tenant(),
            Uuid::new_v4(),
            WriteOptions::default(),
            ids.len(),
            Arc::new(TraceCombiner),
        );
        for n in ids {
            writer
                .append(backend, id(*n), &proto_object(*n), 1, 2)
                .await
                .unwrap();
        }
        writer.complete(backend).await.unwrap()
    }

    #[tokio::test]
    async fn poll_then_find_across_blocks() {
        let backend = Arc::new(ObjectStoreBackend::memory());
        let _a = block_into(&backend, &[1, 3]).await;
        let _b = block_into(&backend, &[3, 5]).await;

        let store = store_over(Arc::clone(&backend));
        store.poll_blocklists().await.unwrap();

        assert_eq!(store.tenants(), vec![tenant().as_str().to_string()]);
        assert_eq!(store.blocklist(&tenant()).live.len(), 2);

        // id 3 lives in both blocks; fragments combine to one span
        let result = store.find(&tenant(), &id(3)).await;
        assert!(!result.partial);
        let trace = Trace::decode_from_bytes(&result.trace.unwrap()).unwrap();
        assert_eq!(trace.span_count(), 1);

        // absent id
        let result = store.find(&tenant(), &id(9)).await;
        assert_eq!(result.trace, None);
        assert!(!result.partial);
    }

    #[tokio::test]
    async fn upload_publishes_meta_last_and_is_idempotent() {
        let local = Arc::new(ObjectStoreBackend::memory());
        let meta = block_into(&local, &[1, 2]).await;

        let remote = Arc::new(ObjectStoreBackend::memory());
        let store = store_over(Arc::clone(&remote));

        store.write_block(local.as_ref(), &meta).await.unwrap();
        // crash-retry: a second upload converges
        store.write_block(local.as_ref(), &meta).await.unwrap();

        store.poll_blocklists().await.unwrap();
        assert_eq!(store.blocklist(&tenant()).live, vec![meta.clone()]);

        let found = store.find(&tenant(), &id(1)).await;
        assert!(found.trace.is_some());
    }

    #[tokio::test]
    async fn partial_upload_is_invisible() {
        let local = Arc::new(ObjectStoreBackend::memory());
        let meta = block_into(&local, &[1]).await;

        let remote = Arc::new(ObjectStoreBackend::memory());
        let store = store_over(Arc::clone(&remote));

        // copy everything except the manifest (simulated crash before the
        // final write)
        let keypath = block::block_keypath(&tenant(), meta.block_id);
        for name in [
            block::NAME_DATA.to_string(),
            block::NAME_INDEX.to_string(),
            block::bloom_name(0),
        ] {
            let bytes = local.read(&name, &keypath, false).await.unwrap();
            remote.write(&name, &keypath, bytes, false).await.unwrap();
        }

        store.poll_blocklists().await.unwrap();
        assert!(store.blocklist(&tenant()).live.is_empty());
    }

    #[tokio::test]
    async fn compacted_marker_moves_block_out_of_live() {
        let backend = Arc::new(ObjectStoreBackend::memory());
        let meta = block_into(&backend, &[1, 2]).await;
        let keep = block_into(&backend, &[4]).await;

        let store = store_over(Arc::clone(&backend));
        store.mark_compacted(&meta, 12345).await.unwrap();

        store.poll_blocklists().await.unwrap();
        let blocklist = store.blocklist(&tenant());
        assert_eq!(blocklist.live, vec![keep]);
        assert_eq!(blocklist.compacted.len(), 1);
        assert_eq!(blocklist.compacted[0].block_meta, meta);
        assert_eq!(blocklist.compacted[0].compacted_time, 12345);
    }

    #[tokio::test]
    async fn delete_block_removes_every_artifact() {
        let backend = Arc::new(ObjectStoreBackend::memory());
        let meta = block_into(&backend, &[1]).await;

        let store = store_over(Arc::clone(&backend));
        store.delete_block(&tenant(), meta.block_id).await.unwrap();

        let names = backend
            .list(&block::block_keypath(&tenant(), meta.block_id))
            .await
            .unwrap();
        assert!(names.is_empty(), "leftover artifacts: {names:?}");
    }
}
