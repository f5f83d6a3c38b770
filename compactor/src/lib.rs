//! Background compaction and retention.
//!
//! The compactor merges groups of small, time-adjacent blocks into larger
//! ones with a k-way merge by trace id, deduplicating overlapping traces
//! through the combiner. Consumed inputs are tombstoned (compacted
//! marker) and deleted only after a grace window, so queriers holding an
//! older blocklist snapshot keep working. Tenant retention rides the same
//! tombstone path.
//!
//! Multiple compactors coordinate without a leader: block ownership is
//! sharded over a compactor ring keyed by the job's first block id. A
//! membership change mid-selection can briefly double-compact; duplicate
//! outputs are reconciled at read time by the combiner.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use block::{
    iter::{BlockIterator, MultiBlockIterator},
    writer::{BlockWriter, WriteOptions},
};
use data_types::{BlockMeta, ObjectCombiner, Overrides, TenantId};
use metric::{Metric, U64Counter};
use observability_deps::tracing::{info, warn};
use ring::{Operation, Ring};
use snafu::{ResultExt, Snafu};
use std::{sync::Arc, time::Duration};
use tokio_util::sync::CancellationToken;
use trace_store::TraceStore;
use tracedb_time::TimeProvider;
use uuid::Uuid;

/// Compactor errors.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("block error: {}", source))]
    Block { source: block::Error },

    #[snafu(display("store error: {}", source))]
    Store { source: trace_store::Error },
}

/// Result alias for compactor operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Compactor tunables.
#[derive(Debug, Clone)]
pub struct CompactorConfig {
    /// Cadence of compaction passes.
    pub compaction_interval: Duration,
    /// Blocks below this size are compaction candidates; outputs are
    /// split at this size.
    pub target_block_size: u64,
    /// Maximum inputs merged per job.
    pub max_compaction_inputs: usize,
    /// Maximum gap between two blocks' time windows for them to share a
    /// job.
    pub max_compaction_range: Duration,
    /// Split an output block past this many objects.
    pub max_objects_per_block: u64,
    /// Grace window between tombstoning a block and deleting it.
    pub compacted_block_retention: Duration,
    /// Block format settings for outputs.
    pub block_options: WriteOptions,
}

impl Default for CompactorConfig {
    fn default() -> Self {
        Self {
            compaction_interval: Duration::from_secs(30),
            target_block_size: 100 * 1024 * 1024,
            max_compaction_inputs: 4,
            max_compaction_range: Duration::from_secs(3600),
            max_objects_per_block: 1_000_000,
            compacted_block_retention: Duration::from_secs(3600),
            block_options: Default::default(),
        }
    }
}

/// The compactor.
#[derive(Debug)]
pub struct Compactor {
    store: Arc<TraceStore>,
    overrides: Arc<Overrides>,
    combiner: Arc<dyn ObjectCombiner>,
    time_provider: Arc<dyn TimeProvider>,
    config: CompactorConfig,

    /// Ownership ring: `Some((ring, own instance id))` when multiple
    /// compactors share the backend.
    ownership: Option<(Ring, String)>,

    jobs_run: Metric<U64Counter>,
    blocks_compacted: Metric<U64Counter>,
    blocks_deleted: Metric<U64Counter>,
}

impl Compactor {
    /// Assemble a compactor.
    pub fn new(
        store: Arc<TraceStore>,
        overrides: Arc<Overrides>,
        combiner: Arc<dyn ObjectCombiner>,
        time_provider: Arc<dyn TimeProvider>,
        config: CompactorConfig,
        ownership: Option<(Ring, String)>,
        metric_registry: &metric::Registry,
    ) -> Self {
        Self {
            store,
            overrides,
            combiner,
            time_provider,
            config,
            ownership,
            jobs_run: metric_registry
                .register_metric("compactor_jobs_run", "compaction jobs executed"),
            blocks_compacted: metric_registry
                .register_metric("compactor_blocks_compacted", "input blocks consumed"),
            blocks_deleted: metric_registry
                .register_metric("compactor_blocks_deleted", "blocks removed by the sweeper"),
        }
    }

    /// Run compaction and retention passes until shutdown.
    pub async fn run(&self, shutdown: CancellationToken) {
        loop {
            if let Err(e) = self.store.poll_blocklists().await {
                warn!(error = %e, "blocklist poll failed");
            }
            if let Err(e) = self.compact_all_tenants().await {
                warn!(error = %e, "compaction pass failed");
            }
            if let Err(e) = self.apply_retention().await {
                warn!(error = %e, "retention pass failed");
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.compaction_interval) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    /// One compaction pass over every tenant in the current snapshot.
    pub async fn compact_all_tenants(&self) -> Result<()> {
        for tenant_name in self.store.tenants() {
            let Ok(tenant) = TenantId::new(tenant_name) else {
                continue;
            };
            let blocklist = self.store.blocklist(&tenant);
            for job in select_jobs(&blocklist.live, &self.config) {
                if !self.owns(&job[0]).await {
                    continue;
                }
                match self.compact_job(&tenant, &job).await {
                    Ok(outputs) => {
                        self.jobs_run.recorder(&[("status", "ok")]).inc(1);
                        self.blocks_compacted
                            .recorder([("tenant", tenant.as_str().to_string())])
                            .inc(job.len() as u64);
                        info!(
                            tenant = %tenant,
                            inputs = job.len(),
                            outputs = outputs.len(),
                            "compacted block group",
                        );
                    }
                    Err(e) => {
                        self.jobs_run.recorder(&[("status", "error")]).inc(1);
                        warn!(tenant = %tenant, error = %e, "compaction job failed");
                    }
                }
            }
        }
        Ok(())
    }

    async fn owns(&self, first_input: &BlockMeta) -> bool {
        let Some((ring, instance_id)) = &self.ownership else {
            return true;
        };
        let token = ring::token_for("", first_input.block_id.as_bytes());
        match ring.get(token, Operation::Read).await {
            Ok(set) => set
                .instances
                .first()
                .map(|(id, _)| id == instance_id)
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    /// Merge one group of input blocks into one or more outputs, then
    /// tombstone the inputs.
    pub async fn compact_job(
        &self,
        tenant: &TenantId,
        inputs: &[BlockMeta],
    ) -> Result<Vec<BlockMeta>> {
        let reader = self.store.reader();
        let writer = self.store.writer();

        let mut iterators = Vec::with_capacity(inputs.len());
        for meta in inputs {
            iterators.push(
                BlockIterator::load(reader.as_ref(), meta)
                    .await
                    .context(BlockSnafu)?,
            );
        }
        let mut merged = MultiBlockIterator::new(iterators, Arc::clone(&self.combiner));

        let time_range = inputs.iter().fold((0i64, 0i64), |acc, meta| {
            let start = if acc.0 == 0 {
                meta.start_time
            } else {
                acc.0.min(meta.start_time)
            };
            (start, acc.1.max(meta.end_time))
        });
        let expected = inputs.iter().map(|m| m.total_objects as usize).sum();

        let mut outputs = Vec::new();
        let mut current: Option<BlockWriter> = None;
        while let Some((id, object)) = merged.next_object().context(BlockSnafu)? {
            if current.is_none() {
                let mut w = BlockWriter::new(
                    tenant,
                    Uuid::new_v4(),
                    self.config.block_options,
                    expected,
                    Arc::clone(&self.combiner),
                );
                w.extend_time_range(time_range.0, time_range.1);
                current = Some(w);
            }
            let block_writer = current.as_mut().expect("set above");

            block_writer
                .append(writer.as_ref(), id, &object, 0, 0)
                .await
                .context(BlockSnafu)?;

            if block_writer.data_len_estimate() >= self.config.target_block_size
                || block_writer.object_count() >= self.config.max_objects_per_block
            {
                let writer_done = current.take().expect("set above");
                outputs.push(writer_done.complete(writer.as_ref()).await.context(BlockSnafu)?);
            }
        }
        if let Some(writer_done) = current.take() {
            outputs.push(writer_done.complete(writer.as_ref()).await.context(BlockSnafu)?);
        }

        let now = self.time_provider.now().timestamp_nanos();
        for meta in inputs {
            self.store.mark_compacted(meta, now).await.context(StoreSnafu)?;
        }
        Ok(outputs)
    }

    /// Tombstone blocks past their tenant's retention and delete
    /// tombstoned blocks past the grace window.
    pub async fn apply_retention(&self) -> Result<()> {
        let now = self.time_provider.now();

        for tenant_name in self.store.tenants() {
            let Ok(tenant) = TenantId::new(tenant_name) else {
                continue;
            };
            let limits = self.overrides.for_tenant(&tenant);
            let blocklist = self.store.blocklist(&tenant);

            let cutoff = (now - limits.block_retention).timestamp_nanos();
            for meta in &blocklist.live {
                if meta.end_time < cutoff && meta.end_time != 0 {
                    if let Err(e) = self
                        .store
                        .mark_compacted(meta, now.timestamp_nanos())
                        .await
                    {
                        warn!(tenant = %tenant, block = %meta.block_id, error = %e, "retention tombstone failed");
                    }
                }
            }

            for marker in &blocklist.compacted {
                let tombstoned = tracedb_time::Time::from_timestamp_nanos(marker.compacted_time);
                let expired = now
                    .checked_duration_since(tombstoned)
                    .map(|age| age > self.config.compacted_block_retention)
                    .unwrap_or(false);
                if !expired {
                    continue;
                }
                match self
                    .store
                    .delete_block(&tenant, marker.block_meta.block_id)
                    .await
                {
                    Ok(()) => {
                        self.blocks_deleted
                            .recorder([("tenant", tenant.as_str().to_string())])
                            .inc(1);
                    }
                    Err(e) => {
                        warn!(tenant = %tenant, block = %marker.block_meta.block_id, error = %e, "sweep failed");
                    }
                }
            }
        }
        Ok(())
    }
}

/// Choose groups of small, time-adjacent blocks worth merging.
///
/// Candidates are live blocks below the target size; a job is up to
/// `max_compaction_inputs` of them, consecutive in start-time order, whose
/// windows overlap or sit within `max_compaction_range` of each other.
/// Jobs need at least two inputs.
pub fn select_jobs(live: &[BlockMeta], config: &CompactorConfig) -> Vec<Vec<BlockMeta>> {
    let mut candidates: Vec<&BlockMeta> = live
        .iter()
        .filter(|m| m.size < config.target_block_size && m.total_objects > 0)
        .collect();
    candidates.sort_by_key(|m| (m.start_time, m.block_id));

    let range_slack = config.max_compaction_range.as_nanos() as i64;
    let mut jobs = Vec::new();
    let mut current: Vec<BlockMeta> = Vec::new();

    for meta in candidates {
        let adjacent = current
            .last()
            .map(|prev: &BlockMeta| meta.start_time <= prev.end_time + range_slack)
            .unwrap_or(true);

        if !adjacent || current.len() >= config.max_compaction_inputs {
            if current.len() >= 2 {
                jobs.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
        }
        current.push(meta.clone());
    }
    if current.len() >= 2 {
        jobs.push(current);
    }
    jobs
}

#[cfg(test)]
mod tests {
    use super::*;
    use block::writer::BlockWriter;
    use data_types::{
        trace::{InstrumentationLibrarySpans, ResourceSpans, Span, Trace},
        Limits, TraceCombiner, TraceId,
    };
    use object_backend::{ObjectStoreBackend, RawReader};
    use tracedb_time::{MockProvider, Time};

    fn tenant() -> TenantId {
        TenantId::new("compact-tenant").unwrap()
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
                        trace_id: vec![2; 16],
                        span_id: vec![span_id; 8],
                        parent_span_id: vec![],
                        name: "op".into(),
                        start_time_unix_nano: 100,
                        end_time_unix_nano: 200,
                        status_code: 0,
                        attributes: vec![],
                    }],
                }],
            }],
        }
        .encode_to_bytes()
    }

    async fn write_block(backend: &ObjectStoreBackend, ids: &[u8], times: (i64, i64)) -> BlockMeta {
        let mut writer = BlockWriter::new(
            &tenant(),
            Uuid::new_v4(),
            Default::default(),
            ids.len(),
            Arc::new(TraceCombiner),
        );
        for n in ids {
            writer
                .append(backend, id(*n), &proto_object(*n), times.0, times.1)
                .await
                .unwrap();
        }
        writer.complete(backend).await.unwrap()
    }

    struct TestCompactor {
        compactor: Compactor,
        store: Arc<TraceStore>,
        time_provider: Arc<MockProvider>,
    }

    fn test_compactor(
        backend: Arc<ObjectStoreBackend>,
        config: CompactorConfig,
        limits: Limits,
    ) -> TestCompactor {
        let store = Arc::new(TraceStore::new(
            Arc::clone(&backend) as _,
            backend as _,
            Arc::new(TraceCombiner),
            Default::default(),
        ));
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(
            1_000_000_000,
        )));
        let registry = metric::Registry::new();
        let compactor = Compactor::new(
            Arc::clone(&store),
            Arc::new(Overrides::new(limits, Default::default())),
            Arc::new(TraceCombiner),
            Arc::clone(&time_provider) as _,
            config,
            None,
            &registry,
        );
        TestCompactor {
            compactor,
            store,
            time_provider,
        }
    }

    fn meta_with(size: u64, start: i64, end: i64) -> BlockMeta {
        let mut meta = BlockMeta::new(&tenant(), Uuid::new_v4(), Default::default());
        meta.size = size;
        meta.start_time = start;
        meta.end_time = end;
        meta.total_objects = 1;
        meta
    }

    #[test]
    fn job_selection_groups_small_adjacent_blocks() {
        let config = CompactorConfig {
            target_block_size: 1000,
            max_compaction_inputs: 2,
            max_compaction_range: Duration::from_nanos(50),
            ..Default::default()
        };

        let big = meta_with(5000, 0, 10);
        let a = meta_with(10, 0, 100);
        let b = meta_with(10, 90, 200); // overlaps a
        let c = meta_with(10, 240, 300); // within range of b
        let lonely = meta_with(10, 10_000, 10_100); // far away

        let jobs = select_jobs(&[big, a.clone(), b.clone(), c.clone(), lonely], &config);
        // max 2 inputs: [a, b]; c alone can't form a job, nor can lonely
        assert_eq!(jobs.len(), 1);
        assert_eq!(
            jobs[0].iter().map(|m| m.block_id).collect::<Vec<_>>(),
            vec![a.block_id, b.block_id]
        );

        // with 4 inputs allowed, c joins the group
        let config = CompactorConfig {
            max_compaction_inputs: 4,
            ..config
        };
        let jobs = select_jobs(&[a.clone(), b.clone(), c.clone()], &config);
        assert_eq!(jobs[0].len(), 3);
    }

    #[tokio::test]
    async fn compacts_overlapping_blocks_and_tombstones_inputs() {
        let backend = Arc::new(ObjectStoreBackend::memory());
        let _a = write_block(&backend, &[1, 3], (100, 200)).await;
        let _b = write_block(&backend, &[3, 5], (150, 250)).await;

        let t = test_compactor(
            Arc::clone(&backend),
            CompactorConfig::default(),
            Limits::default(),
        );
        t.store.poll_blocklists().await.unwrap();
        t.compactor.compact_all_tenants().await.unwrap();

        t.store.poll_blocklists().await.unwrap();
        let blocklist = t.store.blocklist(&tenant());
        assert_eq!(blocklist.live.len(), 1, "one merged output");
        assert_eq!(blocklist.compacted.len(), 2, "both inputs tombstoned");

        let output = &blocklist.live[0];
        assert_eq!(output.total_objects, 3, "ids 1, 3, 5");
        assert_eq!(output.start_time, 100);
        assert_eq!(output.end_time, 250);

        // the overlapping id was deduplicated, not doubled
        let result = t.store.find(&tenant(), &id(3)).await;
        let trace = Trace::decode_from_bytes(&result.trace.unwrap()).unwrap();
        assert_eq!(trace.span_count(), 1);
    }

    #[tokio::test]
    async fn compaction_is_idempotent() {
        let backend = Arc::new(ObjectStoreBackend::memory());
        write_block(&backend, &[1], (100, 200)).await;
        write_block(&backend, &[2], (150, 250)).await;

        let t = test_compactor(
            Arc::clone(&backend),
            CompactorConfig::default(),
            Limits::default(),
        );
        t.store.poll_blocklists().await.unwrap();
        t.compactor.compact_all_tenants().await.unwrap();

        t.store.poll_blocklists().await.unwrap();
        let after_first = t.store.blocklist(&tenant()).live.clone();
        assert_eq!(after_first.len(), 1);

        // a second pass finds nothing to do
        t.compactor.compact_all_tenants().await.unwrap();
        t.store.poll_blocklists().await.unwrap();
        let after_second = t.store.blocklist(&tenant()).live.clone();
        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn retention_tombstones_then_sweeps() {
        let backend = Arc::new(ObjectStoreBackend::memory());
        let meta = write_block(&backend, &[1], (100, 200)).await;

        let limits = Limits {
            block_retention: Duration::from_nanos(10),
            ..Default::default()
        };
        let config = CompactorConfig {
            compacted_block_retention: Duration::from_secs(1),
            ..Default::default()
        };
        let t = test_compactor(Arc::clone(&backend), config, limits);

        // the block's end time (200ns) is far behind now (1s)
        t.store.poll_blocklists().await.unwrap();
        t.compactor.apply_retention().await.unwrap();

        t.store.poll_blocklists().await.unwrap();
        let blocklist = t.store.blocklist(&tenant());
        assert!(blocklist.live.is_empty());
        assert_eq!(blocklist.compacted.len(), 1);

        // inside the grace window nothing is deleted
        t.compactor.apply_retention().await.unwrap();
        assert!(!backend
            .list(&block::block_keypath(&tenant(), meta.block_id))
            .await
            .unwrap()
            .is_empty());

        // past the grace window the sweeper removes the artifacts
        t.time_provider.inc(Duration::from_secs(2));
        t.compactor.apply_retention().await.unwrap();
        assert!(backend
            .list(&block::block_keypath(&tenant(), meta.block_id))
            .await
            .unwrap()
            .is_empty());
    }
}
