//! The ingester: live-trace aggregation, the WAL-backed head block, the
//! cut/rotate/flush pipeline, and crash recovery.
//!
//! Writes land in a per-tenant [`instance::Instance`]: an append to the
//! WAL (durable before the RPC is acknowledged) plus an in-memory buffer.
//! A background loop evicts idle traces into the head block, rotates the
//! head once it is big or old enough, builds the sealed head into an
//! immutable block on local disk, and a bounded flush queue uploads blocks
//! to the object store. The WAL segment is deleted only once the built
//! block exists; the local block copy is deleted only once uploaded and
//! past `complete_block_timeout`.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use backoff::{Backoff, BackoffConfig};
use block::{finder::PagedFinder, writer::BlockWriter};
use data_types::{ObjectCombiner, Overrides, TenantId, TraceId};
use ingester_client::{IngesterClient, PushBytesRequest, RpcCode, RpcError};
use metric::{Metric, U64Counter};
use object_backend::{ObjectStoreBackend, RawReader};
use observability_deps::tracing::{error, info, warn};
use parking_lot::{Mutex, RwLock};
use ring::InstanceState;
use snafu::{ResultExt, Snafu};
use std::{
    collections::HashMap,
    path::PathBuf,
    sync::Arc,
    time::Duration,
};
use tokio_util::sync::CancellationToken;
use trace_store::TraceStore;
use tracedb_time::TimeProvider;
use uuid::Uuid;

mod instance;

use instance::{CompleteBlockEntry, Instance, SealedHead};

/// Ingester errors (internal; the RPC surface maps them to
/// [`RpcError`]s).
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("wal error: {}", source))]
    Wal { source: wal::Error },

    #[snafu(display("block error: {}", source))]
    Block { source: block::Error },

    #[snafu(display("store error: {}", source))]
    Store { source: trace_store::Error },

    #[snafu(display("backend error: {}", source))]
    Backend { source: object_backend::Error },

    #[snafu(display("combining trace fragments failed: {}", source))]
    Combine { source: data_types::CombineError },

    #[snafu(display("io error on {}: {}", path.display(), source))]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Result alias for ingester operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Ingester tunables.
#[derive(Debug, Clone)]
pub struct IngesterConfig {
    /// Rotate the head block past this WAL size.
    pub max_block_bytes: u64,
    /// Rotate the head block past this age.
    pub max_block_duration: Duration,
    /// Evict a live trace once it has gone this long without an append.
    pub trace_idle_period: Duration,
    /// Evict a live trace past this total age even if still appending.
    pub max_trace_idle: Duration,
    /// Cadence of the cut/rotate/sweep loop.
    pub flush_check_period: Duration,
    /// Keep uploaded blocks on local disk this long before deleting.
    pub complete_block_timeout: Duration,
    /// Parallel flush workers.
    pub concurrent_flushes: usize,
    /// Bound of the flush queue; rotation blocks when full.
    pub flush_queue_depth: usize,
    /// Directory for WAL segments.
    pub wal_path: PathBuf,
    /// Directory for sealed-but-local blocks.
    pub local_blocks_path: PathBuf,
    /// Block format settings for sealed heads.
    pub block_options: block::writer::WriteOptions,
}

impl Default for IngesterConfig {
    fn default() -> Self {
        Self {
            max_block_bytes: 500 * 1024 * 1024,
            max_block_duration: Duration::from_secs(3600),
            trace_idle_period: Duration::from_secs(10),
            max_trace_idle: Duration::from_secs(60),
            flush_check_period: Duration::from_secs(10),
            complete_block_timeout: Duration::from_secs(15 * 60),
            concurrent_flushes: 4,
            flush_queue_depth: 100,
            wal_path: PathBuf::from("/var/tracedb/wal"),
            local_blocks_path: PathBuf::from("/var/tracedb/blocks"),
            block_options: Default::default(),
        }
    }
}

#[derive(Debug, Clone)]
struct FlushJob {
    tenant: TenantId,
    block_id: Uuid,
}

/// The ingester.
#[derive(Debug)]
pub struct Ingester {
    config: IngesterConfig,
    overrides: Arc<Overrides>,
    time_provider: Arc<dyn TimeProvider>,
    combiner: Arc<dyn ObjectCombiner>,

    /// Local filesystem home of sealed blocks awaiting upload.
    local_backend: Arc<ObjectStoreBackend>,
    /// The remote store blocks are flushed into.
    store: Arc<TraceStore>,

    /// Mirrors this instance's ring state.
    state: RwLock<InstanceState>,
    instances: Mutex<HashMap<String, Instance>>,

    flush_tx: tokio::sync::mpsc::Sender<FlushJob>,
    flush_rx: tokio::sync::Mutex<tokio::sync::mpsc::Receiver<FlushJob>>,

    traces_created: Metric<U64Counter>,
    blocks_cut: Metric<U64Counter>,
    blocks_flushed: Metric<U64Counter>,
    flush_failures: Metric<U64Counter>,
}

impl Ingester {
    /// Build an ingester. `store` is the remote-backed trace store blocks
    /// are flushed into.
    pub fn new(
        config: IngesterConfig,
        overrides: Arc<Overrides>,
        store: Arc<TraceStore>,
        combiner: Arc<dyn ObjectCombiner>,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: &metric::Registry,
    ) -> Result<Self> {
        std::fs::create_dir_all(&config.wal_path).context(IoSnafu {
            path: config.wal_path.clone(),
        })?;
        std::fs::create_dir_all(&config.local_blocks_path).context(IoSnafu {
            path: config.local_blocks_path.clone(),
        })?;
        let local_backend = Arc::new(
            ObjectStoreBackend::local(&config.local_blocks_path).context(BackendSnafu)?,
        );

        let (flush_tx, flush_rx) = tokio::sync::mpsc::channel(config.flush_queue_depth.max(1));

        Ok(Self {
            overrides,
            time_provider,
            combiner,
            local_backend,
            store,
            state: RwLock::new(InstanceState::Joining),
            instances: Default::default(),
            flush_tx,
            flush_rx: tokio::sync::Mutex::new(flush_rx),
            traces_created: metric_registry
                .register_metric("ingester_traces_created", "live traces created"),
            blocks_cut: metric_registry
                .register_metric("ingester_blocks_cut", "head blocks sealed, by trigger"),
            blocks_flushed: metric_registry
                .register_metric("ingester_blocks_flushed", "blocks uploaded to the backend"),
            flush_failures: metric_registry
                .register_metric("ingester_flush_failures", "block upload attempts that failed"),
            config,
        })
    }

    /// The advertised lifecycle state.
    pub fn state(&self) -> InstanceState {
        *self.state.read()
    }

    fn set_state(&self, state: InstanceState) {
        *self.state.write() = state;
        info!(?state, "ingester state changed");
    }

    /// Recover from disk, then start accepting writes.
    pub async fn start(&self) -> Result<()> {
        self.replay().await?;
        self.set_state(InstanceState::Active);
        Ok(())
    }

    /// Drain: refuse new writes, seal and upload everything.
    pub async fn stop(&self) -> Result<()> {
        self.set_state(InstanceState::Leaving);
        self.seal_all().await?;
        self.flush_pending().await
    }

    /// Hand ownership off during a planned departure: drain everything to
    /// the backend so successors find the data there. The object store is
    /// the transfer medium; no peer-to-peer copy happens.
    pub async fn transfer_out(&self) -> Result<()> {
        self.stop().await
    }

    /// Background loops: the cut ticker and the flush workers.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut workers = Vec::new();
        for _ in 0..self.config.concurrent_flushes.max(1) {
            let ingester = Arc::clone(&self);
            let shutdown = shutdown.clone();
            workers.push(tokio::spawn(async move {
                ingester.flush_worker(shutdown).await;
            }));
        }

        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.flush_check_period) => {}
                _ = shutdown.cancelled() => break,
            }
            if let Err(e) = self.maybe_cut().await {
                error!(error = %e, "cut pass failed");
            }
        }

        for worker in workers {
            let _ = worker.await;
        }
    }

    async fn flush_worker(&self, shutdown: CancellationToken) {
        loop {
            let job = {
                let mut rx = self.flush_rx.lock().await;
                tokio::select! {
                    job = rx.recv() => job,
                    _ = shutdown.cancelled() => return,
                }
            };
            let Some(job) = job else { return };

            let mut backoff = Backoff::new(&BackoffConfig::default());
            let result = backoff
                .retry_with_limit("flush block", 10, || self.flush_block(job.clone()))
                .await;
            if let Err(e) = result {
                // the block stays local; replay re-queues it on restart
                error!(
                    tenant = %job.tenant,
                    block = %job.block_id,
                    error = %e,
                    "giving up flushing block for now",
                );
            }
        }
    }

    /// One pass of the periodic loop: evict idle traces, rotate due heads,
    /// build sealed heads into blocks, sweep expired local blocks.
    pub async fn maybe_cut(&self) -> Result<()> {
        let now = self.time_provider.now();

        let sealed: Vec<(TenantId, SealedHead, &'static str)> = {
            let mut instances = self.instances.lock();
            let mut sealed = Vec::new();
            for instance in instances.values_mut() {
                instance.cut_idle_traces(
                    now,
                    self.config.trace_idle_period,
                    self.config.max_trace_idle,
                    false,
                    self.combiner.as_ref(),
                )?;

                if instance.should_rotate(
                    now,
                    self.config.max_block_bytes,
                    self.config.max_block_duration,
                ) {
                    let trigger = if instance.head_size() > self.config.max_block_bytes {
                        "size"
                    } else {
                        "age"
                    };
                    let head = instance.rotate(
                        &self.config.wal_path,
                        now,
                        self.combiner.as_ref(),
                    )?;
                    sealed.push((instance.tenant.clone(), head, trigger));
                }
            }
            sealed
        };

        for (tenant, head, trigger) in sealed {
            self.blocks_cut.recorder(&[("trigger", trigger)]).inc(1);
            self.build_and_enqueue(&tenant, head).await?;
        }

        self.sweep_local_blocks(now).await;
        Ok(())
    }

    /// Immediately cut and seal every instance's head (shutdown path).
    pub async fn seal_all(&self) -> Result<()> {
        let now = self.time_provider.now();
        let sealed: Vec<(TenantId, SealedHead)> = {
            let mut instances = self.instances.lock();
            let mut sealed = Vec::new();
            for instance in instances.values_mut() {
                instance.cut_idle_traces(
                    now,
                    Duration::ZERO,
                    Duration::ZERO,
                    true,
                    self.combiner.as_ref(),
                )?;
                if instance.head_object_count() > 0 {
                    let head =
                        instance.rotate(&self.config.wal_path, now, self.combiner.as_ref())?;
                    sealed.push((instance.tenant.clone(), head));
                }
            }
            sealed
        };

        for (tenant, head) in sealed {
            self.blocks_cut.recorder(&[("trigger", "shutdown")]).inc(1);
            self.build_and_enqueue(&tenant, head).await?;
        }
        Ok(())
    }

    async fn build_and_enqueue(&self, tenant: &TenantId, head: SealedHead) -> Result<()> {
        let meta = self.build_block(tenant, &head).await?;
        wal::delete_segment(&head.wal_path).context(WalSnafu)?;

        {
            let mut instances = self.instances.lock();
            if let Some(instance) = instances.get_mut(tenant.as_str()) {
                instance.complete_blocks.push(CompleteBlockEntry {
                    meta: meta.clone(),
                    uploaded_at: None,
                });
            }
        }

        let job = FlushJob {
            tenant: tenant.clone(),
            block_id: meta.block_id,
        };
        // a full queue applies backpressure to the rotation path
        if self.flush_tx.send(job).await.is_err() {
            warn!("flush queue closed; block will be recovered on restart");
        }
        Ok(())
    }

    /// Build a sealed head into an immutable block on the local backend.
    async fn build_block(
        &self,
        tenant: &TenantId,
        head: &SealedHead,
    ) -> Result<data_types::BlockMeta> {
        let mut objects = head.objects.clone();
        objects.sort_by_key(|(id, _)| *id);

        let mut writer = BlockWriter::new(
            tenant,
            head.block_id,
            self.config.block_options,
            objects.len(),
            Arc::clone(&self.combiner),
        );
        for (id, object) in &objects {
            let (start, end) = data_types::trace::Trace::decode_from_bytes(object)
                .map(|t| t.time_range())
                .unwrap_or((0, 0));
            writer
                .append(self.local_backend.as_ref(), *id, object, start, end)
                .await
                .context(BlockSnafu)?;
        }
        let meta = writer
            .complete(self.local_backend.as_ref())
            .await
            .context(BlockSnafu)?;
        info!(
            tenant = %tenant,
            block = %meta.block_id,
            objects = meta.total_objects,
            "built complete block",
        );
        Ok(meta)
    }

    async fn flush_block(&self, job: FlushJob) -> Result<()> {
        let meta = {
            let instances = self.instances.lock();
            instances.get(job.tenant.as_str()).and_then(|instance| {
                instance
                    .complete_blocks
                    .iter()
                    .find(|b| b.meta.block_id == job.block_id)
                    .map(|b| (b.meta.clone(), b.uploaded_at))
            })
        };
        let Some((meta, uploaded_at)) = meta else {
            return Ok(());
        };
        if uploaded_at.is_some() {
            return Ok(());
        }

        self.store
            .write_block(self.local_backend.as_ref(), &meta)
            .await
            .map_err(|e| {
                self.flush_failures
                    .recorder([("tenant", job.tenant.as_str().to_string())])
                    .inc(1);
                Error::Store { source: e }
            })?;

        self.blocks_flushed
            .recorder([("tenant", job.tenant.as_str().to_string())])
            .inc(1);

        let now = self.time_provider.now();
        let mut instances = self.instances.lock();
        if let Some(instance) = instances.get_mut(job.tenant.as_str()) {
            if let Some(entry) = instance
                .complete_blocks
                .iter_mut()
                .find(|b| b.meta.block_id == job.block_id)
            {
                entry.uploaded_at = Some(now);
            }
        }
        Ok(())
    }

    /// Upload every local block not yet in the remote store, immediately.
    pub async fn flush_pending(&self) -> Result<()> {
        let pending: Vec<FlushJob> = {
            let instances = self.instances.lock();
            instances
                .values()
                .flat_map(|instance| {
                    instance
                        .complete_blocks
                        .iter()
                        .filter(|b| b.uploaded_at.is_none())
                        .map(|b| FlushJob {
                            tenant: instance.tenant.clone(),
                            block_id: b.meta.block_id,
                        })
                })
                .collect()
        };

        for job in pending {
            let mut backoff = Backoff::new(&BackoffConfig {
                init_backoff: Duration::from_millis(100),
                max_backoff: Duration::from_secs(5),
                base: 2.0,
            });
            backoff
                .retry_with_limit("flush pending block", 5, || self.flush_block(job.clone()))
                .await
                .map_err(|e| Error::Store {
                    source: trace_store::Error::Backend {
                        source: object_backend::Error::Backend {
                            path: job.block_id.to_string(),
                            source: e.to_string().into(),
                        },
                    },
                })?;
        }
        Ok(())
    }

    async fn sweep_local_blocks(&self, now: tracedb_time::Time) {
        let expired: Vec<(TenantId, Uuid)> = {
            let mut instances = self.instances.lock();
            let mut expired = Vec::new();
            for instance in instances.values_mut() {
                let timeout = self.config.complete_block_timeout;
                let (keep, drop): (Vec<CompleteBlockEntry>, Vec<CompleteBlockEntry>) = instance
                    .complete_blocks
                    .drain(..)
                    .partition(|entry| match entry.uploaded_at {
                        None => true,
                        Some(at) => now
                            .checked_duration_since(at)
                            .map(|age| age < timeout)
                            .unwrap_or(true),
                    });
                instance.complete_blocks = keep;
                for entry in drop {
                    expired.push((instance.tenant.clone(), entry.meta.block_id));
                }
            }
            expired
        };

        for (tenant, block_id) in expired {
            let keypath = block::block_keypath(&tenant, block_id);
            match self.local_backend.list(&keypath).await {
                Ok(names) => {
                    for name in names {
                        if let Err(e) = object_backend::RawWriter::delete(
                            self.local_backend.as_ref(),
                            &name,
                            &keypath,
                        )
                        .await
                        {
                            warn!(error = %e, "deleting expired local block artifact failed");
                        }
                    }
                    info!(tenant = %tenant, block = %block_id, "dropped expired local block");
                }
                Err(e) => warn!(error = %e, "listing expired local block failed"),
            }
        }
    }

    /// Recover WAL segments and local blocks after a restart.
    async fn replay(&self) -> Result<()> {
        let now = self.time_provider.now();

        // WAL segments: open heads become live traces again, sealed heads
        // are rebuilt into complete blocks
        let segments = wal::replay(&self.config.wal_path).context(WalSnafu)?;
        for segment in segments {
            let tenant = segment.tenant.clone();
            if segment.sealed {
                let record_count = segment.records.len();
                if record_count == 0 {
                    wal::delete_segment(&segment.path).context(WalSnafu)?;
                    continue;
                }
                let mut objects = segment.records;
                objects.sort_by_key(|(id, _)| *id);
                let head = SealedHead {
                    block_id: segment.block_id,
                    objects,
                    wal_path: segment.path,
                };
                self.ensure_instance(&tenant, now)?;
                self.build_and_enqueue(&tenant, head).await?;
                info!(
                    tenant = %tenant,
                    block = %segment.block_id,
                    records = record_count,
                    "rebuilt sealed wal segment into block",
                );
            } else {
                self.ensure_instance(&tenant, now)?;
                {
                    let mut instances = self.instances.lock();
                    let instance = instances
                        .get_mut(tenant.as_str())
                        .expect("ensured above");
                    for (id, data) in segment.records {
                        instance.restore(id, data, now)?;
                    }
                }
                // restored records are durable in the new head's wal
                wal::delete_segment(&segment.path).context(WalSnafu)?;
                info!(tenant = %tenant, "restored open wal segment into live traces");
            }
        }

        // local blocks that never made it to the backend are re-uploaded;
        // readers never observed them, so convergence is safe
        let tenants = self.local_backend.list(&[]).await.context(BackendSnafu)?;
        for tenant_name in tenants {
            let Ok(tenant) = TenantId::new(tenant_name.clone()) else {
                continue;
            };
            let blocks = self
                .local_backend
                .list(&[tenant_name.clone()])
                .await
                .context(BackendSnafu)?;
            for child in blocks {
                let Ok(block_id) = Uuid::parse_str(&child) else {
                    continue;
                };
                let meta = match block::read_meta(self.local_backend.as_ref(), &tenant, block_id)
                    .await
                {
                    Ok(meta) => meta,
                    Err(object_backend::Error::DoesNotExist { .. }) => continue,
                    Err(source) => return Err(Error::Backend { source }),
                };

                let already_remote =
                    match block::read_meta(self.store.reader().as_ref(), &tenant, block_id).await {
                        Ok(_) => true,
                        Err(object_backend::Error::DoesNotExist { .. }) => false,
                        Err(source) => return Err(Error::Backend { source }),
                    };

                self.ensure_instance(&tenant, now)?;
                {
                    let mut instances = self.instances.lock();
                    let instance = instances.get_mut(tenant.as_str()).expect("ensured above");
                    instance.complete_blocks.push(CompleteBlockEntry {
                        meta: meta.clone(),
                        uploaded_at: already_remote.then_some(now),
                    });
                }
                if !already_remote {
                    info!(tenant = %tenant, block = %block_id, "re-queueing interrupted upload");
                    let _ = self
                        .flush_tx
                        .send(FlushJob {
                            tenant: tenant.clone(),
                            block_id,
                        })
                        .await;
                }
            }
        }
        Ok(())
    }

    fn ensure_instance(&self, tenant: &TenantId, now: tracedb_time::Time) -> Result<()> {
        let mut instances = self.instances.lock();
        if !instances.contains_key(tenant.as_str()) {
            let instance = Instance::new(tenant.clone(), &self.config.wal_path, now)?;
            instances.insert(tenant.as_str().to_string(), instance);
        }
        Ok(())
    }

    /// Number of live traces currently held for `tenant`.
    pub fn live_trace_count(&self, tenant: &TenantId) -> usize {
        self.instances
            .lock()
            .get(tenant.as_str())
            .map(|i| i.live_traces.len())
            .unwrap_or(0)
    }

    async fn find(&self, tenant: &TenantId, trace_id: &TraceId) -> Result<Option<Vec<u8>>> {
        let mut fragments: Vec<Vec<u8>> = Vec::new();

        // live trace first
        let (live_batches, local_metas) = {
            let instances = self.instances.lock();
            match instances.get(tenant.as_str()) {
                None => (Vec::new(), Vec::new()),
                Some(instance) => (
                    instance
                        .live_traces
                        .get(trace_id)
                        .map(|t| t.batches.clone())
                        .unwrap_or_default(),
                    instance
                        .complete_blocks
                        .iter()
                        .filter(|b| b.meta.may_contain(trace_id))
                        .map(|b| b.meta.clone())
                        .collect(),
                ),
            }
        };
        fragments.extend(live_batches);

        // then sealed-but-local blocks
        for meta in local_metas {
            let finder = PagedFinder::new(
                Arc::clone(&self.local_backend) as Arc<dyn RawReader>,
                meta,
                Some(Arc::clone(&self.combiner)),
            );
            if let Some(fragment) = finder.find(trace_id).await.context(BlockSnafu)? {
                fragments.push(fragment);
            }
        }

        // then everything already uploaded
        let uploaded = self.store.find(tenant, trace_id).await;
        if let Some(fragment) = uploaded.trace {
            fragments.push(fragment);
        }

        let mut merged: Option<Vec<u8>> = None;
        for fragment in fragments {
            merged = Some(match merged.take() {
                None => fragment,
                Some(acc) => {
                    self.combiner
                        .combine(&acc, &fragment)
                        .map_err(|source| Error::Combine { source })?
                        .0
                }
            });
        }
        Ok(merged)
    }
}

#[async_trait]
impl IngesterClient for Ingester {
    async fn push_bytes(
        &self,
        tenant: &TenantId,
        request: PushBytesRequest,
    ) -> std::result::Result<(), RpcError> {
        if self.state() == InstanceState::Leaving {
            return Err(RpcError::new(
                RpcCode::Unavailable,
                "instance is leaving and no longer accepts writes",
            ));
        }

        let now = self.time_provider.now();
        let mut limits = self.overrides.for_tenant(tenant);
        // the fleet-wide cap tightens the local one when configured
        if limits.max_global_traces_per_user > 0 {
            limits.max_local_traces_per_user = limits
                .max_local_traces_per_user
                .min(limits.max_global_traces_per_user);
        }

        self.ensure_instance(tenant, now).map_err(|e| {
            RpcError::new(RpcCode::Internal, format!("creating tenant instance: {e}"))
        })?;

        let mut instances = self.instances.lock();
        let instance = instances.get_mut(tenant.as_str()).expect("ensured above");

        let mut created = 0u64;
        for (id, data) in request.ids.iter().zip(request.traces.iter()) {
            let existed = instance.live_traces.contains_key(id);
            instance.push(*id, data, now, &limits)?;
            if !existed {
                created += 1;
            }
        }
        drop(instances);

        if created > 0 {
            self.traces_created
                .recorder([("tenant", tenant.as_str().to_string())])
                .inc(created);
        }
        Ok(())
    }

    async fn find_trace_by_id(
        &self,
        tenant: &TenantId,
        trace_id: &TraceId,
    ) -> std::result::Result<Option<Vec<u8>>, RpcError> {
        self.find(tenant, trace_id)
            .await
            .map_err(|e| RpcError::new(RpcCode::Internal, e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use data_types::{
        trace::{InstrumentationLibrarySpans, ResourceSpans, Span, Trace},
        Limits, TraceCombiner,
    };
    use ingester_client::{ERR_PREFIX_LIVE_TRACES_EXCEEDED, ERR_PREFIX_TRACE_TOO_LARGE};
    use tracedb_time::{MockProvider, Time};

    fn tenant() -> TenantId {
        TenantId::new("a").unwrap()
    }

    fn id(n: u8) -> TraceId {
        TraceId::new([n; 16])
    }

    fn fragment(trace_id: u8, span_id: u8) -> Vec<u8> {
        Trace {
            resource_spans: vec![ResourceSpans {
                resource: None,
                instrumentation_library_spans: vec![InstrumentationLibrarySpans {
                    instrumentation_library: None,
                    spans: vec![Span {
                        trace_id: vec![trace_id; 16],
                        span_id: vec![span_id; 8],
                        parent_span_id: vec![],
                        name: format!("op-{span_id}"),
                        start_time_unix_nano: 10,
                        end_time_unix_nano: 20,
                        status_code: 0,
                        attributes: vec![],
                    }],
                }],
            }],
        }
        .encode_to_bytes()
    }

    fn request_of(trace_id: u8, span_id: u8) -> PushBytesRequest {
        PushBytesRequest {
            traces: vec![fragment(trace_id, span_id)],
            ids: vec![id(trace_id)],
            search_data: vec![vec![]],
        }
    }

    struct TestIngester {
        ingester: Arc<Ingester>,
        store: Arc<TraceStore>,
        time_provider: Arc<MockProvider>,
        wal_dir: tempfile::TempDir,
        blocks_dir: tempfile::TempDir,
    }

    fn test_config(
        wal_dir: &tempfile::TempDir,
        blocks_dir: &tempfile::TempDir,
    ) -> IngesterConfig {
        IngesterConfig {
            // rotate on the first cut pass once anything was appended
            max_block_bytes: 1,
            trace_idle_period: Duration::ZERO,
            max_trace_idle: Duration::from_secs(3600),
            wal_path: wal_dir.path().to_path_buf(),
            local_blocks_path: blocks_dir.path().to_path_buf(),
            ..Default::default()
        }
    }

    async fn test_ingester(limits: Limits) -> TestIngester {
        let wal_dir = tempfile::tempdir().unwrap();
        let blocks_dir = tempfile::tempdir().unwrap();
        let remote = Arc::new(ObjectStoreBackend::memory());
        let store = Arc::new(TraceStore::new(
            Arc::clone(&remote) as _,
            remote as _,
            Arc::new(TraceCombiner),
            Default::default(),
        ));
        let time_provider = Arc::new(MockProvider::new(Time::from_timestamp_nanos(0)));
        let registry = metric::Registry::new();

        let ingester = Arc::new(
            Ingester::new(
                test_config(&wal_dir, &blocks_dir),
                Arc::new(Overrides::new(limits, Default::default())),
                Arc::clone(&store),
                Arc::new(TraceCombiner),
                Arc::clone(&time_provider) as _,
                &registry,
            )
            .unwrap(),
        );
        ingester.start().await.unwrap();

        TestIngester {
            ingester,
            store,
            time_provider,
            wal_dir,
            blocks_dir,
        }
    }

    fn reopen(
        wal_dir: &tempfile::TempDir,
        blocks_dir: &tempfile::TempDir,
        store: &Arc<TraceStore>,
        time_provider: &Arc<MockProvider>,
    ) -> Arc<Ingester> {
        let registry = metric::Registry::new();
        Arc::new(
            Ingester::new(
                test_config(wal_dir, blocks_dir),
                Arc::new(Overrides::default()),
                Arc::clone(store),
                Arc::new(TraceCombiner),
                Arc::clone(time_provider) as _,
                &registry,
            )
            .unwrap(),
        )
    }

    fn span_count(bytes: &[u8]) -> usize {
        Trace::decode_from_bytes(bytes).unwrap().span_count()
    }

    #[tokio::test]
    async fn push_then_find_live_trace() {
        let t = test_ingester(Limits::default()).await;

        for span in 1u8..=3 {
            t.ingester
                .push_bytes(&tenant(), request_of(7, span))
                .await
                .unwrap();
        }

        assert_eq!(t.ingester.live_trace_count(&tenant()), 1);
        let found = t
            .ingester
            .find_trace_by_id(&tenant(), &id(7))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(span_count(&found), 3);

        // absent id
        assert!(t
            .ingester
            .find_trace_by_id(&tenant(), &id(9))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn live_traces_exceeded_refuses_new_traces_only() {
        let limits = Limits {
            max_local_traces_per_user: 1,
            ..Default::default()
        };
        let t = test_ingester(limits).await;

        t.ingester
            .push_bytes(&tenant(), request_of(1, 1))
            .await
            .unwrap();
        let err = t
            .ingester
            .push_bytes(&tenant(), request_of(2, 1))
            .await
            .unwrap_err();
        assert!(err.message.starts_with(ERR_PREFIX_LIVE_TRACES_EXCEEDED));

        // appends to the existing trace still pass
        t.ingester
            .push_bytes(&tenant(), request_of(1, 2))
            .await
            .unwrap();
        assert_eq!(t.ingester.live_trace_count(&tenant()), 1);
    }

    #[tokio::test]
    async fn trace_too_large_rejects_append_and_keeps_prior_bytes() {
        let chunk = fragment(3, 1).len() as u64;
        let limits = Limits {
            // two chunks fit, the third does not
            max_bytes_per_trace: chunk * 2 + chunk / 2,
            ..Default::default()
        };
        let t = test_ingester(limits).await;

        t.ingester
            .push_bytes(&tenant(), request_of(3, 1))
            .await
            .unwrap();
        t.ingester
            .push_bytes(&tenant(), request_of(3, 2))
            .await
            .unwrap();

        let wal_size_before = {
            let instances = t.ingester.instances.lock();
            instances.get("a").unwrap().head_size()
        };

        let err = t
            .ingester
            .push_bytes(&tenant(), request_of(3, 3))
            .await
            .unwrap_err();
        assert!(err.message.starts_with(ERR_PREFIX_TRACE_TOO_LARGE));

        // no wal entry was written for the rejected append, and the live
        // trace still carries the first two fragments
        let instances = t.ingester.instances.lock();
        let instance = instances.get("a").unwrap();
        assert_eq!(instance.head_size(), wal_size_before);
        assert_eq!(
            instance.live_traces.get(&id(3)).unwrap().size_bytes,
            chunk * 2
        );
    }

    #[tokio::test]
    async fn cut_flush_and_read_back_from_store() {
        let t = test_ingester(Limits::default()).await;
        for span in 1u8..=2 {
            t.ingester
                .push_bytes(&tenant(), request_of(5, span))
                .await
                .unwrap();
        }

        // everything is idle from the next instant on
        t.time_provider.inc(Duration::from_secs(1));
        t.ingester.maybe_cut().await.unwrap();
        assert_eq!(t.ingester.live_trace_count(&tenant()), 0);

        t.ingester.flush_pending().await.unwrap();
        t.store.poll_blocklists().await.unwrap();
        assert_eq!(t.store.blocklist(&tenant()).live.len(), 1);

        let found = t
            .ingester
            .find_trace_by_id(&tenant(), &id(5))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(span_count(&found), 2);

        // the store alone (no live/local state) also serves the id
        let result = t.store.find(&tenant(), &id(5)).await;
        assert_eq!(span_count(&result.trace.unwrap()), 2);
    }

    #[tokio::test]
    async fn open_wal_segment_replays_into_live_traces() {
        let TestIngester {
            ingester,
            store,
            time_provider,
            wal_dir,
            blocks_dir,
        } = test_ingester(Limits::default()).await;
        ingester
            .push_bytes(&tenant(), request_of(4, 1))
            .await
            .unwrap();
        ingester
            .push_bytes(&tenant(), request_of(4, 2))
            .await
            .unwrap();

        // crash: no cut, no flush
        drop(ingester);

        let revived = reopen(&wal_dir, &blocks_dir, &store, &time_provider);
        revived.start().await.unwrap();

        assert_eq!(revived.live_trace_count(&tenant()), 1);
        let found = revived
            .find_trace_by_id(&tenant(), &id(4))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(span_count(&found), 2);
    }

    #[tokio::test]
    async fn sealed_wal_segment_rebuilds_into_block() {
        let TestIngester {
            ingester,
            store,
            time_provider,
            wal_dir,
            blocks_dir,
        } = test_ingester(Limits::default()).await;
        drop(ingester);

        // a sealed segment left behind by a crash after rotation but
        // before the block build finished
        let block_id = Uuid::new_v4();
        let mut writer = wal::SegmentWriter::create(wal_dir.path(), block_id, &tenant()).unwrap();
        writer.append(&id(6), &fragment(6, 1)).unwrap();
        writer.append(&id(6), &fragment(6, 2)).unwrap();
        writer.seal().unwrap();

        let revived = reopen(&wal_dir, &blocks_dir, &store, &time_provider);
        revived.start().await.unwrap();
        revived.flush_pending().await.unwrap();

        store.poll_blocklists().await.unwrap();
        let blocklist = store.blocklist(&tenant());
        assert!(blocklist.live.iter().any(|m| m.block_id == block_id));

        let result = store.find(&tenant(), &id(6)).await;
        assert_eq!(span_count(&result.trace.unwrap()), 2);

        // the sealed segment is gone
        assert!(wal::replay(wal_dir.path()).unwrap().iter().all(|s| !s.sealed));
    }

    #[tokio::test]
    async fn interrupted_upload_is_retried_on_restart() {
        let TestIngester {
            ingester,
            store,
            time_provider,
            wal_dir,
            blocks_dir,
        } = test_ingester(Limits::default()).await;
        ingester
            .push_bytes(&tenant(), request_of(8, 1))
            .await
            .unwrap();

        // sealed and built locally, but the upload never ran
        ingester.seal_all().await.unwrap();
        store.poll_blocklists().await.unwrap();
        assert!(store.blocklist(&tenant()).live.is_empty());
        drop(ingester);

        let revived = reopen(&wal_dir, &blocks_dir, &store, &time_provider);
        revived.start().await.unwrap();
        revived.flush_pending().await.unwrap();

        store.poll_blocklists().await.unwrap();
        assert_eq!(store.blocklist(&tenant()).live.len(), 1);
        let result = store.find(&tenant(), &id(8)).await;
        assert!(result.trace.is_some());
    }

    #[tokio::test]
    async fn leaving_refuses_writes_but_serves_reads() {
        let t = test_ingester(Limits::default()).await;
        t.ingester
            .push_bytes(&tenant(), request_of(2, 1))
            .await
            .unwrap();

        t.ingester.stop().await.unwrap();
        assert_eq!(t.ingester.state(), InstanceState::Leaving);

        let err = t
            .ingester
            .push_bytes(&tenant(), request_of(2, 2))
            .await
            .unwrap_err();
        assert_eq!(err.code, RpcCode::Unavailable);

        // the final flush made the trace durable and still readable here
        t.store.poll_blocklists().await.unwrap();
        let found = t
            .ingester
            .find_trace_by_id(&tenant(), &id(2))
            .await
            .unwrap();
        assert!(found.is_some());
    }
}
