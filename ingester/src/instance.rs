//! Per-tenant ingester state.

use crate::{Error, WalSnafu};
use data_types::{Limits, ObjectCombiner, TenantId, TraceId};
use ingester_client::{
    RpcCode, RpcError, ERR_PREFIX_LIVE_TRACES_EXCEEDED, ERR_PREFIX_TRACE_TOO_LARGE,
};
use snafu::ResultExt;
use std::{collections::HashMap, path::Path, path::PathBuf, time::Duration};
use tracedb_time::Time;
use uuid::Uuid;
use wal::SegmentWriter;

/// One in-flight trace.
#[derive(Debug)]
pub(crate) struct LiveTrace {
    /// Serialized trace fragments in arrival order.
    pub batches: Vec<Vec<u8>>,
    pub first_append: Time,
    pub last_append: Time,
    pub size_bytes: u64,
}

/// A sealed-but-local block awaiting upload and, later, local deletion.
#[derive(Debug)]
pub(crate) struct CompleteBlockEntry {
    pub meta: data_types::BlockMeta,
    /// Set once the block is durably in the remote backend.
    pub uploaded_at: Option<Time>,
}

/// Everything sealed out of one head rotation, handed to the async block
/// builder outside the instance lock.
#[derive(Debug)]
pub(crate) struct SealedHead {
    pub block_id: Uuid,
    pub objects: Vec<(TraceId, Vec<u8>)>,
    pub wal_path: PathBuf,
}

/// Per-tenant state: the live-trace map, the WAL-backed head block, and
/// the list of complete blocks still held locally.
///
/// An `Instance` is always used under its owning ingester's lock; methods
/// here are synchronous and never await.
#[derive(Debug)]
pub(crate) struct Instance {
    pub tenant: TenantId,
    pub live_traces: HashMap<TraceId, LiveTrace>,

    head: SegmentWriter,
    head_created: Time,
    /// Complete objects cut out of the live map, pending the next seal.
    head_objects: Vec<(TraceId, Vec<u8>)>,

    pub complete_blocks: Vec<CompleteBlockEntry>,
}

impl Instance {
    pub fn new(tenant: TenantId, wal_dir: &Path, now: Time) -> Result<Self, Error> {
        let head = SegmentWriter::create(wal_dir, Uuid::new_v4(), &tenant).context(WalSnafu)?;
        Ok(Self {
            tenant,
            live_traces: HashMap::new(),
            head,
            head_created: now,
            head_objects: Vec::new(),
            complete_blocks: Vec::new(),
        })
    }

    /// Append one `(id, trace bytes)` item: capacity checks, WAL append
    /// (durable before return), then the in-memory buffer.
    pub fn push(
        &mut self,
        id: TraceId,
        data: &[u8],
        now: Time,
        limits: &Limits,
    ) -> Result<(), RpcError> {
        if !self.live_traces.contains_key(&id)
            && self.live_traces.len() >= limits.max_local_traces_per_user
        {
            return Err(RpcError::new(
                RpcCode::ResourceExhausted,
                format!(
                    "{ERR_PREFIX_LIVE_TRACES_EXCEEDED}: tenant {} at {} live traces",
                    self.tenant,
                    self.live_traces.len()
                ),
            ));
        }

        // the size check happens before anything is buffered or logged, so
        // a rejected append leaves the live trace fully usable
        let current = self.live_traces.get(&id).map(|t| t.size_bytes).unwrap_or(0);
        if current + data.len() as u64 > limits.max_bytes_per_trace {
            return Err(RpcError::new(
                RpcCode::ResourceExhausted,
                format!(
                    "{ERR_PREFIX_TRACE_TOO_LARGE}: trace {} would reach {} bytes (limit {})",
                    id,
                    current + data.len() as u64,
                    limits.max_bytes_per_trace
                ),
            ));
        }

        if let Err(e) = self.head.append(&id, data) {
            return Err(RpcError::new(
                RpcCode::Internal,
                format!("wal append failed: {e}"),
            ));
        }

        let trace = self.live_traces.entry(id).or_insert(LiveTrace {
            batches: Vec::new(),
            first_append: now,
            last_append: now,
            size_bytes: 0,
        });
        trace.batches.push(data.to_vec());
        trace.size_bytes += data.len() as u64;
        trace.last_append = now;
        Ok(())
    }

    /// Restore one trace from an open WAL segment during replay, bypassing
    /// the capacity checks (the data is already durable).
    pub fn restore(&mut self, id: TraceId, data: Vec<u8>, now: Time) -> Result<(), Error> {
        self.head.append(&id, &data).context(WalSnafu)?;
        let trace = self.live_traces.entry(id).or_insert(LiveTrace {
            batches: Vec::new(),
            first_append: now,
            last_append: now,
            size_bytes: 0,
        });
        trace.size_bytes += data.len() as u64;
        trace.batches.push(data);
        Ok(())
    }

    /// Evict traces that have gone idle (or, with `immediate`, all of
    /// them) into the head block as combined complete objects. Returns how
    /// many traces were cut.
    pub fn cut_idle_traces(
        &mut self,
        now: Time,
        idle_period: Duration,
        max_age: Duration,
        immediate: bool,
        combiner: &dyn ObjectCombiner,
    ) -> Result<usize, Error> {
        let to_cut: Vec<TraceId> = self
            .live_traces
            .iter()
            .filter(|(_, trace)| {
                if immediate {
                    return true;
                }
                let idle = now
                    .checked_duration_since(trace.last_append)
                    .map(|d| d > idle_period)
                    .unwrap_or(false);
                let aged = now
                    .checked_duration_since(trace.first_append)
                    .map(|d| d > max_age)
                    .unwrap_or(false);
                idle || aged
            })
            .map(|(id, _)| *id)
            .collect();

        for id in &to_cut {
            let trace = self.live_traces.remove(id).expect("selected above");
            let mut object: Option<Vec<u8>> = None;
            for batch in trace.batches {
                object = Some(match object.take() {
                    None => batch,
                    Some(acc) => {
                        combiner
                            .combine(&acc, &batch)
                            .map_err(|source| Error::Combine { source })?
                            .0
                    }
                });
            }
            if let Some(object) = object {
                self.head_objects.push((*id, object));
            }
        }
        Ok(to_cut.len())
    }

    /// Bytes appended to the head's WAL so far.
    pub fn head_size(&self) -> u64 {
        self.head.size()
    }

    /// Whether the head block is due for rotation.
    pub fn should_rotate(&self, now: Time, max_bytes: u64, max_duration: Duration) -> bool {
        if self.head.size() == 0 {
            return false;
        }
        if self.head.size() > max_bytes {
            return true;
        }
        now.checked_duration_since(self.head_created)
            .map(|age| age > max_duration)
            .unwrap_or(false)
    }

    /// Atomically seal the head: force-cut every live trace (their bytes
    /// are in this head's WAL), rename the WAL, and open a fresh empty
    /// head. The returned [`SealedHead`] is built into a block outside the
    /// lock.
    pub fn rotate(
        &mut self,
        wal_dir: &Path,
        now: Time,
        combiner: &dyn ObjectCombiner,
    ) -> Result<SealedHead, Error> {
        self.cut_idle_traces(now, Duration::ZERO, Duration::ZERO, true, combiner)?;

        let new_head =
            SegmentWriter::create(wal_dir, Uuid::new_v4(), &self.tenant).context(WalSnafu)?;
        let old_head = std::mem::replace(&mut self.head, new_head);
        self.head_created = now;

        let block_id = old_head.block_id();
        let wal_path = old_head.seal().context(WalSnafu)?;
        Ok(SealedHead {
            block_id,
            objects: std::mem::take(&mut self.head_objects),
            wal_path,
        })
    }

    /// Bytes sitting in cut objects not yet sealed, for tests and metrics.
    pub fn head_object_count(&self) -> usize {
        self.head_objects.len()
    }
}
