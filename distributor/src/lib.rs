//! The write edge of the system.
//!
//! A distributor admits span batches for a tenant, regroups them by trace
//! id, and fans each trace out to its replica set of ingesters with
//! quorum semantics. Distributors are stateless; admission control is the
//! only local state (token buckets), and even that can be scaled globally
//! by dividing the tenant limit across the distributor ring.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use data_types::{
    trace::{InstrumentationLibrarySpans, ResourceSpans, Trace},
    IngestionRateStrategy, Limits, Overrides, TenantId, TraceId,
};
use ingester_client::{
    IngesterPool, PushBytesRequest, RpcCode, RpcError, ERR_PREFIX_LIVE_TRACES_EXCEEDED,
    ERR_PREFIX_TRACE_TOO_LARGE,
};
use metric::{Metric, U64Counter};
use observability_deps::tracing::debug;
use prost::Message;
use ring::{batch::BatchError, Operation, Ring};
use std::{collections::HashMap, sync::Arc, time::Duration};
use tracedb_time::TimeProvider;

pub mod limiter;

use limiter::RateLimiter;

/// Distributor tunables.
#[derive(Debug, Clone)]
pub struct DistributorConfig {
    /// Accept `Joining` ingesters as spare write replicas during handoff.
    pub extend_writes: bool,
    /// Per-ingester RPC deadline, detached from the caller's context.
    pub remote_timeout: Duration,
    /// Log every received trace id (debugging aid, hot path).
    pub log_received_traces: bool,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            extend_writes: true,
            remote_timeout: Duration::from_secs(5),
            log_received_traces: false,
        }
    }
}

/// The distributor.
#[derive(Debug)]
pub struct Distributor {
    ingester_ring: Ring,
    /// Present iff some tenant uses the global rate strategy: the ring
    /// exists purely so each distributor can count its peers.
    distributor_ring: Option<Ring>,
    pool: Arc<dyn IngesterPool>,
    overrides: Arc<Overrides>,
    limiter: RateLimiter,
    config: DistributorConfig,

    spans_received: Metric<U64Counter>,
    bytes_received: Metric<U64Counter>,
    discarded_spans: Metric<U64Counter>,
}

impl Distributor {
    /// Assemble a distributor.
    pub fn new(
        ingester_ring: Ring,
        distributor_ring: Option<Ring>,
        pool: Arc<dyn IngesterPool>,
        overrides: Arc<Overrides>,
        config: DistributorConfig,
        time_provider: Arc<dyn TimeProvider>,
        metric_registry: &metric::Registry,
    ) -> Self {
        Self {
            ingester_ring,
            distributor_ring,
            pool,
            overrides,
            limiter: RateLimiter::new(time_provider),
            config,
            spans_received: metric_registry
                .register_metric("distributor_spans_received", "spans accepted for processing"),
            bytes_received: metric_registry
                .register_metric("distributor_bytes_received", "bytes accepted for processing"),
            discarded_spans: metric_registry
                .register_metric("discarded_spans", "spans dropped before reaching storage"),
        }
    }

    /// Admit, shard and replicate one batch for `tenant`.
    pub async fn push(
        &self,
        tenant: Option<TenantId>,
        batch: ResourceSpans,
    ) -> Result<(), RpcError> {
        let Some(tenant) = tenant else {
            return Err(RpcError::new(
                RpcCode::Unauthenticated,
                "no tenant id attached to request",
            ));
        };

        let span_count = batch
            .instrumentation_library_spans
            .iter()
            .map(|ils| ils.spans.len() as u64)
            .sum::<u64>();
        if span_count == 0 {
            return Ok(());
        }
        let batch_size = batch.encoded_len() as u64;

        self.spans_received
            .recorder([("tenant", tenant.as_str().to_string())])
            .inc(span_count);
        self.bytes_received
            .recorder([("tenant", tenant.as_str().to_string())])
            .inc(batch_size);

        let limits = self.overrides.for_tenant(&tenant);
        let (rate, burst) = self.effective_rate(&limits).await;
        if !self
            .limiter
            .allow_n(tenant.as_str(), batch_size, rate, burst)
        {
            self.discard(&tenant, "rate_limited", span_count);
            return Err(RpcError::new(
                RpcCode::ResourceExhausted,
                format!("RATE_LIMITED: tenant {tenant} over ingestion limit"),
            ));
        }

        let traces = match regroup_by_trace(batch) {
            Ok(traces) => traces,
            Err(e) => {
                self.discard(&tenant, "internal_error", span_count);
                return Err(e);
            }
        };

        if self.config.log_received_traces {
            for (id, _) in &traces {
                debug!(tenant = %tenant, trace_id = %id, "received trace");
            }
        }

        let keys: Vec<u32> = traces
            .iter()
            .map(|(id, _)| ring::token_for(tenant.as_str(), id.as_bytes()))
            .collect();
        let ids: Arc<Vec<TraceId>> = Arc::new(traces.iter().map(|(id, _)| *id).collect());
        let marshaled: Arc<Vec<Vec<u8>>> = Arc::new(
            traces
                .into_iter()
                .map(|(_, trace)| trace.encode_to_vec())
                .collect(),
        );

        let op = if self.config.extend_writes {
            Operation::WriteNoExtend
        } else {
            Operation::Write
        };

        let pool = Arc::clone(&self.pool);
        let callback_tenant = tenant.clone();
        let result = ring::batch::do_batch(
            &self.ingester_ring,
            op,
            &keys,
            self.config.remote_timeout,
            move |_instance_id, instance, indices| {
                let pool = Arc::clone(&pool);
                let tenant = callback_tenant.clone();
                let ids = Arc::clone(&ids);
                let marshaled = Arc::clone(&marshaled);
                async move {
                    let client = pool.client_for(&instance.addr).ok_or_else(|| {
                        RpcError::new(
                            RpcCode::Internal,
                            format!("no client for ingester at {}", instance.addr),
                        )
                    })?;
                    let request = PushBytesRequest {
                        traces: indices.iter().map(|i| marshaled[*i].clone()).collect(),
                        ids: indices.iter().map(|i| ids[*i]).collect(),
                        search_data: vec![Vec::new(); indices.len()],
                    };
                    client.push_bytes(&tenant, request).await
                }
            },
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(BatchError::EmptyRing) => {
                self.discard(&tenant, "internal_error", span_count);
                Err(RpcError::new(
                    RpcCode::Unavailable,
                    "no healthy ingesters in the ring",
                ))
            }
            Err(BatchError::KeyFailed { source, .. }) => {
                self.discard(&tenant, discard_reason(&source), span_count);
                Err(source)
            }
            Err(BatchError::KeyTimedOut { instance }) => {
                self.discard(&tenant, "internal_error", span_count);
                Err(RpcError::new(
                    RpcCode::Internal,
                    format!("write to ingester {instance} timed out"),
                ))
            }
        }
    }

    async fn effective_rate(&self, limits: &Limits) -> (f64, f64) {
        let divisor = match (limits.ingestion_rate_strategy, &self.distributor_ring) {
            (IngestionRateStrategy::Global, Some(ring)) => {
                ring.healthy_instance_count(Operation::Write).await.max(1) as f64
            }
            _ => 1.0,
        };
        (
            limits.ingestion_rate_limit_bytes as f64 / divisor,
            limits.ingestion_burst_size_bytes as f64 / divisor,
        )
    }

    fn discard(&self, tenant: &TenantId, reason: &'static str, spans: u64) {
        self.discarded_spans
            .recorder([
                ("reason", reason.to_string()),
                ("tenant", tenant.as_str().to_string()),
            ])
            .inc(spans);
    }
}

/// Map an ingester error message to a `discarded_spans` reason by its
/// prefix tag.
fn discard_reason(error: &RpcError) -> &'static str {
    if error.message.starts_with(ERR_PREFIX_LIVE_TRACES_EXCEEDED) {
        "live_traces_exceeded"
    } else if error.message.starts_with(ERR_PREFIX_TRACE_TOO_LARGE) {
        "trace_too_large"
    } else {
        "internal_error"
    }
}

/// Regroup one received batch by trace id.
///
/// Spans sharing `(trace id, instrumentation library)` coalesce into one
/// [`InstrumentationLibrarySpans`]; each unique trace id then yields one
/// [`Trace`] whose batches carry the original batch's resource.
fn regroup_by_trace(batch: ResourceSpans) -> Result<Vec<(TraceId, Trace)>, RpcError> {
    let resource = batch.resource;

    let mut order: Vec<TraceId> = Vec::new();
    let mut grouped: HashMap<TraceId, Vec<InstrumentationLibrarySpans>> = HashMap::new();

    for ils in batch.instrumentation_library_spans {
        let library = ils.instrumentation_library;
        for span in ils.spans {
            let id = TraceId::try_from(span.trace_id.as_slice()).map_err(|e| {
                RpcError::new(RpcCode::InvalidArgument, e.to_string())
            })?;

            let batches = grouped.entry(id).or_insert_with(|| {
                order.push(id);
                Vec::new()
            });
            match batches
                .iter_mut()
                .find(|existing| existing.instrumentation_library == library)
            {
                Some(existing) => existing.spans.push(span),
                None => batches.push(InstrumentationLibrarySpans {
                    instrumentation_library: library.clone(),
                    spans: vec![span],
                }),
            }
        }
    }

    Ok(order
        .into_iter()
        .map(|id| {
            let batches = grouped.remove(&id).expect("grouped above");
            (
                id,
                Trace {
                    resource_spans: vec![ResourceSpans {
                        resource: resource.clone(),
                        instrumentation_library_spans: batches,
                    }],
                },
            )
        })
        .collect())
}
