//! The abstract ingester RPC surface.
//!
//! Distributors and queriers talk to ingesters through [`IngesterClient`];
//! the in-process implementation lives in the `ingester` crate and a gRPC
//! transport is a drop-in implementation of the same trait. Keeping the
//! seam here means the write path can be tested without any transport at
//! all ([`MockIngesterClient`]).
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use data_types::{TenantId, TraceId};
use std::fmt::{self, Debug};

/// Status codes mirroring the gRPC code space the real transport uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RpcCode {
    /// Tenant missing or unidentifiable.
    Unauthenticated,
    /// Malformed request (e.g. wrong trace id length).
    InvalidArgument,
    /// Per-tenant capacity or rate limit hit.
    ResourceExhausted,
    /// Instance cannot take writes in its current lifecycle state.
    Unavailable,
    /// Everything else.
    Internal,
}

/// An RPC-shaped error.
///
/// The message is part of the contract: ingesters prefix capacity errors
/// with [`ERR_PREFIX_LIVE_TRACES_EXCEEDED`] / [`ERR_PREFIX_TRACE_TOO_LARGE`]
/// so distributors can classify discards without sharing error types with
/// the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    /// The status code.
    pub code: RpcCode,
    /// Human-readable detail, prefix-tagged for capacity errors.
    pub message: String,
}

impl RpcError {
    /// Construct an error.
    pub fn new(code: RpcCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Error-message prefix for "too many live traces for this tenant".
pub const ERR_PREFIX_LIVE_TRACES_EXCEEDED: &str = "LIVE_TRACES_EXCEEDED";
/// Error-message prefix for "single trace over its byte limit".
pub const ERR_PREFIX_TRACE_TOO_LARGE: &str = "TRACE_TOO_LARGE";

/// One `PushBytes` request: aligned arrays of serialized traces, their
/// ids, and optional opaque search data.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PushBytesRequest {
    /// Serialized `Trace` payloads.
    pub traces: Vec<Vec<u8>>,
    /// Trace ids, aligned with `traces`.
    pub ids: Vec<TraceId>,
    /// Opaque search data, aligned with `traces` (empty = none).
    pub search_data: Vec<Vec<u8>>,
}

/// What ingesters expose to the rest of the system.
#[async_trait]
pub trait IngesterClient: Debug + Send + Sync + 'static {
    /// Replicated write entry point; all items belong to `tenant`.
    async fn push_bytes(&self, tenant: &TenantId, request: PushBytesRequest)
        -> Result<(), RpcError>;

    /// Point lookup over this ingester's live traces and local blocks.
    /// Absence is `Ok(None)`.
    async fn find_trace_by_id(
        &self,
        tenant: &TenantId,
        trace_id: &TraceId,
    ) -> Result<Option<Vec<u8>>, RpcError>;
}

/// Resolves an instance address to a client, so fan-out code can reach
/// whichever replicas the ring selects.
pub trait IngesterPool: Debug + Send + Sync + 'static {
    /// The client for `addr`.
    fn client_for(&self, addr: &str) -> Option<std::sync::Arc<dyn IngesterClient>>;
}

/// An [`IngesterPool`] over a fixed address → client map, used by the
/// all-in-one target and tests.
#[derive(Debug, Default)]
pub struct StaticPool {
    clients: std::collections::HashMap<String, std::sync::Arc<dyn IngesterClient>>,
}

impl StaticPool {
    /// Build a pool from `(addr, client)` pairs.
    pub fn new(
        clients: impl IntoIterator<Item = (String, std::sync::Arc<dyn IngesterClient>)>,
    ) -> Self {
        Self {
            clients: clients.into_iter().collect(),
        }
    }
}

impl IngesterPool for StaticPool {
    fn client_for(&self, addr: &str) -> Option<std::sync::Arc<dyn IngesterClient>> {
        self.clients.get(addr).map(std::sync::Arc::clone)
    }
}

/// A scriptable in-memory [`IngesterClient`] for tests.
#[derive(Debug, Default)]
pub struct MockIngesterClient {
    state: parking_lot::Mutex<MockState>,
}

#[derive(Debug, Default)]
struct MockState {
    pushes: Vec<(TenantId, PushBytesRequest)>,
    push_errors: Vec<RpcError>,
    finds: std::collections::HashMap<(TenantId, TraceId), Vec<u8>>,
}

impl MockIngesterClient {
    /// Queue errors returned by subsequent `push_bytes` calls (consumed in
    /// order; once drained, pushes succeed).
    pub fn with_push_errors(self, errors: Vec<RpcError>) -> Self {
        self.state.lock().push_errors = errors;
        self
    }

    /// All `push_bytes` calls observed so far.
    pub fn pushes(&self) -> Vec<(TenantId, PushBytesRequest)> {
        self.state.lock().pushes.clone()
    }

    /// Make `find_trace_by_id` return `object` for `(tenant, trace_id)`.
    pub fn insert_trace(&self, tenant: TenantId, trace_id: TraceId, object: Vec<u8>) {
        self.state.lock().finds.insert((tenant, trace_id), object);
    }
}

#[async_trait]
impl IngesterClient for MockIngesterClient {
    async fn push_bytes(
        &self,
        tenant: &TenantId,
        request: PushBytesRequest,
    ) -> Result<(), RpcError> {
        let mut state = self.state.lock();
        state.pushes.push((tenant.clone(), request));
        if state.push_errors.is_empty() {
            Ok(())
        } else {
            Err(state.push_errors.remove(0))
        }
    }

    async fn find_trace_by_id(
        &self,
        tenant: &TenantId,
        trace_id: &TraceId,
    ) -> Result<Option<Vec<u8>>, RpcError> {
        Ok(self
            .state
            .lock()
            .finds
            .get(&(tenant.clone(), *trace_id))
            .cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tenant() -> TenantId {
        TenantId::new("t").unwrap()
    }

    #[tokio::test]
    async fn mock_records_pushes_and_replays_errors() {
        let client = MockIngesterClient::default().with_push_errors(vec![RpcError::new(
            RpcCode::ResourceExhausted,
            format!("{ERR_PREFIX_LIVE_TRACES_EXCEEDED}: tenant at limit"),
        )]);

        let request = PushBytesRequest {
            traces: vec![vec![1, 2, 3]],
            ids: vec![TraceId::new([1; 16])],
            search_data: vec![vec![]],
        };

        let err = client.push_bytes(&tenant(), request.clone()).await.unwrap_err();
        assert!(err.message.starts_with(ERR_PREFIX_LIVE_TRACES_EXCEEDED));

        client.push_bytes(&tenant(), request).await.unwrap();
        assert_eq!(client.pushes().len(), 2);
    }

    #[tokio::test]
    async fn mock_find() {
        let client = MockIngesterClient::default();
        let id = TraceId::new([9; 16]);
        assert_eq!(client.find_trace_by_id(&tenant(), &id).await.unwrap(), None);

        client.insert_trace(tenant(), id, vec![7]);
        assert_eq!(
            client.find_trace_by_id(&tenant(), &id).await.unwrap(),
            Some(vec![7])
        );
    }
}
