//! The consistent-hash ring.
//!
//! Instances own random tokens on the `[0, 2^32)` circle; a key is served
//! by the first `replication_factor` distinct healthy instances found
//! walking clockwise from the key. Membership lives in a shared document
//! behind [`kv::KvStore`]; [`lifecycler::Lifecycler`] keeps one instance's
//! entry registered, heartbeated and state-correct, and [`batch::do_batch`]
//! is the write fan-out with per-key quorum accounting.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use serde::{Deserialize, Serialize};
use snafu::Snafu;
use std::{collections::BTreeMap, sync::Arc, time::Duration};
use tracedb_time::{Time, TimeProvider};

pub mod batch;
pub mod kv;
pub mod lifecycler;

/// Ring errors.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("no instances are available for this operation"))]
    EmptyRing,

    #[snafu(display("instance {} is not registered in the ring", instance))]
    NotRegistered { instance: String },
}

/// Result alias for ring operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

const FNV1A_32_OFFSET_BASIS: u32 = 0x811c9dc5;
const FNV1A_32_PRIME: u32 = 0x01000193;

/// The stable 32-bit FNV-1a token for a `(tenant, trace id)` pair.
///
/// Every distributor must place a given trace on the same replicas, so
/// this function is part of the cross-node contract and must not change.
pub fn token_for(tenant: &str, trace_id: &[u8]) -> u32 {
    let mut hash = FNV1A_32_OFFSET_BASIS;
    for b in tenant.as_bytes().iter().chain(trace_id.iter()) {
        hash ^= u32::from(*b);
        hash = hash.wrapping_mul(FNV1A_32_PRIME);
    }
    hash
}

/// The lifecycle state an instance advertises in the ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceState {
    /// Starting up (replaying its WAL); has no readable data yet.
    Joining,
    /// Serving reads and writes.
    Active,
    /// Draining: serves reads, refuses new writes.
    Leaving,
}

/// One instance's entry in the ring document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceDesc {
    /// Dial address for RPCs.
    pub addr: String,
    /// Advertised state.
    pub state: InstanceState,
    /// Owned tokens, sorted ascending.
    pub tokens: Vec<u32>,
    /// Unix nanoseconds of the last heartbeat.
    pub last_heartbeat: i64,
}

impl InstanceDesc {
    fn is_healthy(&self, now: Time, heartbeat_timeout: Duration) -> bool {
        now.checked_duration_since(Time::from_timestamp_nanos(self.last_heartbeat))
            .map(|age| age <= heartbeat_timeout)
            // a heartbeat "from the future" is clock skew, not death
            .unwrap_or(true)
    }
}

/// The shared membership document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Desc {
    /// Instance id → instance entry.
    pub instances: BTreeMap<String, InstanceDesc>,
}

/// The operation a ring lookup serves, which determines the instance
/// states eligible to receive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Point reads: `Active` and `Leaving` (which still holds data).
    Read,
    /// Writes: `Active` and `Leaving` only.
    Write,
    /// Writes during handoff: additionally accepts `Joining` instances as
    /// spare replicas to minimize reshuffling.
    WriteNoExtend,
}

impl Operation {
    fn accepts(&self, state: InstanceState) -> bool {
        match (self, state) {
            (_, InstanceState::Active | InstanceState::Leaving) => true,
            (Self::WriteNoExtend, InstanceState::Joining) => true,
            _ => false,
        }
    }
}

/// The ordered replicas chosen for one key.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicationSet {
    /// `(instance id, entry)` pairs in walk order.
    pub instances: Vec<(String, InstanceDesc)>,
}

impl ReplicationSet {
    /// Replicas that must succeed for a write to this set to succeed.
    pub fn quorum(&self) -> usize {
        self.instances.len() / 2 + 1
    }
}

/// Read-side view of one ring.
#[derive(Debug, Clone)]
pub struct Ring {
    kv: Arc<dyn kv::KvStore>,
    ring_key: String,
    replication_factor: usize,
    heartbeat_timeout: Duration,
    time_provider: Arc<dyn TimeProvider>,
}

impl Ring {
    /// A view over the document at `ring_key` in `kv`.
    pub fn new(
        kv: Arc<dyn kv::KvStore>,
        ring_key: impl Into<String>,
        replication_factor: usize,
        heartbeat_timeout: Duration,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            kv,
            ring_key: ring_key.into(),
            replication_factor: replication_factor.max(1),
            heartbeat_timeout,
            time_provider,
        }
    }

    /// The ring document key this view reads.
    pub fn ring_key(&self) -> &str {
        &self.ring_key
    }

    /// The configured replication factor.
    pub fn replication_factor(&self) -> usize {
        self.replication_factor
    }

    /// Number of healthy instances eligible for `op` right now.
    pub async fn healthy_instance_count(&self, op: Operation) -> usize {
        let now = self.time_provider.now();
        self.kv
            .get(&self.ring_key)
            .await
            .map(|desc| {
                desc.instances
                    .values()
                    .filter(|i| op.accepts(i.state) && i.is_healthy(now, self.heartbeat_timeout))
                    .count()
            })
            .unwrap_or(0)
    }

    /// The first `replication_factor` distinct eligible instances walking
    /// clockwise from `key`.
    pub async fn get(&self, key: u32, op: Operation) -> Result<ReplicationSet> {
        let desc = self.kv.get(&self.ring_key).await.unwrap_or_default();
        self.replicas_from(&desc, key, op)
    }

    /// As [`Self::get`] over an already-fetched document, so batch callers
    /// resolve every key against one consistent snapshot.
    pub fn replicas_from(&self, desc: &Desc, key: u32, op: Operation) -> Result<ReplicationSet> {
        let now = self.time_provider.now();

        // the token circle over eligible instances only
        let mut circle: Vec<(u32, &String)> = desc
            .instances
            .iter()
            .filter(|(_, i)| op.accepts(i.state) && i.is_healthy(now, self.heartbeat_timeout))
            .flat_map(|(id, i)| i.tokens.iter().map(move |t| (*t, id)))
            .collect();
        if circle.is_empty() {
            return Err(Error::EmptyRing);
        }
        circle.sort_unstable();

        let start = circle.partition_point(|(token, _)| *token < key);
        let mut instances: Vec<(String, InstanceDesc)> = Vec::new();
        for offset in 0..circle.len() {
            let (_, instance_id) = circle[(start + offset) % circle.len()];
            if instances.iter().any(|(id, _)| id == instance_id) {
                continue;
            }
            instances.push((
                instance_id.clone(),
                desc.instances[instance_id].clone(),
            ));
            if instances.len() == self.replication_factor {
                break;
            }
        }

        Ok(ReplicationSet { instances })
    }

    /// The current membership document, for callers that resolve many keys.
    pub async fn document(&self) -> Desc {
        self.kv.get(&self.ring_key).await.unwrap_or_default()
    }
}
