//! The replicated write fan-out.

use crate::{InstanceDesc, Operation, Ring};
use observability_deps::tracing::warn;
use std::{collections::HashMap, fmt, future::Future, time::Duration};

/// Why a batch failed.
#[derive(Debug)]
pub enum BatchError<E> {
    /// No eligible instance existed for some key.
    EmptyRing,
    /// A key missed quorum; carries the first failing replica's error.
    KeyFailed {
        /// The failing instance.
        instance: String,
        /// Its error.
        source: E,
    },
    /// A key missed quorum and its first failure was an RPC timeout.
    KeyTimedOut {
        /// The timed-out instance.
        instance: String,
    },
}

impl<E: fmt::Display> fmt::Display for BatchError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyRing => write!(f, "no instances are available for this operation"),
            Self::KeyFailed { instance, source } => {
                write!(f, "write to instance {} failed: {}", instance, source)
            }
            Self::KeyTimedOut { instance } => {
                write!(f, "write to instance {} timed out", instance)
            }
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BatchError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::KeyFailed { source, .. } => Some(source),
            _ => None,
        }
    }
}

enum Outcome<E> {
    Ok,
    Failed(Option<E>),
    TimedOut,
}

/// Fan a batch of keys out to their replica sets.
///
/// Keys are grouped by destination so each instance receives exactly one
/// call carrying the indices of the keys it serves. Calls run as detached
/// tasks bounded by `remote_timeout`, so a caller hanging up cannot abort
/// fan-outs other callers depend on.
///
/// Each key succeeds when at least `quorum` of its replicas succeed; the
/// batch succeeds iff every key does, otherwise the first per-key failure
/// is surfaced.
pub async fn do_batch<F, Fut, E>(
    ring: &Ring,
    op: Operation,
    keys: &[u32],
    remote_timeout: Duration,
    callback: F,
) -> Result<(), BatchError<E>>
where
    F: Fn(String, InstanceDesc, Vec<usize>) -> Fut,
    Fut: Future<Output = Result<(), E>> + Send + 'static,
    E: std::fmt::Display + Send + 'static,
{
    if keys.is_empty() {
        return Ok(());
    }

    // resolve every key against one membership snapshot
    let desc = ring.document().await;

    let mut replicas_per_key: Vec<Vec<String>> = Vec::with_capacity(keys.len());
    let mut keys_per_instance: HashMap<String, (InstanceDesc, Vec<usize>)> = HashMap::new();
    for (index, key) in keys.iter().enumerate() {
        let set = ring
            .replicas_from(&desc, *key, op)
            .map_err(|_| BatchError::EmptyRing)?;
        let mut replica_ids = Vec::with_capacity(set.instances.len());
        for (instance_id, instance) in set.instances {
            keys_per_instance
                .entry(instance_id.clone())
                .or_insert_with(|| (instance, Vec::new()))
                .1
                .push(index);
            replica_ids.push(instance_id);
        }
        replicas_per_key.push(replica_ids);
    }

    let mut handles = Vec::with_capacity(keys_per_instance.len());
    for (instance_id, (instance, indices)) in keys_per_instance {
        let fut = callback(instance_id.clone(), instance, indices);
        // spawned so caller cancellation cannot abort in-flight replicas
        let handle = tokio::spawn(tokio::time::timeout(remote_timeout, fut));
        handles.push((instance_id, handle));
    }

    let mut outcomes: HashMap<String, Outcome<E>> = HashMap::new();
    for (instance_id, handle) in handles {
        let outcome = match handle.await {
            Ok(Ok(Ok(()))) => Outcome::Ok,
            Ok(Ok(Err(e))) => {
                warn!(instance = %instance_id, error = %e, "replica call failed");
                Outcome::Failed(Some(e))
            }
            Ok(Err(_elapsed)) => {
                warn!(instance = %instance_id, "replica call timed out");
                Outcome::TimedOut
            }
            Err(join_error) => {
                warn!(instance = %instance_id, error = %join_error, "replica task died");
                Outcome::Failed(None)
            }
        };
        outcomes.insert(instance_id, outcome);
    }

    // per-key quorum over however many replicas the key actually got
    for replica_ids in &replicas_per_key {
        let quorum = replica_ids.len() / 2 + 1;
        let successes = replica_ids
            .iter()
            .filter(|id| matches!(outcomes.get(*id), Some(Outcome::Ok)))
            .count();
        if successes >= quorum {
            continue;
        }

        for id in replica_ids {
            match outcomes.get_mut(id) {
                Some(Outcome::Failed(slot)) => {
                    return match slot.take() {
                        Some(source) => Err(BatchError::KeyFailed {
                            instance: id.clone(),
                            source,
                        }),
                        None => Err(BatchError::KeyTimedOut {
                            instance: id.clone(),
                        }),
                    };
                }
                Some(Outcome::TimedOut) => {
                    return Err(BatchError::KeyTimedOut {
                        instance: id.clone(),
                    })
                }
                _ => continue,
            }
        }
        // unreachable: a missed quorum implies at least one non-Ok outcome
        return Err(BatchError::KeyTimedOut {
            instance: replica_ids
                .first()
                .cloned()
                .unwrap_or_else(|| "unknown".to_string()),
        });
    }

    Ok(())
}
