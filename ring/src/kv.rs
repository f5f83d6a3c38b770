//! The shared document store behind the ring.
//!
//! Production deployments point this at an external store (or a gossip
//! layer); those are collaborators. [`MemKvStore`] is the in-process
//! implementation used by tests and the all-in-one target.

use crate::Desc;
use async_trait::async_trait;
use parking_lot::Mutex;
use snafu::Snafu;
use std::{collections::HashMap, fmt::Debug};

/// KV store errors.
#[derive(Debug, Snafu)]
pub enum KvError {
    #[snafu(display("compare-and-swap on {:?} did not converge", key))]
    CasContention { key: String },
}

/// The mutation passed to [`KvStore::cas`]: current document in, desired
/// document out (`None` leaves the document unchanged).
pub type CasFn = Box<dyn FnOnce(Option<Desc>) -> Option<Desc> + Send>;

/// A store holding one [`Desc`] per key, mutated by compare-and-swap.
#[async_trait]
pub trait KvStore: Debug + Send + Sync + 'static {
    /// The current document at `key`.
    async fn get(&self, key: &str) -> Option<Desc>;

    /// Atomically transform the document at `key`.
    async fn cas(&self, key: &str, f: CasFn) -> Result<(), KvError>;
}

/// In-memory [`KvStore`].
#[derive(Debug, Default)]
pub struct MemKvStore {
    documents: Mutex<HashMap<String, Desc>>,
}

#[async_trait]
impl KvStore for MemKvStore {
    async fn get(&self, key: &str) -> Option<Desc> {
        self.documents.lock().get(key).cloned()
    }

    async fn cas(&self, key: &str, f: CasFn) -> Result<(), KvError> {
        let mut documents = self.documents.lock();
        let current = documents.get(key).cloned();
        if let Some(next) = f(current) {
            documents.insert(key.to_string(), next);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{InstanceDesc, InstanceState};

    fn entry() -> InstanceDesc {
        InstanceDesc {
            addr: "localhost:0".to_string(),
            state: InstanceState::Active,
            tokens: vec![1],
            last_heartbeat: 0,
        }
    }

    #[tokio::test]
    async fn cas_creates_and_updates() {
        let kv = MemKvStore::default();
        assert!(kv.get("ring").await.is_none());

        kv.cas(
            "ring",
            Box::new(|current| {
                assert!(current.is_none());
                let mut desc = Desc::default();
                desc.instances.insert("a".to_string(), entry());
                Some(desc)
            }),
        )
        .await
        .unwrap();

        kv.cas(
            "ring",
            Box::new(|current| {
                let mut desc = current.expect("created above");
                desc.instances.insert("b".to_string(), entry());
                Some(desc)
            }),
        )
        .await
        .unwrap();

        let desc = kv.get("ring").await.unwrap();
        assert_eq!(desc.instances.len(), 2);
    }

    #[tokio::test]
    async fn cas_returning_none_is_a_no_op() {
        let kv = MemKvStore::default();
        kv.cas("ring", Box::new(|_| None)).await.unwrap();
        assert!(kv.get("ring").await.is_none());
    }
}
