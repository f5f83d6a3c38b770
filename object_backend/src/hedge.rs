//! Request hedging for tail-latency reduction.
//!
//! Object store reads occasionally take orders of magnitude longer than the
//! median. [`HedgedReader`] issues a second identical request once the first
//! has been outstanding for `hedge_at`; whichever succeeds first wins. A
//! failed call resolves only after both attempts have failed, and at most
//! one extra request is ever in flight per call. Writes and lists are never
//! hedged.

use crate::{RawReader, Result};
use async_trait::async_trait;
use bytes::Bytes;
use futures::future::{self, Either};
use observability_deps::tracing::debug;
use std::{sync::Arc, time::Duration};

/// Decorates a [`RawReader`] with hedged `read`/`read_range`.
#[derive(Debug)]
pub struct HedgedReader {
    inner: Arc<dyn RawReader>,
    hedge_at: Duration,
}

impl HedgedReader {
    /// Hedge reads on `inner` after `hedge_at`.
    pub fn new(inner: Arc<dyn RawReader>, hedge_at: Duration) -> Self {
        Self { inner, hedge_at }
    }

    async fn hedged<F, Fut>(&self, name: &str, run: F) -> Result<Bytes>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<Bytes>>,
    {
        let first = std::pin::pin!(run());
        let timer = std::pin::pin!(tokio::time::sleep(self.hedge_at));

        let first = match future::select(first, timer).await {
            // first attempt finished inside the hedge window
            Either::Left((res, _timer)) => return res,
            Either::Right(((), first)) => first,
        };

        debug!(name, hedge_at_ms = self.hedge_at.as_millis() as u64, "hedging read");
        let second = std::pin::pin!(run());

        match future::select(first, second).await {
            Either::Left((Ok(bytes), _)) | Either::Right((Ok(bytes), _)) => Ok(bytes),
            // one attempt failed: the result is whatever the other produces,
            // falling back to the loser's error if that fails too
            Either::Left((Err(first_err), second)) => match second.await {
                Ok(bytes) => Ok(bytes),
                Err(_) => Err(first_err),
            },
            Either::Right((Err(second_err), first)) => match first.await {
                Ok(bytes) => Ok(bytes),
                Err(_) => Err(second_err),
            },
        }
    }
}

#[async_trait]
impl RawReader for HedgedReader {
    async fn read(&self, name: &str, keypath: &[String], should_cache: bool) -> Result<Bytes> {
        self.hedged(name, || self.inner.read(name, keypath, should_cache))
            .await
    }

    async fn read_range(
        &self,
        name: &str,
        keypath: &[String],
        offset: u64,
        len: usize,
    ) -> Result<Bytes> {
        self.hedged(name, || self.inner.read_range(name, keypath, offset, len))
            .await
    }

    async fn list(&self, keypath: &[String]) -> Result<Vec<String>> {
        self.inner.list(keypath).await
    }
}
