//! Raw byte storage over object stores, and the decorators that wrap it.
//!
//! Everything durable in the system moves through the [`RawReader`] /
//! [`RawWriter`] pair. The concrete implementation adapts the
//! [`object_store`] crate (in-memory, local filesystem, and the cloud
//! stores behind feature flags); [`cache::CachingBackend`] and
//! [`hedge::HedgedReader`] are stacked on top where configured.
#![deny(rustdoc::broken_intra_doc_links, rustdoc::bare_urls, rust_2018_idioms)]
#![warn(
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self,
    clippy::clone_on_ref_ptr
)]

use async_trait::async_trait;
use bytes::Bytes;
use object_store::{path::Path, DynObjectStore};
use snafu::Snafu;
use std::{fmt::Debug, sync::Arc};

pub mod cache;
pub mod hedge;

/// Errors from raw storage operations.
///
/// Not-found conditions from every underlying store are normalized to
/// [`Error::DoesNotExist`] so callers can match on absence without knowing
/// the store.
#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("object does not exist: {}", path))]
    DoesNotExist { path: String },

    #[snafu(display("backend error for {}: {}", path, source))]
    Backend {
        path: String,
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[snafu(display(
        "short range read for {}: wanted {} bytes at offset {}, got {}",
        path,
        wanted,
        offset,
        got
    ))]
    ShortRead {
        path: String,
        offset: u64,
        wanted: usize,
        got: usize,
    },
}

impl Error {
    fn from_object_store(path: String, e: object_store::Error) -> Self {
        match e {
            object_store::Error::NotFound { .. } => Self::DoesNotExist { path },
            other => Self::Backend {
                path,
                source: Box::new(other),
            },
        }
    }
}

/// Result alias for raw storage operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Accumulates buffered appends until [`RawWriter::close_append`] makes the
/// object visible in one shot.
///
/// Object stores have no native append; the tracker simulates it.
#[derive(Debug)]
pub struct AppendTracker {
    name: String,
    keypath: Vec<String>,
    buffer: Vec<u8>,
}

impl AppendTracker {
    /// Bytes buffered so far.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Whether anything has been buffered.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

/// Writes raw bytes to durable storage.
#[async_trait]
pub trait RawWriter: Debug + Send + Sync + 'static {
    /// Atomically create or replace `keypath/name`. Durable on return.
    async fn write(
        &self,
        name: &str,
        keypath: &[String],
        data: Bytes,
        should_cache: bool,
    ) -> Result<()>;

    /// Buffer `data` for `keypath/name`, creating a tracker on first call.
    async fn append(
        &self,
        name: &str,
        keypath: &[String],
        tracker: Option<AppendTracker>,
        data: &[u8],
    ) -> Result<AppendTracker>;

    /// Flush a tracker's buffered appends as the final object.
    async fn close_append(&self, tracker: AppendTracker) -> Result<()>;

    /// Delete `keypath/name`. Deleting an absent object is not an error.
    async fn delete(&self, name: &str, keypath: &[String]) -> Result<()>;
}

/// Reads raw bytes from durable storage.
#[async_trait]
pub trait RawReader: Debug + Send + Sync + 'static {
    /// Read all of `keypath/name`.
    async fn read(&self, name: &str, keypath: &[String], should_cache: bool) -> Result<Bytes>;

    /// Read exactly `len` bytes of `keypath/name` starting at `offset`.
    async fn read_range(
        &self,
        name: &str,
        keypath: &[String],
        offset: u64,
        len: usize,
    ) -> Result<Bytes>;

    /// List the immediate children under `keypath`.
    async fn list(&self, keypath: &[String]) -> Result<Vec<String>>;
}

fn object_path(keypath: &[String], name: &str) -> String {
    let mut parts = keypath.to_vec();
    parts.push(name.to_string());
    parts.join("/")
}

/// [`RawReader`] + [`RawWriter`] over any [`object_store::ObjectStore`].
#[derive(Debug)]
pub struct ObjectStoreBackend {
    store: Arc<DynObjectStore>,
}

impl ObjectStoreBackend {
    /// Adapt an existing store.
    pub fn new(store: Arc<DynObjectStore>) -> Self {
        Self { store }
    }

    /// An ephemeral in-memory backend, mostly for tests and the all-in-one
    /// target.
    pub fn memory() -> Self {
        Self::new(Arc::new(object_store::memory::InMemory::new()))
    }

    /// A backend rooted at a local directory.
    pub fn local(root: impl AsRef<std::path::Path>) -> Result<Self> {
        let store = object_store::local::LocalFileSystem::new_with_prefix(root.as_ref())
            .map_err(|e| Error::Backend {
                path: root.as_ref().display().to_string(),
                source: Box::new(e),
            })?;
        Ok(Self::new(Arc::new(store)))
    }
}

#[async_trait]
impl RawWriter for ObjectStoreBackend {
    async fn write(
        &self,
        name: &str,
        keypath: &[String],
        data: Bytes,
        _should_cache: bool,
    ) -> Result<()> {
        let path = object_path(keypath, name);
        self.store
            .put(&Path::from(path.as_str()), data)
            .await
            .map_err(|e| Error::from_object_store(path, e))
    }

    async fn append(
        &self,
        name: &str,
        keypath: &[String],
        tracker: Option<AppendTracker>,
        data: &[u8],
    ) -> Result<AppendTracker> {
        let mut tracker = tracker.unwrap_or_else(|| AppendTracker {
            name: name.to_string(),
            keypath: keypath.to_vec(),
            buffer: Vec::new(),
        });
        tracker.buffer.extend_from_slice(data);
        Ok(tracker)
    }

    async fn close_append(&self, tracker: AppendTracker) -> Result<()> {
        let AppendTracker {
            name,
            keypath,
            buffer,
        } = tracker;
        self.write(&name, &keypath, buffer.into(), false).await
    }

    async fn delete(&self, name: &str, keypath: &[String]) -> Result<()> {
        let path = object_path(keypath, name);
        match self.store.delete(&Path::from(path.as_str())).await {
            Ok(()) => Ok(()),
            Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(Error::from_object_store(path, e)),
        }
    }
}

#[async_trait]
impl RawReader for ObjectStoreBackend {
    async fn read(&self, name: &str, keypath: &[String], _should_cache: bool) -> Result<Bytes> {
        let path = object_path(keypath, name);
        let result = self
            .store
            .get(&Path::from(path.as_str()))
            .await
            .map_err(|e| Error::from_object_store(path.clone(), e))?;
        result
            .bytes()
            .await
            .map_err(|e| Error::from_object_store(path, e))
    }

    async fn read_range(
        &self,
        name: &str,
        keypath: &[String],
        offset: u64,
        len: usize,
    ) -> Result<Bytes> {
        let path = object_path(keypath, name);
        let range = offset as usize..offset as usize + len;
        let bytes = self
            .store
            .get_range(&Path::from(path.as_str()), range)
            .await
            .map_err(|e| Error::from_object_store(path.clone(), e))?;
        if bytes.len() != len {
            return Err(Error::ShortRead {
                path,
                offset,
                wanted: len,
                got: bytes.len(),
            });
        }
        Ok(bytes)
    }

    async fn list(&self, keypath: &[String]) -> Result<Vec<String>> {
        let prefix_string = keypath.join("/");
        let prefix = (!prefix_string.is_empty()).then(|| Path::from(prefix_string.as_str()));

        let listing = self
            .store
            .list_with_delimiter(prefix.as_ref())
            .await
            .map_err(|e| Error::from_object_store(prefix_string.clone(), e))?;

        let mut children: Vec<String> = listing
            .common_prefixes
            .iter()
            .chain(listing.objects.iter().map(|o| &o.location))
            .filter_map(|p| p.parts().last().map(|part| part.as_ref().to_string()))
            .collect();
        children.sort();
        children.dedup();
        Ok(children)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypath(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn write_then_read() {
        let backend = ObjectStoreBackend::memory();
        let kp = keypath(&["tenant", "block"]);

        backend
            .write("data", &kp, Bytes::from_static(b"hello"), false)
            .await
            .unwrap();

        let got = backend.read("data", &kp, false).await.unwrap();
        assert_eq!(&got[..], b"hello");
    }

    #[tokio::test]
    async fn read_missing_is_does_not_exist() {
        let backend = ObjectStoreBackend::memory();
        let err = backend
            .read("nope", &keypath(&["tenant", "block"]), false)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DoesNotExist { .. }), "{err}");
    }

    #[tokio::test]
    async fn range_reads_are_exact() {
        let backend = ObjectStoreBackend::memory();
        let kp = keypath(&["t", "b"]);
        backend
            .write("data", &kp, Bytes::from_static(b"0123456789"), false)
            .await
            .unwrap();

        let got = backend.read_range("data", &kp, 2, 4).await.unwrap();
        assert_eq!(&got[..], b"2345");
    }

    #[tokio::test]
    async fn append_is_buffered_until_close() {
        let backend = ObjectStoreBackend::memory();
        let kp = keypath(&["t", "b"]);

        let tracker = backend.append("data", &kp, None, b"one").await.unwrap();
        let tracker = backend
            .append("data", &kp, Some(tracker), b"two")
            .await
            .unwrap();
        assert_eq!(tracker.len(), 6);

        // nothing visible yet
        assert!(matches!(
            backend.read("data", &kp, false).await,
            Err(Error::DoesNotExist { .. })
        ));

        backend.close_append(tracker).await.unwrap();
        let got = backend.read("data", &kp, false).await.unwrap();
        assert_eq!(&got[..], b"onetwo");
    }

    #[tokio::test]
    async fn list_immediate_children() {
        let backend = ObjectStoreBackend::memory();
        backend
            .write("meta.json", &keypath(&["tenant-a", "block-1"]), Bytes::new(), false)
            .await
            .unwrap();
        backend
            .write("meta.json", &keypath(&["tenant-a", "block-2"]), Bytes::new(), false)
            .await
            .unwrap();
        backend
            .write("meta.json", &keypath(&["tenant-b", "block-3"]), Bytes::new(), false)
            .await
            .unwrap();

        let tenants = backend.list(&[]).await.unwrap();
        assert_eq!(tenants, vec!["tenant-a", "tenant-b"]);

        let blocks = backend.list(&keypath(&["tenant-a"])).await.unwrap();
        assert_eq!(blocks, vec!["block-1", "block-2"]);
    }

    #[tokio::test]
    async fn local_backend_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ObjectStoreBackend::local(dir.path()).unwrap();
        let kp = keypath(&["tenant", "block"]);

        backend
            .write("index", &kp, Bytes::from_static(b"records"), false)
            .await
            .unwrap();
        let got = backend.read("index", &kp, false).await.unwrap();
        assert_eq!(&got[..], b"records");
    }
}
