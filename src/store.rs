//! Object-store capability boundary (spec.md §4.5, §9's "source pattern
//! re-architecture"): an [`ObjectStore`] trait plus two implementations —
//! [`LocalObjectStore`] for tests and local-mode runs, [`HttpObjectStore`]
//! for a real remote backend.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::{RetryTransientMiddleware, policies::ExponentialBackoff};
use reqwest_tracing::TracingMiddleware;
use tokio::fs;
use tracing::debug;

use crate::error::StoreError;

/// Upload/download surface every engine and schema-gate call site uses.
/// `download` returns `Ok(None)` rather than an error when the object does
/// not exist — spec.md's Schema Gate treats "no published schema yet" as a
/// normal first-run case, not a failure.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(&self, object_path: &str, bytes: Vec<u8>) -> Result<(), StoreError>;

    async fn download(&self, object_path: &str) -> Result<Option<Vec<u8>>, StoreError>;
}

/// Filesystem-backed store rooted at a local directory. Used directly by
/// `local_mode` runs and by every test that needs a real `ObjectStore`
/// rather than a mock.
pub struct LocalObjectStore {
    root: PathBuf,
}

impl LocalObjectStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, object_path: &str) -> PathBuf {
        self.root.join(object_path)
    }
}

#[async_trait]
impl ObjectStore for LocalObjectStore {
    async fn upload(&self, object_path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let dest = self.resolve(object_path);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await.map_err(StoreError::Io)?;
        }
        fs::write(&dest, bytes).await.map_err(StoreError::Io)?;
        debug!(path = %dest.display(), "uploaded object to local store");
        Ok(())
    }

    async fn download(&self, object_path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let src = self.resolve(object_path);
        match fs::read(&src).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }
}

/// Remote object store reached over HTTP, with exponential-backoff retry
/// and request tracing wired through `reqwest-middleware`.
pub struct HttpObjectStore {
    client: ClientWithMiddleware,
    base_url: String,
    bucket: String,
}

impl HttpObjectStore {
    pub fn new(base_url: impl Into<String>, bucket: impl Into<String>, max_retries: u32) -> Self {
        let retry_policy = ExponentialBackoff::builder().build_with_max_retries(max_retries);
        // No blanket client-wide timeout: upload and download carry different
        // deadlines (spec.md §4.5), applied per-request below.
        let inner = reqwest::Client::builder()
            .build()
            .expect("reqwest client builds with static config");
        let client = ClientBuilder::new(inner)
            .with(TracingMiddleware::default())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();

        Self {
            client,
            base_url: base_url.into(),
            bucket: bucket.into(),
        }
    }

    fn object_url(&self, object_path: &str) -> String {
        format!("{}/{}/{}", self.base_url, self.bucket, object_path)
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn upload(&self, object_path: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        let url = self.object_url(object_path);
        let response = self
            .client
            .put(&url)
            .timeout(UPLOAD_DEADLINE)
            .body(bytes)
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;

        if !response.status().is_success() {
            return Err(StoreError::Transport(format!(
                "upload to {url} failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn download(&self, object_path: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let url = self.object_url(object_path);
        let response = self
            .client
            .get(&url)
            .timeout(DOWNLOAD_DEADLINE)
            .send()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(StoreError::Transport(format!(
                "download from {url} failed with status {}",
                response.status()
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| StoreError::Transport(err.to_string()))?;
        Ok(Some(bytes.to_vec()))
    }
}

/// Gzip-compresses `bytes` for upload as a bundle's data or index object
/// (spec.md §4.1: bundles are published gzip-compressed).
pub fn gzip(bytes: &[u8]) -> std::io::Result<Vec<u8>> {
    use flate2::Compression;
    use flate2::write::GzEncoder;
    use std::io::Write;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Shared type alias for an object store handed around behind an `Arc`.
pub type SharedObjectStore = Arc<dyn ObjectStore>;

/// Upload deadline (spec.md §4.5): a 1-hour ceiling per call.
pub const UPLOAD_DEADLINE: Duration = Duration::from_secs(3600);
/// Download deadline (spec.md §4.5): a 2-minute ceiling per call.
pub const DOWNLOAD_DEADLINE: Duration = Duration::from_secs(120);

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn local_store_round_trips() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path().to_path_buf());

        store
            .upload("a/b/c.jsonl.gz", b"hello".to_vec())
            .await
            .unwrap();
        let got = store.download("a/b/c.jsonl.gz").await.unwrap();
        assert_eq!(got, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn local_store_missing_object_returns_none() {
        let dir = TempDir::new().unwrap();
        let store = LocalObjectStore::new(dir.path().to_path_buf());

        let got = store.download("missing").await.unwrap();
        assert_eq!(got, None);
    }

    #[test]
    fn gzip_round_trips() {
        use flate2::read::GzDecoder;
        use std::io::Read;

        let compressed = gzip(b"{\"a\":1}").unwrap();
        let mut decoder = GzDecoder::new(&compressed[..]);
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        assert_eq!(out, "{\"a\":1}");
    }
}
