//! Option documents, hash-addressed asset storage and HTTP fetch utilities.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::header::CONTENT_TYPE;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "feedsync-storage";

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("decoding document {key}: {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("encoding document {key}: {source}")]
    Encode {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid document key {0:?}")]
    InvalidKey(String),
}

impl StorageError {
    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            action,
            path: path.display().to_string(),
            source,
        }
    }
}

/// Whole-document key-value storage. Callers read, modify and write back the
/// complete document; the store itself never merges.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn load(&self, key: &str) -> Result<Option<JsonValue>, StorageError>;
    async fn store(&self, key: &str, value: &JsonValue) -> Result<(), StorageError>;
}

/// Typed read of a document; a missing document yields `T::default()`.
pub async fn load_document<T>(store: &dyn DocumentStore, key: &str) -> Result<T, StorageError>
where
    T: DeserializeOwned + Default,
{
    match store.load(key).await? {
        Some(value) => serde_json::from_value(value).map_err(|source| StorageError::Decode {
            key: key.to_string(),
            source,
        }),
        None => Ok(T::default()),
    }
}

pub async fn store_document<T>(
    store: &dyn DocumentStore,
    key: &str,
    doc: &T,
) -> Result<(), StorageError>
where
    T: Serialize + ?Sized,
{
    let value = serde_json::to_value(doc).map_err(|source| StorageError::Encode {
        key: key.to_string(),
        source,
    })?;
    store.store(key, &value).await
}

fn validate_key(key: &str) -> Result<(), StorageError> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if valid {
        Ok(())
    } else {
        Err(StorageError::InvalidKey(key.to_string()))
    }
}

/// One JSON file per document under `root`, replaced atomically on write.
#[derive(Debug, Clone)]
pub struct FileDocumentStore {
    root: PathBuf,
}

impl FileDocumentStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.root.join(format!("{key}.json"))
    }
}

#[async_trait]
impl DocumentStore for FileDocumentStore {
    async fn load(&self, key: &str) -> Result<Option<JsonValue>, StorageError> {
        validate_key(key)?;
        let path = self.path_for(key);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StorageError::io("reading", &path, err)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|source| StorageError::Decode {
                key: key.to_string(),
                source,
            })
    }

    async fn store(&self, key: &str, value: &JsonValue) -> Result<(), StorageError> {
        validate_key(key)?;
        let bytes = serde_json::to_vec_pretty(value).map_err(|source| StorageError::Encode {
            key: key.to_string(),
            source,
        })?;
        write_atomically(&self.path_for(key), &bytes, WriteMode::Replace).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MemoryDocumentStore {
    docs: Mutex<HashMap<String, JsonValue>>,
}

impl MemoryDocumentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DocumentStore for MemoryDocumentStore {
    async fn load(&self, key: &str) -> Result<Option<JsonValue>, StorageError> {
        validate_key(key)?;
        Ok(self.docs.lock().await.get(key).cloned())
    }

    async fn store(&self, key: &str, value: &JsonValue) -> Result<(), StorageError> {
        validate_key(key)?;
        self.docs.lock().await.insert(key.to_string(), value.clone());
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WriteMode {
    /// Keep an existing file; content-addressed paths never change.
    KeepExisting,
    Replace,
}

/// Write through a sibling temp file and rename into place. Returns `false`
/// when `KeepExisting` found the target already present.
async fn write_atomically(
    target: &Path,
    bytes: &[u8],
    mode: WriteMode,
) -> Result<bool, StorageError> {
    let parent = target.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .map_err(|e| StorageError::io("creating directory", parent, e))?;

    if mode == WriteMode::KeepExisting
        && fs::try_exists(target)
            .await
            .map_err(|e| StorageError::io("checking", target, e))?
    {
        return Ok(false);
    }

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .map_err(|e| StorageError::io("opening temp file", &temp_path, e))?;
    file.write_all(bytes)
        .await
        .map_err(|e| StorageError::io("writing temp file", &temp_path, e))?;
    file.flush()
        .await
        .map_err(|e| StorageError::io("flushing temp file", &temp_path, e))?;
    drop(file);

    match fs::rename(&temp_path, target).await {
        Ok(()) => Ok(true),
        Err(err)
            if err.kind() == std::io::ErrorKind::AlreadyExists
                && mode == WriteMode::KeepExisting =>
        {
            let _ = fs::remove_file(&temp_path).await;
            Ok(false)
        }
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(StorageError::io("renaming temp file into", target, err))
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredArtifact {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Immutable, hash-addressed blob storage for downloaded assets.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn artifact_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        scope: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let month = fetched_at.format("%Y/%m").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(month)
            .join(scope)
            .join(format!("{content_hash}.{ext}"))
    }

    /// Store bytes under a content-hash path; identical bytes land on the same file.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        scope: &str,
        extension: &str,
        bytes: &[u8],
    ) -> Result<StoredArtifact, StorageError> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path =
            self.artifact_relative_path(fetched_at, scope, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);
        let written = write_atomically(&absolute_path, bytes, WriteMode::KeepExisting).await?;
        Ok(StoredArtifact {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated: !written,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
    pub per_scope_concurrency: usize,
    pub backoff: BackoffPolicy,
    /// How long a successful response may be served again for `CachePolicy::Use`.
    pub cache_ttl: Option<Duration>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_scope_concurrency: 2,
            backoff: BackoffPolicy::default(),
            cache_ttl: Some(Duration::from_secs(600)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CachePolicy {
    Use,
    Bypass,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("fetcher is shut down")]
    Closed,
}

#[derive(Debug)]
struct CachedResponse {
    stored_at: Instant,
    response: FetchedResponse,
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
    cache_ttl: Option<Duration>,
    cache: Mutex<HashMap<String, CachedResponse>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
            backoff: config.backoff,
            cache_ttl: config.cache_ttl.filter(|ttl| !ttl.is_zero()),
            cache: Mutex::new(HashMap::new()),
        })
    }

    async fn per_scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    async fn cached(&self, url: &str) -> Option<FetchedResponse> {
        let ttl = self.cache_ttl?;
        let cache = self.cache.lock().await;
        cache
            .get(url)
            .filter(|entry| entry.stored_at.elapsed() < ttl)
            .map(|entry| entry.response.clone())
    }

    /// GET `url` with bounded concurrency (global and per `scope`) and
    /// exponential backoff on retryable failures.
    pub async fn fetch_bytes(
        &self,
        scope: &str,
        url: &str,
        cache: CachePolicy,
    ) -> Result<FetchedResponse, FetchError> {
        if cache == CachePolicy::Use {
            if let Some(hit) = self.cached(url).await {
                debug!(scope, url, "serving cached response");
                return Ok(hit);
            }
        }

        let span = info_span!("http_fetch", scope, url);
        let response = self.fetch_with_retries(scope, url).instrument(span).await?;

        if self.cache_ttl.is_some() {
            self.cache.lock().await.insert(
                url.to_string(),
                CachedResponse {
                    stored_at: Instant::now(),
                    response: response.clone(),
                },
            );
        }
        Ok(response)
    }

    async fn fetch_with_retries(
        &self,
        scope: &str,
        url: &str,
    ) -> Result<FetchedResponse, FetchError> {
        let _global = self.global_limit.acquire().await.map_err(|_| FetchError::Closed)?;
        let per_scope = self.per_scope_semaphore(scope).await;
        let _scope = per_scope.acquire().await.map_err(|_| FetchError::Closed)?;

        let mut attempt = 0;
        loop {
            let retry_allowed = attempt < self.backoff.max_retries;
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let content_type = resp
                            .headers()
                            .get(CONTENT_TYPE)
                            .and_then(|v| v.to_str().ok())
                            .map(ToString::to_string);
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            content_type,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::NonRetryable || !retry_allowed {
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: final_url,
                        });
                    }
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable
                        || !retry_allowed
                    {
                        return Err(FetchError::Request(err));
                    }
                }
            }

            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use tempfile::tempdir;

    #[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
    struct Counter {
        hits: u32,
    }

    #[test]
    fn artifact_hashing_is_stable() {
        let hash = ArtifactStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn identical_assets_share_one_file() {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path());
        let fetched_at = DateTime::parse_from_rfc3339("2026-02-24T12:00:00Z")
            .expect("ts")
            .with_timezone(&Utc);

        let first = store
            .store_bytes(fetched_at, "feed_a", "jpg", b"\xff\xd8same")
            .await
            .expect("first store");
        let second = store
            .store_bytes(fetched_at, "feed_a", "jpg", b"\xff\xd8same")
            .await
            .expect("second store");

        assert!(!first.deduplicated);
        assert!(second.deduplicated);
        assert_eq!(first.relative_path, second.relative_path);
        assert!(first.relative_path.starts_with("2026/02/feed_a"));
        assert!(first.absolute_path.exists());
    }

    #[tokio::test]
    async fn file_documents_round_trip_and_replace() {
        let dir = tempdir().expect("tempdir");
        let store = FileDocumentStore::new(dir.path());

        let missing: Counter = load_document(&store, "counter").await.expect("load");
        assert_eq!(missing, Counter::default());

        store_document(&store, "counter", &Counter { hits: 1 }).await.expect("store");
        store_document(&store, "counter", &Counter { hits: 2 }).await.expect("replace");
        let loaded: Counter = load_document(&store, "counter").await.expect("load");
        assert_eq!(loaded.hits, 2);

        let leftovers = std::fs::read_dir(dir.path())
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn document_keys_cannot_escape_root() {
        let store = MemoryDocumentStore::new();
        let err = store.load("../etc/passwd").await.expect_err("must reject");
        assert!(matches!(err, StorageError::InvalidKey(_)));
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    #[test]
    fn retry_classification() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
    }
}
