//! Client construction, caching, and per-operation instrumentation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use metrics::counter;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::aws::S3StorageClient;
use super::backend::{
    PutObjectOptions, StorageClient, StorageFuture, StorageObjectResult, StorageProvider,
};
use super::config::{StorageConfig, StorageFingerprint};
use super::gcp::GcsStorageClient;
use super::oss::OssStorageClient;
use super::vercel::VercelBlobClient;
use crate::cache::LruCache;
use crate::errors::{RuntimeError, StorageResult};
use crate::metrics::{
    record_operation, STORAGE_BYTES_DOWNLOADED_TOTAL, STORAGE_BYTES_UPLOADED_TOTAL,
    STORAGE_CLIENTS_CREATED_TOTAL, STORAGE_CLIENT_CACHE_HITS_TOTAL,
};

/// Default number of distinct clients kept alive.
pub const DEFAULT_CLIENT_CACHE_CAPACITY: usize = 64;

/// Wraps a provider client with metrics and an optional deadline.
pub struct MeteredClient {
    inner: Arc<dyn StorageClient>,
    timeout: Option<Duration>,
}

impl MeteredClient {
    pub fn new(inner: Arc<dyn StorageClient>, timeout: Option<Duration>) -> Self {
        Self { inner, timeout }
    }

    async fn run<T>(&self, operation: &'static str, fut: StorageFuture<'_, T>) -> StorageResult<T> {
        let provider = self.inner.provider().as_str();
        let start = Instant::now();

        let result = match self.timeout {
            Some(after) => match tokio::time::timeout(after, fut).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("Storage {} {} timed out after {:?}", provider, operation, after);
                    Err(RuntimeError::Timeout { operation, after })
                }
            },
            None => fut.await,
        };

        if let Err(ref e) = result {
            debug!("Storage {} {} failed: {}", provider, operation, e);
        }
        record_operation(provider, operation, result.is_ok(), start.elapsed());
        result
    }
}

impl StorageClient for MeteredClient {
    fn provider(&self) -> StorageProvider {
        self.inner.provider()
    }

    fn get_object(&self, key: &str) -> StorageFuture<'_, Bytes> {
        let fut = self.inner.get_object(key);
        Box::pin(async move {
            let data = self.run("get_object", fut).await?;
            counter!(STORAGE_BYTES_DOWNLOADED_TOTAL, "provider" => self.provider().as_str())
                .increment(data.len() as u64);
            Ok(data)
        })
    }

    fn put_object(
        &self,
        key: &str,
        body: Bytes,
        options: PutObjectOptions,
    ) -> StorageFuture<'_, StorageObjectResult> {
        let size = body.len() as u64;
        let fut = self.inner.put_object(key, body, options);
        Box::pin(async move {
            let result = self.run("put_object", fut).await?;
            counter!(STORAGE_BYTES_UPLOADED_TOTAL, "provider" => self.provider().as_str())
                .increment(size);
            Ok(result)
        })
    }

    fn get_public_url(&self, key: &str) -> Option<String> {
        self.inner.get_public_url(key)
    }

    fn list_objects(&self, prefix: Option<&str>) -> StorageFuture<'_, Vec<String>> {
        let fut = self.inner.list_objects(prefix);
        Box::pin(async move { self.run("list_objects", fut).await })
    }

    fn delete_object(&self, key: &str) -> StorageFuture<'_, ()> {
        let fut = self.inner.delete_object(key);
        Box::pin(async move { self.run("delete_object", fut).await })
    }
}

/// Build an uncached client for `config`.
///
/// Construction fails fast on configuration errors (missing bucket,
/// unusable credentials) rather than on first use.
pub async fn create_client(config: &StorageConfig) -> StorageResult<Arc<dyn StorageClient>> {
    let client: Arc<dyn StorageClient> = match config.provider {
        StorageProvider::S3 => Arc::new(S3StorageClient::connect(config).await?),
        StorageProvider::R2 => Arc::new(
            S3StorageClient::connect(config)
                .await?
                .tagged(StorageProvider::R2),
        ),
        StorageProvider::Gcs => Arc::new(GcsStorageClient::connect(config).await?),
        StorageProvider::Oss => Arc::new(OssStorageClient::connect(config).await?),
        StorageProvider::Vercel => Arc::new(VercelBlobClient::connect(config).await?),
    };

    counter!(STORAGE_CLIENTS_CREATED_TOTAL, "provider" => config.provider.as_str()).increment(1);
    Ok(Arc::new(MeteredClient::new(client, config.timeout())))
}

/// Bounded cache of storage clients keyed by [`StorageFingerprint`].
pub struct StorageFactory {
    cache: Mutex<LruCache<StorageFingerprint, Arc<dyn StorageClient>>>,
}

impl Default for StorageFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageFactory {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CLIENT_CACHE_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Return the cached client for `config`'s fingerprint, building it on a miss.
    ///
    /// The cache lock is held while building so concurrent callers with the
    /// same fingerprint share one instance.
    pub async fn client(&self, config: &StorageConfig) -> StorageResult<Arc<dyn StorageClient>> {
        let fingerprint = config.fingerprint();
        let mut cache = self.cache.lock().await;

        if let Some(hit) = cache.get(&fingerprint) {
            counter!(STORAGE_CLIENT_CACHE_HITS_TOTAL, "provider" => config.provider.as_str())
                .increment(1);
            return Ok(hit);
        }

        let client = create_client(config).await?;
        cache.insert(fingerprint, Arc::clone(&client));
        Ok(client)
    }

    pub async fn cached_len(&self) -> usize {
        self.cache.lock().await.len()
    }

    /// Drop every cached client, e.g. after rotating credentials.
    pub async fn clear(&self) {
        self.cache.lock().await.clear();
    }
}
