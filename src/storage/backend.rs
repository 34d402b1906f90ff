//! Uniform storage client contract.
//!
//! Every provider adapter implements [`StorageClient`].  Callers work in
//! terms of caller keys (without the configured prefix) and owned byte
//! buffers, so they never branch on the provider.

use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

use bytes::Bytes;

pub use super::config::{BlobAccess, StorageProvider};
use crate::errors::StorageResult;

/// Boxed future returned by every async [`StorageClient`] operation.
pub type StorageFuture<'a, T> = Pin<Box<dyn Future<Output = StorageResult<T>> + Send + 'a>>;

/// Optional attributes for [`StorageClient::put_object`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PutObjectOptions {
    pub content_type: Option<String>,
    pub cache_control: Option<String>,
    /// User metadata stored alongside the object.
    pub metadata: BTreeMap<String, String>,
    /// Vercel Blob access level; other providers ignore it.
    pub access: Option<BlobAccess>,
}

impl PutObjectOptions {
    pub fn content_type(mut self, value: impl Into<String>) -> Self {
        self.content_type = Some(value.into());
        self
    }

    pub fn cache_control(mut self, value: impl Into<String>) -> Self {
        self.cache_control = Some(value.into());
        self
    }

    pub fn metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Result of a successful upload.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageObjectResult {
    /// Public URL of the object, when one can be derived.
    pub url: Option<String>,
}

/// Async object storage contract.
pub trait StorageClient: Send + Sync + 'static {
    /// Which provider backs this client.
    fn provider(&self) -> StorageProvider;

    /// Read the full object at `key`.
    fn get_object(&self, key: &str) -> StorageFuture<'_, Bytes>;

    /// Write `body` to `key`.
    fn put_object(
        &self,
        key: &str,
        body: Bytes,
        options: PutObjectOptions,
    ) -> StorageFuture<'_, StorageObjectResult>;

    /// Public URL for `key`. Pure; never touches the network.
    fn get_public_url(&self, key: &str) -> Option<String>;

    /// Every key under `prefix`, with the configured prefix stripped.
    fn list_objects(&self, prefix: Option<&str>) -> StorageFuture<'_, Vec<String>>;

    /// Delete `key`. Deleting a missing key succeeds.
    fn delete_object(&self, key: &str) -> StorageFuture<'_, ()>;
}
