//! S3-compatible storage client (AWS S3 and Cloudflare R2).
//!
//! Key mapping:
//!   Objects:  `{prefix}/{key}` in the configured bucket.
//!
//! Credentials come from `storage.credentials` when both the key id and the
//! secret are set, otherwise from the standard AWS credential chain
//! (env vars, `~/.aws/credentials`, IAM role, etc.).

use std::collections::HashMap;

use aws_sdk_s3::Client;
use bytes::Bytes;
use tracing::{debug, info};

use super::backend::{
    PutObjectOptions, StorageClient, StorageFuture, StorageObjectResult, StorageProvider,
};
use super::body::{collect_pages, ByteSource, Page};
use super::config::StorageConfig;
use super::keys::{build_public_url, list_prefix, normalize_key, strip_prefix};
use crate::errors::{RuntimeError, StorageResult};

/// Region used for R2 when none is configured; R2 ignores it but SigV4 needs one.
const R2_DEFAULT_REGION: &str = "auto";

/// Storage client backed by the AWS S3 SDK.
///
/// R2 reuses this adapter; only the [`StorageProvider`] tag differs.
pub struct S3StorageClient {
    /// AWS S3 SDK client.
    client: Client,
    /// Tag reported by [`StorageClient::provider`].
    provider: StorageProvider,
    bucket: String,
    prefix: Option<String>,
    public_base_url: Option<String>,
}

impl S3StorageClient {
    /// Build an S3 client from the resolved target of `config`.
    ///
    /// Provider overrides (`r2.*`) are applied by [`StorageConfig::target`]
    /// before the SDK config is assembled.
    pub async fn connect(config: &StorageConfig) -> StorageResult<Self> {
        let target = config.target();
        let bucket = target
            .bucket
            .filter(|b| !b.is_empty())
            .ok_or(RuntimeError::MissingBucket {
                provider: config.provider.label(),
            })?;

        let region = target.region.or_else(|| {
            (config.provider == StorageProvider::R2).then(|| R2_DEFAULT_REGION.to_string())
        });

        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region) = region {
            config_loader = config_loader.region(aws_config::Region::new(region));
        }
        if let Some(ref endpoint) = target.endpoint {
            config_loader = config_loader.endpoint_url(endpoint);
        }

        let credentials = config.credentials();
        if let Some((ak, sk)) = credentials.key_pair() {
            let creds = aws_sdk_s3::config::Credentials::new(
                ak,
                sk,
                credentials.session_token.clone(),
                None, // expiry
                "runtime-storage-config",
            );
            config_loader = config_loader.credentials_provider(creds);
        }

        let sdk_config = config_loader.load().await;

        let use_path_style = config
            .s3
            .as_ref()
            .and_then(|s3| s3.force_path_style)
            .unwrap_or(false);
        let s3_config_builder =
            aws_sdk_s3::config::Builder::from(&sdk_config).force_path_style(use_path_style);

        let client = Client::from_conf(s3_config_builder.build());

        info!(
            "S3 storage client initialized: bucket={} prefix='{}' endpoint={}",
            bucket,
            config.prefix.as_deref().unwrap_or(""),
            target.endpoint.as_deref().unwrap_or("<default>")
        );

        Ok(Self {
            client,
            provider: StorageProvider::S3,
            bucket,
            prefix: config.prefix.clone(),
            public_base_url: target.public_base_url,
        })
    }

    /// Report a different provider tag (used for R2).
    pub fn tagged(mut self, provider: StorageProvider) -> Self {
        self.provider = provider;
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_key(&self, key: &str) -> String {
        normalize_key(self.prefix.as_deref(), key)
    }

    /// Map an AWS SDK error to an anyhow error with context.
    fn map_sdk_error(context: &str, err: impl std::fmt::Display) -> anyhow::Error {
        anyhow::anyhow!("AWS S3 {context}: {err}")
    }

    async fn list_page(&self, prefix: &str, token: Option<String>) -> anyhow::Result<Page> {
        debug!(
            "S3 list_objects_v2: bucket={} prefix={} token={:?}",
            self.bucket, prefix, token
        );

        let resp = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_prefix((!prefix.is_empty()).then(|| prefix.to_string()))
            .set_continuation_token(token)
            .send()
            .await
            .map_err(|e| Self::map_sdk_error("list_objects_v2", e.into_service_error()))?;

        let names = resp
            .contents()
            .iter()
            .filter_map(|obj| obj.key().map(str::to_string))
            .collect();
        let next = if resp.is_truncated().unwrap_or(false) {
            resp.next_continuation_token().map(str::to_string)
        } else {
            None
        };

        Ok(Page { names, next })
    }
}

impl StorageClient for S3StorageClient {
    fn provider(&self) -> StorageProvider {
        self.provider
    }

    fn get_object(&self, key: &str) -> StorageFuture<'_, Bytes> {
        let s3_key = self.object_key(key);
        Box::pin(async move {
            debug!("S3 get_object: bucket={} key={}", self.bucket, s3_key);

            let resp = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| {
                    let service_err = e.into_service_error();
                    if service_err.is_no_such_key() {
                        anyhow::anyhow!("Object not found at storage key: {s3_key}")
                    } else {
                        Self::map_sdk_error("get_object", service_err)
                    }
                })?;

            Ok(resp.body.drain().await?)
        })
    }

    fn put_object(
        &self,
        key: &str,
        body: Bytes,
        options: PutObjectOptions,
    ) -> StorageFuture<'_, StorageObjectResult> {
        let s3_key = self.object_key(key);
        Box::pin(async move {
            debug!(
                "S3 put_object: bucket={} key={} size={}",
                self.bucket,
                s3_key,
                body.len()
            );

            let metadata = (!options.metadata.is_empty()).then(|| {
                options
                    .metadata
                    .into_iter()
                    .collect::<HashMap<String, String>>()
            });

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .body(aws_sdk_s3::primitives::ByteStream::from(body))
                .set_content_type(options.content_type)
                .set_cache_control(options.cache_control)
                .set_metadata(metadata)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("put_object", e.into_service_error()))?;

            Ok(StorageObjectResult {
                url: build_public_url(self.public_base_url.as_deref(), &s3_key),
            })
        })
    }

    fn get_public_url(&self, key: &str) -> Option<String> {
        build_public_url(self.public_base_url.as_deref(), &self.object_key(key))
    }

    fn list_objects(&self, prefix: Option<&str>) -> StorageFuture<'_, Vec<String>> {
        let object_prefix = list_prefix(self.prefix.as_deref(), prefix);
        Box::pin(async move {
            let prefix_ref = object_prefix.as_str();
            let names = collect_pages(move |token| self.list_page(prefix_ref, token)).await?;
            Ok(names
                .iter()
                .map(|name| strip_prefix(self.prefix.as_deref(), name))
                .collect())
        })
    }

    fn delete_object(&self, key: &str) -> StorageFuture<'_, ()> {
        let s3_key = self.object_key(key);
        Box::pin(async move {
            debug!("S3 delete_object: bucket={} key={}", self.bucket, s3_key);

            // S3 delete_object is idempotent -- no error for missing keys.
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&s3_key)
                .send()
                .await
                .map_err(|e| Self::map_sdk_error("delete_object", e.into_service_error()))?;

            Ok(())
        })
    }
}
