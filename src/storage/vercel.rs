//! Vercel Blob client over the Blob HTTP API using `reqwest`.
//!
//! Objects are addressed by pathname (`{prefix}/{key}`) for uploads,
//! listing and deletes. Reads go through the blob's public URL, so
//! `get_object` needs `publicBaseUrl` or a full URL key.
//!
//! The bearer token comes from `storage.vercel.token`, falling back to
//! `BLOB_READ_WRITE_TOKEN`.

use std::time::Duration;

use bytes::Bytes;
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::AUTHORIZATION;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::backend::{
    BlobAccess, PutObjectOptions, StorageClient, StorageFuture, StorageObjectResult,
    StorageProvider,
};
use super::body::{collect_pages, ByteSource, Page};
use super::config::StorageConfig;
use super::keys::{build_public_url, is_url, list_prefix, normalize_key, strip_prefix};
use crate::config::EnvVars;
use crate::errors::{RuntimeError, StorageResult};

/// Default Blob API base URL.
pub const VERCEL_BLOB_API_URL: &str = "https://blob.vercel-storage.com";

/// Blob API version sent with every request.
const API_VERSION: &str = "7";

/// Characters escaped in an upload pathname; `/` keeps separating segments.
const PATHNAME: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~')
    .remove(b'/');

/// Page size for list requests.
const LIST_LIMIT: &str = "1000";

#[derive(Debug, Deserialize)]
struct PutBlobResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct ListedBlob {
    pathname: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListBlobResponse {
    #[serde(default)]
    blobs: Vec<ListedBlob>,
    cursor: Option<String>,
    #[serde(default)]
    has_more: bool,
}

#[derive(Debug, Serialize)]
struct DeleteRequest<'a> {
    urls: [&'a str; 1],
}

#[derive(Debug, Deserialize)]
struct BlobErrorDetail {
    code: Option<String>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BlobErrorResponse {
    error: Option<BlobErrorDetail>,
}

/// `max-age=N` seconds from a `Cache-Control` value.
fn cache_max_age(cache_control: &str) -> Option<u64> {
    cache_control.split(',').find_map(|directive| {
        let (name, value) = directive.trim().split_once('=')?;
        name.trim()
            .eq_ignore_ascii_case("max-age")
            .then(|| value.trim().parse().ok())
            .flatten()
    })
}

/// Storage client for one Vercel Blob store.
pub struct VercelBlobClient {
    client: reqwest::Client,
    api_url: String,
    token: String,
    access: BlobAccess,
    prefix: Option<String>,
    public_base_url: Option<String>,
}

impl VercelBlobClient {
    pub async fn connect(config: &StorageConfig) -> StorageResult<Self> {
        Self::connect_with_env(config, &EnvVars::from_process())
    }

    pub fn connect_with_env(config: &StorageConfig, env: &EnvVars) -> StorageResult<Self> {
        let vercel = config.vercel.clone().unwrap_or_default();

        let token = vercel
            .token
            .filter(|t| !t.is_empty())
            .or_else(|| env.non_empty("BLOB_READ_WRITE_TOKEN").map(str::to_string))
            .ok_or_else(|| RuntimeError::InvalidCredentials {
                provider: "Vercel Blob",
                message: "storage.vercel.token or BLOB_READ_WRITE_TOKEN is required".to_string(),
            })?;

        let api_url = vercel
            .api_url
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| VERCEL_BLOB_API_URL.to_string())
            .trim_end_matches('/')
            .to_string();

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        info!(
            "Vercel Blob client initialized: api={} access={} prefix='{}'",
            api_url,
            vercel.access.unwrap_or_default().as_str(),
            config.prefix.as_deref().unwrap_or("")
        );

        Ok(Self {
            client,
            api_url,
            token,
            access: vercel.access.unwrap_or_default(),
            prefix: config.prefix.clone(),
            public_base_url: config.target().public_base_url,
        })
    }

    fn object_key(&self, key: &str) -> String {
        normalize_key(self.prefix.as_deref(), key)
    }

    /// Upload endpoint for `pathname`, percent-encoded so `?`, `#` and `%`
    /// stay part of the path.
    fn upload_url(&self, pathname: &str) -> String {
        format!("{}/{}", self.api_url, utf8_percent_encode(pathname, PATHNAME))
    }

    fn bearer(&self) -> String {
        format!("Bearer {}", self.token)
    }

    /// URL to read `key` from: the key itself when it is a URL, otherwise
    /// the public base URL joined with the object key.
    fn read_url(&self, key: &str) -> StorageResult<String> {
        if is_url(key) {
            return Ok(key.to_string());
        }
        let object_key = self.object_key(key);
        if is_url(&object_key) {
            return Ok(object_key);
        }
        build_public_url(self.public_base_url.as_deref(), &object_key).ok_or(
            RuntimeError::MissingPublicUrl {
                provider: "Vercel Blob",
                operation: "get_object",
            },
        )
    }

    /// Map a Blob API error response to an anyhow error with context.
    async fn map_blob_error(context: &str, resp: reqwest::Response) -> anyhow::Error {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if let Ok(BlobErrorResponse { error: Some(err) }) = serde_json::from_str(&body) {
            return anyhow::anyhow!(
                "Vercel Blob {}: {} ({})",
                context,
                err.message.unwrap_or_default(),
                err.code.unwrap_or_else(|| status.as_u16().to_string())
            );
        }
        anyhow::anyhow!("Vercel Blob {context}: HTTP {status} - {body}")
    }

    async fn list_page(&self, prefix: &str, cursor: Option<String>) -> anyhow::Result<Page> {
        let mut query = vec![("limit", LIST_LIMIT.to_string())];
        if !prefix.is_empty() {
            query.push(("prefix", prefix.to_string()));
        }
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        debug!("Vercel Blob list: prefix={}", prefix);

        let resp = self
            .client
            .get(&self.api_url)
            .header(AUTHORIZATION, self.bearer())
            .header("x-api-version", API_VERSION)
            .query(&query)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("Vercel Blob list request failed: {e}"))?;

        if !resp.status().is_success() {
            return Err(Self::map_blob_error("list", resp).await);
        }

        let list: ListBlobResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("Vercel Blob list: malformed response: {e}"))?;

        Ok(Page {
            names: list.blobs.into_iter().map(|blob| blob.pathname).collect(),
            next: if list.has_more { list.cursor } else { None },
        })
    }
}

impl StorageClient for VercelBlobClient {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Vercel
    }

    fn get_object(&self, key: &str) -> StorageFuture<'_, Bytes> {
        let url = self.read_url(key);
        Box::pin(async move {
            let url = url?;
            debug!("Vercel Blob get: url={}", url);

            let mut req = self.client.get(&url);
            if self.access == BlobAccess::Private {
                req = req.header(AUTHORIZATION, self.bearer());
            }
            let resp = req
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Vercel Blob get request failed: {e}"))?;

            if resp.status() == StatusCode::NOT_FOUND {
                return Err(anyhow::anyhow!("Object not found at url: {url}").into());
            }
            if !resp.status().is_success() {
                return Err(Self::map_blob_error("get", resp).await.into());
            }

            Ok(resp.drain().await?)
        })
    }

    fn put_object(
        &self,
        key: &str,
        body: Bytes,
        options: PutObjectOptions,
    ) -> StorageFuture<'_, StorageObjectResult> {
        let pathname = self.object_key(key);
        Box::pin(async move {
            debug!("Vercel Blob put: pathname={} size={}", pathname, body.len());

            let access = options.access.unwrap_or(self.access);
            let mut req = self
                .client
                .put(self.upload_url(&pathname))
                .header(AUTHORIZATION, self.bearer())
                .header("x-api-version", API_VERSION)
                .header("x-vercel-blob-access", access.as_str())
                .header("x-add-random-suffix", "0");
            if let Some(content_type) = &options.content_type {
                req = req.header("x-content-type", content_type.as_str());
            }
            if let Some(max_age) = options.cache_control.as_deref().and_then(cache_max_age) {
                req = req.header("x-cache-control-max-age", max_age.to_string());
            }

            let resp = req
                .body(body)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Vercel Blob put request failed: {e}"))?;

            if !resp.status().is_success() {
                return Err(Self::map_blob_error("put", resp).await.into());
            }

            let put: PutBlobResponse = resp
                .json()
                .await
                .map_err(|e| anyhow::anyhow!("Vercel Blob put: malformed response: {e}"))?;

            Ok(StorageObjectResult { url: Some(put.url) })
        })
    }

    fn get_public_url(&self, key: &str) -> Option<String> {
        build_public_url(self.public_base_url.as_deref(), &self.object_key(key))
    }

    fn list_objects(&self, prefix: Option<&str>) -> StorageFuture<'_, Vec<String>> {
        let object_prefix = list_prefix(self.prefix.as_deref(), prefix);
        Box::pin(async move {
            let prefix_ref = object_prefix.as_str();
            let names = collect_pages(move |cursor| self.list_page(prefix_ref, cursor)).await?;
            Ok(names
                .iter()
                .map(|name| strip_prefix(self.prefix.as_deref(), name))
                .collect())
        })
    }

    fn delete_object(&self, key: &str) -> StorageFuture<'_, ()> {
        let target = if is_url(key) {
            key.to_string()
        } else {
            let object_key = self.object_key(key);
            build_public_url(self.public_base_url.as_deref(), &object_key).unwrap_or(object_key)
        };
        Box::pin(async move {
            debug!("Vercel Blob delete: {}", target);

            // Deleting a missing blob is a no-op on the service side.
            let resp = self
                .client
                .post(format!("{}/delete", self.api_url))
                .header(AUTHORIZATION, self.bearer())
                .header("x-api-version", API_VERSION)
                .json(&DeleteRequest { urls: [target.as_str()] })
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("Vercel Blob delete request failed: {e}"))?;

            if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
                return Err(Self::map_blob_error("delete", resp).await.into());
            }
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::config::VercelOptions;

    fn config(public_base_url: Option<&str>) -> StorageConfig {
        let mut config = StorageConfig::new(StorageProvider::Vercel);
        config.prefix = Some("media".to_string());
        config.public_base_url = public_base_url.map(str::to_string);
        config.vercel = Some(VercelOptions {
            token: Some("vercel_blob_rw_test".to_string()),
            access: None,
            api_url: Some("http://127.0.0.1:3001/".to_string()),
        });
        config
    }

    #[test]
    fn test_connect_defaults() {
        let client = VercelBlobClient::connect_with_env(&config(None), &EnvVars::default()).unwrap();
        assert_eq!(client.api_url, "http://127.0.0.1:3001");
        assert_eq!(client.access, BlobAccess::Public);
        assert_eq!(client.provider(), StorageProvider::Vercel);
    }

    #[test]
    fn test_token_from_env_or_error() {
        let mut cfg = config(None);
        cfg.vercel.as_mut().unwrap().token = None;
        assert!(matches!(
            VercelBlobClient::connect_with_env(&cfg, &EnvVars::default()),
            Err(RuntimeError::InvalidCredentials { .. })
        ));

        let env = EnvVars::from_pairs([("BLOB_READ_WRITE_TOKEN", "from-env")]);
        let client = VercelBlobClient::connect_with_env(&cfg, &env).unwrap();
        assert_eq!(client.bearer(), "Bearer from-env");
    }

    #[test]
    fn test_read_url_requires_public_base() {
        let client = VercelBlobClient::connect_with_env(&config(None), &EnvVars::default()).unwrap();
        assert!(matches!(
            client.read_url("a.jpg"),
            Err(RuntimeError::MissingPublicUrl {
                provider: "Vercel Blob",
                operation: "get_object"
            })
        ));
        assert_eq!(
            client
                .read_url("https://store.public.blob.vercel-storage.com/media/a.jpg")
                .unwrap(),
            "https://store.public.blob.vercel-storage.com/media/a.jpg"
        );
    }

    #[test]
    fn test_read_url_from_public_base() {
        let client = VercelBlobClient::connect_with_env(
            &config(Some("https://store.public.blob.vercel-storage.com/")),
            &EnvVars::default(),
        )
        .unwrap();
        assert_eq!(
            client.read_url("/a.jpg").unwrap(),
            "https://store.public.blob.vercel-storage.com/media/a.jpg"
        );
        assert_eq!(
            client.get_public_url("a.jpg").as_deref(),
            Some("https://store.public.blob.vercel-storage.com/media/a.jpg")
        );
    }

    #[tokio::test]
    async fn test_get_object_without_url_fails_before_network() {
        let client = VercelBlobClient::connect_with_env(&config(None), &EnvVars::default()).unwrap();
        let err = client.get_object("a.jpg").await.unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_upload_url_encodes_pathname() {
        let client = VercelBlobClient::connect_with_env(&config(None), &EnvVars::default()).unwrap();
        let pathname = client.object_key("/photos/a b?#%.jpg");
        assert_eq!(
            client.upload_url(&pathname),
            "http://127.0.0.1:3001/media/photos/a%20b%3F%23%25.jpg"
        );
        assert_eq!(
            client.upload_url("media/café.png"),
            "http://127.0.0.1:3001/media/caf%C3%A9.png"
        );
    }

    #[test]
    fn test_cache_max_age() {
        assert_eq!(cache_max_age("public, max-age=31536000, immutable"), Some(31536000));
        assert_eq!(cache_max_age("MAX-AGE = 60"), Some(60));
        assert_eq!(cache_max_age("no-store"), None);
        assert_eq!(cache_max_age("max-age=abc"), None);
    }

    #[test]
    fn test_list_response_parsing() {
        let list: ListBlobResponse = serde_json::from_str(
            r#"{"blobs":[{"pathname":"media/a.jpg","url":"https://x/media/a.jpg","size":1}],
                "cursor":"c1","hasMore":true}"#,
        )
        .unwrap();
        assert_eq!(list.blobs[0].pathname, "media/a.jpg");
        assert_eq!(list.cursor.as_deref(), Some("c1"));
        assert!(list.has_more);

        let last: ListBlobResponse = serde_json::from_str(r#"{"blobs":[]}"#).unwrap();
        assert!(!last.has_more);
        assert_eq!(last.cursor, None);
    }
}
