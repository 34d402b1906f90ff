//! Alibaba Cloud OSS client over the OSS REST API using `reqwest`.
//!
//! Key mapping:
//!   Objects:  `{prefix}/{key}` in the configured bucket, addressed
//!             virtual-hosted style as `https://{bucket}.{endpoint}/{object}`.
//!
//! Requests are signed with OSS V4 (see [`super::signing`]). Access keys
//! come from `storage.credentials`, falling back to `OSS_ACCESS_KEY_ID` /
//! `OSS_ACCESS_KEY_SECRET` or `ALIBABA_CLOUD_ACCESS_KEY_ID` /
//! `ALIBABA_CLOUD_ACCESS_KEY_SECRET`.

use std::time::Duration;

use base64::Engine;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Method, StatusCode};
use tracing::{debug, info};

use super::backend::{
    PutObjectOptions, StorageClient, StorageFuture, StorageObjectResult, StorageProvider,
};
use super::body::{collect_pages, ByteSource, Page};
use super::config::StorageConfig;
use super::keys::{build_public_url, list_prefix, normalize_key, strip_prefix};
use super::signing;
use crate::config::EnvVars;
use crate::errors::{RuntimeError, StorageResult};

/// Upper bound on keys per list request.
const LIST_MAX_KEYS: &str = "1000";

/// Env var pairs consulted for access keys, in order.
const ENV_KEY_PAIRS: [(&str, &str); 2] = [
    ("OSS_ACCESS_KEY_ID", "OSS_ACCESS_KEY_SECRET"),
    ("ALIBABA_CLOUD_ACCESS_KEY_ID", "ALIBABA_CLOUD_ACCESS_KEY_SECRET"),
];

/// Env vars consulted for an STS security token, in order.
const ENV_SECURITY_TOKENS: [&str; 2] = ["OSS_SESSION_TOKEN", "ALIBABA_CLOUD_SECURITY_TOKEN"];

/// Access key pair plus optional STS token.
#[derive(Clone)]
struct OssCredentials {
    access_key_id: String,
    access_key_secret: String,
    security_token: Option<String>,
}

impl std::fmt::Debug for OssCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OssCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("security_token", &self.security_token.is_some())
            .finish_non_exhaustive()
    }
}

/// A request ready to be sent: absolute URL plus signed headers.
#[derive(Debug)]
struct SignedRequest {
    url: String,
    headers: Vec<(String, String)>,
}

/// Storage client for one OSS bucket.
pub struct OssStorageClient {
    client: reqwest::Client,
    /// `https` or `http`.
    scheme: String,
    /// Endpoint host without the bucket label, e.g. `oss-cn-hangzhou.aliyuncs.com`.
    endpoint_host: String,
    /// Region used in the signing scope, e.g. `cn-hangzhou`.
    region: String,
    bucket: String,
    credentials: OssCredentials,
    prefix: Option<String>,
    public_base_url: Option<String>,
}

/// `oss-cn-hangzhou` / `oss-cn-hangzhou-internal` -> `cn-hangzhou`.
fn signing_region(value: &str) -> String {
    let value = value.trim();
    let value = value.strip_prefix("oss-").unwrap_or(value);
    value.strip_suffix("-internal").unwrap_or(value).to_string()
}

/// Split a configured endpoint into `(scheme, host)`.
fn split_endpoint(endpoint: &str) -> StorageResult<(String, String)> {
    let with_scheme = if endpoint.contains("://") {
        endpoint.to_string()
    } else {
        format!("https://{endpoint}")
    };
    let url = reqwest::Url::parse(&with_scheme).map_err(|e| RuntimeError::InvalidStorageConfig {
        message: format!("oss endpoint {endpoint:?}: {e}"),
    })?;
    let host = url
        .host_str()
        .ok_or_else(|| RuntimeError::InvalidStorageConfig {
            message: format!("oss endpoint {endpoint:?} has no host"),
        })?;
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok((url.scheme().to_string(), host))
}

/// Region implied by an `oss-<region>.aliyuncs.com` endpoint host.
fn region_from_host(host: &str) -> Option<String> {
    let first = host.split('.').next()?;
    first.starts_with("oss-").then(|| signing_region(first))
}

fn resolve_credentials(config: &StorageConfig, env: &EnvVars) -> StorageResult<OssCredentials> {
    let configured = config.credentials();
    let security_token = configured
        .session_token
        .clone()
        .filter(|t| !t.is_empty())
        .or_else(|| {
            ENV_SECURITY_TOKENS
                .iter()
                .find_map(|name| env.non_empty(name).map(str::to_string))
        });

    if let Some((id, secret)) = configured.key_pair() {
        return Ok(OssCredentials {
            access_key_id: id.to_string(),
            access_key_secret: secret.to_string(),
            security_token,
        });
    }

    ENV_KEY_PAIRS
        .iter()
        .find_map(|(id_var, secret_var)| {
            Some(OssCredentials {
                access_key_id: env.non_empty(id_var)?.to_string(),
                access_key_secret: env.non_empty(secret_var)?.to_string(),
                security_token: security_token.clone(),
            })
        })
        .ok_or_else(|| RuntimeError::InvalidCredentials {
            provider: "OSS",
            message: "storage.credentials or OSS_ACCESS_KEY_ID/OSS_ACCESS_KEY_SECRET are required"
                .to_string(),
        })
}

impl OssStorageClient {
    pub async fn connect(config: &StorageConfig) -> StorageResult<Self> {
        Self::connect_with_env(config, &EnvVars::from_process())
    }

    /// Build a client, reading credential fallbacks from `env`.
    pub fn connect_with_env(config: &StorageConfig, env: &EnvVars) -> StorageResult<Self> {
        let target = config.target();
        let bucket = target
            .bucket
            .filter(|b| !b.is_empty())
            .ok_or(RuntimeError::MissingBucket { provider: "OSS" })?;

        let (scheme, endpoint_host, region) = match (&target.endpoint, &target.region) {
            (Some(endpoint), region) => {
                let (scheme, host) = split_endpoint(endpoint)?;
                let region = region
                    .as_deref()
                    .map(signing_region)
                    .or_else(|| region_from_host(&host))
                    .ok_or_else(|| RuntimeError::InvalidStorageConfig {
                        message: format!("oss region cannot be inferred from endpoint {host}"),
                    })?;
                (scheme, host, region)
            }
            (None, Some(region)) => {
                let region = signing_region(region);
                let host = format!("oss-{region}.aliyuncs.com");
                ("https".to_string(), host, region)
            }
            (None, None) => {
                return Err(RuntimeError::InvalidStorageConfig {
                    message: "oss requires region or endpoint".to_string(),
                })
            }
        };

        let credentials = resolve_credentials(config, env)?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        info!(
            "OSS storage client initialized: bucket={} endpoint={} region={} prefix='{}'",
            bucket,
            endpoint_host,
            region,
            config.prefix.as_deref().unwrap_or("")
        );

        Ok(Self {
            client,
            scheme,
            endpoint_host,
            region,
            bucket,
            credentials,
            prefix: config.prefix.clone(),
            public_base_url: target.public_base_url,
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    fn object_name(&self, key: &str) -> String {
        normalize_key(self.prefix.as_deref(), key)
    }

    /// Build the URL and signed headers for one request at `now`.
    ///
    /// `object` is `None` for bucket-level requests (listing).
    fn sign(
        &self,
        method: &Method,
        object: Option<&str>,
        query: &[(String, String)],
        mut headers: Vec<(String, String)>,
        now: DateTime<Utc>,
    ) -> SignedRequest {
        let timestamp = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date_stamp = now.format("%Y%m%d").to_string();

        headers.push(("x-oss-date".to_string(), timestamp.clone()));
        headers.push((
            "x-oss-content-sha256".to_string(),
            signing::UNSIGNED_PAYLOAD.to_string(),
        ));
        if let Some(token) = &self.credentials.security_token {
            headers.push(("x-oss-security-token".to_string(), token.clone()));
        }

        let encoded_object = object
            .map(|name| signing::uri_encode(name, false))
            .unwrap_or_default();
        let canonical_uri = format!("/{}/{}", self.bucket, encoded_object);
        let canonical_request =
            signing::build_canonical_request(method.as_str(), &canonical_uri, query, &headers);
        let scope = signing::credential_scope(&date_stamp, &self.region);
        let string_to_sign = signing::build_string_to_sign(&timestamp, &scope, &canonical_request);
        let key = signing::derive_signing_key(
            &self.credentials.access_key_secret,
            &date_stamp,
            &self.region,
        );
        let signature = signing::compute_signature(&key, &string_to_sign);
        headers.push((
            "authorization".to_string(),
            signing::authorization_header(&self.credentials.access_key_id, &scope, &signature),
        ));

        let mut url = format!(
            "{}://{}.{}/{}",
            self.scheme, self.bucket, self.endpoint_host, encoded_object
        );
        let query_string = signing::canonical_query_string(query);
        if !query_string.is_empty() {
            url.push('?');
            url.push_str(&query_string);
        }

        SignedRequest { url, headers }
    }

    async fn send(
        &self,
        method: Method,
        object: Option<&str>,
        query: &[(String, String)],
        headers: Vec<(String, String)>,
        body: Option<Bytes>,
    ) -> anyhow::Result<reqwest::Response> {
        let signed = self.sign(&method, object, query, headers, Utc::now());

        let mut header_map = HeaderMap::with_capacity(signed.headers.len());
        for (name, value) in &signed.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| anyhow::anyhow!("Invalid OSS header name {name}: {e}"))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| anyhow::anyhow!("Invalid OSS header value for {name}: {e}"))?;
            header_map.insert(name, value);
        }

        let mut req = self
            .client
            .request(method.clone(), &signed.url)
            .headers(header_map);
        if let Some(body) = body {
            req = req.body(body);
        }

        req.send()
            .await
            .map_err(|e| anyhow::anyhow!("OSS {method} request failed: {e}"))
    }

    /// Map an OSS error response to an anyhow error with context.
    async fn map_oss_error(context: &str, resp: reqwest::Response) -> anyhow::Error {
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        match parse_error_xml(&body) {
            Some((code, message)) => {
                anyhow::anyhow!("OSS {context}: {code}: {message} (HTTP {status})")
            }
            None => anyhow::anyhow!("OSS {context}: HTTP {status} - {body}"),
        }
    }

    async fn list_page(&self, prefix: &str, marker: Option<String>) -> anyhow::Result<Page> {
        let mut query = vec![("max-keys".to_string(), LIST_MAX_KEYS.to_string())];
        if !prefix.is_empty() {
            query.push(("prefix".to_string(), prefix.to_string()));
        }
        if let Some(marker) = marker {
            query.push(("marker".to_string(), marker));
        }

        debug!("OSS list: bucket={} prefix={}", self.bucket, prefix);

        let resp = self.send(Method::GET, None, &query, Vec::new(), None).await?;
        if !resp.status().is_success() {
            return Err(Self::map_oss_error("list", resp).await);
        }
        let body = resp
            .text()
            .await
            .map_err(|e| anyhow::anyhow!("OSS list: failed to read body: {e}"))?;
        parse_list_xml(&body)
    }
}

/// Parse `<ListBucketResult>` into a page of keys and the next marker.
fn parse_list_xml(body: &str) -> anyhow::Result<Page> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut names = Vec::new();
    let mut truncated = false;
    let mut next_marker = None;
    let mut current_tag = String::new();
    let mut in_contents = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
                if current_tag == "Contents" {
                    in_contents = true;
                }
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Contents" {
                    in_contents = false;
                }
                current_tag.clear();
            }
            Ok(Event::Text(ref e)) => {
                let text = e
                    .unescape()
                    .map_err(|err| anyhow::anyhow!("OSS list: malformed XML text: {err}"))?
                    .to_string();
                match current_tag.as_str() {
                    "Key" if in_contents => names.push(text),
                    "IsTruncated" => truncated = text == "true",
                    "NextMarker" => next_marker = Some(text),
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(anyhow::anyhow!("OSS list: malformed XML: {e}")),
            _ => {}
        }
    }

    Ok(Page {
        names,
        next: if truncated { next_marker } else { None },
    })
}

/// `(Code, Message)` from an OSS `<Error>` document.
fn parse_error_xml(body: &str) -> Option<(String, String)> {
    use quick_xml::events::Event;
    use quick_xml::Reader;

    let mut reader = Reader::from_str(body);
    reader.trim_text(true);

    let mut code = None;
    let mut message = String::new();
    let mut current_tag = String::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(ref e)) => {
                current_tag = String::from_utf8_lossy(e.name().as_ref()).to_string();
            }
            Ok(Event::End(_)) => current_tag.clear(),
            Ok(Event::Text(ref e)) => {
                let text = e.unescape().ok()?.to_string();
                match current_tag.as_str() {
                    "Code" => code = Some(text),
                    "Message" => message = text,
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(_) => return None,
            _ => {}
        }
    }

    code.map(|code| (code, message))
}

impl StorageClient for OssStorageClient {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Oss
    }

    fn get_object(&self, key: &str) -> StorageFuture<'_, Bytes> {
        let object_name = self.object_name(key);
        Box::pin(async move {
            debug!("OSS get: bucket={} name={}", self.bucket, object_name);

            let resp = self
                .send(Method::GET, Some(&object_name), &[], Vec::new(), None)
                .await?;
            if resp.status() == StatusCode::NOT_FOUND {
                return Err(anyhow::anyhow!("Object not found at storage key: {object_name}").into());
            }
            if !resp.status().is_success() {
                return Err(Self::map_oss_error("get", resp).await.into());
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
        let object_name = self.object_name(key);
        Box::pin(async move {
            debug!(
                "OSS put: bucket={} name={} size={}",
                self.bucket,
                object_name,
                body.len()
            );

            let content_md5 = base64::engine::general_purpose::STANDARD.encode(Md5::digest(&body));
            let mut headers = vec![
                (
                    "content-type".to_string(),
                    options
                        .content_type
                        .unwrap_or_else(|| "application/octet-stream".to_string()),
                ),
                ("content-md5".to_string(), content_md5),
            ];
            if let Some(cache_control) = options.cache_control {
                headers.push(("cache-control".to_string(), cache_control));
            }
            for (name, value) in options.metadata {
                headers.push((format!("x-oss-meta-{}", name.to_lowercase()), value));
            }

            let resp = self
                .send(Method::PUT, Some(&object_name), &[], headers, Some(body))
                .await?;
            if !resp.status().is_success() {
                return Err(Self::map_oss_error("put", resp).await.into());
            }

            Ok(StorageObjectResult {
                url: build_public_url(self.public_base_url.as_deref(), &object_name),
            })
        })
    }

    fn get_public_url(&self, key: &str) -> Option<String> {
        build_public_url(self.public_base_url.as_deref(), &self.object_name(key))
    }

    fn list_objects(&self, prefix: Option<&str>) -> StorageFuture<'_, Vec<String>> {
        let object_prefix = list_prefix(self.prefix.as_deref(), prefix);
        Box::pin(async move {
            let prefix_ref = object_prefix.as_str();
            let names = collect_pages(move |marker| self.list_page(prefix_ref, marker)).await?;
            Ok(names
                .iter()
                .map(|name| strip_prefix(self.prefix.as_deref(), name))
                .collect())
        })
    }

    fn delete_object(&self, key: &str) -> StorageFuture<'_, ()> {
        let object_name = self.object_name(key);
        Box::pin(async move {
            debug!("OSS delete: bucket={} name={}", self.bucket, object_name);

            // OSS answers 204 for missing objects too.
            let resp = self
                .send(Method::DELETE, Some(&object_name), &[], Vec::new(), None)
                .await?;
            if !resp.status().is_success() && resp.status() != StatusCode::NOT_FOUND {
                return Err(Self::map_oss_error("delete", resp).await.into());
            }
            Ok(())
        })
    }
}
