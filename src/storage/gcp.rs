//! Google Cloud Storage client over the GCS JSON API using `reqwest`.
//!
//! Key mapping:
//!   Objects:  `{prefix}/{key}` in the configured bucket.
//!
//! Credentials are resolved once at construction, first match wins:
//!   - `storage.gcs.credentialsJson` (inline service-account or user key)
//!   - `GOOGLE_APPLICATION_CREDENTIALS` (path to a key file)
//!   - gcloud CLI auth (`gcloud auth application-default login`)
//!   - `GOOGLE_OAUTH_ACCESS_TOKEN` (pre-minted bearer token)
//!   - GCE metadata server (when running on Google Cloud)

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use bytes::{BufMut, Bytes, BytesMut};
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use super::backend::{
    PutObjectOptions, StorageClient, StorageFuture, StorageObjectResult, StorageProvider,
};
use super::body::{collect_pages, ByteSource, Page};
use super::config::StorageConfig;
use super::keys::{build_public_url, list_prefix, normalize_key, strip_prefix};
use crate::config::EnvVars;
use crate::errors::{RuntimeError, StorageResult};

/// GCS JSON API base URL.
const GCS_API_BASE: &str = "https://storage.googleapis.com";

/// Default OAuth2 token endpoint.
const GOOGLE_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

/// GCE metadata server token endpoint.
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";

/// OAuth2 scope requested for service-account tokens.
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

/// Boundary for `multipart/related` uploads.
const MULTIPART_BOUNDARY: &str = "runtime_storage_gcs_upload_boundary";

/// Seconds subtracted from a token's lifetime before it is refreshed.
const TOKEN_EXPIRY_MARGIN_SECS: u64 = 60;

// -- GCS JSON API types -------------------------------------------------------

#[derive(Debug, Deserialize)]
struct GcsObject {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsListResponse {
    items: Option<Vec<GcsObject>>,
    #[serde(rename = "nextPageToken")]
    next_page_token: Option<String>,
}

impl GcsListResponse {
    fn into_page(self) -> Page {
        Page {
            names: self
                .items
                .unwrap_or_default()
                .into_iter()
                .filter_map(|item| item.name)
                .collect(),
            next: self.next_page_token,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GcsObjectResource<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    content_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cache_control: Option<&'a str>,
    #[serde(skip_serializing_if = "is_empty_map")]
    metadata: &'a BTreeMap<String, String>,
}

fn is_empty_map(map: &&BTreeMap<String, String>) -> bool {
    map.is_empty()
}

#[derive(Debug, Deserialize)]
struct GcsErrorDetail {
    code: Option<u16>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GcsErrorResponse {
    error: Option<GcsErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<u64>,
}

// -- Credentials --------------------------------------------------------------

/// Contents of a Google credentials JSON file.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum CredentialsFile {
    ServiceAccount {
        client_email: String,
        private_key: String,
        token_uri: Option<String>,
    },
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
}

#[derive(Debug, Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

/// Where access tokens come from.
enum TokenSource {
    ServiceAccount {
        client_email: String,
        key: EncodingKey,
        token_uri: String,
    },
    AuthorizedUser {
        client_id: String,
        client_secret: String,
        refresh_token: String,
    },
    Static(String),
    MetadataServer,
}

impl TokenSource {
    fn describe(&self) -> &'static str {
        match self {
            TokenSource::ServiceAccount { .. } => "service_account",
            TokenSource::AuthorizedUser { .. } => "authorized_user",
            TokenSource::Static(_) => "static_token",
            TokenSource::MetadataServer => "metadata_server",
        }
    }

    fn from_credentials(creds: CredentialsFile) -> StorageResult<Self> {
        Ok(match creds {
            CredentialsFile::ServiceAccount {
                client_email,
                private_key,
                token_uri,
            } => TokenSource::ServiceAccount {
                key: EncodingKey::from_rsa_pem(private_key.as_bytes())
                    .map_err(|e| invalid_credentials(format!("bad private_key: {e}")))?,
                client_email,
                token_uri: token_uri.unwrap_or_else(|| GOOGLE_TOKEN_URI.to_string()),
            },
            CredentialsFile::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
            } => TokenSource::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
            },
        })
    }

    fn parse(json: &str, origin: &str) -> StorageResult<Self> {
        let creds: CredentialsFile = serde_json::from_str(json)
            .map_err(|e| invalid_credentials(format!("failed to parse {origin}: {e}")))?;
        Self::from_credentials(creds)
    }

    /// Resolve the token source for `inline` and the environment.
    async fn resolve(inline: Option<&Value>, env: &EnvVars) -> StorageResult<Self> {
        match inline {
            Some(Value::String(json)) if !json.trim().is_empty() => {
                return Self::parse(json, "gcs.credentialsJson");
            }
            Some(value @ Value::Object(_)) => {
                let creds: CredentialsFile = serde_json::from_value(value.clone())
                    .map_err(|e| invalid_credentials(format!("gcs.credentialsJson: {e}")))?;
                return Self::from_credentials(creds);
            }
            _ => {}
        }

        if let Some(path) = env.non_empty("GOOGLE_APPLICATION_CREDENTIALS") {
            let contents = tokio::fs::read_to_string(path).await.map_err(|e| {
                invalid_credentials(format!("failed to read key file {path}: {e}"))
            })?;
            return Self::parse(&contents, path);
        }

        let adc_path = application_default_credentials_path(env);
        if let Ok(true) = tokio::fs::try_exists(&adc_path).await {
            let contents = tokio::fs::read_to_string(&adc_path)
                .await
                .map_err(|e| invalid_credentials(format!("failed to read {adc_path}: {e}")))?;
            return Self::parse(&contents, &adc_path);
        }

        if let Some(token) = env.non_empty("GOOGLE_OAUTH_ACCESS_TOKEN") {
            return Ok(TokenSource::Static(token.to_string()));
        }

        Ok(TokenSource::MetadataServer)
    }
}

fn invalid_credentials(message: String) -> RuntimeError {
    RuntimeError::InvalidCredentials {
        provider: "GCS",
        message,
    }
}

/// Path to gcloud application-default credentials.
fn application_default_credentials_path(env: &EnvVars) -> String {
    if let Some(config_dir) = env.non_empty("CLOUDSDK_CONFIG") {
        return format!("{config_dir}/application_default_credentials.json");
    }
    if let Some(home) = env.non_empty("HOME") {
        return format!("{home}/.config/gcloud/application_default_credentials.json");
    }
    ".config/gcloud/application_default_credentials.json".to_string()
}

/// Cached access token with expiry.
struct CachedToken {
    access_token: String,
    expiry: Instant,
}

// -- Client -------------------------------------------------------------------

/// Storage client for one GCS bucket.
pub struct GcsStorageClient {
    /// HTTP client for GCS JSON API calls.
    client: reqwest::Client,
    /// API base; `storage.endpoint` points this at an emulator.
    api_base: String,
    bucket: String,
    project_id: Option<String>,
    prefix: Option<String>,
    public_base_url: Option<String>,
    token_source: TokenSource,
    /// Cached OAuth2 access token.
    token_cache: Mutex<Option<CachedToken>>,
}

impl GcsStorageClient {
    pub async fn connect(config: &StorageConfig) -> StorageResult<Self> {
        Self::connect_with_env(config, &EnvVars::from_process()).await
    }

    /// Build a client, reading credential variables from `env`.
    pub async fn connect_with_env(config: &StorageConfig, env: &EnvVars) -> StorageResult<Self> {
        let target = config.target();
        let bucket = target
            .bucket
            .filter(|b| !b.is_empty())
            .ok_or(RuntimeError::MissingBucket { provider: "GCS" })?;
        let gcs = config.gcs.clone().unwrap_or_default();

        let token_source = TokenSource::resolve(gcs.credentials_json.as_ref(), env).await?;

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300))
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to create HTTP client: {e}"))?;

        let api_base = target
            .endpoint
            .map(|e| e.trim_end_matches('/').to_string())
            .unwrap_or_else(|| GCS_API_BASE.to_string());

        info!(
            "GCS storage client initialized: bucket={} project={} prefix='{}' credentials={}",
            bucket,
            gcs.project_id.as_deref().unwrap_or("<default>"),
            config.prefix.as_deref().unwrap_or(""),
            token_source.describe()
        );

        Ok(Self {
            client,
            api_base,
            bucket,
            project_id: gcs.project_id,
            prefix: config.prefix.clone(),
            public_base_url: target.public_base_url,
            token_source,
            token_cache: Mutex::new(None),
        })
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn object_name(&self, key: &str) -> String {
        normalize_key(self.prefix.as_deref(), key)
    }

    /// Return a cached token, refreshing it when expired.
    async fn access_token(&self) -> anyhow::Result<String> {
        {
            let cache = self.token_cache.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(ref cached) = *cache {
                if cached.expiry > Instant::now() {
                    return Ok(cached.access_token.clone());
                }
            }
        }

        let (token, expires_in) = self.fetch_access_token().await?;
        let expiry =
            Instant::now() + Duration::from_secs(expires_in.saturating_sub(TOKEN_EXPIRY_MARGIN_SECS));

        let mut cache = self.token_cache.lock().unwrap_or_else(|e| e.into_inner());
        *cache = Some(CachedToken {
            access_token: token.clone(),
            expiry,
        });
        Ok(token)
    }

    async fn fetch_access_token(&self) -> anyhow::Result<(String, u64)> {
        match &self.token_source {
            TokenSource::Static(token) => Ok((token.clone(), 3600)),
            TokenSource::ServiceAccount {
                client_email,
                key,
                token_uri,
            } => {
                let now = chrono::Utc::now().timestamp();
                let claims = JwtClaims {
                    iss: client_email,
                    scope: STORAGE_SCOPE,
                    aud: token_uri,
                    iat: now,
                    exp: now + 3600,
                };
                let assertion = jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, key)
                    .map_err(|e| anyhow::anyhow!("Failed to sign service account JWT: {e}"))?;
                let form = [
                    ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                    ("assertion", assertion.as_str()),
                ];
                self.request_token(self.client.post(token_uri).form(&form), "JWT exchange")
                    .await
            }
            TokenSource::AuthorizedUser {
                client_id,
                client_secret,
                refresh_token,
            } => {
                let form = [
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("refresh_token", refresh_token.as_str()),
                    ("grant_type", "refresh_token"),
                ];
                self.request_token(self.client.post(GOOGLE_TOKEN_URI).form(&form), "token refresh")
                    .await
            }
            TokenSource::MetadataServer => {
                let req = self
                    .client
                    .get(METADATA_TOKEN_URL)
                    .header("Metadata-Flavor", "Google")
                    .timeout(Duration::from_secs(5));
                self.request_token(req, "metadata server").await.map_err(|e| {
                    anyhow::anyhow!(
                        "{e}. Set storage.gcs.credentialsJson, GOOGLE_APPLICATION_CREDENTIALS, \
                         or GOOGLE_OAUTH_ACCESS_TOKEN"
                    )
                })
            }
        }
    }

    async fn request_token(
        &self,
        req: reqwest::RequestBuilder,
        context: &str,
    ) -> anyhow::Result<(String, u64)> {
        let resp = req
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS {context} request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(anyhow::anyhow!("GCS {context} failed ({status}): {body}"));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("GCS {context}: malformed token response: {e}"))?;
        Ok((token.access_token, token.expires_in.unwrap_or(3600)))
    }

    async fn bearer(&self) -> anyhow::Result<String> {
        Ok(format!("Bearer {}", self.access_token().await?))
    }

    /// URL-encode a GCS object name for use in API paths.
    fn url_encode_object_name(name: &str) -> String {
        percent_encoding::utf8_percent_encode(name, percent_encoding::NON_ALPHANUMERIC).to_string()
    }

    fn object_url(&self, object_name: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.api_base,
            Self::url_encode_object_name(&self.bucket),
            Self::url_encode_object_name(object_name)
        )
    }

    /// Map a GCS HTTP error to an anyhow error with context.
    fn map_gcs_error(context: &str, status: StatusCode, body: &str) -> anyhow::Error {
        if let Ok(err_resp) = serde_json::from_str::<GcsErrorResponse>(body) {
            if let Some(err) = err_resp.error {
                return anyhow::anyhow!(
                    "GCS {}: {} (code {})",
                    context,
                    err.message.unwrap_or_default(),
                    err.code.unwrap_or(status.as_u16())
                );
            }
        }
        anyhow::anyhow!("GCS {context}: HTTP {status} - {body}")
    }

    /// Assemble a `multipart/related` body: JSON resource, then media.
    fn multipart_body(resource: &GcsObjectResource<'_>, media_type: &str, data: &[u8]) -> anyhow::Result<Bytes> {
        let json = serde_json::to_vec(resource)?;
        let mut body = BytesMut::with_capacity(json.len() + data.len() + 256);
        body.put_slice(format!("--{MULTIPART_BOUNDARY}\r\n").as_bytes());
        body.put_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
        body.put_slice(&json);
        body.put_slice(format!("\r\n--{MULTIPART_BOUNDARY}\r\n").as_bytes());
        body.put_slice(format!("Content-Type: {media_type}\r\n\r\n").as_bytes());
        body.put_slice(data);
        body.put_slice(format!("\r\n--{MULTIPART_BOUNDARY}--\r\n").as_bytes());
        Ok(body.freeze())
    }

    async fn list_page(&self, prefix: &str, token: Option<String>) -> anyhow::Result<Page> {
        let url = format!(
            "{}/storage/v1/b/{}/o",
            self.api_base,
            Self::url_encode_object_name(&self.bucket)
        );

        let mut query: Vec<(&str, String)> =
            vec![("fields", "items(name),nextPageToken".to_string())];
        if !prefix.is_empty() {
            query.push(("prefix", prefix.to_string()));
        }
        if let Some(token) = token {
            query.push(("pageToken", token));
        }

        debug!("GCS list: bucket={} prefix={}", self.bucket, prefix);

        let resp = self
            .client
            .get(&url)
            .header(AUTHORIZATION, self.bearer().await?)
            .query(&query)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("GCS list request failed: {e}"))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Self::map_gcs_error("list", status, &body));
        }

        let list: GcsListResponse = resp
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("GCS list: malformed response: {e}"))?;

        Ok(list.into_page())
    }
}

impl StorageClient for GcsStorageClient {
    fn provider(&self) -> StorageProvider {
        StorageProvider::Gcs
    }

    fn get_object(&self, key: &str) -> StorageFuture<'_, Bytes> {
        let object_name = self.object_name(key);
        Box::pin(async move {
            debug!("GCS download: bucket={} name={}", self.bucket, object_name);

            let resp = self
                .client
                .get(self.object_url(&object_name))
                .header(AUTHORIZATION, self.bearer().await?)
                .query(&[("alt", "media")])
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("GCS download request failed: {e}"))?;

            let status = resp.status();
            if status == StatusCode::NOT_FOUND {
                return Err(anyhow::anyhow!("Object not found at storage key: {object_name}").into());
            }
            if !status.is_success() {
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_gcs_error("download", status, &body).into());
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
                "GCS upload: bucket={} name={} size={}",
                self.bucket,
                object_name,
                body.len()
            );

            let resource = GcsObjectResource {
                name: &object_name,
                content_type: options.content_type.as_deref(),
                cache_control: options.cache_control.as_deref(),
                metadata: &options.metadata,
            };
            let media_type = options
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream");
            let payload = Self::multipart_body(&resource, media_type, &body)?;

            let url = format!(
                "{}/upload/storage/v1/b/{}/o",
                self.api_base,
                Self::url_encode_object_name(&self.bucket)
            );
            let resp = self
                .client
                .post(&url)
                .header(AUTHORIZATION, self.bearer().await?)
                .header(
                    CONTENT_TYPE,
                    format!("multipart/related; boundary={MULTIPART_BOUNDARY}"),
                )
                .query(&[("uploadType", "multipart")])
                .body(payload)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("GCS upload request failed: {e}"))?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_gcs_error("upload", status, &body).into());
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
            let names = collect_pages(move |token| self.list_page(prefix_ref, token)).await?;
            Ok(names
                .iter()
                .map(|name| strip_prefix(self.prefix.as_deref(), name))
                .collect())
        })
    }

    fn delete_object(&self, key: &str) -> StorageFuture<'_, ()> {
        let object_name = self.object_name(key);
        Box::pin(async move {
            debug!("GCS delete: bucket={} name={}", self.bucket, object_name);

            let resp = self
                .client
                .delete(self.object_url(&object_name))
                .header(AUTHORIZATION, self.bearer().await?)
                .send()
                .await
                .map_err(|e| anyhow::anyhow!("GCS delete request failed: {e}"))?;

            // Deleting a missing object is not an error.
            let status = resp.status();
            if !status.is_success() && status != StatusCode::NOT_FOUND {
                let body = resp.text().await.unwrap_or_default();
                return Err(Self::map_gcs_error("delete", status, &body).into());
            }

            Ok(())
        })
    }
}

impl std::fmt::Debug for GcsStorageClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GcsStorageClient")
            .field("bucket", &self.bucket)
            .field("project_id", &self.project_id)
            .field("prefix", &self.prefix)
            .field("credentials", &self.token_source.describe())
            .finish()
    }
}
