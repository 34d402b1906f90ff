//! Typed `storage` section of the runtime config.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::errors::RuntimeError;

/// Object storage backends the facade can construct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageProvider {
    S3,
    R2,
    Gcs,
    Oss,
    Vercel,
}

impl StorageProvider {
    pub const ALL: [StorageProvider; 5] = [
        StorageProvider::S3,
        StorageProvider::R2,
        StorageProvider::Gcs,
        StorageProvider::Oss,
        StorageProvider::Vercel,
    ];

    /// Identifier used in YAML and metric labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            StorageProvider::S3 => "s3",
            StorageProvider::R2 => "r2",
            StorageProvider::Gcs => "gcs",
            StorageProvider::Oss => "oss",
            StorageProvider::Vercel => "vercel",
        }
    }

    /// Human-facing name used in error messages.
    pub fn label(&self) -> &'static str {
        match self {
            StorageProvider::S3 => "S3",
            StorageProvider::R2 => "R2",
            StorageProvider::Gcs => "GCS",
            StorageProvider::Oss => "OSS",
            StorageProvider::Vercel => "Vercel Blob",
        }
    }

    /// Case-insensitive lookup of a provider identifier.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL
            .into_iter()
            .find(|p| p.as_str().eq_ignore_ascii_case(value))
    }
}

impl fmt::Display for StorageProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Vercel Blob access level.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlobAccess {
    #[default]
    Public,
    Private,
}

impl BlobAccess {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlobAccess::Public => "public",
            BlobAccess::Private => "private",
        }
    }
}

/// Static access keys shared by the S3, R2 and OSS adapters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageCredentials {
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub session_token: Option<String>,
}

impl StorageCredentials {
    /// `(key id, secret)` when both are present and non-empty.
    pub fn key_pair(&self) -> Option<(&str, &str)> {
        match (self.access_key_id.as_deref(), self.secret_access_key.as_deref()) {
            (Some(id), Some(secret)) if !id.is_empty() && !secret.is_empty() => Some((id, secret)),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Options {
    pub force_path_style: Option<bool>,
}

/// Per-provider replacements for the generic target fields (`r2`, `oss`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetOverrides {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub public_base_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GcsOptions {
    pub project_id: Option<String>,
    pub bucket: Option<String>,
    pub public_base_url: Option<String>,
    /// Inline service-account or authorized-user key, as a JSON string or mapping.
    pub credentials_json: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VercelOptions {
    pub token: Option<String>,
    pub access: Option<BlobAccess>,
    pub api_url: Option<String>,
}

/// The `storage` mapping of a [`crate::config::RuntimeConfig`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    pub provider: StorageProvider,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    pub public_base_url: Option<String>,
    pub credentials: Option<StorageCredentials>,
    /// Per-operation deadline in milliseconds. Unset means no deadline.
    pub timeout_ms: Option<u64>,
    pub s3: Option<S3Options>,
    pub r2: Option<TargetOverrides>,
    pub gcs: Option<GcsOptions>,
    pub oss: Option<TargetOverrides>,
    pub vercel: Option<VercelOptions>,
}

/// Bucket/region/endpoint/public URL after provider overrides are applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StorageTarget {
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub public_base_url: Option<String>,
}

/// Cache identity of a constructed client.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageFingerprint {
    pub provider: StorageProvider,
    pub bucket: Option<String>,
    pub region: Option<String>,
    pub endpoint: Option<String>,
    pub prefix: Option<String>,
    pub public_base_url: Option<String>,
    /// Vercel Blob only: API URL and a SHA-256 digest of the configured
    /// token. Blob stores are selected by token, not by bucket.
    pub blob_store: Option<String>,
}

impl StorageConfig {
    /// A config with only `provider` set.
    pub fn new(provider: StorageProvider) -> Self {
        Self {
            provider,
            bucket: None,
            region: None,
            endpoint: None,
            prefix: None,
            public_base_url: None,
            credentials: None,
            timeout_ms: None,
            s3: None,
            r2: None,
            gcs: None,
            oss: None,
            vercel: None,
        }
    }

    /// Validate and deserialize the raw `storage` value.
    ///
    /// `provider` must be a string naming one of [`StorageProvider::ALL`].
    pub fn from_value(value: &Value) -> Result<Self, RuntimeError> {
        let Value::Object(map) = value else {
            return Err(RuntimeError::MissingStorageConfig);
        };

        let provider = match map.get("provider") {
            Some(Value::String(provider)) if !provider.trim().is_empty() => provider,
            _ => return Err(RuntimeError::MissingProvider),
        };
        let provider =
            StorageProvider::parse(provider).ok_or_else(|| RuntimeError::UnsupportedProvider {
                provider: provider.clone(),
            })?;

        let mut map = map.clone();
        map.insert(
            "provider".to_string(),
            Value::String(provider.as_str().to_string()),
        );
        serde_json::from_value(Value::Object(map)).map_err(|e| RuntimeError::InvalidStorageConfig {
            message: e.to_string(),
        })
    }

    /// Generic fields with the provider's own sub-object layered on top.
    pub fn target(&self) -> StorageTarget {
        let generic = StorageTarget {
            bucket: self.bucket.clone(),
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            public_base_url: self.public_base_url.clone(),
        };

        let overrides = match self.provider {
            StorageProvider::R2 => self.r2.as_ref(),
            StorageProvider::Oss => self.oss.as_ref(),
            StorageProvider::Gcs => {
                let Some(gcs) = &self.gcs else {
                    return generic;
                };
                return StorageTarget {
                    bucket: gcs.bucket.clone().or(generic.bucket),
                    public_base_url: gcs.public_base_url.clone().or(generic.public_base_url),
                    ..generic
                };
            }
            StorageProvider::S3 | StorageProvider::Vercel => None,
        };

        match overrides {
            Some(o) => StorageTarget {
                bucket: o.bucket.clone().or(generic.bucket),
                region: o.region.clone().or(generic.region),
                endpoint: o.endpoint.clone().or(generic.endpoint),
                public_base_url: o.public_base_url.clone().or(generic.public_base_url),
            },
            None => generic,
        }
    }

    /// Cache key for the client built from this config.
    ///
    /// Credentials and `timeoutMs` are not part of the identity, except the
    /// Vercel token, which names the store itself. A token taken from
    /// `BLOB_READ_WRITE_TOKEN` is not seen here.
    pub fn fingerprint(&self) -> StorageFingerprint {
        let target = self.target();
        let blob_store = match (self.provider, &self.vercel) {
            (StorageProvider::Vercel, Some(vercel)) => Some(format!(
                "{}#{}",
                vercel.api_url.as_deref().unwrap_or_default(),
                vercel
                    .token
                    .as_deref()
                    .map(|token| hex::encode(Sha256::digest(token.as_bytes())))
                    .unwrap_or_default()
            )),
            _ => None,
        };
        StorageFingerprint {
            blob_store,
            provider: self.provider,
            bucket: target.bucket,
            region: target.region,
            endpoint: target.endpoint,
            prefix: self.prefix.clone(),
            public_base_url: target.public_base_url,
        }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.filter(|ms| *ms > 0).map(Duration::from_millis)
    }

    pub fn credentials(&self) -> StorageCredentials {
        self.credentials.clone().unwrap_or_default()
    }
}
