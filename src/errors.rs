//! Error types for configuration resolution and storage access.
//!
//! Absent or malformed configuration files are never errors: they are
//! logged and treated as empty.  The variants here cover the fatal
//! configuration class (raised where the value is first used) and
//! provider I/O failures, which are carried through verbatim.

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the runtime config resolver and storage facade.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The merged runtime config has no `storage` mapping.
    #[error("[storage] Missing storage config")]
    MissingStorageConfig,

    /// `storage.provider` is absent or not a string.
    #[error("[storage] storage.provider is required")]
    MissingProvider,

    /// `storage.provider` names a provider this crate does not know.
    #[error("[storage] Unsupported provider: {provider}")]
    UnsupportedProvider { provider: String },

    /// The storage section exists but does not deserialize.
    #[error("[storage] Invalid storage config: {message}")]
    InvalidStorageConfig { message: String },

    /// A provider that needs a bucket was configured without one.
    #[error("[storage] {provider} bucket is required")]
    MissingBucket { provider: &'static str },

    /// Provider credentials are missing or unusable.
    #[error("[storage] {provider} credentials are invalid: {message}")]
    InvalidCredentials {
        provider: &'static str,
        message: String,
    },

    /// An operation needed a public base URL (or a full URL key) and none was configured.
    #[error("[storage] {provider} requires publicBaseUrl or a full URL key for {operation}")]
    MissingPublicUrl {
        provider: &'static str,
        operation: &'static str,
    },

    /// A storage operation exceeded the configured deadline.
    #[error("[storage] {operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    /// Failure reported by the underlying provider (network, auth, 404, ...).
    #[error(transparent)]
    Provider(#[from] anyhow::Error),
}

impl RuntimeError {
    /// True for the fatal configuration class, false for provider I/O.
    pub fn is_configuration(&self) -> bool {
        !matches!(
            self,
            RuntimeError::Provider(_) | RuntimeError::Timeout { .. }
        )
    }
}

/// Convenience alias used throughout the storage facade.
pub type StorageResult<T> = Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unsupported_provider_message() {
        let err = RuntimeError::UnsupportedProvider {
            provider: "ftp".to_string(),
        };
        assert_eq!(err.to_string(), "[storage] Unsupported provider: ftp");
        assert!(err.is_configuration());
    }

    #[test]
    fn test_provider_error_is_transparent() {
        let err: RuntimeError = anyhow::anyhow!("AWS S3 get_object: NoSuchKey").into();
        assert_eq!(err.to_string(), "AWS S3 get_object: NoSuchKey");
        assert!(!err.is_configuration());
    }

    #[test]
    fn test_missing_bucket_message() {
        let err = RuntimeError::MissingBucket { provider: "GCS" };
        assert_eq!(err.to_string(), "[storage] GCS bucket is required");
    }
}
