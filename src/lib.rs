//! runtime-storage library: layered runtime configuration and a
//! multi-provider object storage facade.
//!
//! [`RuntimeContext`] owns both caches. It resolves the merged
//! [`config::RuntimeConfig`] for the current process and hands out storage
//! clients built from that config's `storage` section.

use std::sync::Arc;

pub mod cache;
pub mod config;
pub mod errors;
pub mod metrics;
pub mod storage;

use crate::config::{ConfigPaths, ConfigResolver, EnvVars, RuntimeConfig};
use crate::errors::StorageResult;
use crate::storage::{StorageClient, StorageConfig, StorageFactory};

/// Long-lived owner of the config-resolution and storage-client caches.
pub struct RuntimeContext {
    resolver: ConfigResolver,
    factory: StorageFactory,
}

impl RuntimeContext {
    pub fn new(paths: ConfigPaths) -> Self {
        Self {
            resolver: ConfigResolver::new(paths),
            factory: StorageFactory::new(),
        }
    }

    /// Both caches bounded to `capacity` entries.
    pub fn with_capacity(paths: ConfigPaths, capacity: usize) -> Self {
        Self {
            resolver: ConfigResolver::with_capacity(paths, capacity),
            factory: StorageFactory::with_capacity(capacity),
        }
    }

    /// Rooted at the current working directory.
    pub fn discover() -> Self {
        Self::new(ConfigPaths::discover())
    }

    pub fn paths(&self) -> &ConfigPaths {
        self.resolver.paths()
    }

    /// Resolve the runtime config against an environment snapshot.
    pub fn runtime_config(&self, env: &EnvVars, hostname: Option<&str>) -> Arc<RuntimeConfig> {
        self.resolver.resolve(env, hostname)
    }

    /// Storage client for the resolved config's `storage` section.
    pub async fn storage_client(
        &self,
        env: &EnvVars,
        hostname: Option<&str>,
    ) -> StorageResult<Arc<dyn StorageClient>> {
        let runtime = self.runtime_config(env, hostname);
        let storage = runtime.storage_config()?;
        self.storage_client_for(&storage).await
    }

    /// Storage client for an explicit config, bypassing resolution.
    pub async fn storage_client_for(
        &self,
        config: &StorageConfig,
    ) -> StorageResult<Arc<dyn StorageClient>> {
        self.factory.client(config).await
    }

    pub fn resolver(&self) -> &ConfigResolver {
        &self.resolver
    }

    pub fn factory(&self) -> &StorageFactory {
        &self.factory
    }
}
