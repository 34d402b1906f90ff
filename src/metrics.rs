//! Prometheus metrics for config resolution and storage access.
//!
//! Installs a global Prometheus recorder using `metrics-exporter-prometheus`
//! and defines metric name constants. Library code records through the
//! `metrics` macros unconditionally; without an installed recorder the
//! macros are no-ops.

use metrics::{counter, describe_counter, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Mutex, OnceLock};
use std::time::Duration;

// -- Metric name constants ----------------------------------------------------

/// Config resolutions that missed the cache and merged YAML (counter).
pub const RUNTIME_CONFIG_RESOLUTIONS_TOTAL: &str = "runtime_config_resolutions_total";

/// Config resolutions served from the cache (counter).
pub const RUNTIME_CONFIG_CACHE_HITS_TOTAL: &str = "runtime_config_cache_hits_total";

/// Storage clients constructed (counter). Labels: provider.
pub const STORAGE_CLIENTS_CREATED_TOTAL: &str = "storage_clients_created_total";

/// Storage client lookups served from the cache (counter). Labels: provider.
pub const STORAGE_CLIENT_CACHE_HITS_TOTAL: &str = "storage_client_cache_hits_total";

/// Storage operations (counter). Labels: provider, operation, status.
pub const STORAGE_OPERATIONS_TOTAL: &str = "storage_operations_total";

/// Storage operation duration in seconds (histogram). Labels: provider, operation.
pub const STORAGE_OPERATION_DURATION_SECONDS: &str = "storage_operation_duration_seconds";

/// Bytes written through `put_object` (counter). Labels: provider.
pub const STORAGE_BYTES_UPLOADED_TOTAL: &str = "storage_bytes_uploaded_total";

/// Bytes read through `get_object` (counter). Labels: provider.
pub const STORAGE_BYTES_DOWNLOADED_TOTAL: &str = "storage_bytes_downloaded_total";

// -- Global recorder installation ---------------------------------------------

/// Singleton handle to the Prometheus recorder.
static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Serializes recorder installation.
static INSTALL_LOCK: Mutex<()> = Mutex::new(());

/// Install the global Prometheus metrics recorder. Repeated calls return the
/// handle installed by the first one.
pub fn init_metrics() -> anyhow::Result<&'static PrometheusHandle> {
    let _guard = INSTALL_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if let Some(handle) = PROMETHEUS_HANDLE.get() {
        return Ok(handle);
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| anyhow::anyhow!("failed to install Prometheus recorder: {e}"))?;
    Ok(PROMETHEUS_HANDLE.get_or_init(|| handle))
}

/// Register metric descriptions with the global recorder. Call once after
/// `init_metrics()`.
pub fn describe_metrics() {
    describe_counter!(
        RUNTIME_CONFIG_RESOLUTIONS_TOTAL,
        "Runtime config resolutions that merged YAML fragments"
    );
    describe_counter!(
        RUNTIME_CONFIG_CACHE_HITS_TOTAL,
        "Runtime config resolutions served from the cache"
    );
    describe_counter!(STORAGE_CLIENTS_CREATED_TOTAL, "Storage clients constructed");
    describe_counter!(
        STORAGE_CLIENT_CACHE_HITS_TOTAL,
        "Storage client lookups served from the cache"
    );
    describe_counter!(STORAGE_OPERATIONS_TOTAL, "Storage operations by type and outcome");
    describe_histogram!(
        STORAGE_OPERATION_DURATION_SECONDS,
        "Storage operation duration in seconds"
    );
    describe_counter!(STORAGE_BYTES_UPLOADED_TOTAL, "Bytes written to object storage");
    describe_counter!(STORAGE_BYTES_DOWNLOADED_TOTAL, "Bytes read from object storage");
}

/// Prometheus exposition text, when a recorder has been installed.
pub fn render() -> Option<String> {
    PROMETHEUS_HANDLE.get().map(PrometheusHandle::render)
}

/// Record one finished storage operation.
pub fn record_operation(provider: &'static str, operation: &'static str, ok: bool, elapsed: Duration) {
    let status = if ok { "ok" } else { "error" };
    counter!(STORAGE_OPERATIONS_TOTAL, "provider" => provider, "operation" => operation, "status" => status).increment(1);
    histogram!(STORAGE_OPERATION_DURATION_SECONDS, "provider" => provider, "operation" => operation)
        .record(elapsed.as_secs_f64());
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        let first = init_metrics().unwrap() as *const PrometheusHandle;
        let second = init_metrics().unwrap() as *const PrometheusHandle;
        assert_eq!(first, second);
        describe_metrics();
    }

    #[test]
    fn test_render_includes_recorded_operation() {
        init_metrics().unwrap();
        record_operation("s3", "get_object", true, Duration::from_millis(5));
        let text = render().unwrap();
        assert!(text.contains(STORAGE_OPERATIONS_TOTAL));
    }
}
