//! YAML fragment loading and the caching config resolver.
//!
//! Fragments live at `<config-dir>/runtime-service-config.<source>.yaml`
//! where `<source>` is `base`, `prod` or `sit`. They are merged in this
//! order, later layers winning:
//!
//! ```text
//! base <- environment overlay <- environment.regions[<region>] <- hosts[<hostname>]
//! ```
//!
//! Missing, unreadable, or non-mapping fragments are logged and treated as
//! empty so `base` alone still yields a usable config.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use metrics::counter;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::detect::{
    detect_env_settings, detect_hostname, is_local_hostname, DetectedHostname,
    RuntimeEnvSettings, RuntimeEnvironment, RuntimeRegion,
};
use super::env_vars::EnvVars;
use super::merge::{merge_all, merge_maps, resolve_env_references};
use super::types::RuntimeConfig;
use crate::cache::LruCache;
use crate::metrics::{RUNTIME_CONFIG_CACHE_HITS_TOTAL, RUNTIME_CONFIG_RESOLUTIONS_TOTAL};

/// Common file stem of every configuration fragment.
pub const CONFIG_FILE_STEM: &str = "runtime-service-config";

/// Default number of distinct resolutions kept in the cache.
pub const DEFAULT_CONFIG_CACHE_CAPACITY: usize = 64;

/// Which fragment to load.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKey {
    Base,
    Environment(RuntimeEnvironment),
}

impl SourceKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceKey::Base => "base",
            SourceKey::Environment(env) => env.as_str(),
        }
    }
}

/// Filesystem locations the resolver reads from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPaths {
    /// Project root; descriptor files are searched relative to it.
    pub root: PathBuf,
    /// Directory holding the `runtime-service-config.*.yaml` fragments.
    pub config_dir: PathBuf,
}

impl ConfigPaths {
    /// Paths for a project rooted at `root`, fragments in `<root>/src/config`.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        let config_dir = root.join("src").join("config");
        Self { root, config_dir }
    }

    /// Paths rooted at the current working directory.
    pub fn discover() -> Self {
        Self::new(std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")))
    }

    /// Override the fragment directory.
    pub fn with_config_dir(mut self, config_dir: impl Into<PathBuf>) -> Self {
        self.config_dir = config_dir.into();
        self
    }

    /// Location of one fragment.
    pub fn fragment_path(&self, source: SourceKey) -> PathBuf {
        self.config_dir
            .join(format!("{CONFIG_FILE_STEM}.{}.yaml", source.as_str()))
    }
}

/// Load one fragment, resolving `{env: VAR}` references against `env`.
pub fn load_fragment(path: &Path, source: SourceKey, env: &EnvVars) -> Map<String, Value> {
    let contents = match std::fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                "Failed to load YAML source \"{}\" from {}: {}",
                source.as_str(),
                path.display(),
                e
            );
            return Map::new();
        }
    };

    let parsed = match parse_yaml(&contents) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(
                "Failed to parse YAML source \"{}\", falling back to empty object: {}",
                source.as_str(),
                e
            );
            return Map::new();
        }
    };

    match resolve_env_references(parsed, env) {
        Value::Object(map) => map,
        _ => {
            warn!(
                "YAML source \"{}\" did not produce an object. Falling back to empty object.",
                source.as_str()
            );
            Map::new()
        }
    }
}

/// Parse YAML into a JSON tree, expanding `<<` merge keys.
fn parse_yaml(contents: &str) -> anyhow::Result<Value> {
    let mut yaml: serde_yaml::Value = serde_yaml::from_str(contents)?;
    yaml.apply_merge()?;
    Ok(serde_json::to_value(yaml)?)
}

/// Remove `regions` from an environment overlay, returning the block for `region`.
fn split_region_overlay(
    env_overlay: &mut Map<String, Value>,
    region: RuntimeRegion,
) -> Option<Map<String, Value>> {
    let Some(Value::Object(regions)) = env_overlay.remove("regions") else {
        return None;
    };

    regions.into_iter().find_map(|(key, value)| match value {
        Value::Object(block) if key.trim().to_lowercase() == region.as_str() => Some(block),
        _ => None,
    })
}

/// Merge `hosts[hostname]` onto `merged` when present.
fn apply_host_overrides(merged: Map<String, Value>, hostname: Option<&str>) -> Map<String, Value> {
    let Some(hostname) = hostname else {
        return merged;
    };

    let host_block = match merged.get("hosts") {
        Some(Value::Object(hosts)) => match hosts.get(hostname) {
            Some(Value::Object(block)) => Some(block.clone()),
            _ => {
                if !is_local_hostname(hostname) {
                    warn!("No host overrides found for \"{}\"", hostname);
                }
                None
            }
        },
        _ => None,
    };

    match host_block {
        Some(block) => {
            debug!("Applying host overrides for {}", hostname);
            merge_maps(merged, block)
        }
        None => merged,
    }
}

/// Detected identity of a resolution; one cached config per distinct key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolutionKey {
    pub hostname: Option<String>,
    pub environment: RuntimeEnvironment,
    pub region: RuntimeRegion,
}

/// Resolves and caches [`RuntimeConfig`] values.
///
/// The cache is bounded (LRU) and owned by the resolver, so a long-running
/// process that keeps changing its detection inputs does not grow without
/// limit.
pub struct ConfigResolver {
    paths: ConfigPaths,
    cache: Mutex<LruCache<ResolutionKey, Arc<RuntimeConfig>>>,
}

impl ConfigResolver {
    pub fn new(paths: ConfigPaths) -> Self {
        Self::with_capacity(paths, DEFAULT_CONFIG_CACHE_CAPACITY)
    }

    pub fn with_capacity(paths: ConfigPaths, capacity: usize) -> Self {
        Self {
            paths,
            cache: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn paths(&self) -> &ConfigPaths {
        &self.paths
    }

    /// Resolve against the current process environment.
    pub fn resolve_from_process(&self, hostname: Option<&str>) -> Arc<RuntimeConfig> {
        self.resolve(&EnvVars::from_process(), hostname)
    }

    /// Resolve, returning the cached instance when hostname, environment
    /// and region match a previous call.
    pub fn resolve(&self, env: &EnvVars, hostname: Option<&str>) -> Arc<RuntimeConfig> {
        let host = detect_hostname(env, hostname);
        let settings = detect_env_settings(env, &self.paths.root);
        let key = ResolutionKey {
            hostname: host.hostname.clone(),
            environment: settings.environment,
            region: settings.region,
        };

        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(hit) = cache.get(&key) {
            counter!(RUNTIME_CONFIG_CACHE_HITS_TOTAL).increment(1);
            return hit;
        }

        let config = Arc::new(self.build_detected(env, host, settings));
        cache.insert(key, Arc::clone(&config));
        config
    }

    /// Build a fresh config without consulting the cache.
    pub fn build(&self, env: &EnvVars, hostname: Option<&str>) -> RuntimeConfig {
        let host = detect_hostname(env, hostname);
        let settings = detect_env_settings(env, &self.paths.root);
        self.build_detected(env, host, settings)
    }

    fn build_detected(
        &self,
        env: &EnvVars,
        host: DetectedHostname,
        settings: RuntimeEnvSettings,
    ) -> RuntimeConfig {
        counter!(RUNTIME_CONFIG_RESOLUTIONS_TOTAL).increment(1);

        let base_source = SourceKey::Base;
        let env_source = SourceKey::Environment(settings.environment);
        let base = load_fragment(&self.paths.fragment_path(base_source), base_source, env);
        let mut env_overlay =
            load_fragment(&self.paths.fragment_path(env_source), env_source, env);
        let region_overlay =
            split_region_overlay(&mut env_overlay, settings.region).unwrap_or_default();

        let merged = merge_all([base, env_overlay, region_overlay]);
        let merged = apply_host_overrides(merged, host.hostname.as_deref());

        let detected_by = match &host.hostname {
            Some(_) => format!("{}|hostname:{}", settings.detected_by, host.detected_by),
            None => settings.detected_by.clone(),
        };

        let region_label = match settings.region {
            RuntimeRegion::Default => String::new(),
            region => format!("/{} region", region.as_str().to_uppercase()),
        };
        let host_label = host
            .hostname
            .as_deref()
            .map(|h| format!(" @ {h}"))
            .unwrap_or_default();
        info!(
            "Loaded runtime config env: {}{}{} ({})",
            settings.environment.as_str().to_uppercase(),
            region_label,
            host_label,
            detected_by
        );

        RuntimeConfig::new(
            merged,
            settings.environment,
            settings.region,
            host.hostname,
            detected_by,
        )
    }

    /// Number of cached resolutions.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Fixture {
        dir: tempfile::TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                dir: tempfile::tempdir().unwrap(),
            }
        }

        fn paths(&self) -> ConfigPaths {
            ConfigPaths::new(self.dir.path())
        }

        fn fragment(&self, source: &str, contents: &str) -> &Self {
            let dir = self.dir.path().join("src/config");
            std::fs::create_dir_all(&dir).unwrap();
            std::fs::write(
                dir.join(format!("{CONFIG_FILE_STEM}.{source}.yaml")),
                contents,
            )
            .unwrap();
            self
        }

        fn resolver(&self) -> ConfigResolver {
            ConfigResolver::new(self.paths())
        }
    }

    #[test]
    fn test_fragment_path_convention() {
        let paths = ConfigPaths::new("/srv/site");
        assert_eq!(
            paths.fragment_path(SourceKey::Base),
            PathBuf::from("/srv/site/src/config/runtime-service-config.base.yaml")
        );
        assert_eq!(
            paths
                .with_config_dir("/etc/site")
                .fragment_path(SourceKey::Environment(RuntimeEnvironment::Sit)),
            PathBuf::from("/etc/site/runtime-service-config.sit.yaml")
        );
    }

    #[test]
    fn test_end_to_end_host_override_wins() {
        let fx = Fixture::new();
        fx.fragment("base", "apiBaseUrl: https://api.base\n")
            .fragment(
                "sit",
                r#"
apiBaseUrl: https://api.sit
regions:
  cn:
    apiBaseUrl: https://api.sit.cn
hosts:
  staging.example.com:
    apiBaseUrl: https://api.staging-override
"#,
            );
        let env = EnvVars::from_pairs([("RUNTIME_ENV", "sit"), ("REGION", "cn")]);

        let cfg = fx.resolver().resolve(&env, Some("staging.example.com"));
        assert_eq!(cfg.get_str("apiBaseUrl"), Some("https://api.staging-override"));
        assert_eq!(cfg.environment(), RuntimeEnvironment::Sit);
        assert_eq!(cfg.region(), RuntimeRegion::Cn);
        assert_eq!(cfg.hostname(), Some("staging.example.com"));
        assert_eq!(cfg.detected_by(), "env:RUNTIME_ENV|hostname:parameter");
    }

    #[test]
    fn test_precedence_base_env_region() {
        let fx = Fixture::new();
        fx.fragment("base", "a: base\nb: base\nc: base\n").fragment(
            "sit",
            "b: sit\nc: sit\nregions:\n  CN:\n    c: region\n",
        );

        let env = EnvVars::from_pairs([("RUNTIME_ENV", "sit"), ("REGION", "cn")]);
        let cfg = fx.resolver().resolve(&env, None);
        assert_eq!(cfg.get_str("a"), Some("base"));
        assert_eq!(cfg.get_str("b"), Some("sit"));
        assert_eq!(cfg.get_str("c"), Some("region"));
        assert_eq!(cfg.get("regions"), None);

        let env = EnvVars::from_pairs([("RUNTIME_ENV", "sit"), ("REGION", "global")]);
        let cfg = fx.resolver().resolve(&env, None);
        assert_eq!(cfg.get_str("c"), Some("sit"));
    }

    #[test]
    fn test_arrays_replaced_across_fragments() {
        let fx = Fixture::new();
        fx.fragment("base", "tags: [a, b]\n")
            .fragment("prod", "tags: [c]\n");
        let cfg = fx
            .resolver()
            .resolve(&EnvVars::from_pairs([("RUNTIME_ENV", "prod")]), None);
        assert_eq!(cfg.get("tags"), Some(&json!(["c"])));
    }

    #[test]
    fn test_env_substitution_in_fragments() {
        let fx = Fixture::new();
        fx.fragment("base", "db:\n  password:\n    env: DB_PASS\n");

        let env = EnvVars::from_pairs([("DB_PASS", "secret")]);
        let cfg = fx.resolver().resolve(&env, None);
        assert_eq!(cfg.get_str("db.password"), Some("secret"));

        let cfg = fx.resolver().resolve(&EnvVars::default(), None);
        assert_eq!(cfg.get("db.password"), None);
        assert!(cfg.get("db").is_some());
    }

    #[test]
    fn test_fixed_field_immunity() {
        let fx = Fixture::new();
        fx.fragment("base", "environment: sit\nregion: cn\nsource: sit\n");
        let cfg = fx.resolver().resolve(&EnvVars::default(), None);
        assert_eq!(cfg.environment(), RuntimeEnvironment::Prod);
        assert_eq!(cfg.get_str("environment"), Some("prod"));
        assert_eq!(cfg.get_str("region"), Some("default"));
        assert_eq!(cfg.get_str("source"), Some("prod"));
        assert_eq!(cfg.detected_by(), "default");
    }

    #[test]
    fn test_malformed_and_missing_fragments_are_empty() {
        let fx = Fixture::new();
        fx.fragment("base", "ok: true\n")
            .fragment("prod", "- not\n- a mapping\n");
        let cfg = fx.resolver().resolve(&EnvVars::default(), None);
        assert_eq!(cfg.get("ok"), Some(&json!(true)));

        let fx = Fixture::new();
        fx.fragment("base", "key: [unclosed\n");
        let cfg = fx.resolver().resolve(&EnvVars::default(), None);
        assert_eq!(cfg.get("key"), None);
        assert_eq!(cfg.get_str("environment"), Some("prod"));
    }

    #[test]
    fn test_host_override_ignored_for_unknown_host() {
        let fx = Fixture::new();
        fx.fragment(
            "base",
            "api: base\nhosts:\n  www.example.com:\n    api: www\n",
        );
        let cfg = fx
            .resolver()
            .resolve(&EnvVars::default(), Some("other.example.com"));
        assert_eq!(cfg.get_str("api"), Some("base"));

        let cfg = fx
            .resolver()
            .resolve(&EnvVars::default(), Some("https://WWW.example.com/"));
        assert_eq!(cfg.get_str("api"), Some("www"));
    }

    #[test]
    fn test_cache_identity_and_refresh() {
        let fx = Fixture::new();
        fx.fragment("base", "api: base\n").fragment("sit", "api: sit\n");
        let resolver = fx.resolver();

        let prod_env = EnvVars::from_pairs([("RUNTIME_ENV", "prod")]);
        let first = resolver.resolve(&prod_env, None);
        let second = resolver.resolve(&prod_env, None);
        assert!(Arc::ptr_eq(&first, &second));

        let sit_env = EnvVars::from_pairs([("RUNTIME_ENV", "sit")]);
        let third = resolver.resolve(&sit_env, None);
        assert!(!Arc::ptr_eq(&first, &third));
        assert_eq!(third.get_str("api"), Some("sit"));
        assert_eq!(resolver.cached_len(), 2);
    }

    #[test]
    fn test_cache_keyed_by_detected_environment() {
        let fx = Fixture::new();
        fx.fragment("base", "api: base\n");
        let resolver = fx.resolver();

        let short = resolver.resolve(&EnvVars::from_pairs([("RUNTIME_ENV", "prod")]), None);
        let long = resolver.resolve(
            &EnvVars::from_pairs([("RUNTIME_ENV", "production")]),
            None,
        );
        assert!(Arc::ptr_eq(&short, &long));

        let host = resolver.resolve(
            &EnvVars::from_pairs([("RUNTIME_ENV", "prod")]),
            Some("www.example.com"),
        );
        let same_host = resolver.resolve(
            &EnvVars::from_pairs([("RUNTIME_ENV", "live")]),
            Some("https://WWW.example.com/"),
        );
        assert!(Arc::ptr_eq(&host, &same_host));
        assert_eq!(resolver.cached_len(), 2);
    }

    #[test]
    fn test_yaml_merge_keys_are_expanded() {
        let fx = Fixture::new();
        fx.fragment(
            "base",
            "defaults: &d\n  timeout: 5\n  retries: 2\nservice:\n  <<: *d\n  retries: 9\n",
        );
        let cfg = fx.resolver().resolve(&EnvVars::default(), None);
        assert_eq!(cfg.get("service"), Some(&json!({"timeout": 5, "retries": 9})));
        assert_eq!(cfg.get("service.<<"), None);
    }

    #[test]
    fn test_cache_is_bounded() {
        let fx = Fixture::new();
        fx.fragment("base", "api: base\n");
        let resolver = ConfigResolver::with_capacity(fx.paths(), 2);
        for host in ["a.example.com", "b.example.com", "c.example.com"] {
            resolver.resolve(&EnvVars::default(), Some(host));
        }
        assert_eq!(resolver.cached_len(), 2);
    }

    #[test]
    fn test_descriptor_file_drives_overlay() {
        let fx = Fixture::new();
        fx.fragment("base", "api: base\n").fragment("sit", "api: sit\n");
        std::fs::write(
            fx.dir.path().join(".runtime-env-config.yaml"),
            "environment: staging\n",
        )
        .unwrap();

        let cfg = fx.resolver().resolve(&EnvVars::default(), None);
        assert_eq!(cfg.get_str("api"), Some("sit"));
        assert_eq!(cfg.detected_by(), "file:.runtime-env-config.yaml");
    }
}
