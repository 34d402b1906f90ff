//! Environment, region and hostname detection.
//!
//! Detection order for the environment, first match wins:
//!
//! 1. `RUNTIME_ENV`, normalized against a synonym table.
//! 2. A runtime-env descriptor file (`.runtime-env-config.yaml`) at
//!    `RUNTIME_ENV_CONFIG_PATH`, `dashboard/config/`, `src/config/`, then the
//!    project root.
//! 3. `prod` / `default`.
//!
//! `REGION` always wins over any region found in a descriptor file.
//! Hostname detection is independent and only feeds the per-host override
//! block of the merge.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::env_vars::EnvVars;

/// File name of the runtime-env descriptor.
pub const RUNTIME_ENV_CONFIG_BASENAME: &str = ".runtime-env-config.yaml";

/// Hostnames that never trigger the "no host overrides" warning and are
/// accepted as hostnames even though they contain no dot.
pub const LOCAL_HOSTNAMES: [&str; 3] = ["localhost", "127.0.0.1", "[::1]"];

/// Environment variables consulted for the hostname, in priority order.
pub const HOSTNAME_ENV_CANDIDATES: [&str; 7] = [
    "RUNTIME_HOSTNAME",
    "NEXT_RUNTIME_HOSTNAME",
    "DEPLOYMENT_HOSTNAME",
    "VERCEL_URL",
    "NEXT_PUBLIC_VERCEL_URL",
    "URL",
    "HOSTNAME",
];

/// Which top-level YAML overlay applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeEnvironment {
    Prod,
    Sit,
}

impl RuntimeEnvironment {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeEnvironment::Prod => "prod",
            RuntimeEnvironment::Sit => "sit",
        }
    }

    /// Normalize a free-form environment name.
    ///
    /// Case-insensitive; every run of non-alphanumerics folds to `_` and
    /// leading/trailing `_` are dropped before the synonym lookup.
    pub fn normalize(value: &str) -> Option<Self> {
        let mut folded = String::with_capacity(value.len());
        let mut pending_sep = false;
        for ch in value.trim().chars().flat_map(char::to_lowercase) {
            if ch.is_ascii_alphanumeric() {
                if pending_sep && !folded.is_empty() {
                    folded.push('_');
                }
                pending_sep = false;
                folded.push(ch);
            } else {
                pending_sep = true;
            }
        }

        match folded.as_str() {
            "prod" | "production" | "release" | "main" | "live" => Some(RuntimeEnvironment::Prod),
            "sit" | "staging" | "test" | "qa" | "uat" | "dev" | "development" | "preview"
            | "preprod" => Some(RuntimeEnvironment::Sit),
            _ => None,
        }
    }
}

impl fmt::Display for RuntimeEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Optional second-level overlay nested under the environment overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuntimeRegion {
    #[default]
    Default,
    Cn,
    Global,
}

impl RuntimeRegion {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuntimeRegion::Default => "default",
            RuntimeRegion::Cn => "cn",
            RuntimeRegion::Global => "global",
        }
    }

    /// Normalize a region name (`cn`/`china`, `global`, `default`).
    pub fn normalize(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "cn" | "china" => Some(RuntimeRegion::Cn),
            "global" => Some(RuntimeRegion::Global),
            "default" => Some(RuntimeRegion::Default),
            _ => None,
        }
    }
}

impl fmt::Display for RuntimeRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of environment/region detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeEnvSettings {
    pub environment: RuntimeEnvironment,
    pub region: RuntimeRegion,
    /// Provenance for diagnostics only (`env:RUNTIME_ENV`, `file:...`, `default`).
    pub detected_by: String,
}

/// Result of hostname detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedHostname {
    pub hostname: Option<String>,
    pub detected_by: String,
}

/// Determine environment and region for a process rooted at `root`.
pub fn detect_env_settings(env: &EnvVars, root: &Path) -> RuntimeEnvSettings {
    if let Some(raw) = env.non_empty("RUNTIME_ENV") {
        if let Some(environment) = RuntimeEnvironment::normalize(raw) {
            return RuntimeEnvSettings {
                environment,
                region: region_override(env).unwrap_or_default(),
                detected_by: "env:RUNTIME_ENV".to_string(),
            };
        }
        debug!("RUNTIME_ENV={raw:?} is not a known environment, trying descriptor files");
    }

    for candidate in descriptor_candidates(env, root) {
        if let Some(settings) = read_descriptor(&candidate, env) {
            return settings;
        }
    }

    RuntimeEnvSettings {
        environment: RuntimeEnvironment::Prod,
        region: region_override(env).unwrap_or_default(),
        detected_by: "default".to_string(),
    }
}

/// `REGION` when set; unknown values collapse to `default`.
fn region_override(env: &EnvVars) -> Option<RuntimeRegion> {
    env.non_empty("REGION")
        .map(|raw| RuntimeRegion::normalize(raw).unwrap_or_default())
}

/// A descriptor search location and its provenance label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DescriptorCandidate {
    pub path: PathBuf,
    pub detected_by: String,
}

/// Descriptor file locations in search order.
pub fn descriptor_candidates(env: &EnvVars, root: &Path) -> Vec<DescriptorCandidate> {
    let mut candidates = Vec::with_capacity(4);

    if let Some(explicit) = env.non_empty("RUNTIME_ENV_CONFIG_PATH") {
        let explicit = Path::new(explicit);
        let path = if explicit.is_absolute() {
            explicit.to_path_buf()
        } else {
            root.join(explicit)
        };
        candidates.push(DescriptorCandidate {
            path,
            detected_by: "env:RUNTIME_ENV_CONFIG_PATH".to_string(),
        });
    }

    for dir in ["dashboard/config", "src/config"] {
        candidates.push(DescriptorCandidate {
            path: root.join(dir).join(RUNTIME_ENV_CONFIG_BASENAME),
            detected_by: format!("file:{dir}/{RUNTIME_ENV_CONFIG_BASENAME}"),
        });
    }

    candidates.push(DescriptorCandidate {
        path: root.join(RUNTIME_ENV_CONFIG_BASENAME),
        detected_by: format!("file:{RUNTIME_ENV_CONFIG_BASENAME}"),
    });

    candidates
}

#[derive(Debug, Deserialize)]
struct Descriptor {
    environment: Option<serde_yaml::Value>,
    region: Option<serde_yaml::Value>,
}

/// Read one descriptor; `None` when absent, malformed, or naming no known environment.
fn read_descriptor(candidate: &DescriptorCandidate, env: &EnvVars) -> Option<RuntimeEnvSettings> {
    if !candidate.path.exists() {
        return None;
    }

    let contents = match std::fs::read_to_string(&candidate.path) {
        Ok(contents) => contents,
        Err(e) => {
            warn!(
                "Failed to read runtime env config at {}: {}",
                candidate.path.display(),
                e
            );
            return None;
        }
    };

    let parsed: serde_yaml::Value = match serde_yaml::from_str(&contents) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!(
                "Failed to parse runtime env config at {}: {}",
                candidate.path.display(),
                e
            );
            return None;
        }
    };
    if !parsed.is_mapping() {
        return None;
    }
    let descriptor: Descriptor = serde_yaml::from_value(parsed).ok()?;

    let environment = descriptor
        .environment
        .as_ref()
        .and_then(serde_yaml::Value::as_str)
        .and_then(RuntimeEnvironment::normalize)?;

    let region = region_override(env).unwrap_or_else(|| {
        descriptor
            .region
            .as_ref()
            .and_then(serde_yaml::Value::as_str)
            .and_then(RuntimeRegion::normalize)
            .unwrap_or_default()
    });

    Some(RuntimeEnvSettings {
        environment,
        region,
        detected_by: candidate.detected_by.clone(),
    })
}

/// True for `localhost`, `127.0.0.1` and `[::1]`.
pub fn is_local_hostname(hostname: &str) -> bool {
    LOCAL_HOSTNAMES.contains(&hostname)
}

/// Extract a lower-cased hostname from a bare host, host:port, or URL.
pub fn sanitize_hostname(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return None;
    }

    let has_scheme = trimmed
        .get(..8)
        .is_some_and(|head| head.eq_ignore_ascii_case("https://"))
        || trimmed
            .get(..7)
            .is_some_and(|head| head.eq_ignore_ascii_case("http://"));
    let maybe_url = if has_scheme {
        trimmed.to_string()
    } else {
        format!("https://{trimmed}")
    };

    let hostname = match reqwest::Url::parse(&maybe_url) {
        Ok(url) => url.host_str().map(|h| h.trim_end_matches('.').to_lowercase()),
        Err(_) => {
            let without_scheme = match trimmed.find("://") {
                Some(idx) if !trimmed[..idx].contains('/') => &trimmed[idx + 3..],
                _ => trimmed,
            };
            let host = without_scheme.split('/').next().unwrap_or_default();
            let host = host.split(':').next().unwrap_or_default();
            Some(host.trim_end_matches('.').to_lowercase())
        }
    };

    hostname.filter(|h| !h.is_empty())
}

/// Determine the hostname used for the per-host override block.
///
/// An explicit override always wins. Environment candidates must contain a
/// dot or be a local alias, which rejects bare container hostnames.
pub fn detect_hostname(env: &EnvVars, hostname_override: Option<&str>) -> DetectedHostname {
    if let Some(hostname) = hostname_override.and_then(sanitize_hostname) {
        return DetectedHostname {
            hostname: Some(hostname),
            detected_by: "parameter".to_string(),
        };
    }

    for source in HOSTNAME_ENV_CANDIDATES {
        let Some(hostname) = env.get(source).and_then(sanitize_hostname) else {
            continue;
        };
        if !hostname.contains('.') && !is_local_hostname(&hostname) {
            debug!("Ignoring machine-like hostname {hostname:?} from {source}");
            continue;
        }
        return DetectedHostname {
            hostname: Some(hostname),
            detected_by: source.to_string(),
        };
    }

    DetectedHostname {
        hostname: None,
        detected_by: "default".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(path: &Path, contents: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn test_normalize_environment_synonyms() {
        for raw in ["prod", "Production", " RELEASE ", "main", "live"] {
            assert_eq!(
                RuntimeEnvironment::normalize(raw),
                Some(RuntimeEnvironment::Prod),
                "{raw}"
            );
        }
        for raw in [
            "sit",
            "Staging",
            "test",
            "QA",
            "uat",
            "dev",
            "development",
            "preview",
            "preprod",
        ] {
            assert_eq!(
                RuntimeEnvironment::normalize(raw),
                Some(RuntimeEnvironment::Sit),
                "{raw}"
            );
        }
    }

    #[test]
    fn test_normalize_environment_folds_punctuation() {
        assert_eq!(
            RuntimeEnvironment::normalize("--prod--"),
            Some(RuntimeEnvironment::Prod)
        );
        assert_eq!(
            RuntimeEnvironment::normalize("pre-prod"),
            None,
            "pre-prod folds to pre_prod, which is not a synonym"
        );
        assert_eq!(RuntimeEnvironment::normalize("nightly"), None);
        assert_eq!(RuntimeEnvironment::normalize(""), None);
    }

    #[test]
    fn test_normalize_region() {
        assert_eq!(RuntimeRegion::normalize("CN"), Some(RuntimeRegion::Cn));
        assert_eq!(RuntimeRegion::normalize("china"), Some(RuntimeRegion::Cn));
        assert_eq!(
            RuntimeRegion::normalize(" global "),
            Some(RuntimeRegion::Global)
        );
        assert_eq!(
            RuntimeRegion::normalize("default"),
            Some(RuntimeRegion::Default)
        );
        assert_eq!(RuntimeRegion::normalize("eu"), None);
    }

    #[test]
    fn test_runtime_env_wins() {
        let root = tempfile::tempdir().unwrap();
        write(
            &root.path().join(RUNTIME_ENV_CONFIG_BASENAME),
            "environment: prod\nregion: global\n",
        );
        let env = EnvVars::from_pairs([("RUNTIME_ENV", "staging"), ("REGION", "cn")]);

        let settings = detect_env_settings(&env, root.path());
        assert_eq!(settings.environment, RuntimeEnvironment::Sit);
        assert_eq!(settings.region, RuntimeRegion::Cn);
        assert_eq!(settings.detected_by, "env:RUNTIME_ENV");
    }

    #[test]
    fn test_unknown_runtime_env_falls_through_to_descriptor() {
        let root = tempfile::tempdir().unwrap();
        write(
            &root.path().join("src/config").join(RUNTIME_ENV_CONFIG_BASENAME),
            "environment: sit\nregion: global\n",
        );
        let env = EnvVars::from_pairs([("RUNTIME_ENV", "nightly")]);

        let settings = detect_env_settings(&env, root.path());
        assert_eq!(settings.environment, RuntimeEnvironment::Sit);
        assert_eq!(settings.region, RuntimeRegion::Global);
        assert_eq!(
            settings.detected_by,
            "file:src/config/.runtime-env-config.yaml"
        );
    }

    #[test]
    fn test_region_env_overrides_descriptor_region() {
        let root = tempfile::tempdir().unwrap();
        write(
            &root.path().join(RUNTIME_ENV_CONFIG_BASENAME),
            "environment: sit\nregion: global\n",
        );
        let env = EnvVars::from_pairs([("REGION", "cn")]);

        let settings = detect_env_settings(&env, root.path());
        assert_eq!(settings.environment, RuntimeEnvironment::Sit);
        assert_eq!(settings.region, RuntimeRegion::Cn);
    }

    #[test]
    fn test_explicit_descriptor_path_searched_first() {
        let root = tempfile::tempdir().unwrap();
        write(&root.path().join("custom/env.yaml"), "environment: preview\n");
        write(
            &root.path().join(RUNTIME_ENV_CONFIG_BASENAME),
            "environment: prod\n",
        );
        let env = EnvVars::from_pairs([("RUNTIME_ENV_CONFIG_PATH", "custom/env.yaml")]);

        let settings = detect_env_settings(&env, root.path());
        assert_eq!(settings.environment, RuntimeEnvironment::Sit);
        assert_eq!(settings.detected_by, "env:RUNTIME_ENV_CONFIG_PATH");
    }

    #[test]
    fn test_malformed_descriptor_is_skipped() {
        let root = tempfile::tempdir().unwrap();
        write(
            &root.path().join("dashboard/config").join(RUNTIME_ENV_CONFIG_BASENAME),
            "environment: [unclosed\n",
        );
        write(
            &root.path().join("src/config").join(RUNTIME_ENV_CONFIG_BASENAME),
            "- just\n- a list\n",
        );
        write(
            &root.path().join(RUNTIME_ENV_CONFIG_BASENAME),
            "environment: qa\n",
        );

        let settings = detect_env_settings(&EnvVars::default(), root.path());
        assert_eq!(settings.environment, RuntimeEnvironment::Sit);
        assert_eq!(settings.detected_by, "file:.runtime-env-config.yaml");
    }

    #[test]
    fn test_default_when_nothing_matches() {
        let root = tempfile::tempdir().unwrap();
        let settings = detect_env_settings(&EnvVars::default(), root.path());
        assert_eq!(
            settings,
            RuntimeEnvSettings {
                environment: RuntimeEnvironment::Prod,
                region: RuntimeRegion::Default,
                detected_by: "default".to_string(),
            }
        );
    }

    #[test]
    fn test_unknown_region_env_collapses_to_default() {
        let root = tempfile::tempdir().unwrap();
        let env = EnvVars::from_pairs([("RUNTIME_ENV", "prod"), ("REGION", "mars")]);
        let settings = detect_env_settings(&env, root.path());
        assert_eq!(settings.region, RuntimeRegion::Default);
    }

    #[test]
    fn test_sanitize_hostname() {
        assert_eq!(
            sanitize_hostname("https://Staging.Example.com/path?q=1"),
            Some("staging.example.com".to_string())
        );
        assert_eq!(
            sanitize_hostname("my-app.vercel.app"),
            Some("my-app.vercel.app".to_string())
        );
        assert_eq!(
            sanitize_hostname("example.com.:8443"),
            Some("example.com".to_string())
        );
        assert_eq!(sanitize_hostname("[::1]:3000"), Some("[::1]".to_string()));
        assert_eq!(sanitize_hostname("   "), None);
    }

    #[test]
    fn test_detect_hostname_parameter_wins() {
        let env = EnvVars::from_pairs([("RUNTIME_HOSTNAME", "env.example.com")]);
        let detected = detect_hostname(&env, Some("param.example.com"));
        assert_eq!(detected.hostname.as_deref(), Some("param.example.com"));
        assert_eq!(detected.detected_by, "parameter");
    }

    #[test]
    fn test_detect_hostname_skips_machine_ids() {
        let env = EnvVars::from_pairs([
            ("HOSTNAME", "a1b2c3d4e5f6"),
            ("VERCEL_URL", "site-git-main.vercel.app"),
        ]);
        let detected = detect_hostname(&env, None);
        assert_eq!(detected.hostname.as_deref(), Some("site-git-main.vercel.app"));
        assert_eq!(detected.detected_by, "VERCEL_URL");

        let env = EnvVars::from_pairs([("HOSTNAME", "a1b2c3d4e5f6")]);
        let detected = detect_hostname(&env, None);
        assert_eq!(detected.hostname, None);
        assert_eq!(detected.detected_by, "default");
    }

    #[test]
    fn test_detect_hostname_accepts_localhost() {
        let env = EnvVars::from_pairs([("HOSTNAME", "localhost")]);
        let detected = detect_hostname(&env, None);
        assert_eq!(detected.hostname.as_deref(), Some("localhost"));
        assert_eq!(detected.detected_by, "HOSTNAME");
    }
}
