//! The merged, immutable runtime configuration.

use serde::de::DeserializeOwned;
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

use super::detect::{RuntimeEnvironment, RuntimeRegion};
use crate::errors::RuntimeError;
use crate::storage::config::StorageConfig;

/// Keys the resolver always writes last, overriding anything the YAML set.
pub const FIXED_FIELDS: [&str; 5] = ["environment", "region", "source", "hostname", "detectedBy"];

/// Fully merged configuration for one `{hostname, environment, region}`.
///
/// The open key/value tree is whatever the YAML fragments produced; the
/// detection fields are fixed and mirrored into the tree under
/// [`FIXED_FIELDS`]. Instances are never mutated after construction; the
/// resolver hands them out as `Arc<RuntimeConfig>`.
#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    environment: RuntimeEnvironment,
    region: RuntimeRegion,
    hostname: Option<String>,
    detected_by: String,
    values: Map<String, Value>,
}

impl RuntimeConfig {
    /// Stamp the detection fields onto a merged tree.
    pub fn new(
        mut values: Map<String, Value>,
        environment: RuntimeEnvironment,
        region: RuntimeRegion,
        hostname: Option<String>,
        detected_by: String,
    ) -> Self {
        let stamped = [
            Some(environment.as_str()),
            Some(region.as_str()),
            Some(environment.as_str()),
            hostname.as_deref(),
            Some(detected_by.as_str()),
        ];
        for (field, value) in FIXED_FIELDS.iter().zip(stamped) {
            match value {
                Some(value) => {
                    values.insert(field.to_string(), Value::String(value.to_string()));
                }
                None => {
                    values.remove(*field);
                }
            }
        }

        Self {
            environment,
            region,
            hostname,
            detected_by,
            values,
        }
    }

    pub fn environment(&self) -> RuntimeEnvironment {
        self.environment
    }

    pub fn region(&self) -> RuntimeRegion {
        self.region
    }

    /// Which environment overlay won. Always equal to [`Self::environment`].
    pub fn source(&self) -> RuntimeEnvironment {
        self.environment
    }

    pub fn hostname(&self) -> Option<&str> {
        self.hostname.as_deref()
    }

    pub fn detected_by(&self) -> &str {
        &self.detected_by
    }

    /// The whole merged tree, fixed fields included.
    pub fn values(&self) -> &Map<String, Value> {
        &self.values
    }

    /// Look up a dotted path such as `storage.bucket` or `links.0.href`.
    ///
    /// Unresolved values (`null`) are reported as absent. Use
    /// [`Self::get_in`] for keys that themselves contain dots.
    pub fn get(&self, path: &str) -> Option<&Value> {
        let segments: Vec<&str> = path.split('.').collect();
        self.get_in(&segments)
    }

    /// Look up a path given as explicit segments.
    pub fn get_in(&self, segments: &[&str]) -> Option<&Value> {
        let (first, rest) = segments.split_first()?;
        let mut current = self.values.get(*first)?;
        for segment in rest {
            current = match current {
                Value::Object(map) => map.get(*segment)?,
                Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
                _ => return None,
            };
        }
        (!current.is_null()).then_some(current)
    }

    /// String value at a dotted path.
    pub fn get_str(&self, path: &str) -> Option<&str> {
        self.get(path).and_then(Value::as_str)
    }

    /// Deserialize the value at a dotted path into `T`.
    pub fn extract<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, serde_json::Error> {
        self.get(path)
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
    }

    /// Owned JSON view of the whole tree.
    pub fn to_value(&self) -> Value {
        Value::Object(self.values.clone())
    }

    /// Extract and validate the `storage` section.
    ///
    /// A missing section, a missing `provider`, or an unknown provider are
    /// fatal configuration errors.
    pub fn storage_config(&self) -> Result<StorageConfig, RuntimeError> {
        let storage = self
            .values
            .get("storage")
            .ok_or(RuntimeError::MissingStorageConfig)?;
        StorageConfig::from_value(storage)
    }
}

impl Serialize for RuntimeConfig {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.values.serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn config(values: Value) -> RuntimeConfig {
        let Value::Object(map) = values else {
            panic!("expected object");
        };
        RuntimeConfig::new(
            map,
            RuntimeEnvironment::Sit,
            RuntimeRegion::Cn,
            Some("staging.example.com".to_string()),
            "env:RUNTIME_ENV|hostname:parameter".to_string(),
        )
    }

    #[test]
    fn test_fixed_fields_override_yaml() {
        let cfg = config(json!({
            "environment": "prod",
            "region": "global",
            "source": "prod",
            "detectedBy": "spoofed",
            "apiBaseUrl": "https://api"
        }));
        assert_eq!(cfg.environment(), RuntimeEnvironment::Sit);
        assert_eq!(cfg.source(), cfg.environment());
        assert_eq!(cfg.get_str("environment"), Some("sit"));
        assert_eq!(cfg.get_str("region"), Some("cn"));
        assert_eq!(cfg.get_str("source"), Some("sit"));
        assert_eq!(
            cfg.get_str("detectedBy"),
            Some("env:RUNTIME_ENV|hostname:parameter")
        );
        assert_eq!(cfg.get_str("hostname"), Some("staging.example.com"));
    }

    #[test]
    fn test_hostname_removed_when_not_detected() {
        let Value::Object(map) = json!({"hostname": "yaml.example.com"}) else {
            unreachable!()
        };
        let cfg = RuntimeConfig::new(
            map,
            RuntimeEnvironment::Prod,
            RuntimeRegion::Default,
            None,
            "default".to_string(),
        );
        assert_eq!(cfg.hostname(), None);
        assert_eq!(cfg.get("hostname"), None);
    }

    #[test]
    fn test_every_fixed_field_is_stamped() {
        let mut yaml = Map::new();
        for field in FIXED_FIELDS {
            yaml.insert(field.to_string(), json!("from-yaml"));
        }
        let cfg = RuntimeConfig::new(
            yaml,
            RuntimeEnvironment::Sit,
            RuntimeRegion::Global,
            Some("www.example.com".to_string()),
            "env:RUNTIME_ENV".to_string(),
        );
        for field in FIXED_FIELDS {
            assert_ne!(cfg.get_str(field), Some("from-yaml"), "{field}");
        }
        assert_eq!(cfg.get_str("region"), Some("global"));
    }

    #[test]
    fn test_get_paths() {
        let cfg = config(json!({
            "db": {"password": null, "host": "db.local"},
            "links": [{"href": "/a"}],
            "hosts": {"staging.example.com": {"apiBaseUrl": "x"}}
        }));
        assert_eq!(cfg.get_str("db.host"), Some("db.local"));
        assert_eq!(cfg.get("db.password"), None);
        assert_eq!(cfg.get_str("links.0.href"), Some("/a"));
        assert_eq!(cfg.get("links.1.href"), None);
        assert_eq!(
            cfg.get_in(&["hosts", "staging.example.com", "apiBaseUrl"]),
            Some(&json!("x"))
        );
    }

    #[test]
    fn test_extract_typed() {
        #[derive(serde::Deserialize, Debug, PartialEq)]
        struct Db {
            host: String,
        }
        let cfg = config(json!({"db": {"host": "db.local"}}));
        assert_eq!(
            cfg.extract::<Db>("db").unwrap(),
            Some(Db {
                host: "db.local".to_string()
            })
        );
        assert_eq!(cfg.extract::<Db>("nope").unwrap(), None);
    }

    #[test]
    fn test_storage_config_missing() {
        let cfg = config(json!({}));
        assert!(matches!(
            cfg.storage_config(),
            Err(RuntimeError::MissingStorageConfig)
        ));
    }

    #[test]
    fn test_serialize_as_tree() {
        let cfg = config(json!({"a": 1}));
        let value = serde_json::to_value(&cfg).unwrap();
        assert_eq!(value["a"], json!(1));
        assert_eq!(value["environment"], json!("sit"));
    }
}
