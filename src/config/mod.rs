//! Layered runtime configuration.
//!
//! Resolution detects the environment, region and hostname, loads the
//! base and environment YAML fragments, deep-merges them with region and
//! host overlays, and stamps the fixed identity fields last.

pub mod detect;
pub mod env_vars;
pub mod loader;
pub mod merge;
pub mod types;

pub use detect::{RuntimeEnvironment, RuntimeRegion};
pub use env_vars::EnvVars;
pub use loader::{ConfigPaths, ConfigResolver};
pub use types::RuntimeConfig;
