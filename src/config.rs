use crate::core::db::pool::{Pool, PoolRegistry, DEFAULT_POOL_SIZE};
use crate::core::{RdbiError, Result};
use crate::driver::{ConnectArgs, Connector, DriverRegistry};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Top-level configuration structure parsed from a TOML file.
#[derive(Debug, Default, Deserialize)]
pub struct Config {
    /// Default rewindable-result flag for every pool
    #[serde(default)]
    pub rewindable_result: bool,
    #[serde(default, rename = "pool")]
    pub pools: Vec<PoolConfig>,
}

/// One `[[pool]]` table.
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    pub name: String,
    /// Registered driver name, e.g. "SQLite"
    pub driver: String,
    #[serde(default = "default_pool_size")]
    pub max: usize,
    /// Overrides the top-level flag for this pool
    pub rewindable_result: Option<bool>,
    /// Driver arguments; non-string values are passed in their TOML spelling
    #[serde(default)]
    pub connect_args: BTreeMap<String, toml::Value>,
}

fn default_pool_size() -> usize {
    DEFAULT_POOL_SIZE
}

impl PoolConfig {
    pub fn connect_args(&self) -> ConnectArgs {
        self.connect_args
            .iter()
            .map(|(key, value)| {
                let value = match value {
                    toml::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (key.clone(), value)
            })
            .collect()
    }
}

impl Config {
    /// Parses configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Creates every configured pool and registers it in `pools`.
    ///
    /// Drivers are resolved through `drivers`; pools are created in file
    /// order and an error stops at the first bad entry.
    pub fn build_pools(&self, drivers: &DriverRegistry, pools: &PoolRegistry) -> Result<Vec<Arc<Pool>>> {
        let mut built = Vec::with_capacity(self.pools.len());
        for spec in &self.pools {
            if spec.name.trim().is_empty() {
                return Err(RdbiError::Config("pool name must not be empty".to_string()));
            }

            let rewindable = spec.rewindable_result.unwrap_or(self.rewindable_result);
            let connector = Connector::by_name(drivers, &spec.driver, spec.connect_args())?
                .with_rewindable_result(rewindable);
            let pool = pools.create(&spec.name, connector, spec.max)?;

            debug!(pool = %spec.name, driver = %spec.driver, max = spec.max, "configured pool");
            built.push(pool);
        }
        Ok(built)
    }
}

/// Loads configuration from a TOML file at the given path.
///
/// # Arguments
///
/// * `path` - The file path to the TOML configuration file.
///
/// # Example
///
/// ```no_run
/// use rdbi::config::load_config;
///
/// let config = load_config("rdbi.toml").expect("Failed to load config");
/// println!("{:?}", config);
/// ```
pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config> {
    let content = fs::read_to_string(path)?;
    Config::from_toml_str(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = r#"
rewindable_result = true

[[pool]]
name = "main"
driver = "SQLite"
max = 3

[pool.connect_args]
database = ":memory:"
busy_timeout_ms = 250

[[pool]]
name = "scratch"
driver = "Mock"
rewindable_result = false
"#;

    #[test]
    fn test_load_config_from_str() {
        let config = Config::from_toml_str(SAMPLE_CONFIG).expect("Failed to parse sample config");
        assert!(config.rewindable_result);
        assert_eq!(config.pools.len(), 2);

        let main = &config.pools[0];
        assert_eq!(main.max, 3);
        let args = main.connect_args();
        assert_eq!(args.get("database"), Some(":memory:"));
        assert_eq!(args.get("busy_timeout_ms"), Some("250"));

        let scratch = &config.pools[1];
        assert_eq!(scratch.max, DEFAULT_POOL_SIZE);
        assert_eq!(scratch.rewindable_result, Some(false));
    }

    #[test]
    fn test_build_pools_registers_by_name() {
        let config = Config::from_toml_str(SAMPLE_CONFIG).unwrap();
        let registry = PoolRegistry::new();

        let built = config
            .build_pools(&DriverRegistry::with_builtin(), &registry)
            .unwrap();

        assert_eq!(built.len(), 2);
        assert_eq!(registry.names(), vec!["main", "scratch"]);

        let main = registry.get("main").unwrap();
        assert_eq!(main.max(), 3);
        assert!(main.connector().rewindable_result());
        assert!(!registry.get("scratch").unwrap().connector().rewindable_result());
    }

    #[test]
    fn test_unknown_driver_fails() {
        let config = Config::from_toml_str("[[pool]]\nname = \"x\"\ndriver = \"Oracle\"\n").unwrap();
        let result = config.build_pools(&DriverRegistry::with_builtin(), &PoolRegistry::new());
        assert!(matches!(result, Err(RdbiError::Config(_))));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        assert!(matches!(
            load_config("/nonexistent/rdbi.toml"),
            Err(RdbiError::Io(_))
        ));
    }
}
