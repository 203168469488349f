//! Store and pipeline configuration
//!
//! Loaded once from YAML at build and at query time. Every section is
//! optional; missing values fall back to defaults.
//!
//! ```yaml
//! store:
//!   backend: postgres
//!   url_env: DATABASE_URL
//! fetch:
//!   max_retries: 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Root configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct BelbConfig {
    pub store: StoreConfig,
    pub fetch: FetchConfig,
    pub parser: ParserConfig,
    pub reader: ReaderConfig,
}

/// Backing store engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    /// Embedded single-file database, one file per knowledge base
    #[default]
    Sqlite,
    /// Client-server database shared by all knowledge bases
    Postgres,
}

impl Backend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Backend::Sqlite => "sqlite",
            Backend::Postgres => "postgres",
        }
    }
}

/// Database connection configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: Backend,
    /// Connection URL for the postgres backend. Takes precedence over `url_env`.
    pub url: Option<String>,
    /// Environment variable holding the postgres URL
    pub url_env: String,
    pub max_connections: u32,
    pub connect_timeout_secs: u64,
    /// Rows per INSERT statement
    pub batch_size: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: Backend::Sqlite,
            url: None,
            url_env: "DATABASE_URL".to_string(),
            max_connections: 4,
            connect_timeout_secs: 30,
            batch_size: 500,
        }
    }
}

impl StoreConfig {
    /// Resolve the postgres connection URL
    pub fn postgres_url(&self) -> Result<String, ConfigError> {
        if let Some(url) = &self.url {
            return Ok(url.clone());
        }
        std::env::var(&self.url_env).map_err(|_| {
            ConfigError::Invalid(format!(
                "postgres backend selected but neither `store.url` nor ${} is set",
                self.url_env
            ))
        })
    }
}

/// Download behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Attempts after the first failure
    pub max_retries: u32,
    /// Delay before the first retry, doubled on every further attempt
    pub backoff_ms: u64,
    pub timeout_secs: u64,
    pub user_agent: String,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_ms: 1000,
            timeout_secs: 600,
            user_agent: concat!("belb/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Malformed-record policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ParserConfig {
    /// Fraction of malformed records above which a parse fails
    pub malformed_threshold: f64,
    /// Records to see before the threshold is checked mid-stream
    pub min_records_for_threshold: usize,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            malformed_threshold: 0.01,
            min_records_for_threshold: 100,
        }
    }
}

/// Query-time behavior
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub max_history_hops: usize,
    /// Entity records per page during iteration
    pub batch_size: usize,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            max_history_hops: 32,
            batch_size: 1000,
        }
    }
}

impl BelbConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let config: BelbConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.parser.malformed_threshold) {
            return Err(ConfigError::Invalid(format!(
                "parser.malformed_threshold must be within [0, 1], got {}",
                self.parser.malformed_threshold
            )));
        }
        if self.reader.max_history_hops == 0 {
            return Err(ConfigError::Invalid(
                "reader.max_history_hops must be positive".to_string(),
            ));
        }
        if self.store.batch_size == 0 || self.reader.batch_size == 0 {
            return Err(ConfigError::Invalid("batch sizes must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
store:
  backend: postgres
  url: postgres://belb@localhost/belb
  batch_size: 100
fetch:
  max_retries: 5
parser:
  malformed_threshold: 0.05
reader:
  max_history_hops: 8
"#;
        let config = BelbConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.store.backend, Backend::Postgres);
        assert_eq!(config.store.batch_size, 100);
        assert_eq!(config.fetch.max_retries, 5);
        assert_eq!(config.fetch.backoff_ms, 1000);
        assert_eq!(config.parser.malformed_threshold, 0.05);
        assert_eq!(config.reader.max_history_hops, 8);
        assert_eq!(
            config.store.postgres_url().unwrap(),
            "postgres://belb@localhost/belb"
        );
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = BelbConfig::from_yaml("{}").unwrap();
        assert_eq!(config.store.backend, Backend::Sqlite);
        assert_eq!(config.reader.max_history_hops, 32);
        assert_eq!(config.parser.min_records_for_threshold, 100);
    }

    #[test]
    fn test_invalid_threshold_rejected() {
        let yaml = "parser:\n  malformed_threshold: 1.5\n";
        assert!(matches!(
            BelbConfig::from_yaml(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_unknown_backend_rejected() {
        let yaml = "store:\n  backend: mysql\n";
        assert!(matches!(BelbConfig::from_yaml(yaml), Err(ConfigError::Yaml(_))));
    }
}
