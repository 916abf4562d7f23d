//! Configuration parsing and structures

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::env::substitute_env_vars;

/// Top-level configuration
///
/// Every section has defaults, so an empty document is a valid
/// configuration that caches into a temporary directory and talks to S3
/// through the default AWS credential chain.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Mirror cache configuration
    #[serde(default)]
    pub cache: CacheSettings,

    /// Local filesystem backend configuration
    #[serde(default)]
    pub local: LocalConfig,

    /// S3 backend configuration
    #[serde(default)]
    pub s3: S3Config,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Mirror cache configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CacheSettings {
    /// Directory holding mirror files. When unset, a private temporary
    /// directory is created and removed again on shutdown.
    pub root: Option<PathBuf>,
}

/// Local filesystem backend configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LocalConfig {
    /// Create missing parent directories when opening for write
    #[serde(default = "default_true")]
    pub create_parent_dirs: bool,

    /// Stage writes in a temporary file next to the target and move it into
    /// place on commit, so an abandoned write leaves the target untouched
    #[serde(default = "default_true")]
    pub atomic_writes: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            create_parent_dirs: true,
            atomic_writes: true,
        }
    }
}

/// Region used when neither the configuration nor `REGION` names one
pub const DEFAULT_REGION: &str = "us-east-1";

/// S3 backend configuration
#[derive(Debug, Clone, Default, Deserialize)]
pub struct S3Config {
    /// AWS region; see [`S3Config::effective_region`] for the fallbacks
    pub region: Option<String>,

    /// Custom endpoint URL (for S3-compatible stores)
    pub endpoint: Option<String>,

    /// Force path-style addressing (for MinIO, LocalStack, etc.)
    #[serde(default)]
    pub force_path_style: bool,

    /// Send `x-amz-request-payer: requester` with every request
    #[serde(default)]
    pub request_payer: bool,

    /// Upper bound for a whole operation, retries included (e.g. "30s")
    #[serde(default, with = "humantime_serde")]
    pub operation_timeout: Option<Duration>,

    /// Upper bound for establishing a connection (e.g. "5s")
    #[serde(default, with = "humantime_serde")]
    pub connect_timeout: Option<Duration>,
}

impl S3Config {
    /// Region to sign requests for: the configured one, else the `REGION`
    /// environment variable, else [`DEFAULT_REGION`]
    pub fn effective_region(&self) -> String {
        resolve_region(self.region.as_deref(), std::env::var("REGION").ok())
    }
}

fn resolve_region(configured: Option<&str>, from_env: Option<String>) -> String {
    configured
        .map(str::trim)
        .filter(|region| !region.is_empty())
        .map(str::to_string)
        .or_else(|| from_env.filter(|region| !region.trim().is_empty()))
        .unwrap_or_else(|| DEFAULT_REGION.to_string())
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        Self::from_str(&content)
    }

    /// Parse configuration from a YAML string, substituting `${VAR}`
    /// references first
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if let Some(region) = &self.s3.region {
            if region.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "s3.region cannot be empty".to_string(),
                ));
            }
        }

        if let Some(endpoint) = &self.s3.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(ConfigError::ValidationError(format!(
                    "s3.endpoint must be an http(s) URL, got {:?}",
                    endpoint
                )));
            }
        }

        for (name, timeout) in [
            ("s3.operation_timeout", self.s3.operation_timeout),
            ("s3.connect_timeout", self.s3.connect_timeout),
        ] {
            if timeout == Some(Duration::ZERO) {
                return Err(ConfigError::ValidationError(format!(
                    "{} must be greater than zero",
                    name
                )));
            }
        }

        if let Some(root) = &self.cache.root {
            if root.as_os_str().is_empty() {
                return Err(ConfigError::ValidationError(
                    "cache.root cannot be empty".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    ReadError(PathBuf, String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_document_uses_defaults() {
        let config = Config::from_str("").unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(config.cache.root.is_none());
        assert!(config.local.create_parent_dirs);
        assert!(!config.s3.force_path_style);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
logging:
  level: debug

cache:
  root: /var/cache/nstore

local:
  create_parent_dirs: false

s3:
  region: us-west-2
  endpoint: "http://localhost:9000"
  force_path_style: true
  request_payer: true
  operation_timeout: 30s
  connect_timeout: 2s
"#;

        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.cache.root, Some(PathBuf::from("/var/cache/nstore")));
        assert!(!config.local.create_parent_dirs);
        assert_eq!(config.s3.region.as_deref(), Some("us-west-2"));
        assert_eq!(config.s3.endpoint.as_deref(), Some("http://localhost:9000"));
        assert!(config.s3.force_path_style);
        assert!(config.s3.request_payer);
        assert_eq!(config.s3.operation_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.s3.connect_timeout, Some(Duration::from_secs(2)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_region_from_environment_with_fallback() {
        let yaml = "s3:\n  region: ${NSTORE_CONFIG_TEST_REGION:-us-east-1}\n";
        let config = Config::from_str(yaml).unwrap();
        assert_eq!(config.s3.region.as_deref(), Some("us-east-1"));
    }

    #[test]
    fn test_region_defaults() {
        assert_eq!(resolve_region(None, None), DEFAULT_REGION);
        assert_eq!(resolve_region(None, Some("eu-west-1".into())), "eu-west-1");
        assert_eq!(resolve_region(None, Some("  ".into())), DEFAULT_REGION);
        assert_eq!(
            resolve_region(Some("us-west-2"), Some("eu-west-1".into())),
            "us-west-2"
        );
        assert_eq!(resolve_region(Some(""), Some("eu-west-1".into())), "eu-west-1");
    }

    #[test]
    fn test_local_writes_are_atomic_by_default() {
        let config = Config::from_str("local:\n  create_parent_dirs: false\n").unwrap();
        assert!(config.local.atomic_writes);
        let config = Config::from_str("local:\n  atomic_writes: false\n").unwrap();
        assert!(!config.local.atomic_writes);
        assert!(config.local.create_parent_dirs);
    }

    #[test]
    fn test_unknown_section_rejected() {
        let result = Config::from_str("mounts: []\n");
        assert!(matches!(result, Err(ConfigError::ParseError(_))));
    }

    #[test]
    fn test_validate_rejects_bad_endpoint() {
        let config = Config::from_str("s3:\n  endpoint: localhost:9000\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("s3.endpoint"), "{}", err);
    }

    #[test]
    fn test_validate_rejects_zero_timeout() {
        let config = Config::from_str("s3:\n  operation_timeout: 0s\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("operation_timeout"), "{}", err);
    }
}
