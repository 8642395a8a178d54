//! Heap Configuration
//!
//! Configuration can be set programmatically or loaded from environment
//! variables.
//!
//! # Environment Variables
//!
//! All environment variables use the `SEGVM_` prefix:
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `SEGVM_STACK_CAPACITY` | Values in the evaluation stack | 4096 |
//! | `SEGVM_SAVE_DIR_CAPACITY` | Bytes in the save-directory string | 256 |
//! | `SEGVM_MAX_DYNMEM_SIZE` | Largest dynmem blob in bytes (0 = unlimited) | 16777216 (16MB) |
//! | `SEGVM_LOG_LEVEL` | Log level (off/error/warn/info/debug/trace) | info |
//!
//! # Example
//!
//! ```rust,ignore
//! use segvm_heap::config::HeapConfig;
//!
//! let config = HeapConfig::from_env();
//!
//! let config = HeapConfig::builder()
//!     .stack_capacity(0x800)
//!     .build()?;
//! ```

use std::env;

use thiserror::Error;
use tracing::level_filters::LevelFilter;

/// Logging configuration.
#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Most verbose level the heap emits when `RUST_LOG` is not set.
    /// Default: `INFO`.
    pub level: LevelFilter,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::INFO,
        }
    }
}

/// Complete heap configuration.
#[derive(Debug, Clone)]
pub struct HeapConfig {
    /// Number of values in the evaluation stack.
    /// Default: 0x1000.
    pub stack_capacity: usize,

    /// Capacity of the save-directory system string in bytes.
    /// Default: 256.
    pub save_dir_capacity: usize,

    /// Largest dynmem blob in bytes.
    /// 0 means unlimited. Default: 16MB.
    pub max_dynmem_size: usize,

    /// Logging configuration.
    pub log: LogConfig,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            stack_capacity: 0x1000,
            save_dir_capacity: 256,
            max_dynmem_size: 16 * 1024 * 1024, // 16 MB
            log: LogConfig::default(),
        }
    }
}

impl HeapConfig {
    /// Create a new builder.
    pub fn builder() -> HeapConfigBuilder {
        HeapConfigBuilder::new()
    }

    /// Load configuration from environment variables.
    ///
    /// Unset or unparsable variables keep their defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(val) = parse_env_usize("SEGVM_STACK_CAPACITY") {
            if val > 0 {
                config.stack_capacity = val;
            }
        }

        if let Some(val) = parse_env_usize("SEGVM_SAVE_DIR_CAPACITY") {
            if val > 0 {
                config.save_dir_capacity = val;
            }
        }

        if let Some(val) = parse_env_usize("SEGVM_MAX_DYNMEM_SIZE") {
            config.max_dynmem_size = val;
        }

        if let Some(level) = env::var("SEGVM_LOG_LEVEL")
            .ok()
            .and_then(|val| val.trim().parse::<LevelFilter>().ok())
        {
            config.log.level = level;
        }

        config
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "stack_capacity".into(),
                message: "must be at least 1".into(),
            });
        }

        if self.save_dir_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "save_dir_capacity".into(),
                message: "must be at least 1 byte".into(),
            });
        }

        Ok(())
    }
}

/// Configuration error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// Invalid configuration value.
    #[error("invalid configuration for '{field}': {message}")]
    InvalidValue {
        /// Field name.
        field: String,
        /// Error message.
        message: String,
    },
}

/// Builder for HeapConfig.
#[derive(Debug, Clone, Default)]
pub struct HeapConfigBuilder {
    config: HeapConfig,
}

impl HeapConfigBuilder {
    /// Create a new builder with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the evaluation stack capacity in values.
    pub fn stack_capacity(mut self, n: usize) -> Self {
        self.config.stack_capacity = n;
        self
    }

    /// Set the save-directory string capacity in bytes.
    pub fn save_dir_capacity(mut self, n: usize) -> Self {
        self.config.save_dir_capacity = n;
        self
    }

    /// Set the largest dynmem blob in bytes (0 = unlimited).
    pub fn max_dynmem_size(mut self, n: usize) -> Self {
        self.config.max_dynmem_size = n;
        self
    }

    /// Set the log level.
    pub fn log_level(mut self, level: LevelFilter) -> Self {
        self.config.log.level = level;
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<HeapConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Parse an environment variable as usize.
fn parse_env_usize(name: &str) -> Option<usize> {
    env::var(name).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = HeapConfig::default();
        assert_eq!(config.stack_capacity, 0x1000);
        assert_eq!(config.save_dir_capacity, 256);
        assert_eq!(config.max_dynmem_size, 16 * 1024 * 1024);
        assert_eq!(config.log.level, LevelFilter::INFO);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = HeapConfig::builder()
            .stack_capacity(64)
            .max_dynmem_size(0)
            .log_level(LevelFilter::TRACE)
            .build()
            .unwrap();

        assert_eq!(config.stack_capacity, 64);
        assert_eq!(config.max_dynmem_size, 0);
        assert_eq!(config.log.level, LevelFilter::TRACE);
    }

    #[test]
    fn test_builder_validation() {
        assert!(HeapConfig::builder().stack_capacity(0).build().is_err());
        let err = HeapConfig::builder().save_dir_capacity(0).build().unwrap_err();
        assert!(err.to_string().contains("save_dir_capacity"));
    }

    #[test]
    fn test_log_level_from_env() {
        env::set_var("SEGVM_LOG_LEVEL", " debug ");
        assert_eq!(HeapConfig::from_env().log.level, LevelFilter::DEBUG);

        env::set_var("SEGVM_LOG_LEVEL", "loud");
        assert_eq!(HeapConfig::from_env().log.level, LevelFilter::INFO);

        env::remove_var("SEGVM_LOG_LEVEL");
    }

    #[test]
    fn test_from_env_with_no_vars() {
        env::remove_var("SEGVM_STACK_CAPACITY");
        env::remove_var("SEGVM_MAX_DYNMEM_SIZE");

        let config = HeapConfig::from_env();
        assert_eq!(config.stack_capacity, 0x1000);
        assert_eq!(config.max_dynmem_size, 16 * 1024 * 1024);
    }
}
