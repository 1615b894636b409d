//! Configuration parsing and structures

use std::path::{Path, PathBuf};
use std::str::FromStr;

use globset::Glob;
use serde::Deserialize;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Default buffered pipe size between a writer and its background upload
pub const DEFAULT_PIPE_CAPACITY: usize = 4 * 1024 * 1024;

// =============================================================================
// Raw Config (Deserialized from YAML)
// =============================================================================

/// Raw configuration as deserialized from YAML.
/// This is converted to `Config` via `resolve()`.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfig {
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Path cache behaviour
    #[serde(default)]
    pub cache: CacheConfig,

    /// Upload bridge settings
    #[serde(default)]
    pub upload: RawUploadConfig,

    /// Names answered locally as "not found"
    #[serde(default)]
    pub ignore: IgnoreConfig,
}

/// Upload settings before size strings are parsed
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawUploadConfig {
    /// Pipe capacity (e.g., "4MB", "512KB")
    pub pipe_capacity: Option<String>,

    /// How write handles hand their bytes to the backend
    #[serde(default)]
    pub mode: UploadMode,
}

// =============================================================================
// Resolved Config (Ready for use)
// =============================================================================

/// Top-level configuration (resolved from RawConfig)
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub logging: LoggingConfig,
    pub cache: CacheConfig,
    pub upload: UploadConfig,
    pub ignore: IgnoreConfig,
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

impl LoggingConfig {
    /// Install the global tracing subscriber.
    ///
    /// `RUST_LOG` takes precedence over the configured level. Calling this
    /// again after a subscriber is installed is harmless.
    pub fn init(&self) {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&self.level));

        if tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .is_err()
        {
            debug!("tracing subscriber already installed");
        }
    }
}

/// Path cache configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct CacheConfig {
    /// Allow the same path to be listed more than once in its parent.
    /// Only useful as a workaround for eventually-consistent backends.
    #[serde(default)]
    pub allow_duplicate_names: bool,
}

/// Write-side upload strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum UploadMode {
    /// Stream through a bounded pipe into an upload running on its own task
    #[default]
    Stealing,
    /// Hold the whole file in memory and upload it on release
    Buffered,
}

/// Upload bridge configuration (resolved)
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Buffered pipe size in bytes
    pub pipe_capacity: usize,
    pub mode: UploadMode,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            pipe_capacity: DEFAULT_PIPE_CAPACITY,
            mode: UploadMode::default(),
        }
    }
}

/// Ignore list configuration
#[derive(Debug, Clone, Deserialize, Default)]
pub struct IgnoreConfig {
    /// Ignore AppleDouble and Finder bookkeeping files
    #[serde(default)]
    pub apple_double: bool,

    /// Extra glob patterns matched against file names
    #[serde(default)]
    pub patterns: Vec<String>,
}

// =============================================================================
// Resolution Logic
// =============================================================================

impl RawConfig {
    /// Resolve raw config into final config, parsing sizes and checking patterns
    pub fn resolve(self) -> Result<Config, ConfigError> {
        let RawConfig {
            logging,
            cache,
            upload,
            ignore,
        } = self;

        let pipe_capacity = match upload.pipe_capacity {
            Some(s) => {
                let bytes = parse_size(&s).ok_or_else(|| {
                    ConfigError::ValidationError(format!("Invalid pipe_capacity: {:?}", s))
                })?;
                usize::try_from(bytes).map_err(|_| {
                    ConfigError::ValidationError(format!("pipe_capacity too large: {:?}", s))
                })?
            }
            None => DEFAULT_PIPE_CAPACITY,
        };

        for pattern in &ignore.patterns {
            Glob::new(pattern).map_err(|e| {
                ConfigError::ValidationError(format!("Invalid ignore pattern {:?}: {}", pattern, e))
            })?;
        }

        let config = Config {
            logging,
            cache,
            upload: UploadConfig {
                pipe_capacity,
                mode: upload.mode,
            },
            ignore,
        };
        config.validate()?;
        Ok(config)
    }
}

impl Config {
    /// Load configuration from a YAML file
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(path.to_path_buf(), e.to_string()))?;

        content.parse()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.upload.pipe_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "upload.pipe_capacity must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl FromStr for Config {
    type Err = ConfigError;

    /// Parse configuration from a YAML string
    fn from_str(content: &str) -> Result<Self, Self::Err> {
        let raw: RawConfig =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        raw.resolve()
    }
}

/// Parse size string like "4MB" to bytes
pub fn parse_size(s: &str) -> Option<u64> {
    let s = s.trim().to_uppercase();
    let (num_part, suffix) = if s.ends_with("GB") {
        (&s[..s.len() - 2], 1024 * 1024 * 1024)
    } else if s.ends_with("MB") {
        (&s[..s.len() - 2], 1024 * 1024)
    } else if s.ends_with("KB") {
        (&s[..s.len() - 2], 1024)
    } else if s.ends_with('B') {
        (&s[..s.len() - 1], 1)
    } else {
        (s.as_str(), 1)
    };

    num_part.trim().parse::<u64>().ok().map(|n| n * suffix)
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
    use std::io::Write;

    #[test]
    fn test_parse_size() {
        assert_eq!(parse_size("1GB"), Some(1024 * 1024 * 1024));
        assert_eq!(parse_size("4MB"), Some(4 * 1024 * 1024));
        assert_eq!(parse_size("512kb"), Some(512 * 1024));
        assert_eq!(parse_size("1024B"), Some(1024));
        assert_eq!(parse_size("1024"), Some(1024));
        assert_eq!(parse_size("lots"), None);
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
logging:
  level: debug

cache:
  allow_duplicate_names: true

upload:
  pipe_capacity: 64KB
  mode: buffered

ignore:
  apple_double: true
  patterns:
    - "*.swp"
"#;

        let config: Config = yaml.parse().unwrap();
        assert_eq!(config.logging.level, "debug");
        assert!(config.cache.allow_duplicate_names);
        assert_eq!(config.upload.pipe_capacity, 64 * 1024);
        assert_eq!(config.upload.mode, UploadMode::Buffered);
        assert!(config.ignore.apple_double);
        assert_eq!(config.ignore.patterns, vec!["*.swp".to_string()]);
    }

    #[test]
    fn test_empty_document_uses_defaults() {
        let config: Config = "{}".parse().unwrap();
        assert_eq!(config.logging.level, "info");
        assert!(!config.cache.allow_duplicate_names);
        assert_eq!(config.upload.pipe_capacity, DEFAULT_PIPE_CAPACITY);
        assert_eq!(config.upload.mode, UploadMode::Stealing);
        assert!(!config.ignore.apple_double);
    }

    #[test]
    fn test_invalid_pipe_capacity() {
        let err = "upload:\n  pipe_capacity: huge\n"
            .parse::<Config>()
            .unwrap_err();
        assert!(
            err.to_string().contains("pipe_capacity"),
            "Error should mention pipe_capacity: {}",
            err
        );

        let err = "upload:\n  pipe_capacity: \"0\"\n"
            .parse::<Config>()
            .unwrap_err();
        assert!(err.to_string().contains("greater than zero"));
    }

    #[test]
    fn test_unknown_upload_mode() {
        let err = "upload:\n  mode: chunked\n".parse::<Config>().unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn test_invalid_ignore_pattern() {
        let yaml = r#"
ignore:
  patterns:
    - "a[b"
"#;
        let err = yaml.parse::<Config>().unwrap_err();
        assert!(matches!(err, ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "logging:\n  level: warn").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_from_missing_file() {
        let err = Config::from_file(Path::new("/nonexistent/fuse-bridge.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::ReadError(_, _)));
    }
}
