//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Supports YAML configuration files with human-readable durations and byte sizes.

use crate::{CacheError, Result};
use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::{Deserialize, Serialize};

use std::path::PathBuf;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Custom deserializer for PathBuf that expands ~ to home directory
mod pathbuf_serde {
    use serde::{Deserialize, Deserializer};
    use std::path::PathBuf;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<PathBuf, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Ok(super::expand_tilde(&s))
    }
}

pub(crate) fn expand_tilde(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var_os("HOME") {
            let mut result = PathBuf::from(home);
            result.push(rest);
            return result;
        }
    }
    PathBuf::from(path)
}

/// Custom deserializer for Duration from string format like "30s", "250ms", "5m"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let duration = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs_f64(value),
            "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs_f64(value * 60.0),
            "h" | "hr" | "hrs" | "hour" | "hours" => Duration::from_secs_f64(value * 3600.0),
            "ms" | "millis" | "millisecond" | "milliseconds" => {
                Duration::from_secs_f64(value / 1000.0)
            }
            "" => Duration::from_secs_f64(value), // Default to seconds if no unit
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        Ok(duration)
    }
}

/// Custom deserializer for byte sizes: plain integers or strings like "512MiB", "1GB"
pub(crate) mod size_serde {
    use serde::{Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawSize {
        Bytes(u64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<u64, D::Error>
    where
        D: Deserializer<'de>,
    {
        match RawSize::deserialize(deserializer)? {
            RawSize::Bytes(bytes) => Ok(bytes),
            RawSize::Text(text) => parse_size(&text).map_err(serde::de::Error::custom),
        }
    }

    pub fn parse_size(s: &str) -> Result<u64, String> {
        let s = s.trim();
        let num_end = s
            .char_indices()
            .find(|(_, c)| !(c.is_ascii_digit() || *c == '.'))
            .map(|(i, _)| i)
            .unwrap_or(s.len());

        if num_end == 0 {
            return Err(format!("No number found in size string: {}", s));
        }

        let value: f64 = s[..num_end]
            .parse()
            .map_err(|e| format!("Failed to parse size '{}': {}", s, e))?;

        let multiplier: u64 = match s[num_end..].trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" => 1_000,
            "kib" => 1 << 10,
            "m" | "mb" => 1_000_000,
            "mib" => 1 << 20,
            "g" | "gb" => 1_000_000_000,
            "gib" => 1 << 30,
            "t" | "tb" => 1_000_000_000_000,
            "tib" => 1 << 40,
            other => return Err(format!("Unknown size unit: {}", other)),
        };

        Ok((value * multiplier as f64) as u64)
    }
}

pub use duration_serde::parse_duration;
pub use size_serde::parse_size;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub cache: FileCacheConfig,
    #[serde(default)]
    pub object_store: ObjectStoreConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Read cache configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileCacheConfig {
    /// Global switch. When false every resolve returns the no-cache sentinel.
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Directory holding one backing file per cached object version
    #[serde(
        default = "default_cache_dir",
        deserialize_with = "pathbuf_serde::deserialize"
    )]
    pub cache_dir: PathBuf,

    /// Soft byte budget for all backing files. 0 disables the cache.
    #[serde(default = "default_max_size", deserialize_with = "size_serde::deserialize")]
    pub max_size: u64,

    /// Bytes written per download step before the watermark advances
    #[serde(
        default = "default_download_chunk_size",
        deserialize_with = "size_serde::deserialize"
    )]
    pub download_chunk_size: u64,

    /// Ceiling on how long a sequential read waits for the watermark before
    /// falling back to a direct read
    #[serde(
        default = "default_sequential_read_wait_timeout",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub sequential_read_wait_timeout: Duration,

    /// Non-contiguous reads on one handle before it is classified random
    #[serde(default = "default_random_read_threshold")]
    pub random_read_threshold: u32,

    /// Start a download even when the first read of a handle is not at offset 0
    #[serde(default)]
    pub cache_file_for_range_read: bool,

    /// Adopt complete backing files left behind by a previous run instead of
    /// deleting them at startup
    #[serde(default)]
    pub reuse_existing_files: bool,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_cache_dir() -> PathBuf {
    expand_tilde("~/.cache/bucket-fs")
}

fn default_max_size() -> u64 {
    1 << 30 // 1 GiB
}

fn default_download_chunk_size() -> u64 {
    8 << 20 // 8 MiB
}

fn default_sequential_read_wait_timeout() -> Duration {
    Duration::from_secs(2)
}

fn default_random_read_threshold() -> u32 {
    3
}

impl Default for FileCacheConfig {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            cache_dir: default_cache_dir(),
            max_size: default_max_size(),
            download_chunk_size: default_download_chunk_size(),
            sequential_read_wait_timeout: default_sequential_read_wait_timeout(),
            random_read_threshold: default_random_read_threshold(),
            cache_file_for_range_read: false,
            reuse_existing_files: false,
        }
    }
}

impl FileCacheConfig {
    /// Config rooted at `cache_dir` with a byte budget, other fields default
    pub fn with_dir(cache_dir: impl Into<PathBuf>, max_size: u64) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            max_size,
            ..Self::default()
        }
    }

    /// Whether the cache participates at all
    pub fn is_active(&self) -> bool {
        self.enabled && self.max_size > 0
    }

    /// Clamp tunables into their supported ranges, logging every correction
    pub fn validate_and_clamp(&mut self) {
        const MIN_CHUNK: u64 = 256 << 10;
        const MAX_CHUNK: u64 = 128 << 20;
        const MIN_WAIT: Duration = Duration::from_millis(10);
        const MAX_WAIT: Duration = Duration::from_secs(60);

        if self.download_chunk_size < MIN_CHUNK {
            warn!(
                "cache.download_chunk_size ({}) is below minimum ({}), clamping",
                self.download_chunk_size, MIN_CHUNK
            );
            self.download_chunk_size = MIN_CHUNK;
        } else if self.download_chunk_size > MAX_CHUNK {
            warn!(
                "cache.download_chunk_size ({}) exceeds maximum ({}), clamping",
                self.download_chunk_size, MAX_CHUNK
            );
            self.download_chunk_size = MAX_CHUNK;
        }

        if self.sequential_read_wait_timeout < MIN_WAIT {
            warn!(
                "cache.sequential_read_wait_timeout ({:?}) is below minimum ({:?}), clamping",
                self.sequential_read_wait_timeout, MIN_WAIT
            );
            self.sequential_read_wait_timeout = MIN_WAIT;
        } else if self.sequential_read_wait_timeout > MAX_WAIT {
            warn!(
                "cache.sequential_read_wait_timeout ({:?}) exceeds maximum ({:?}), clamping",
                self.sequential_read_wait_timeout, MAX_WAIT
            );
            self.sequential_read_wait_timeout = MAX_WAIT;
        }

        if self.random_read_threshold == 0 {
            warn!("cache.random_read_threshold must be at least 1, clamping to 1");
            self.random_read_threshold = 1;
        }

        if self.enabled && self.max_size == 0 {
            info!("cache.max_size is 0, read cache disabled");
            self.enabled = false;
        }
    }
}

/// Object store endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Base URL of the object gateway, e.g. "http://127.0.0.1:4443"
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    #[serde(
        default = "default_request_timeout",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub request_timeout: Duration,

    /// Retries for stat and range reads. Full-object streams are never retried.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    #[serde(
        default = "default_initial_retry_delay",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub initial_retry_delay: Duration,

    #[serde(
        default = "default_max_retry_delay",
        deserialize_with = "duration_serde::deserialize"
    )]
    pub max_retry_delay: Duration,
}

fn default_endpoint() -> String {
    "http://127.0.0.1:4443".to_string()
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_max_retries() -> usize {
    3
}

fn default_initial_retry_delay() -> Duration {
    Duration::from_millis(100)
}

fn default_max_retry_delay() -> Duration {
    Duration::from_secs(10)
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            request_timeout: default_request_timeout(),
            max_retries: default_max_retries(),
            initial_retry_delay: default_initial_retry_delay(),
            max_retry_delay: default_max_retry_delay(),
        }
    }
}

impl ObjectStoreConfig {
    /// Validate the configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if !self.endpoint.starts_with("http://") {
            return Err(format!(
                "Object store endpoint must be a plain http:// URL (TLS is not supported), got '{}'",
                self.endpoint
            ));
        }
        if self.request_timeout.is_zero() {
            return Err("Object store request timeout must be non-zero".to_string());
        }
        if self.initial_retry_delay > self.max_retry_delay {
            return Err(format!(
                "initial_retry_delay ({:?}) must not exceed max_retry_delay ({:?})",
                self.initial_retry_delay, self.max_retry_delay
            ));
        }
        Ok(())
    }
}

/// Application logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Directory for daily-rotated log files; console only when unset
    #[serde(default)]
    pub app_log_dir: Option<PathBuf>,

    /// Days of rotated log files to keep
    #[serde(default = "default_log_retention_days")]
    pub retention_days: u32,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_retention_days() -> u32 {
    7
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            app_log_dir: None,
            retention_days: default_log_retention_days(),
        }
    }
}

impl Config {
    /// Load configuration from file, environment, and command line.
    ///
    /// Returns the parsed matches as well so the binary can read its own
    /// positional arguments.
    pub fn load() -> Result<(Self, ArgMatches)> {
        let matches = Self::build_cli().get_matches();
        let config = Self::from_matches(&matches)?;
        Ok((config, matches))
    }

    /// Resolve configuration from already-parsed command line matches
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = Self::default();

        if let Some(config_path) = matches.get_one::<String>("config") {
            config = Self::load_from_file(config_path)?;
        }

        config.apply_env_overrides();
        config.apply_cli_overrides(matches)?;
        config.finalize()?;

        Ok(config)
    }

    /// Validate and clamp every section, logging the effective cache settings
    pub fn finalize(&mut self) -> Result<()> {
        if let Err(e) = self.object_store.validate() {
            return Err(CacheError::ConfigError(format!(
                "Invalid object store configuration: {}",
                e
            )));
        }

        self.cache.validate_and_clamp();

        if self.cache.is_active() {
            info!(
                "Read cache enabled: dir={:?}, max_size={}, chunk_size={}, wait_timeout={:?}, random_threshold={}, reuse_existing_files={}",
                self.cache.cache_dir,
                self.cache.max_size,
                self.cache.download_chunk_size,
                self.cache.sequential_read_wait_timeout,
                self.cache.random_read_threshold,
                self.cache.reuse_existing_files
            );
        } else {
            info!("Read cache disabled");
        }

        debug!("Configuration: {:?}", self);
        Ok(())
    }

    /// Build CLI argument parser
    pub fn build_cli() -> Command {
        Command::new("bucket-fs-cache")
            .version(env!("CARGO_PKG_VERSION"))
            .about("Read objects through the local file content cache")
            .arg(
                Arg::new("config")
                    .short('c')
                    .long("config")
                    .value_name("FILE")
                    .help("Configuration file path"),
            )
            .arg(
                Arg::new("cache-dir")
                    .long("cache-dir")
                    .value_name("DIR")
                    .help("Cache directory path"),
            )
            .arg(
                Arg::new("max-cache-size")
                    .long("max-cache-size")
                    .value_name("SIZE")
                    .help("Cache byte budget, e.g. 512MiB"),
            )
            .arg(
                Arg::new("chunk-size")
                    .long("chunk-size")
                    .value_name("SIZE")
                    .help("Download chunk size, e.g. 8MiB"),
            )
            .arg(
                Arg::new("disable-cache")
                    .long("disable-cache")
                    .action(ArgAction::SetTrue)
                    .help("Serve every read directly from the object store"),
            )
            .arg(
                Arg::new("endpoint")
                    .long("endpoint")
                    .value_name("URL")
                    .help("Object store endpoint"),
            )
            .arg(
                Arg::new("log-level")
                    .long("log-level")
                    .value_name("LEVEL")
                    .help("Log level (trace, debug, info, warn, error)"),
            )
            .arg(
                Arg::new("passes")
                    .long("passes")
                    .value_name("N")
                    .default_value("1")
                    .help("Number of sequential read passes over the object"),
            )
            .arg(
                Arg::new("block-size")
                    .long("block-size")
                    .value_name("SIZE")
                    .default_value("1MiB")
                    .help("Size of each read issued through the cache handle"),
            )
            .arg(
                Arg::new("output")
                    .short('o')
                    .long("output")
                    .value_name("FILE")
                    .help("Write the object bytes read in the first pass to FILE"),
            )
            .arg(
                Arg::new("bucket")
                    .required(true)
                    .index(1)
                    .help("Bucket name"),
            )
            .arg(
                Arg::new("object")
                    .required(true)
                    .index(2)
                    .help("Object name"),
            )
    }

    /// Load configuration from a YAML file
    pub fn load_from_file(path: &str) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            CacheError::ConfigError(format!("Failed to read config file {}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            CacheError::ConfigError(format!("Failed to parse config file {}: {}", path, e))
        })?;

        info!("Configuration loaded from file: {}", path);
        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        if let Ok(enabled) = std::env::var("CACHE_ENABLED") {
            self.cache.enabled = enabled.to_lowercase() == "true";
        }

        if let Ok(cache_dir) = std::env::var("CACHE_DIR") {
            self.cache.cache_dir = expand_tilde(&cache_dir);
        }

        if let Ok(size) = std::env::var("CACHE_MAX_SIZE") {
            match parse_size(&size) {
                Ok(size) => self.cache.max_size = size,
                Err(e) => warn!("Ignoring CACHE_MAX_SIZE: {}", e),
            }
        }

        if let Ok(size) = std::env::var("CACHE_CHUNK_SIZE") {
            match parse_size(&size) {
                Ok(size) => self.cache.download_chunk_size = size,
                Err(e) => warn!("Ignoring CACHE_CHUNK_SIZE: {}", e),
            }
        }

        if let Ok(endpoint) = std::env::var("OBJECT_STORE_ENDPOINT") {
            self.object_store.endpoint = endpoint;
        }

        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.logging.log_level = level;
        }

        if let Ok(dir) = std::env::var("APP_LOG_DIR") {
            self.logging.app_log_dir = Some(expand_tilde(&dir));
        }
    }

    fn apply_cli_overrides(&mut self, matches: &ArgMatches) -> Result<()> {
        if let Some(dir) = matches.get_one::<String>("cache-dir") {
            self.cache.cache_dir = expand_tilde(dir);
        }

        if let Some(size) = matches.get_one::<String>("max-cache-size") {
            self.cache.max_size = parse_size(size).map_err(CacheError::ConfigError)?;
        }

        if let Some(size) = matches.get_one::<String>("chunk-size") {
            self.cache.download_chunk_size = parse_size(size).map_err(CacheError::ConfigError)?;
        }

        if matches.get_flag("disable-cache") {
            self.cache.enabled = false;
        }

        if let Some(endpoint) = matches.get_one::<String>("endpoint") {
            self.object_store.endpoint = endpoint.clone();
        }

        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duration_parsing_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("5").unwrap(), Duration::from_secs(5));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("10 fortnights").is_err());
    }

    #[test]
    fn test_size_parsing_units() {
        assert_eq!(parse_size("8MiB").unwrap(), 8 * 1024 * 1024);
        assert_eq!(parse_size("1GB").unwrap(), 1_000_000_000);
        assert_eq!(parse_size("4096").unwrap(), 4096);
        assert_eq!(parse_size("1.5KiB").unwrap(), 1536);
        assert!(parse_size("MiB").is_err());
        assert!(parse_size("3 parsecs").is_err());
    }

    #[test]
    fn test_yaml_config_parsing() {
        let yaml = r#"
cache:
  enabled: true
  cache_dir: "/var/cache/bucket-fs"
  max_size: "512MiB"
  download_chunk_size: 1048576
  sequential_read_wait_timeout: "500ms"
  random_read_threshold: 5
  cache_file_for_range_read: true
object_store:
  endpoint: "http://localhost:9000"
  request_timeout: "10s"
  max_retries: 2
logging:
  log_level: "debug"
"#;

        let config: Config = serde_yaml::from_str(yaml).expect("Failed to parse config");

        assert!(config.cache.enabled);
        assert_eq!(config.cache.cache_dir, PathBuf::from("/var/cache/bucket-fs"));
        assert_eq!(config.cache.max_size, 512 * 1024 * 1024);
        assert_eq!(config.cache.download_chunk_size, 1024 * 1024);
        assert_eq!(
            config.cache.sequential_read_wait_timeout,
            Duration::from_millis(500)
        );
        assert_eq!(config.cache.random_read_threshold, 5);
        assert!(config.cache.cache_file_for_range_read);
        assert!(!config.cache.reuse_existing_files);
        assert_eq!(config.object_store.endpoint, "http://localhost:9000");
        assert_eq!(config.object_store.max_retries, 2);
        assert_eq!(
            config.object_store.initial_retry_delay,
            Duration::from_millis(100)
        );
        assert_eq!(config.logging.log_level, "debug");
    }

    #[test]
    fn test_empty_yaml_uses_defaults() {
        let config: Config = serde_yaml::from_str("{}").expect("Failed to parse config");
        assert!(config.cache.enabled);
        assert_eq!(config.cache.download_chunk_size, 8 * 1024 * 1024);
        assert_eq!(config.cache.random_read_threshold, 3);
        assert_eq!(
            config.cache.sequential_read_wait_timeout,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_clamping() {
        let mut cache = FileCacheConfig {
            download_chunk_size: 1024,
            sequential_read_wait_timeout: Duration::from_secs(600),
            random_read_threshold: 0,
            ..FileCacheConfig::default()
        };
        cache.validate_and_clamp();
        assert_eq!(cache.download_chunk_size, 256 * 1024);
        assert_eq!(cache.sequential_read_wait_timeout, Duration::from_secs(60));
        assert_eq!(cache.random_read_threshold, 1);

        let mut zero_budget = FileCacheConfig::with_dir("/tmp/cache", 0);
        zero_budget.validate_and_clamp();
        assert!(!zero_budget.enabled);
        assert!(!zero_budget.is_active());
    }

    #[test]
    fn test_object_store_validation() {
        let mut store = ObjectStoreConfig::default();
        assert!(store.validate().is_ok());

        store.endpoint = "ftp://example".to_string();
        assert!(store.validate().is_err());
        store.endpoint = "https://storage.example.com".to_string();
        assert!(store.validate().is_err());

        let store = ObjectStoreConfig {
            initial_retry_delay: Duration::from_secs(20),
            ..ObjectStoreConfig::default()
        };
        assert!(store.validate().is_err());
    }

    #[test]
    fn test_cli_overrides() {
        let matches = Config::build_cli().get_matches_from([
            "bucket-fs-cache",
            "--cache-dir",
            "/tmp/bucket-cache",
            "--max-cache-size",
            "64MiB",
            "--disable-cache",
            "--log-level",
            "warn",
            "my-bucket",
            "dir/foo",
        ]);
        let config = Config::from_matches(&matches).unwrap();
        assert_eq!(config.cache.cache_dir, PathBuf::from("/tmp/bucket-cache"));
        assert_eq!(config.cache.max_size, 64 * 1024 * 1024);
        assert!(!config.cache.enabled);
        assert_eq!(config.logging.log_level, "warn");
        assert_eq!(
            matches.get_one::<String>("bucket").map(String::as_str),
            Some("my-bucket")
        );
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, "cache:\n  max_size: \"2GiB\"\n").unwrap();

        let config = Config::load_from_file(path.to_str().unwrap()).unwrap();
        assert_eq!(config.cache.max_size, 2 * 1024 * 1024 * 1024);

        let missing = Config::load_from_file("/nonexistent/config.yaml");
        assert!(matches!(missing, Err(CacheError::ConfigError(_))));
    }
}
