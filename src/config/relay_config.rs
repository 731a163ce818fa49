//! Relay Configuration - every pipeline constant as an operator-tunable TOML value
//!
//! Each struct implements `Default` with values from `config::defaults`, so a
//! missing file or a partial file behaves exactly like the built-in constants.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults;

/// Environment variable naming an explicit config file.
pub const CONFIG_ENV_VAR: &str = "RELAY_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "relay.toml";

// ============================================================================
// Top-Level Config
// ============================================================================

/// Root configuration for one relay deployment.
///
/// Load with `RelayConfig::load()` which searches:
/// 1. `$RELAY_CONFIG` env var
/// 2. `./relay.toml`
/// 3. Built-in defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Collector endpoint receiving every payload.
    #[serde(default = "default_endpoint")]
    pub endpoint: String,

    /// Transport strategy ceilings and host capabilities
    #[serde(default)]
    pub transport: TransportConfig,

    /// Batching policy
    #[serde(default)]
    pub queue: QueueConfig,

    /// Durable retry store
    #[serde(default)]
    pub retry: RetryConfig,

    /// Connectivity probing
    #[serde(default)]
    pub network: NetworkConfig,

    /// Request completion correlation
    #[serde(default)]
    pub correlator: CorrelatorConfig,

    /// How long shutdown waits for queued beacons to drain (ms).
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

fn default_endpoint() -> String {
    defaults::DEFAULT_ENDPOINT.to_string()
}

fn default_shutdown_grace_ms() -> u64 {
    defaults::SHUTDOWN_GRACE_MS
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            transport: TransportConfig::default(),
            queue: QueueConfig::default(),
            retry: RetryConfig::default(),
            network: NetworkConfig::default(),
            correlator: CorrelatorConfig::default(),
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl RelayConfig {
    /// Load configuration using the standard search order.
    pub fn load() -> Self {
        // 1. Check env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), endpoint = %config.endpoint, "Loaded relay config from RELAY_CONFIG");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from RELAY_CONFIG, falling back");
                    }
                }
            } else {
                warn!(path = %path, "RELAY_CONFIG points to non-existent file, falling back");
            }
        }

        // 2. Check ./relay.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!(endpoint = %config.endpoint, "Loaded relay config from ./relay.toml");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./relay.toml, using defaults");
                }
            }
        }

        // 3. Defaults
        info!("No relay config file found, using built-in defaults");
        Self::default()
    }

    /// Load from a specific TOML file path.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        let config: Self = toml::from_str(&contents)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(ConfigError::Serialize)
    }

    /// Validate all values for internal consistency.
    ///
    /// Every problem is collected, not just the first one.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors: Vec<String> = Vec::new();

        match reqwest::Url::parse(&self.endpoint) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => {}
            Ok(url) => errors.push(format!(
                "endpoint: unsupported scheme '{}' (expected http or https)",
                url.scheme()
            )),
            Err(e) => errors.push(format!("endpoint: invalid URL '{}': {e}", self.endpoint)),
        }

        if let Some(probe) = &self.network.probe_url {
            if let Err(e) = reqwest::Url::parse(probe) {
                errors.push(format!("network.probe_url: invalid URL '{probe}': {e}"));
            }
        }

        Self::check_positive(self.transport.max_url_length, "transport.max_url_length", &mut errors);
        Self::check_positive(self.transport.max_beacon_bytes, "transport.max_beacon_bytes", &mut errors);
        Self::check_positive(self.transport.beacon_buffer, "transport.beacon_buffer", &mut errors);
        Self::check_positive(self.queue.max, "queue.max", &mut errors);
        Self::check_positive(self.retry.max_items, "retry.max_items", &mut errors);
        Self::check_positive(self.retry.slice_size, "retry.slice_size", &mut errors);
        Self::check_positive(self.correlator.max_tracked, "correlator.max_tracked", &mut errors);

        if self.retry.slice_size > self.retry.max_items {
            errors.push(format!(
                "retry.slice_size ({}) must not exceed retry.max_items ({})",
                self.retry.slice_size, self.retry.max_items
            ));
        }

        if self.endpoint.len() >= self.transport.max_url_length && self.transport.pixel {
            errors.push(format!(
                "transport.max_url_length ({}) leaves no room for query parameters on endpoint of length {}",
                self.transport.max_url_length,
                self.endpoint.len()
            ));
        }

        let t = &self.transport;
        if !(t.beacon || t.pixel || t.keepalive || t.sync_post) {
            errors.push("transport: at least one strategy must be enabled".to_string());
        }

        for pattern in &self.correlator.ignore_patterns {
            if let Err(e) = regex::Regex::new(pattern) {
                errors.push(format!("correlator.ignore_patterns: invalid regex '{pattern}': {e}"));
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    fn check_positive(value: usize, name: &str, errors: &mut Vec<String>) {
        if value == 0 {
            errors.push(format!("{name}: must be greater than 0"));
        }
    }

    /// URL used by the reachability probe.
    ///
    /// Falls back to the endpoint origin plus `/favicon.ico`.
    pub fn probe_url(&self) -> String {
        if let Some(url) = &self.network.probe_url {
            return url.clone();
        }
        match reqwest::Url::parse(&self.endpoint) {
            Ok(mut url) => {
                url.set_path(defaults::DEFAULT_PROBE_PATH);
                url.set_query(None);
                url.to_string()
            }
            Err(_) => self.endpoint.clone(),
        }
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

// ============================================================================
// Transport Config
// ============================================================================

/// Size ceilings and host capability flags for the transport chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Full URL length ceiling for the pixel strategy.
    #[serde(default = "default_max_url_length")]
    pub max_url_length: usize,

    /// Encoded size ceiling (bytes) for the beacon strategy.
    #[serde(default = "default_max_beacon_bytes")]
    pub max_beacon_bytes: usize,

    /// Capacity of the beacon hand-off channel.
    #[serde(default = "default_beacon_buffer")]
    pub beacon_buffer: usize,

    /// Host supports fire-and-forget beacons.
    #[serde(default = "default_true")]
    pub beacon: bool,

    /// Host supports pixel (GET) requests.
    #[serde(default = "default_true")]
    pub pixel: bool,

    /// Host supports async keep-alive POST.
    #[serde(default = "default_true")]
    pub keepalive: bool,

    /// Host supports blocking POST.
    #[serde(default = "default_true")]
    pub sync_post: bool,
}

fn default_max_url_length() -> usize {
    defaults::MAX_URL_LENGTH
}
fn default_max_beacon_bytes() -> usize {
    defaults::MAX_BEACON_BYTES
}
fn default_beacon_buffer() -> usize {
    defaults::BEACON_BUFFER
}
const fn default_true() -> bool {
    true
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            max_url_length: default_max_url_length(),
            max_beacon_bytes: default_max_beacon_bytes(),
            beacon_buffer: default_beacon_buffer(),
            beacon: true,
            pixel: true,
            keepalive: true,
            sync_post: true,
        }
    }
}

// ============================================================================
// Queue Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Queue length that forces a flush.
    #[serde(default = "default_queue_max")]
    pub max: usize,

    /// Wait before a partially-filled queue is flushed (ms).
    #[serde(default = "default_queue_wait_ms")]
    pub wait_ms: u64,
}

fn default_queue_max() -> usize {
    defaults::QUEUE_MAX
}
fn default_queue_wait_ms() -> u64 {
    defaults::QUEUE_WAIT_MS
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max: default_queue_max(),
            wait_ms: default_queue_wait_ms(),
        }
    }
}

impl QueueConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

// ============================================================================
// Retry Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum records kept; oldest are evicted beyond this.
    #[serde(default = "default_retry_max_items")]
    pub max_items: usize,

    /// Records per replay slice.
    #[serde(default = "default_retry_slice_size")]
    pub slice_size: usize,

    /// Pause between successful replay slices (ms).
    #[serde(default = "default_retry_pause_ms")]
    pub pause_ms: u64,

    /// Directory of the sled database backing the store.
    #[serde(default = "default_retry_store_path")]
    pub store_path: PathBuf,

    /// Replay persisted records when the pipeline starts.
    #[serde(default = "default_true")]
    pub replay_on_start: bool,
}

fn default_retry_max_items() -> usize {
    defaults::RETRY_MAX_ITEMS
}
fn default_retry_slice_size() -> usize {
    defaults::RETRY_SLICE_SIZE
}
fn default_retry_pause_ms() -> u64 {
    defaults::RETRY_PAUSE_MS
}
fn default_retry_store_path() -> PathBuf {
    PathBuf::from(defaults::RETRY_STORE_PATH)
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_items: default_retry_max_items(),
            slice_size: default_retry_slice_size(),
            pause_ms: default_retry_pause_ms(),
            store_path: default_retry_store_path(),
            replay_on_start: true,
        }
    }
}

impl RetryConfig {
    pub fn pause(&self) -> Duration {
        Duration::from_millis(self.pause_ms)
    }
}

// ============================================================================
// Network Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Cheap, always-present resource probed with HEAD.
    ///
    /// Defaults to the endpoint origin plus `/favicon.ico`.
    #[serde(default)]
    pub probe_url: Option<String>,

    /// Initial connectivity belief.
    #[serde(default = "default_true")]
    pub assume_online: bool,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            probe_url: None,
            assume_online: true,
        }
    }
}

// ============================================================================
// Correlator Config
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorrelatorConfig {
    /// Quiet period after the last completion (ms).
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,

    /// Maximum calls tracked at once; oldest are dropped beyond this.
    #[serde(default = "default_max_tracked")]
    pub max_tracked: usize,

    /// Targets matching any of these regexes are never tracked.
    #[serde(default)]
    pub ignore_patterns: Vec<String>,
}

fn default_debounce_ms() -> u64 {
    defaults::CORRELATOR_DEBOUNCE_MS
}
fn default_max_tracked() -> usize {
    defaults::CORRELATOR_MAX_TRACKED
}

impl Default for CorrelatorConfig {
    fn default() -> Self {
        Self {
            debounce_ms: default_debounce_ms(),
            max_tracked: default_max_tracked(),
            ignore_patterns: Vec::new(),
        }
    }
}

impl CorrelatorConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ConfigError {
    Io(PathBuf, std::io::Error),
    Parse(PathBuf, toml::de::Error),
    Serialize(toml::ser::Error),
    Validation(Vec<String>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(path, e) => write!(f, "cannot read relay config {}: {}", path.display(), e),
            ConfigError::Parse(path, e) => write!(f, "relay config {} is not valid TOML: {}", path.display(), e),
            ConfigError::Serialize(e) => write!(f, "cannot render relay config as TOML: {}", e),
            ConfigError::Validation(errors) => {
                write!(f, "relay config rejected ({} problem(s))", errors.len())?;
                for e in errors {
                    write!(f, "\n  {}", e)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(_, e) => Some(e),
            ConfigError::Parse(_, e) => Some(e),
            ConfigError::Serialize(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_error_names_count_and_fields() {
        let err = ConfigError::Validation(vec![
            "queue.max must be at least 1".to_string(),
            "endpoint is not an absolute URL".to_string(),
        ]);
        let message = err.to_string();
        assert!(message.starts_with("relay config rejected (2 problem(s))"));
        assert!(message.contains("\n  queue.max"));
        assert!(std::error::Error::source(&err).is_none());
    }

    #[test]
    fn test_defaults_match_constants() {
        let config = RelayConfig::default();
        assert_eq!(config.queue.max, 10);
        assert_eq!(config.queue.wait_ms, 5000);
        assert_eq!(config.retry.max_items, 1000);
        assert_eq!(config.retry.slice_size, 5);
        assert_eq!(config.retry.pause_ms, 500);
        assert_eq!(config.transport.max_url_length, 2048);
        assert_eq!(config.transport.max_beacon_bytes, 128 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: RelayConfig = toml::from_str(
            r#"
            endpoint = "https://log.example.com/collect"

            [queue]
            max = 20
            "#,
        )
        .unwrap();
        assert_eq!(config.queue.max, 20);
        assert_eq!(config.queue.wait_ms, 5000);
        assert!(config.transport.beacon);
    }

    #[test]
    fn test_validation_collects_all_errors() {
        let mut config = RelayConfig::default();
        config.endpoint = "ftp://example.com".to_string();
        config.queue.max = 0;
        config.retry.slice_size = 0;
        config.correlator.ignore_patterns = vec!["(unclosed".to_string()];

        match config.validate() {
            Err(ConfigError::Validation(errors)) => {
                assert_eq!(errors.len(), 4, "errors: {errors:?}");
            }
            other => panic!("expected validation error, got {other:?}"),
        }
    }

    #[test]
    fn test_all_strategies_disabled_rejected() {
        let mut config = RelayConfig::default();
        config.transport.beacon = false;
        config.transport.pixel = false;
        config.transport.keepalive = false;
        config.transport.sync_post = false;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_probe_url_defaults_to_endpoint_origin() {
        let mut config = RelayConfig::default();
        config.endpoint = "https://log.example.com/collect?app=web".to_string();
        assert_eq!(config.probe_url(), "https://log.example.com/favicon.ico");

        config.network.probe_url = Some("https://status.example.com/ping".to_string());
        assert_eq!(config.probe_url(), "https://status.example.com/ping");
    }

    #[test]
    fn test_toml_roundtrip_via_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("relay.toml");
        let mut config = RelayConfig::default();
        config.retry.max_items = 50;
        std::fs::write(&path, config.to_toml().unwrap()).unwrap();

        let loaded = RelayConfig::load_from_file(&path).unwrap();
        assert_eq!(loaded.retry.max_items, 50);
    }
}
