//! Configuration snapshot for the schema governance proxy
//!
//! The pipeline reads a validated, immutable [`ProxyConfig`] built from the
//! YAML configuration file. Hot reload replaces the whole snapshot
//! atomically; workers observe the new snapshot at message boundaries.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level proxy configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProxyConfig {
    /// General settings
    pub global: GlobalConfig,

    /// Broker connections (subscriber ingests, publisher forwards)
    pub brokers: BrokersConfig,

    /// Topic allow-list and schema bindings
    pub validation: ValidationConfig,

    /// Quarantine index and payload blob storage
    pub storage: StorageConfig,

    /// Metrics, health check, audit trail
    pub monitoring: MonitoringConfig,

    /// Rate limiting
    pub security: SecurityConfig,

    /// Queue and worker tuning
    pub performance: PerformanceConfig,
}

// ============================================================================
// Global
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GlobalConfig {
    /// Prefix for the proxy's own MQTT client ids
    pub client_id_prefix: String,

    /// Maximum accepted payload size in bytes
    pub max_message_size: usize,

    /// Soft per-message deadline; also the backpressure wait at the queue
    pub message_timeout_secs: u64,

    /// Drain window on shutdown before in-flight work is abandoned
    pub shutdown_timeout_secs: u64,

    /// Validate and audit but never forward
    pub dry_run: bool,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            client_id_prefix: "schema-proxy".to_string(),
            max_message_size: default_max_message_size(),
            message_timeout_secs: 5,
            shutdown_timeout_secs: 30,
            dry_run: false,
        }
    }
}

impl GlobalConfig {
    pub fn message_timeout(&self) -> Duration {
        Duration::from_secs(self.message_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

// ============================================================================
// Brokers
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct BrokersConfig {
    pub subscriber: BrokerConfig,
    pub publisher: BrokerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keepalive_secs: u64,
    pub clean_session: bool,

    /// Transport selection
    pub transport: TransportKind,

    /// TLS settings, used when transport is `tls` (or `websocket` with
    /// `secure: true`)
    pub tls: Option<TlsSettings>,

    /// WebSocket settings, used when transport is `websocket`
    pub websocket: Option<WebSocketSettings>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            username: None,
            password: None,
            keepalive_secs: 60,
            clean_session: true,
            transport: TransportKind::Tcp,
            tls: None,
            websocket: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    #[default]
    Tcp,
    Tls,
    Websocket,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct TlsSettings {
    /// CA bundle in PEM format
    pub ca_file: Option<PathBuf>,
    /// Client certificate in PEM format
    pub cert_file: Option<PathBuf>,
    /// Client private key in PEM format
    pub key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct WebSocketSettings {
    /// Request path on the broker, e.g. `/mqtt`
    pub path: String,
    /// Use wss (requires the `tls` block)
    pub secure: bool,
}

impl Default for WebSocketSettings {
    fn default() -> Self {
        Self {
            path: "/mqtt".to_string(),
            secure: false,
        }
    }
}

// ============================================================================
// Validation
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct ValidationConfig {
    /// Topic allow-list (MQTT wildcard patterns, also the subscription set)
    pub topic_patterns: Vec<String>,

    /// Ordered pattern -> schema bindings; first match wins
    pub schema_mappings: Vec<SchemaMapping>,

    /// Schema definitions keyed by schema id
    pub schema_files: HashMap<String, SchemaFileConfig>,

    /// Per-client topic restrictions, keyed by client id
    pub client_rules: HashMap<String, ClientRules>,

    /// strict, lenient, or warn_only
    pub validation_mode: ValidationMode,

    /// Alias for `performance.validation-cache-size` (lower precedence)
    pub cache_size: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchemaMapping {
    pub pattern: String,
    pub schema_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SchemaFileConfig {
    /// Schema source: a JSON Schema document or a compiled protobuf
    /// descriptor set, per `format`
    pub file: PathBuf,

    #[serde(default)]
    pub format: SchemaFormat,

    /// JSON Schema draft (jsonschema format only)
    #[serde(default)]
    pub draft: JsonSchemaDraft,

    /// Fully-qualified protobuf message type (protobuf format only)
    pub message_type: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SchemaFormat {
    #[default]
    Jsonschema,
    Protobuf,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
pub enum JsonSchemaDraft {
    #[serde(rename = "draft-04")]
    Draft4,
    #[serde(rename = "draft-06")]
    Draft6,
    #[default]
    #[serde(rename = "draft-07")]
    Draft7,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct ClientRules {
    /// Topics this client may publish to; the global allow-list still applies
    pub allowed_topics: Vec<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ValidationMode {
    #[default]
    Strict,
    Lenient,
    WarnOnly,
}

// ============================================================================
// Storage
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct StorageConfig {
    pub quarantine: QuarantineConfig,
    pub payloads: PayloadStoreConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct QuarantineConfig {
    /// Index driver; this build ships `embedded` (SQLite)
    pub driver: String,

    /// SQLite database path for the embedded driver
    pub path: PathBuf,

    /// Records older than this are removed by the retention sweep
    pub cleanup_days: u32,

    /// Soft ceiling on total stored payload bytes; oldest-first eviction
    /// kicks in above it
    pub max_size_bytes: Option<u64>,

    /// Retention sweep period
    pub sweep_interval_secs: u64,
}

impl Default for QuarantineConfig {
    fn default() -> Self {
        Self {
            driver: "embedded".to_string(),
            path: PathBuf::from("quarantine.sqlite3"),
            cleanup_days: 30,
            max_size_bytes: None,
            sweep_interval_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PayloadStoreConfig {
    /// Root of the content-addressed blob tree
    pub root: PathBuf,

    pub compression: Compression,

    /// Blobs with no referring row are reaped after this grace period
    pub reaper_grace_secs: u64,

    pub reaper_interval_secs: u64,
}

impl Default for PayloadStoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("payloads"),
            compression: Compression::None,
            reaper_grace_secs: 3600,
            reaper_interval_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Compression {
    #[default]
    None,
    Gzip,
}

// ============================================================================
// Monitoring
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct MonitoringConfig {
    pub metrics: MetricsConfig,
    pub health_check: HealthCheckConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct MetricsConfig {
    pub enabled: bool,
    pub port: u16,
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9100,
            path: "/metrics".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct HealthCheckConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 9101,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct AuditConfig {
    pub destination: AuditDestination,

    /// Audit trail path for the file destination
    pub path: PathBuf,

    /// Rotate the audit file when it grows past this size
    pub max_file_bytes: u64,

    /// In-memory buffer; oldest unwritten events are dropped on overflow
    pub buffer_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            destination: AuditDestination::File,
            path: PathBuf::from("logs/audit.jsonl"),
            max_file_bytes: 64 * 1024 * 1024,
            buffer_size: 4096,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditDestination {
    #[default]
    File,
    Stdout,
}

// ============================================================================
// Security
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case", default)]
pub struct SecurityConfig {
    pub rate_limiting: RateLimitingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitingConfig {
    pub enabled: bool,

    /// Messages per refill window, per client; burst equals the rate
    pub rate_limit: u32,

    /// Token bucket refill period in seconds
    pub window_size_secs: u64,

    /// What to do with over-limit messages
    pub mode: OverflowMode,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate_limit: 100,
            window_size_secs: 1,
            mode: OverflowMode::Quarantine,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverflowMode {
    #[default]
    Quarantine,
    Drop,
}

// ============================================================================
// Performance
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PerformanceConfig {
    pub worker_threads: usize,
    pub message_buffer_size: usize,
    pub validation_cache_size: Option<usize>,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            message_buffer_size: 10_000,
            validation_cache_size: None,
        }
    }
}

// ============================================================================
// Loading and validation
// ============================================================================

const MIN_MESSAGE_SIZE: usize = 1024;
const MAX_MESSAGE_SIZE: usize = 100 * 1024 * 1024;
const DEFAULT_VALIDATION_CACHE_SIZE: usize = 1000;

fn default_max_message_size() -> usize {
    1024 * 1024
}

impl ProxyConfig {
    /// Load a configuration file, apply `key=value` overrides, and validate.
    pub fn load(path: &Path, overrides: &[String]) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut value: serde_yaml::Value = serde_yaml::from_str(&raw)?;

        for entry in overrides {
            apply_override(&mut value, entry)?;
        }

        let mut config: ProxyConfig = serde_yaml::from_value(value)?;
        config.resolve_paths(path.parent().unwrap_or_else(|| Path::new(".")));
        config.validate()?;
        Ok(config)
    }

    /// Normalize schema file paths relative to the config file directory.
    fn resolve_paths(&mut self, base: &Path) {
        for schema in self.validation.schema_files.values_mut() {
            if schema.file.is_relative() {
                schema.file = base.join(&schema.file);
            }
        }
    }

    /// Structural validation beyond what serde enforces.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.global.max_message_size < MIN_MESSAGE_SIZE
            || self.global.max_message_size > MAX_MESSAGE_SIZE
        {
            return Err(ConfigError::OutOfRange {
                field: "global.max-message-size",
                reason: format!(
                    "{} outside {}..{}",
                    self.global.max_message_size, MIN_MESSAGE_SIZE, MAX_MESSAGE_SIZE
                ),
            });
        }

        if self.performance.worker_threads == 0 {
            return Err(ConfigError::OutOfRange {
                field: "performance.worker-threads",
                reason: "must be at least 1".to_string(),
            });
        }

        // The broker layer appends "-subscriber"/"-publisher"; the combined
        // id must satisfy ^[A-Za-z0-9_-]{1,23}$.
        if self.global.client_id_prefix.is_empty()
            || self.global.client_id_prefix.len() > 12
            || !self
                .global
                .client_id_prefix
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
        {
            return Err(ConfigError::OutOfRange {
                field: "global.client-id-prefix",
                reason: "must match [A-Za-z0-9_-]{1,12}".to_string(),
            });
        }

        if self.storage.quarantine.driver != "embedded" {
            return Err(ConfigError::UnsupportedDriver(
                self.storage.quarantine.driver.clone(),
            ));
        }

        for mapping in &self.validation.schema_mappings {
            if !self.validation.schema_files.contains_key(&mapping.schema_id) {
                return Err(ConfigError::UnknownSchemaId {
                    pattern: mapping.pattern.clone(),
                    schema_id: mapping.schema_id.clone(),
                });
            }
        }

        Ok(())
    }

    /// Effective validation cache size; `performance` wins over the
    /// `validation.cache-size` alias.
    pub fn validation_cache_size(&self) -> usize {
        self.performance
            .validation_cache_size
            .or(self.validation.cache_size)
            .unwrap_or(DEFAULT_VALIDATION_CACHE_SIZE)
    }
}

/// Apply a dotted-path `key=value` override onto the raw YAML value.
fn apply_override(root: &mut serde_yaml::Value, entry: &str) -> Result<(), ConfigError> {
    let (key, raw_value) = entry
        .split_once('=')
        .ok_or_else(|| ConfigError::InvalidOverride(entry.to_string()))?;
    if key.is_empty() {
        return Err(ConfigError::InvalidOverride(entry.to_string()));
    }

    // Scalars parse as YAML so `true`, `42`, and strings all work.
    let parsed: serde_yaml::Value =
        serde_yaml::from_str(raw_value).unwrap_or(serde_yaml::Value::String(raw_value.to_string()));

    let mut node = root;
    let segments: Vec<&str> = key.split('.').collect();
    for (i, segment) in segments.iter().enumerate() {
        if !node.is_mapping() {
            *node = serde_yaml::Value::Mapping(Default::default());
        }
        let map = node.as_mapping_mut().expect("mapping just ensured");
        let seg_key = serde_yaml::Value::String((*segment).to_string());
        if i == segments.len() - 1 {
            map.insert(seg_key, parsed);
            return Ok(());
        }
        node = map
            .entry(seg_key)
            .or_insert(serde_yaml::Value::Mapping(Default::default()));
    }
    Ok(())
}
