// journal2parquet configuration
//
// Supports configuration from multiple sources:
// 1. Environment variables (highest priority)
// 2. Config file path from JOURNAL2PARQUET_CONFIG env var
// 3. Config file contents from JOURNAL2PARQUET_CONFIG_CONTENT env var
// 4. Default config file locations (./config.toml, ./.journal2parquet.toml)
// 5. Built-in defaults (lowest priority)

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

mod env_overrides;
mod sources;
mod validation;

pub use env_overrides::{EnvSource, ENV_PREFIX};

/// Main runtime configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub source: SourceConfig,

    #[serde(default)]
    pub sink: SinkConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub dead_letter: DeadLetterConfig,

    #[serde(default)]
    pub worker: WorkerConfig,

    #[serde(default)]
    pub dispatcher: DispatcherConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthConfig>,

    #[serde(default)]
    pub bridge: BridgeConfig,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub listen_addr: String,
    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            log_level: "info".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Text,
    Json,
}

/// Object store holding uploaded journal files
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub backend: StorageBackend,

    /// Bucket name carried on upload events. For s3/r2 this should match the
    /// configured bucket; events naming any other bucket are rejected.
    pub bucket: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fs: Option<FsConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub s3: Option<S3Config>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r2: Option<R2Config>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Fs,
            bucket: "journals".to_string(),
            fs: Some(FsConfig::default()),
            s3: None,
            r2: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Fs,
    S3,
    R2,
    Memory,
}

impl std::fmt::Display for StorageBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StorageBackend::Fs => write!(f, "fs"),
            StorageBackend::S3 => write!(f, "s3"),
            StorageBackend::R2 => write!(f, "r2"),
            StorageBackend::Memory => write!(f, "memory"),
        }
    }
}

impl std::str::FromStr for StorageBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "fs" | "filesystem" => Ok(StorageBackend::Fs),
            "s3" | "aws" => Ok(StorageBackend::S3),
            "r2" => Ok(StorageBackend::R2),
            "memory" | "mem" => Ok(StorageBackend::Memory),
            _ => anyhow::bail!(
                "Unsupported storage backend: {}. Supported: fs, s3, r2, memory",
                s
            ),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FsConfig {
    pub path: String,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            path: "./data".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub bucket: String,
    pub region: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct R2Config {
    pub bucket: String,
    pub account_id: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Analytical sink receiving parsed record sets
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Storage URI: memory://, fs:///path, s3://bucket/prefix?region=..&endpoint=..
    pub uri: String,

    /// Name of the environment variable holding the sink token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_env: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            uri: "fs://./warehouse".to_string(),
            token_env: None,
        }
    }
}

/// Delivery, retry and dead-letter policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    pub ack_deadline_secs: u64,
    pub min_backoff_secs: u64,
    pub max_backoff_secs: u64,
    pub backoff_multiplier: f64,
    /// Additive jitter as a fraction of the base delay.
    pub backoff_jitter: f64,
    pub max_delivery_attempts: u32,
    /// Route Fatal-Failure outcomes straight to the dead-letter queue.
    pub fatal_short_circuit: bool,
    pub max_in_flight: usize,
    /// Persist live messages under this storage URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_uri: Option<String>,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            ack_deadline_secs: 300,
            min_backoff_secs: 10,
            max_backoff_secs: 600,
            backoff_multiplier: 2.0,
            backoff_jitter: 0.1,
            max_delivery_attempts: 5,
            fatal_short_circuit: true,
            max_in_flight: 16,
            state_uri: None,
        }
    }
}

impl QueueConfig {
    pub fn ack_deadline(&self) -> Duration {
        Duration::from_secs(self.ack_deadline_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeadLetterConfig {
    /// Persist dead-letter entries under this storage URI.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub parse_timeout_secs: u64,
    /// Safety margin subtracted from the ack deadline to form the processing budget.
    pub deadline_margin_secs: u64,
    /// Only objects ending in one of these suffixes are ingested (empty = all).
    #[serde(default)]
    pub include_suffixes: Vec<String>,
    /// Objects whose path contains this segment are skipped.
    pub exclude_segment: String,
    /// Move ingested objects under `processed_segment` in the source store.
    pub archive_processed: bool,
    pub processed_segment: String,
    pub max_concurrency: usize,
    pub max_payload_bytes: usize,
    /// Upper bound on entries one file may produce, repeat expansion included.
    pub max_entries_per_file: usize,
    /// Leading entries scanned for site, software and pinpad identity.
    pub identity_scan_entries: usize,
    /// Acknowledge without writing when identical content was already ingested
    /// under another object or generation.
    pub skip_duplicate_content: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            parse_timeout_secs: 30,
            deadline_margin_secs: 30,
            include_suffixes: Vec::new(),
            exclude_segment: "/processed/".to_string(),
            archive_processed: false,
            processed_segment: "processed".to_string(),
            max_concurrency: 8,
            max_payload_bytes: 1024 * 1024,
            max_entries_per_file: 1_000_000,
            identity_scan_entries: 5000,
            skip_duplicate_content: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Push endpoint of a remote worker. When unset, deliveries are handled in-process.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,

    /// HTTP request timeout. Defaults to the queue ack deadline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_timeout_secs: Option<u64>,
}

/// Identity tokens attached by the dispatcher and verified by the push ingress
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub issuer: String,
    pub audience: String,
    /// Subject the dispatcher signs as.
    pub subject: String,
    #[serde(default)]
    pub allowed_subjects: Vec<String>,
    /// Name of the environment variable holding the HS256 secret.
    pub secret_env: String,
    /// Reject pushes without a valid token.
    pub enforce: bool,
    pub token_ttl_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            issuer: "journal2parquet".to_string(),
            audience: "journal2parquet-worker".to_string(),
            subject: "journal2parquet-dispatcher".to_string(),
            allowed_subjects: vec!["journal2parquet-dispatcher".to_string()],
            secret_env: "JOURNAL2PARQUET_AUTH_SECRET".to_string(),
            enforce: true,
            token_ttl_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// Poll the source listing for new objects instead of relying on pushed notifications.
    pub poll_enabled: bool,
    pub poll_interval_secs: u64,
    #[serde(default)]
    pub prefix: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_enabled: false,
            poll_interval_secs: 60,
            prefix: String::new(),
        }
    }
}

impl RuntimeConfig {
    /// Load configuration from all sources with priority
    pub fn load() -> Result<Self> {
        sources::load_config()
    }

    /// Load configuration from a specific file path (for CLI usage).
    pub fn load_from_path(path: impl AsRef<std::path::Path>) -> Result<Self> {
        sources::load_from_file_path(path)
    }

    /// Load configuration with graceful fallback to defaults.
    /// Does not fail if config file is missing.
    pub fn load_or_default() -> Result<Self> {
        sources::load_or_default()
    }

    /// Merge another config into this one (used for TOML layering).
    pub fn merge(&mut self, other: RuntimeConfig) {
        self.server = other.server;
        self.source = other.source;
        self.sink = other.sink;
        self.queue = other.queue;
        self.dead_letter = other.dead_letter;
        self.worker = other.worker;
        self.dispatcher = other.dispatcher;
        self.bridge = other.bridge;

        if other.auth.is_some() {
            self.auth = other.auth;
        }
    }

    /// Apply environment overrides from a custom source.
    pub fn apply_env_overrides_from<E: EnvSource>(&mut self, env: &E) -> Result<()> {
        env_overrides::apply_env_overrides(self, env)
    }

    /// Build a configuration from inline TOML plus overrides supplied by an `EnvSource`.
    pub fn load_with_env<E: EnvSource>(inline_config: Option<&str>, env: &E) -> Result<Self> {
        let mut config = RuntimeConfig::default();

        if let Some(inline) = inline_config {
            let file_config: RuntimeConfig =
                toml::from_str(inline).context("Failed to parse inline config content")?;
            config.merge(file_config);
        }

        config.apply_env_overrides_from(env)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        validation::validate_config(self)
    }
}
