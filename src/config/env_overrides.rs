use super::{AuthConfig, FsConfig, LogFormat, R2Config, RuntimeConfig, S3Config, StorageBackend};
use anyhow::{anyhow, Context, Result};

pub const ENV_PREFIX: &str = "JOURNAL2PARQUET_";

/// Abstraction over environment-variable lookups so tests can supply their
/// own source of overrides.
pub trait EnvSource {
    fn get(&self, key: &str) -> Option<String>;

    /// Get an environment variable WITHOUT the JOURNAL2PARQUET_ prefix
    /// Used for AWS standard variables (AWS_ACCESS_KEY_ID, etc.)
    fn get_raw(&self, key: &str) -> Option<String>;
}

/// Apply environment-variable overrides (highest priority) to the runtime config.
pub fn apply_env_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    // Server configuration (listen addr, log level/format)
    if let Some(addr) = env.get("LISTEN_ADDR") {
        config.server.listen_addr = addr;
    }
    if let Some(level) = env.get("LOG_LEVEL") {
        config.server.log_level = level;
    }
    if let Some(format) = env.get("LOG_FORMAT") {
        config.server.log_format = match format.to_lowercase().as_str() {
            "json" => LogFormat::Json,
            _ => LogFormat::Text,
        };
    }

    apply_source_overrides(config, env)?;

    // Sink
    if let Some(uri) = env.get("SINK_URI") {
        config.sink.uri = uri;
    }
    if let Some(token_env) = env.get("SINK_TOKEN_ENV") {
        config.sink.token_env = Some(token_env);
    }

    // Queue policy
    if let Some(val) = get_env_u64(env, "QUEUE_ACK_DEADLINE_SECS")? {
        config.queue.ack_deadline_secs = val;
    }
    if let Some(val) = get_env_u64(env, "QUEUE_MIN_BACKOFF_SECS")? {
        config.queue.min_backoff_secs = val;
    }
    if let Some(val) = get_env_u64(env, "QUEUE_MAX_BACKOFF_SECS")? {
        config.queue.max_backoff_secs = val;
    }
    if let Some(val) = get_env_f64(env, "QUEUE_BACKOFF_MULTIPLIER")? {
        config.queue.backoff_multiplier = val;
    }
    if let Some(val) = get_env_f64(env, "QUEUE_BACKOFF_JITTER")? {
        config.queue.backoff_jitter = val;
    }
    if let Some(val) = get_env_u64(env, "QUEUE_MAX_DELIVERY_ATTEMPTS")? {
        config.queue.max_delivery_attempts = u32::try_from(val).map_err(|e| {
            anyhow!(
                "Failed to parse {}QUEUE_MAX_DELIVERY_ATTEMPTS: {}",
                ENV_PREFIX,
                e
            )
        })?;
    }
    if let Some(val) = get_env_bool(env, "QUEUE_FATAL_SHORT_CIRCUIT")? {
        config.queue.fatal_short_circuit = val;
    }
    if let Some(val) = get_env_usize(env, "QUEUE_MAX_IN_FLIGHT")? {
        config.queue.max_in_flight = val;
    }
    if let Some(uri) = env.get("QUEUE_STATE_URI") {
        config.queue.state_uri = non_empty(uri);
    }
    if let Some(uri) = env.get("DEAD_LETTER_URI") {
        config.dead_letter.uri = non_empty(uri);
    }

    // Worker
    if let Some(val) = get_env_u64(env, "WORKER_PARSE_TIMEOUT_SECS")? {
        config.worker.parse_timeout_secs = val;
    }
    if let Some(val) = get_env_u64(env, "WORKER_DEADLINE_MARGIN_SECS")? {
        config.worker.deadline_margin_secs = val;
    }
    if let Some(val) = env.get("WORKER_INCLUDE_SUFFIXES") {
        config.worker.include_suffixes = parse_csv(&val);
    }
    if let Some(val) = get_env_bool(env, "WORKER_ARCHIVE_PROCESSED")? {
        config.worker.archive_processed = val;
    }
    if let Some(val) = get_env_usize(env, "WORKER_MAX_CONCURRENCY")? {
        config.worker.max_concurrency = val;
    }
    if let Some(val) = get_env_usize(env, "MAX_PAYLOAD_BYTES")? {
        config.worker.max_payload_bytes = val;
    }
    if let Some(val) = get_env_usize(env, "WORKER_MAX_ENTRIES_PER_FILE")? {
        config.worker.max_entries_per_file = val;
    }
    if let Some(val) = get_env_bool(env, "WORKER_SKIP_DUPLICATE_CONTENT")? {
        config.worker.skip_duplicate_content = val;
    }

    // Dispatcher
    if let Some(endpoint) = env.get("DISPATCH_ENDPOINT") {
        config.dispatcher.endpoint = non_empty(endpoint);
    }
    if let Some(val) = get_env_u64(env, "DISPATCH_REQUEST_TIMEOUT_SECS")? {
        config.dispatcher.request_timeout_secs = Some(val);
    }

    apply_auth_overrides(config, env)?;

    // Bridge
    if let Some(val) = get_env_bool(env, "BRIDGE_POLL_ENABLED")? {
        config.bridge.poll_enabled = val;
    }
    if let Some(val) = get_env_u64(env, "BRIDGE_POLL_INTERVAL_SECS")? {
        config.bridge.poll_interval_secs = val;
    }
    if let Some(prefix) = env.get("BRIDGE_PREFIX") {
        config.bridge.prefix = prefix;
    }

    Ok(())
}

fn apply_source_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    if let Some(backend) = env.get("SOURCE_BACKEND") {
        config.source.backend = backend
            .parse::<StorageBackend>()
            .context("Invalid JOURNAL2PARQUET_SOURCE_BACKEND value")?;
    }
    if let Some(bucket) = env.get("SOURCE_BUCKET") {
        config.source.bucket = bucket;
    }

    // Filesystem storage
    if let Some(path) = env.get("STORAGE_PATH") {
        config.source.fs.get_or_insert_with(FsConfig::default).path = path;
    }

    // S3 storage
    if let Some(bucket) = env.get("S3_BUCKET") {
        ensure_s3(config).bucket = bucket;
    }
    if let Some(region) = env.get("S3_REGION") {
        ensure_s3(config).region = region;
    }
    if let Some(endpoint) = env.get("S3_ENDPOINT") {
        ensure_s3(config).endpoint = Some(endpoint);
    }

    // R2 storage
    if let Some(bucket) = env.get("R2_BUCKET") {
        ensure_r2(config).bucket = bucket;
    }
    if let Some(account_id) = env.get("R2_ACCOUNT_ID") {
        ensure_r2(config).account_id = account_id;
    }
    // AWS standard credentials (without JOURNAL2PARQUET_ prefix for compatibility)
    if config.source.backend == StorageBackend::R2 {
        if let Some(access_key_id) = env.get_raw("AWS_ACCESS_KEY_ID") {
            ensure_r2(config).access_key_id = access_key_id;
        }
        if let Some(secret_access_key) = env.get_raw("AWS_SECRET_ACCESS_KEY") {
            ensure_r2(config).secret_access_key = secret_access_key;
        }
        if let Some(endpoint) = env.get_raw("AWS_ENDPOINT_URL") {
            ensure_r2(config).endpoint = Some(endpoint);
        }
    }

    Ok(())
}

fn apply_auth_overrides<E: EnvSource>(config: &mut RuntimeConfig, env: &E) -> Result<()> {
    if let Some(issuer) = env.get("AUTH_ISSUER") {
        ensure_auth(config).issuer = issuer;
    }
    if let Some(audience) = env.get("AUTH_AUDIENCE") {
        ensure_auth(config).audience = audience;
    }
    if let Some(subject) = env.get("AUTH_SUBJECT") {
        ensure_auth(config).subject = subject;
    }
    if let Some(subjects) = env.get("AUTH_ALLOWED_SUBJECTS") {
        ensure_auth(config).allowed_subjects = parse_csv(&subjects);
    }
    if let Some(val) = get_env_bool(env, "AUTH_ENFORCE")? {
        ensure_auth(config).enforce = val;
    }
    if let Some(val) = get_env_u64(env, "AUTH_TOKEN_TTL_SECS")? {
        ensure_auth(config).token_ttl_secs = val;
    }
    Ok(())
}

fn ensure_s3(config: &mut RuntimeConfig) -> &mut S3Config {
    config.source.s3.get_or_insert_with(|| S3Config {
        bucket: String::new(),
        region: String::new(),
        endpoint: None,
    })
}

fn ensure_r2(config: &mut RuntimeConfig) -> &mut R2Config {
    config.source.r2.get_or_insert_with(|| R2Config {
        bucket: String::new(),
        account_id: String::new(),
        access_key_id: String::new(),
        secret_access_key: String::new(),
        endpoint: None,
    })
}

fn ensure_auth(config: &mut RuntimeConfig) -> &mut AuthConfig {
    config.auth.get_or_insert_with(AuthConfig::default)
}

fn get_env_usize<E: EnvSource>(env: &E, key: &str) -> Result<Option<usize>> {
    match env.get(key) {
        Some(val) => {
            let parsed = val
                .trim()
                .parse::<usize>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_u64<E: EnvSource>(env: &E, key: &str) -> Result<Option<u64>> {
    match env.get(key) {
        Some(val) => {
            let parsed = val
                .trim()
                .parse::<u64>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_f64<E: EnvSource>(env: &E, key: &str) -> Result<Option<f64>> {
    match env.get(key) {
        Some(val) => {
            let parsed = val
                .trim()
                .parse::<f64>()
                .map_err(|e| anyhow!("Failed to parse {}{}: {}", ENV_PREFIX, key, e))?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn get_env_bool<E: EnvSource>(env: &E, key: &str) -> Result<Option<bool>> {
    match env.get(key) {
        Some(val) => {
            let parsed = val.trim().parse::<bool>().map_err(|e| {
                anyhow!(
                    "Failed to parse {}{} (expected bool): {}",
                    ENV_PREFIX,
                    key,
                    e
                )
            })?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

fn parse_csv(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn non_empty(value: String) -> Option<String> {
    if value.trim().is_empty() {
        None
    } else {
        Some(value)
    }
}
