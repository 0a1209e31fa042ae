// Configuration validation
//
// Validates that required fields are present and values are sensible

use super::*;
use anyhow::{bail, Result};
use tracing::warn;

pub fn validate_config(config: &RuntimeConfig) -> Result<()> {
    validate_server_config(&config.server)?;
    validate_source_config(&config.source)?;

    if config.sink.uri.trim().is_empty() {
        bail!("sink.uri must not be empty");
    }

    validate_queue_config(&config.queue)?;
    validate_worker_config(&config.worker, &config.queue)?;

    if let Some(ref auth) = config.auth {
        validate_auth_config(auth)?;
    }

    if config.bridge.poll_enabled && config.bridge.poll_interval_secs == 0 {
        bail!("bridge.poll_interval_secs must be greater than 0 when polling is enabled");
    }

    Ok(())
}

fn validate_server_config(config: &ServerConfig) -> Result<()> {
    if config.listen_addr.is_empty() {
        bail!("server.listen_addr must not be empty");
    }

    // Basic validation that it looks like an address
    if !config.listen_addr.contains(':') {
        bail!("server.listen_addr must be in format 'host:port'");
    }

    Ok(())
}

fn validate_source_config(config: &SourceConfig) -> Result<()> {
    if config.bucket.is_empty() {
        bail!(
            "source.bucket is required\n\n\
            How to fix:\n\
              • Environment: export {}SOURCE_BUCKET=pos-journals\n\
              • TOML: [source]\n              bucket = \"pos-journals\"\n",
            ENV_PREFIX
        );
    }

    match config.backend {
        StorageBackend::Fs => {
            let fs = config
                .fs
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("fs source backend requires 'fs' configuration"))?;

            if fs.path.is_empty() {
                bail!(
                    "Filesystem path is required\n\n\
                    How to fix:\n\
                      • Environment: export {}STORAGE_PATH=/data/journals\n\
                      • TOML: [source.fs]\n              path = \"/data/journals\"\n",
                    ENV_PREFIX
                );
            }
        }
        StorageBackend::S3 => {
            let s3 = config
                .s3
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("s3 source backend requires 's3' configuration"))?;

            if s3.bucket.is_empty() {
                bail!(
                    "S3 bucket name is required\n\n\
                    How to fix:\n\
                      • Environment: export {}S3_BUCKET=my-bucket\n\
                      • TOML: [source.s3]\n              bucket = \"my-bucket\"\n",
                    ENV_PREFIX
                );
            }

            if s3.region.is_empty() {
                bail!(
                    "S3 region is required\n\n\
                    How to fix:\n\
                      • Environment: export {}S3_REGION=us-west-2\n\
                      • TOML: [source.s3]\n              region = \"us-west-2\"\n",
                    ENV_PREFIX
                );
            }
        }
        StorageBackend::R2 => {
            let r2 = config
                .r2
                .as_ref()
                .ok_or_else(|| anyhow::anyhow!("r2 source backend requires 'r2' configuration"))?;

            if r2.bucket.is_empty() || r2.account_id.is_empty() {
                bail!(
                    "R2 bucket and account ID are required\n\n\
                    How to fix:\n\
                      • Environment: export {0}R2_BUCKET=my-bucket {0}R2_ACCOUNT_ID=<id>\n\
                      • TOML: [source.r2]\n              bucket = \"my-bucket\"\n",
                    ENV_PREFIX
                );
            }

            if r2.access_key_id.is_empty() || r2.secret_access_key.is_empty() {
                bail!(
                    "R2 credentials are required\n\n\
                    How to fix:\n\
                      • Environment: export AWS_ACCESS_KEY_ID=<key> AWS_SECRET_ACCESS_KEY=<secret>\n"
                );
            }
        }
        StorageBackend::Memory => {}
    }

    Ok(())
}

fn validate_queue_config(config: &QueueConfig) -> Result<()> {
    if config.ack_deadline_secs == 0 {
        bail!("queue.ack_deadline_secs must be greater than 0");
    }

    if config.max_delivery_attempts == 0 {
        bail!("queue.max_delivery_attempts must be greater than 0");
    }

    if config.min_backoff_secs == 0 {
        bail!("queue.min_backoff_secs must be greater than 0");
    }

    if config.min_backoff_secs > config.max_backoff_secs {
        bail!(
            "queue.min_backoff_secs ({}) must not exceed queue.max_backoff_secs ({})",
            config.min_backoff_secs,
            config.max_backoff_secs
        );
    }

    if config.backoff_multiplier.is_nan() || config.backoff_multiplier < 1.0 {
        bail!("queue.backoff_multiplier must be at least 1.0");
    }

    // Jitter beyond (multiplier - 1) would let a later delay undercut an earlier one
    if config.backoff_jitter.is_nan()
        || config.backoff_jitter < 0.0
        || config.backoff_jitter > config.backoff_multiplier - 1.0
    {
        bail!(
            "queue.backoff_jitter must be within [0, backoff_multiplier - 1] (got {})",
            config.backoff_jitter
        );
    }

    if config.max_in_flight == 0 {
        bail!("queue.max_in_flight must be greater than 0");
    }

    if config.max_delivery_attempts > 100 {
        warn!(
            max_delivery_attempts = config.max_delivery_attempts,
            "queue.max_delivery_attempts is very large; bad uploads will take a long time to quarantine"
        );
    }

    Ok(())
}

fn validate_worker_config(config: &WorkerConfig, queue: &QueueConfig) -> Result<()> {
    if config.parse_timeout_secs == 0 {
        bail!("worker.parse_timeout_secs must be greater than 0");
    }

    if config.deadline_margin_secs >= queue.ack_deadline_secs {
        bail!(
            "worker.deadline_margin_secs ({}) must be smaller than queue.ack_deadline_secs ({})",
            config.deadline_margin_secs,
            queue.ack_deadline_secs
        );
    }

    if config.parse_timeout_secs >= queue.ack_deadline_secs {
        warn!(
            parse_timeout_secs = config.parse_timeout_secs,
            ack_deadline_secs = queue.ack_deadline_secs,
            "worker.parse_timeout_secs exceeds the ack deadline; slow parses will be retried by the queue"
        );
    }

    if config.max_concurrency == 0 {
        bail!("worker.max_concurrency must be greater than 0");
    }

    if config.max_payload_bytes == 0 {
        bail!("worker.max_payload_bytes must be greater than 0");
    }

    if config.max_entries_per_file == 0 {
        bail!("worker.max_entries_per_file must be greater than 0");
    }

    Ok(())
}

fn validate_auth_config(config: &AuthConfig) -> Result<()> {
    if config.issuer.trim().is_empty() {
        bail!("auth.issuer must not be empty");
    }
    if config.audience.trim().is_empty() {
        bail!("auth.audience must not be empty");
    }
    if config.secret_env.trim().is_empty() {
        bail!("auth.secret_env must name the environment variable holding the signing secret");
    }
    if config.enforce && config.allowed_subjects.is_empty() {
        bail!("auth.allowed_subjects must not be empty when auth.enforce is set");
    }
    if config.token_ttl_secs == 0 {
        bail!("auth.token_ttl_secs must be greater than 0");
    }
    Ok(())
}
