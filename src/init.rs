// Initialization utilities for the server
//
// Logging, storage operators, identity tokens and the dead-letter store

use crate::auth::IdentityTokens;
use crate::config::{LogFormat, RuntimeConfig, ServerConfig, StorageBackend};
use crate::dead_letter::DeadLetterQueue;
use crate::queue::QueueStore;
use crate::sink::ParquetSink;
use crate::source::OpendalSource;
use crate::storage::{operator_from_uri, source_operator};
use anyhow::{bail, Context, Result};
use tracing::{info, warn};

/// Initialize tracing/logging from the server config.
pub fn init_tracing(server: &ServerConfig) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let env_filter =
        EnvFilter::try_new(&server.log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(env_filter);

    // Try to set the global subscriber; ignore error if already set (idempotent)
    let _ = match server.log_format {
        LogFormat::Json => {
            tracing::subscriber::set_global_default(registry.with(fmt::layer().json()))
        }
        LogFormat::Text => tracing::subscriber::set_global_default(registry.with(fmt::layer())),
    };
}

pub(crate) fn init_source(config: &RuntimeConfig) -> Result<OpendalSource> {
    info!(
        "Initializing source with storage backend: {}",
        config.source.backend
    );
    if config.source.backend == StorageBackend::Memory {
        warn!("Memory source backend: uploads are lost on restart");
    }
    let operator = source_operator(&config.source).context("Failed to create source operator")?;
    Ok(OpendalSource::new(operator, config.source.bucket.clone()))
}

pub(crate) fn init_sink(config: &RuntimeConfig) -> Result<ParquetSink> {
    let token = match &config.sink.token_env {
        Some(var) => match std::env::var(var) {
            Ok(token) if !token.trim().is_empty() => Some(token),
            _ => {
                warn!("Sink token variable {} is not set; connecting without it", var);
                None
            }
        },
        None => None,
    };
    info!("Using sink: {}", config.sink.uri);
    let operator = operator_from_uri(&config.sink.uri, token.as_deref())
        .context("Failed to create sink operator")?;
    Ok(ParquetSink::new(operator))
}

/// Identity tokens, if `[auth]` is configured.
///
/// A missing secret is fatal when enforcement is on; otherwise the ingress
/// runs unauthenticated with a warning.
pub(crate) fn init_identity(config: &RuntimeConfig) -> Result<Option<IdentityTokens>> {
    let Some(auth) = config.auth.clone() else {
        info!("Identity tokens disabled (no [auth] section)");
        return Ok(None);
    };

    let secret = std::env::var(&auth.secret_env).unwrap_or_default();
    if secret.trim().is_empty() {
        if auth.enforce {
            bail!(
                "auth.enforce is set but {} is empty.\n\n\
                How to fix:\n  \
                export {}=<shared secret>\n  \
                or set auth.enforce = false for local development",
                auth.secret_env,
                auth.secret_env
            );
        }
        warn!(
            "{} is empty; pushes are accepted without identity tokens",
            auth.secret_env
        );
        return Ok(None);
    }

    info!(
        "Identity tokens enabled: issuer={}, audience={}, enforce={}",
        auth.issuer, auth.audience, auth.enforce
    );
    Ok(Some(IdentityTokens::new(auth, &secret)?))
}

pub(crate) async fn init_dead_letters(config: &RuntimeConfig) -> Result<DeadLetterQueue> {
    let Some(uri) = &config.dead_letter.uri else {
        warn!("No dead_letter.uri configured; dead-letter entries are kept in memory only");
        return Ok(DeadLetterQueue::new());
    };
    let operator = operator_from_uri(uri, None).context("Failed to create dead-letter operator")?;
    let dead_letters = DeadLetterQueue::with_store(operator);
    let loaded = dead_letters
        .load()
        .await
        .with_context(|| format!("Failed to load dead-letter entries from {}", uri))?;
    info!("Dead-letter store at {} ({} existing entries)", uri, loaded);
    Ok(dead_letters)
}

pub(crate) fn init_queue_store(config: &RuntimeConfig) -> Result<Option<QueueStore>> {
    let Some(uri) = &config.queue.state_uri else {
        return Ok(None);
    };
    let operator = operator_from_uri(uri, None).context("Failed to create queue state operator")?;
    info!("Queue state persisted at {}", uri);
    Ok(Some(QueueStore::new(operator)))
}
