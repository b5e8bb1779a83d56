//! OpenDAL operator for the remote store remote-only items are hydrated from.

use anyhow::{Context, Result};
use opendal::Operator;
use pxv_core::config::RemoteConfig;

/// Build an OpenDAL S3 operator for the configured remote.
///
/// A plaintext HTTP endpoint is refused when `enforce_tls` is set and
/// logged as a warning otherwise.
pub fn build_operator(
    cfg: &RemoteConfig,
    access_key_id: &str,
    secret_access_key: &str,
) -> Result<Operator> {
    if cfg.endpoint.starts_with("http://") {
        if cfg.enforce_tls {
            anyhow::bail!(
                "refusing plaintext remote endpoint {} while storage.remote.enforce_tls is set",
                cfg.endpoint
            );
        }
        tracing::warn!(
            endpoint = %cfg.endpoint,
            "remote endpoint uses plaintext HTTP; credentials are sent unencrypted"
        );
    }

    let builder = opendal::services::S3::default()
        .endpoint(&cfg.endpoint)
        .region(&cfg.region)
        .bucket(&cfg.bucket)
        .access_key_id(access_key_id)
        .secret_access_key(secret_access_key);

    let op = Operator::new(builder)
        .context("creating OpenDAL S3 operator")?
        .layer(opendal::layers::LoggingLayer::default())
        .layer(
            opendal::layers::RetryLayer::new()
                .with_max_times(5)
                .with_jitter(),
        )
        .finish();

    Ok(op)
}

/// Verify the remote is reachable by listing the root
pub async fn check_health(op: &Operator) -> Result<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| anyhow::anyhow!("remote health check failed: {e}"))
}
