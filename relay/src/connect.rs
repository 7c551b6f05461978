//! Contains utility functions that connect to external services,
//! used during service initialization

use crate::config::Configuration;
use crate::directory::FileDirectory;
use crate::gateway::{self, SessionError, WsStream};
use anyhow::{Context, Result};
use slog::Logger;
use std::sync::Arc;

/// Attempts to open the initial upstream gateway session,
/// retrying transient failures with the initialization backoff.
/// Authentication rejections abort immediately: retrying them
/// can never succeed with the same key.
pub async fn to_upstream(config: Arc<Configuration>, logger: Logger) -> Result<WsStream> {
    let initialization_backoff = config.initialization_backoff.build();
    let connect = || async {
        gateway::open_session(&config).await.map_err(|err| match err {
            err @ SessionError::Auth { .. } => backoff::Error::Permanent(err),
            err => {
                slog::warn!(
                    logger,
                    "couldn't connect to upstream gateway; retrying after backoff";
                    "error" => ?err,
                );
                backoff::Error::Transient(err)
            }
        })
    };
    let ws = backoff::future::retry(initialization_backoff, connect)
        .await
        .context("could not connect to the upstream gateway")?;
    slog::info!(
        logger,
        "connected to upstream gateway";
        "url" => &config.services.upstream_gateway,
    );
    Ok(ws)
}

/// Loads the destination directory snapshot from its configured path,
/// retrying with the initialization backoff in case the file is still
/// being provisioned when the service starts
pub async fn to_directory(config: Arc<Configuration>, logger: Logger) -> Result<FileDirectory> {
    let initialization_backoff = config.initialization_backoff.build();
    let path = config.services.directory_file.clone();
    let load = || async {
        FileDirectory::load(&path).await.map_err(|err| {
            slog::warn!(
                logger,
                "couldn't load destination directory; retrying after backoff";
                "error" => ?err,
            );
            backoff::Error::Transient(err)
        })
    };
    let directory = backoff::future::retry(initialization_backoff, load)
        .await
        .context("could not load the destination directory snapshot")?;
    slog::info!(
        logger,
        "loaded destination directory snapshot";
        "path" => &config.services.directory_file,
    );
    Ok(directory)
}

/// Builds the shared HTTP client used for webhook deliveries
pub fn http_client(config: &Configuration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.delivery.timeout)
        .build()
        .context("could not construct the webhook HTTP client")
}
