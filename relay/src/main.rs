#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::future_not_send)]

mod alive;
mod config;
mod connect;
mod decode;
mod dedup;
mod directory;
mod dispatch;
mod event;
mod gateway;
mod permissions;
mod queue;
mod shutdown;
mod tracked;
mod util;
mod webhook;

#[cfg(test)]
mod testutils;

use crate::alive::AlivenessMarker;
use crate::config::Configuration;
use crate::dedup::DedupCache;
use crate::dispatch::Dispatcher;
use crate::gateway::StreamConnection;
use crate::permissions::PermissionCache;
use crate::queue::{EventQueue, EventQueueConfig};
use crate::tracked::TrackedIdentities;
use crate::webhook::HttpDeliveryClient;
use anyhow::{Context, Result};
use slog::Logger;
use sloggers::Config;
use std::sync::Arc;

/// Loads the config and bootstraps the service
#[tokio::main]
async fn main() -> Result<()> {
    // Parse the config
    let config_path = std::env::args().nth(1).expect(
        "no config path given \
        \nUsage: \
        \naura-relay [config-path]",
    );
    let config = Arc::new(Configuration::try_load(&config_path)?);

    // Set up the logger from the config
    let logger = config
        .logging
        .build_logger()
        .context("could not build logger from config values")?;

    slog::info!(logger, "configuration loaded"; "path" => config_path);
    slog::debug!(logger, "configuration dump"; "config" => ?config);

    match run(config, logger.clone()).await {
        Ok(_) => slog::info!(logger, "service exited";),
        Err(err) => {
            slog::error!(logger, "an error occurred during service running"; "error" => ?err)
        }
    }
    Ok(())
}

/// Runs the main logic of the service:
/// reads reward events from the upstream gateway, deduplicates them into
/// the bounded queue, and fans each one out to its subscribed webhooks
async fn run(config: Arc<Configuration>, logger: Logger) -> Result<()> {
    // Connect to the upstream gateway and load the destination directory,
    // retrying with the initialization backoff as needed
    let initial_session = connect::to_upstream(Arc::clone(&config), logger.clone()).await?;
    let directory = Arc::new(connect::to_directory(Arc::clone(&config), logger.clone()).await?);

    let tracked = Arc::new(TrackedIdentities::new(
        Arc::clone(&directory),
        config.tracked_refresh_period,
        &logger,
    ));
    tracked
        .refresh()
        .await
        .context("could not load the initial tracked identity snapshot")?;

    let permissions = Arc::new(PermissionCache::new(
        Arc::clone(&directory),
        config.permissions.ttl,
        config.permissions.max_entries,
        &logger,
    ));

    let queue = Arc::new(EventQueue::new(
        EventQueueConfig {
            identifier: String::from("raw_events"),
            max_size: config.raw_events.queue_length,
            warning_threshold: config.raw_events.warn_threshold,
            watch_size_interval: config.raw_events.watch_period,
        },
        &logger,
    ));

    let delivery = Arc::new(HttpDeliveryClient::new(connect::http_client(&config)?));
    let dispatcher = Dispatcher::new(
        Arc::clone(&queue),
        Arc::clone(&directory),
        Arc::clone(&tracked),
        Arc::clone(&permissions),
        delivery,
        config.delivery.clone(),
        &logger,
    );

    let shutdown = shutdown::Shutdown::new();
    tokio::spawn(shutdown::wait_for_signal(shutdown.clone(), logger.clone()));

    let dedup = DedupCache::new(config.dedup.capacity, config.dedup.retention);
    let (gateway, event_stream) = StreamConnection::new(Arc::clone(&config), &logger, dedup);

    // The dispatcher runs on its own task so it keeps draining the queue
    // while the foreground tasks wind down during shutdown
    let mut dispatch_handle = tokio::spawn(async move { dispatcher.run().await });

    // The gateway reader triggering shutdown on exit makes a fatal session
    // error (or event stream closure) tear the whole service down
    let gateway_task = {
        let shutdown = shutdown.clone();
        let receiver = shutdown.subscribe();
        async move {
            let result = gateway.run(initial_session, receiver).await;
            shutdown.trigger();
            result
        }
    };

    let aliveness = AlivenessMarker::new(
        config.liveness.marker_path.clone(),
        config.liveness.period,
        &logger,
    );

    let (gateway_result, (), (), (), ()) = futures::join!(
        gateway_task,
        queue.pipe_in(event_stream),
        queue.watch_size(),
        tracked.run_refresh(shutdown.subscribe()),
        aliveness.run(shutdown.subscribe()),
    );

    // Give the dispatcher a bounded window to drain what remains
    slog::info!(
        logger,
        "waiting for the dispatcher to drain the queue";
        "grace" => ?config.shutdown_grace,
    );
    if tokio::time::timeout(config.shutdown_grace, &mut dispatch_handle)
        .await
        .is_err()
    {
        slog::warn!(
            logger,
            "dispatcher did not drain within the shutdown grace period; aborting it",
        );
        dispatch_handle.abort();
    }

    gateway_result.context("the upstream gateway session failed fatally")?;
    Ok(())
}
