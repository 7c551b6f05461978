//! Consumes decoded reward events from the bounded queue and fans each one
//! out to the destinations subscribed to its owners. Deliveries to separate
//! destinations run concurrently and in isolation: one destination timing
//! out, failing authorization, or erroring never delays or cancels the
//! others. A transient delivery failure gets exactly one immediate retry.

use crate::config::DeliveryConfig;
use crate::directory::{Destination, DirectoryError, OwnerId, UpstreamDirectory};
use crate::event::RewardEvent;
use crate::permissions::PermissionCache;
use crate::queue::EventQueue;
use crate::tracked::TrackedIdentities;
use crate::webhook::{self, DeliveryClient, DeliveryError};
use futures::StreamExt;
use slog::Logger;
use std::collections::HashSet;
use std::sync::Arc;

pub struct Dispatcher<D: UpstreamDirectory, C: DeliveryClient> {
    queue: Arc<EventQueue>,
    directory: Arc<D>,
    tracked: Arc<TrackedIdentities<D>>,
    permissions: Arc<PermissionCache<D>>,
    delivery: Arc<C>,
    config: DeliveryConfig,
    logger: Logger,
}

impl<D: UpstreamDirectory, C: DeliveryClient> Dispatcher<D, C> {
    pub fn new(
        queue: Arc<EventQueue>,
        directory: Arc<D>,
        tracked: Arc<TrackedIdentities<D>>,
        permissions: Arc<PermissionCache<D>>,
        delivery: Arc<C>,
        config: DeliveryConfig,
        logger: &Logger,
    ) -> Self {
        Self {
            queue,
            directory,
            tracked,
            permissions,
            delivery,
            config,
            logger: logger.new(slog::o!("component" => "dispatcher")),
        }
    }

    /// Processes queued events until the queue is closed and drained
    pub async fn run(&self) {
        while let Some(slot) = self.queue.dequeue().await {
            let time_in_queue = slot.enqueued_at.elapsed();
            slog::debug!(
                self.logger,
                "dequeued reward event";
                "username" => &slot.event.username,
                "reward" => &slot.event.reward,
                "time_in_queue" => ?time_in_queue,
            );
            self.process_event(&slot.event).await;
        }
        slog::info!(self.logger, "event queue closed and drained; dispatcher exiting");
    }

    async fn process_event(&self, event: &RewardEvent) {
        if !self.tracked.contains(&event.username).await {
            slog::debug!(
                self.logger,
                "event identity is not tracked; skipping";
                "username" => &event.username,
            );
            return;
        }

        let owners = match self.directory.owners_of(&event.username).await {
            Ok(owners) => owners,
            Err(DirectoryError::UnknownIdentity(username)) => {
                slog::debug!(
                    self.logger,
                    "tracked identity has no directory entry; skipping";
                    "username" => username,
                );
                return;
            }
            Err(err) => {
                slog::warn!(
                    self.logger,
                    "owner lookup failed; dropping event";
                    "username" => &event.username,
                    "error" => ?err,
                );
                return;
            }
        };

        // Collect targets up front, delivering to each guild at most once
        // even when multiple owners of the identity share a destination
        let mut seen_guilds = HashSet::<u64>::new();
        let mut targets = Vec::<(OwnerId, Destination)>::new();
        for owner in owners {
            let destinations = match self.directory.destinations_for(owner).await {
                Ok(destinations) => destinations,
                Err(err) => {
                    slog::warn!(
                        self.logger,
                        "destination lookup failed; skipping owner";
                        "owner_id" => owner.0,
                        "error" => ?err,
                    );
                    continue;
                }
            };
            for destination in destinations {
                if seen_guilds.insert(destination.guild_id) {
                    targets.push((owner, destination));
                }
            }
        }

        futures::stream::iter(targets)
            .for_each_concurrent(Some(self.config.concurrency), |(owner, destination)| {
                self.deliver_to(event, owner, destination)
            })
            .await;
    }

    async fn deliver_to(&self, event: &RewardEvent, owner: OwnerId, destination: Destination) {
        let logger = self.logger.new(slog::o!(
            "guild_id" => destination.guild_id,
            "owner_id" => owner.0,
            "username" => event.username.clone(),
            "reward" => event.reward.clone(),
        ));

        let decision = self.permissions.check(owner, &destination).await;
        if !decision.permits() {
            if decision.lookup_failed {
                slog::warn!(
                    logger,
                    "role membership could not be determined; skipping this delivery only";
                );
            } else if destination.enabled && !decision.role_satisfied {
                slog::info!(
                    logger,
                    "owner does not hold the destination's required role; skipping delivery";
                );
            } else {
                slog::debug!(logger, "destination is disabled; skipping delivery");
            }
            return;
        }

        if !webhook::is_valid_webhook_url(
            &destination.webhook_url,
            &self.config.allowed_webhook_domains,
        ) {
            slog::warn!(
                logger,
                "destination webhook URL failed validation; skipping delivery";
                "webhook_url" => &destination.webhook_url,
            );
            return;
        }

        let message = webhook::render(event, owner, &self.config);
        match self.attempt(&destination.webhook_url, &message).await {
            Ok(()) => {
                slog::info!(logger, "delivered reward notification");
            }
            Err(err) if err.is_transient() => {
                slog::info!(
                    logger,
                    "delivery failed with a transient error; retrying once";
                    "error" => %err,
                );
                match self.attempt(&destination.webhook_url, &message).await {
                    Ok(()) => {
                        slog::info!(logger, "delivered reward notification on retry");
                    }
                    Err(err) => {
                        slog::warn!(
                            logger,
                            "delivery retry failed; giving up on this destination";
                            "error" => %err,
                        );
                    }
                }
            }
            Err(err) => {
                slog::warn!(
                    logger,
                    "delivery failed permanently; giving up on this destination";
                    "error" => %err,
                );
            }
        }
    }

    /// Runs a single delivery attempt under the configured deadline
    async fn attempt(
        &self,
        url: &str,
        message: &crate::webhook::WebhookMessage,
    ) -> Result<(), DeliveryError> {
        match tokio::time::timeout(self.config.timeout, self.delivery.deliver(url, message)).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout(self.config.timeout)),
        }
    }
}
