//! Maintains an eventually-consistent snapshot of the tracked identity set,
//! refreshed from the directory on an interval. The gateway side consults
//! the snapshot with a cheap read; a failed refresh keeps the previous
//! snapshot rather than wiping it.

use crate::directory::UpstreamDirectory;
use crate::shutdown;
use slog::Logger;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

pub struct TrackedIdentities<D: UpstreamDirectory> {
    directory: Arc<D>,
    refresh_period: Duration,
    logger: Logger,
    usernames: RwLock<HashSet<String>>,
}

impl<D: UpstreamDirectory> TrackedIdentities<D> {
    pub fn new(directory: Arc<D>, refresh_period: Duration, logger: &Logger) -> Self {
        Self {
            directory,
            refresh_period,
            logger: logger.new(slog::o!("component" => "tracked_identities")),
            usernames: RwLock::new(HashSet::new()),
        }
    }

    /// Replaces the snapshot with a fresh read of the directory
    pub async fn refresh(&self) -> Result<(), crate::directory::DirectoryError> {
        let identities = self.directory.tracked_identities().await?;
        let next = identities
            .into_iter()
            .map(|username| username.to_lowercase())
            .collect::<HashSet<_>>();
        let count = next.len();
        *self.usernames.write().await = next;
        slog::debug!(
            self.logger,
            "refreshed tracked identity snapshot";
            "identity_count" => count,
        );
        Ok(())
    }

    pub async fn contains(&self, username: &str) -> bool {
        self.usernames.read().await.contains(&username.to_lowercase())
    }

    /// Refreshes the snapshot on an interval until shutdown.
    /// A failed refresh is logged and the stale snapshot stays in service.
    pub async fn run_refresh(&self, mut shutdown: shutdown::Receiver) {
        let mut interval = tokio::time::interval(self.refresh_period);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(err) = self.refresh().await {
                        slog::warn!(
                            self.logger,
                            "periodic tracked identity refresh failed; keeping previous snapshot";
                            "error" => ?err,
                        );
                    }
                },
                _ = shutdown.recv() => break,
            }
        }
    }
}
