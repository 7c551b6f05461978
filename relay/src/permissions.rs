//! Role-based delivery authorization with a bounded TTL cache.
//! Destination records can require that the owning user hold a specific
//! role in the destination guild; the result of that membership lookup is
//! cached per (guild, owner, role) so a burst of finds from one identity
//! does not hammer the directory.

use crate::directory::{Destination, OwnerId, UpstreamDirectory};
use slog::Logger;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Outcome of an authorization check for one (owner, destination) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AuthDecision {
    /// Whether delivery to the destination may proceed
    pub allowed: bool,
    /// Whether a role requirement was the deciding factor
    pub role_satisfied: bool,
    /// Whether the denial came from an unanswerable directory lookup
    /// rather than an actual role decision
    pub lookup_failed: bool,
}

impl AuthDecision {
    pub const fn permits(self) -> bool {
        self.allowed
    }
}

struct CacheEntry {
    has_role: bool,
    expires_at: Instant,
}

pub struct PermissionCache<D: UpstreamDirectory> {
    directory: Arc<D>,
    ttl: Duration,
    max_entries: usize,
    logger: Logger,
    entries: RwLock<HashMap<(u64, u64, u64), CacheEntry>>,
}

impl<D: UpstreamDirectory> PermissionCache<D> {
    pub fn new(directory: Arc<D>, ttl: Duration, max_entries: usize, logger: &Logger) -> Self {
        Self {
            directory,
            ttl,
            max_entries,
            logger: logger.new(slog::o!("component" => "permission_cache")),
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Decides whether a find by `owner` may be delivered to `destination`.
    /// Disabled destinations are always denied; destinations without a role
    /// requirement are allowed without any directory traffic.
    pub async fn check(&self, owner: OwnerId, destination: &Destination) -> AuthDecision {
        if !destination.enabled {
            return AuthDecision {
                allowed: false,
                role_satisfied: false,
                lookup_failed: false,
            };
        }

        let role_id = match destination.required_role {
            Some(role_id) => role_id,
            None => {
                return AuthDecision {
                    allowed: true,
                    role_satisfied: true,
                    lookup_failed: false,
                }
            }
        };

        let key = (destination.guild_id, owner.0, role_id);
        let now = Instant::now();
        if let Some(entry) = self.entries.read().await.get(&key) {
            if entry.expires_at > now {
                return AuthDecision {
                    allowed: entry.has_role,
                    role_satisfied: entry.has_role,
                    lookup_failed: false,
                };
            }
        }

        // Fail closed: an unanswerable role lookup denies this delivery
        // but is not cached, so the next find retries the lookup
        let has_role = match self
            .directory
            .member_has_role(destination.guild_id, owner, role_id)
            .await
        {
            Ok(has_role) => has_role,
            Err(err) => {
                slog::warn!(
                    self.logger,
                    "role membership lookup failed; denying delivery";
                    "guild_id" => key.0,
                    "owner_id" => key.1,
                    "role_id" => key.2,
                    "error" => ?err,
                );
                return AuthDecision {
                    allowed: false,
                    role_satisfied: false,
                    lookup_failed: true,
                };
            }
        };

        let mut entries = self.entries.write().await;
        if entries.len() >= self.max_entries {
            entries.retain(|_, entry| entry.expires_at > now);
        }
        if entries.len() < self.max_entries {
            entries.insert(
                key,
                CacheEntry {
                    has_role,
                    expires_at: now + self.ttl,
                },
            );
        }

        AuthDecision {
            allowed: has_role,
            role_satisfied: has_role,
            lookup_failed: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PermissionCache;
    use crate::directory::{
        Destination, DirectoryError, OwnerId, UpstreamDirectory,
    };
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    struct CountingDirectory {
        lookups: AtomicUsize,
        has_role: bool,
    }

    #[async_trait]
    impl UpstreamDirectory for CountingDirectory {
        async fn tracked_identities(&self) -> Result<Vec<String>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn owners_of(&self, _username: &str) -> Result<Vec<OwnerId>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn destinations_for(
            &self,
            _owner: OwnerId,
        ) -> Result<Vec<Destination>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn member_has_role(
            &self,
            _guild_id: u64,
            _owner: OwnerId,
            _role_id: u64,
        ) -> Result<bool, DirectoryError> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.has_role)
        }
    }

    /// Fails its first role lookup and answers normally afterwards
    struct RecoveringDirectory {
        lookups: AtomicUsize,
    }

    #[async_trait]
    impl UpstreamDirectory for RecoveringDirectory {
        async fn tracked_identities(&self) -> Result<Vec<String>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn owners_of(&self, _username: &str) -> Result<Vec<OwnerId>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn destinations_for(
            &self,
            _owner: OwnerId,
        ) -> Result<Vec<Destination>, DirectoryError> {
            Ok(Vec::new())
        }

        async fn member_has_role(
            &self,
            _guild_id: u64,
            _owner: OwnerId,
            _role_id: u64,
        ) -> Result<bool, DirectoryError> {
            if self.lookups.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(DirectoryError::Lookup(anyhow::anyhow!("unavailable")));
            }
            Ok(true)
        }
    }

    fn destination(required_role: Option<u64>) -> Destination {
        Destination {
            guild_id: 1,
            webhook_url: String::from("https://discord.com/api/webhooks/1/aaa"),
            enabled: true,
            required_role,
        }
    }

    fn cache(directory: Arc<CountingDirectory>, ttl: Duration) -> PermissionCache<CountingDirectory> {
        PermissionCache::new(directory, ttl, 100, &crate::testutils::logger("permissions"))
    }

    #[tokio::test]
    async fn test_repeat_checks_hit_the_cache() {
        let directory = Arc::new(CountingDirectory {
            lookups: AtomicUsize::new(0),
            has_role: true,
        });
        let cache = cache(Arc::clone(&directory), Duration::from_secs(300));
        let dest = destination(Some(7));

        for _ in 0..5 {
            assert!(cache.check(OwnerId(100), &dest).await.permits());
        }
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_no_role_requirement_skips_lookup() {
        let directory = Arc::new(CountingDirectory {
            lookups: AtomicUsize::new(0),
            has_role: false,
        });
        let cache = cache(Arc::clone(&directory), Duration::from_secs(300));

        let decision = cache.check(OwnerId(100), &destination(None)).await;
        assert!(decision.permits());
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_disabled_destination_is_denied() {
        let directory = Arc::new(CountingDirectory {
            lookups: AtomicUsize::new(0),
            has_role: true,
        });
        let cache = cache(Arc::clone(&directory), Duration::from_secs(300));

        let mut dest = destination(Some(7));
        dest.enabled = false;
        assert!(!cache.check(OwnerId(100), &dest).await.permits());
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let directory = Arc::new(CountingDirectory {
            lookups: AtomicUsize::new(0),
            has_role: true,
        });
        let cache = cache(Arc::clone(&directory), Duration::from_millis(20));
        let dest = destination(Some(7));

        assert!(cache.check(OwnerId(100), &dest).await.permits());
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(cache.check(OwnerId(100), &dest).await.permits());
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_role_denies() {
        let directory = Arc::new(CountingDirectory {
            lookups: AtomicUsize::new(0),
            has_role: false,
        });
        let cache = cache(Arc::clone(&directory), Duration::from_secs(300));

        let decision = cache.check(OwnerId(100), &destination(Some(7))).await;
        assert!(!decision.permits());
        assert!(!decision.role_satisfied);
    }

    #[tokio::test]
    async fn test_lookup_failure_denies_without_caching() {
        let directory = Arc::new(RecoveringDirectory {
            lookups: AtomicUsize::new(0),
        });
        let cache = PermissionCache::new(
            Arc::clone(&directory),
            Duration::from_secs(300),
            100,
            &crate::testutils::logger("permissions"),
        );
        let dest = destination(Some(7));

        // The failed lookup denies this delivery only
        let decision = cache.check(OwnerId(100), &dest).await;
        assert!(!decision.permits());
        assert!(decision.lookup_failed);

        // The denial was not cached: the next check issues a fresh lookup
        // and succeeds once the directory recovers
        let decision = cache.check(OwnerId(100), &dest).await;
        assert!(decision.permits());
        assert!(!decision.lookup_failed);
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);

        // The successful result is cached as usual
        assert!(cache.check(OwnerId(100), &dest).await.permits());
        assert_eq!(directory.lookups.load(Ordering::SeqCst), 2);
    }
}
