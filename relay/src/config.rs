//! Contains configuration options for the service that control its network topology
//! and internal behaviors

use anyhow::{Context, Result};
use relay_config_backoff::Backoff;
use serde::Deserialize;
use sloggers::terminal::TerminalLoggerConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Configuration object loaded upon startup
#[derive(Debug, Deserialize, Clone)]
pub struct Configuration {
    /// Collection of secret values used to connect to services
    pub secrets: Secrets,
    /// Collection of external services that this service connects to
    pub services: Services,
    /// Parameters for the backoff used to connect to external services during initialization
    pub initialization_backoff: Backoff,
    /// Parameters for the backoff used to re-establish the upstream gateway session
    /// after it drops mid-stream
    pub reconnection_backoff: Backoff,
    /// How long a session must stay connected
    /// before the reconnection backoff resets to its initial interval
    #[serde(with = "humantime_serde")]
    pub reconnection_backoff_reset_threshold: Duration,
    /// How long the upstream gateway may stay silent
    /// before the session is declared a zombie and torn down
    #[serde(with = "humantime_serde")]
    pub zombie_timeout: Duration,
    /// Options related to the bounded raw event queue
    /// sitting between the gateway reader and the dispatcher
    pub raw_events: RawEvents,
    /// Options related to duplicate suppression of inbound events
    pub dedup: Dedup,
    /// Options related to the role-authorization cache
    pub permissions: Permissions,
    /// How often the tracked identity snapshot is refreshed from the directory
    #[serde(with = "humantime_serde")]
    pub tracked_refresh_period: Duration,
    /// Options related to webhook delivery
    pub delivery: DeliveryConfig,
    /// Options related to the aliveness marker file
    pub liveness: Liveness,
    /// How long queued events are given to drain after shutdown is triggered
    #[serde(with = "humantime_serde")]
    pub shutdown_grace: Duration,
    /// Logging configuration for service diagnostics
    pub logging: TerminalLoggerConfig,
}

/// Collection of secret values used to connect to services
#[derive(Debug, Deserialize, Clone)]
pub struct Secrets {
    /// API key sent in the handshake to authenticate with the upstream gateway
    pub api_token: String,
}

/// Collection of external services that this service connects to
#[derive(Debug, Deserialize, Clone)]
pub struct Services {
    /// Full WebSocket URL of the upstream reward event gateway
    pub upstream_gateway: String,
    /// Path of the JSON destination directory snapshot
    pub directory_file: String,
}

/// Options related to the bounded raw event queue
#[derive(Debug, Deserialize, Clone)]
pub struct RawEvents {
    /// Maximum number of events buffered between ingestion and dispatch;
    /// the oldest event is evicted once the queue is full
    pub queue_length: usize,
    /// Queue length at which warnings start being emitted
    pub warn_threshold: usize,
    /// How often the queue length is examined against the warning threshold
    #[serde(with = "humantime_serde")]
    pub watch_period: Duration,
}

/// Options related to duplicate suppression of inbound events
#[derive(Debug, Deserialize, Clone)]
pub struct Dedup {
    /// Maximum number of event fingerprints remembered at once
    pub capacity: usize,
    /// How long a fingerprint suppresses duplicates before expiring
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

/// Options related to the role-authorization cache
#[derive(Debug, Deserialize, Clone)]
pub struct Permissions {
    /// How long a cached role-membership result stays valid
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,
    /// Maximum number of cached role-membership results
    pub max_entries: usize,
}

/// Options related to webhook delivery
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    /// Deadline for a single delivery attempt
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Maximum number of destinations delivered to concurrently per event
    pub concurrency: usize,
    /// Username that delivered webhook messages post under
    pub bot_username: String,
    /// Finds with a `1 in N` chance at or above this value
    /// get the exceptional announcement prepended
    pub exceptional_chance_threshold: u64,
    /// Icon used by the upstream for ordinary finds;
    /// any other icon marks the find as exceptional
    pub global_icon_url: String,
    /// Message content prepended to exceptional finds
    pub exceptional_message: String,
    /// Hosts (and their subdomains) that webhook URLs may point at
    pub allowed_webhook_domains: Vec<String>,
}

/// Options related to the aliveness marker file
#[derive(Debug, Deserialize, Clone)]
pub struct Liveness {
    /// Path the marker timestamp is written to
    pub marker_path: PathBuf,
    /// How often the marker timestamp is refreshed
    #[serde(with = "humantime_serde")]
    pub period: Duration,
}

impl Configuration {
    /// Attempts to load the config from the file, called once at startup
    pub fn try_load(path: impl AsRef<str>) -> Result<Self> {
        let path = path.as_ref();
        // Use config to load the values and merge with the environment
        let mut settings = config::Config::default();
        settings
            .merge(config::File::with_name(path))
            .context(format!("Could not read in config file from {}", path))?
            // Add in settings from the environment (with a prefix of AURA_RELAY)
            // Eg.. `AURA_RELAY_SECRETS__API_TOKEN=X ./target/aura-relay` would set the
            // `secrets.api_token` key
            .merge(config::Environment::with_prefix("AURA_RELAY").separator("__"))
            .context("Could not merge in values from the environment")?;
        let config = settings
            .try_into()
            .context("Loading the Configuration struct from the merged config failed")?;
        Ok(config)
    }
}
