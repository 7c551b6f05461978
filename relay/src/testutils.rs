use crate::config::{
    Configuration, Dedup, DeliveryConfig, Liveness, Permissions, RawEvents, Secrets, Services,
};
use relay_config_backoff::Backoff;
use sloggers::terminal::{Destination, TerminalLoggerBuilder, TerminalLoggerConfig};
use sloggers::types::{Format, Severity};
use sloggers::Build;
use std::time::Duration;

lazy_static::lazy_static! {
    static ref LOGGER: slog::Logger = {
        let mut builder = TerminalLoggerBuilder::new();
        builder.level(Severity::Info);
        builder.destination(Destination::Stderr);
        builder.format(Format::Full);
        builder.build().unwrap()
    };
}

pub fn logger(test_name: &'static str) -> slog::Logger {
    LOGGER.new(slog::o!("test_name" => test_name))
}

/// A complete configuration with sane test values,
/// for components that take the whole struct
pub fn configuration() -> Configuration {
    let backoff = Backoff {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(5),
        duration: Duration::from_secs(60),
        multiplier: 2.0,
    };
    Configuration {
        secrets: Secrets {
            api_token: String::from("test-api-token"),
        },
        services: Services {
            upstream_gateway: String::from("wss://gateway.example.com/stream"),
            directory_file: String::from("directory.json"),
        },
        initialization_backoff: backoff.clone(),
        reconnection_backoff: backoff,
        reconnection_backoff_reset_threshold: Duration::from_secs(30),
        zombie_timeout: Duration::from_secs(60),
        raw_events: RawEvents {
            queue_length: 100,
            warn_threshold: 80,
            watch_period: Duration::from_secs(10),
        },
        dedup: Dedup {
            capacity: 100,
            retention: Duration::from_secs(300),
        },
        permissions: Permissions {
            ttl: Duration::from_secs(300),
            max_entries: 1000,
        },
        tracked_refresh_period: Duration::from_secs(60),
        delivery: DeliveryConfig {
            timeout: Duration::from_secs(10),
            concurrency: 4,
            bot_username: String::from("Aura Relay"),
            exceptional_chance_threshold: 750_000_000,
            global_icon_url: String::from("https://cdn.example.com/stars/Global.png"),
            exceptional_message: String::from("@everyone an exceptional aura was found!"),
            allowed_webhook_domains: vec![
                String::from("discord.com"),
                String::from("discordapp.com"),
            ],
        },
        liveness: Liveness {
            marker_path: std::path::PathBuf::from("/tmp/aura-relay-alive"),
            period: Duration::from_secs(5),
        },
        shutdown_grace: Duration::from_secs(10),
        logging: TerminalLoggerConfig::default(),
    }
}
