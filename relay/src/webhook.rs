//! Webhook delivery: rendering a reward event into the webhook payload
//! shape, validating destination URLs, and posting payloads over HTTP.
//! The dispatcher depends on the `DeliveryClient` trait so tests can swap
//! in a recording client with no network in the loop.

use crate::config::DeliveryConfig;
use crate::directory::OwnerId;
use crate::event::{Rarity, RewardEvent};
use async_trait::async_trait;
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("destination responded with status {0}")]
    Status(u16),
    #[error("delivery did not complete within {0:?}")]
    Timeout(Duration),
    #[error("transport-level delivery failure")]
    Transport(#[source] anyhow::Error),
}

impl DeliveryError {
    /// Whether a single immediate retry has a reasonable chance of success.
    /// Client errors other than rate limiting are permanent for this payload.
    pub fn is_transient(&self) -> bool {
        match self {
            DeliveryError::Status(status) => *status == 429 || *status >= 500,
            DeliveryError::Timeout(_) | DeliveryError::Transport(_) => true,
        }
    }
}

#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn deliver(&self, url: &str, message: &WebhookMessage) -> Result<(), DeliveryError>;
}

/// Posts payloads to webhook endpoints over HTTPS
pub struct HttpDeliveryClient {
    http: reqwest::Client,
}

impl HttpDeliveryClient {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl DeliveryClient for HttpDeliveryClient {
    async fn deliver(&self, url: &str, message: &WebhookMessage) -> Result<(), DeliveryError> {
        let response = self
            .http
            .post(url)
            .json(message)
            .send()
            .await
            .map_err(|err| DeliveryError::Transport(err.into()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(DeliveryError::Status(status.as_u16()))
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct WebhookMessage {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub username: String,
    pub embeds: Vec<Embed>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Embed {
    pub author: EmbedAuthor,
    pub description: String,
    pub color: u32,
    pub fields: Vec<EmbedField>,
    pub footer: EmbedFooter,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbedAuthor {
    pub name: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub icon_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    pub inline: bool,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct EmbedFooter {
    pub text: String,
}

/// Renders one reward event into the payload delivered to a destination,
/// mentioning the owner whose tracked identity produced the find
pub fn render(event: &RewardEvent, owner: OwnerId, config: &DeliveryConfig) -> WebhookMessage {
    let rarity_text = match &event.rarity {
        Rarity::Standard { chance } => format!("1 in {}", format_thousands(*chance)),
        Rarity::Rare { qualifier, chance } => match (qualifier, chance) {
            (Some(qualifier), _) => qualifier.clone(),
            (None, Some(chance)) => format!("1 in {}", format_thousands(*chance)),
            (None, None) => String::from("Unknown"),
        },
    };

    let mut fields = Vec::with_capacity(4);
    if let Some(rolls) = &event.rolls {
        fields.push(EmbedField {
            name: String::from("Rolls"),
            value: rolls.clone(),
            inline: true,
        });
    }
    fields.push(EmbedField {
        name: String::from("Rarity"),
        value: rarity_text,
        inline: true,
    });
    if let Some(luck) = &event.luck {
        fields.push(EmbedField {
            name: String::from("Luck"),
            value: luck.clone(),
            inline: true,
        });
    }
    if let Some(discovered) = &event.discovered {
        fields.push(EmbedField {
            name: String::from("Time Discovered"),
            value: discovered.clone(),
            inline: true,
        });
    }

    let content = if is_exceptional(event, config) {
        Some(config.exceptional_message.clone())
    } else {
        None
    };

    WebhookMessage {
        content,
        username: config.bot_username.clone(),
        embeds: vec![Embed {
            author: EmbedAuthor {
                name: event.author_name.clone(),
                icon_url: event.icon_url.clone(),
                url: event.source_url.clone(),
            },
            description: format!(
                "<@{}> found **{}**!\n{}",
                owner.0, event.reward, event.description
            ),
            color: event.color,
            fields,
            footer: EmbedFooter {
                text: format!("Found by {}", event.username),
            },
            timestamp: event.timestamp.clone(),
        }],
    }
}

/// A find is exceptional when its chance clears the configured threshold
/// or the upstream used a non-global icon for it
fn is_exceptional(event: &RewardEvent, config: &DeliveryConfig) -> bool {
    event.chance() >= config.exceptional_chance_threshold
        || (!event.icon_url.is_empty() && event.icon_url != config.global_icon_url)
}

/// Validates that a destination URL is a well-formed webhook endpoint:
/// https, an allowed host, an `/api/webhooks/<numeric id>/<token>` path
pub fn is_valid_webhook_url(url: &str, allowed_domains: &[String]) -> bool {
    let rest = match url.strip_prefix("https://") {
        Some(rest) => rest,
        None => return false,
    };
    let (host, path) = match rest.find('/') {
        Some(slash) => (&rest[..slash], &rest[slash..]),
        None => return false,
    };

    let host_allowed = allowed_domains
        .iter()
        .any(|domain| host == domain || host.ends_with(&format!(".{}", domain)));
    if !host_allowed {
        return false;
    }

    let tail = match path.strip_prefix("/api/webhooks/") {
        Some(tail) => tail,
        None => return false,
    };
    let mut segments = tail.split('/');
    let id = segments.next().unwrap_or("");
    let token = segments.next().unwrap_or("");
    if segments.next().is_some() {
        return false;
    }

    !id.is_empty()
        && id.chars().all(|c| c.is_ascii_digit())
        && !token.is_empty()
        && token
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn format_thousands(value: u64) -> String {
    let digits = value.to_string();
    let mut out = String::with_capacity(digits.len() + digits.len() / 3);
    for (i, c) in digits.chars().enumerate() {
        if i > 0 && (digits.len() - i) % 3 == 0 {
            out.push(',');
        }
        out.push(c);
    }
    out
}
