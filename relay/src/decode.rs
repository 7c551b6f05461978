//! Handles decoding raw upstream gateway frames into `RewardEvent` values.
//! A frame carries a JSON payload with a list of embeds; each embed is either
//! the standard reward shape (chance inline in the description) or the
//! rare/extended shape (separate rarity qualifier field). Anything else is a
//! per-message decode failure that gets logged and skipped.

use crate::event::{Rarity, RewardEvent};
use serde::Deserialize;
use slog::Logger;

#[derive(Debug)]
pub enum DecodeError {
    InvalidJson {
        inner: serde_json::Error,
    },
    MissingPayloadStructure {
        raw_frame: String,
    },
    EmbedMissingAuthor {
        index: usize,
    },
    UnparsableDescription {
        index: usize,
        description: String,
    },
    EmptyRewardName {
        index: usize,
    },
}

impl DecodeError {
    pub fn log(&self, logger: &Logger) {
        match self {
            DecodeError::InvalidJson { inner } => {
                slog::warn!(
                    logger,
                    "inbound frame was not valid JSON; skipping";
                    "error" => ?inner,
                );
            }
            DecodeError::MissingPayloadStructure { raw_frame } => {
                slog::warn!(
                    logger,
                    "inbound frame JSON did not contain the expected embed list; skipping";
                    "raw_frame" => raw_frame,
                );
            }
            DecodeError::EmbedMissingAuthor { index } => {
                slog::warn!(
                    logger,
                    "embed is missing its author block; skipping embed";
                    "embed_index" => index,
                );
            }
            DecodeError::UnparsableDescription { index, description } => {
                slog::warn!(
                    logger,
                    "embed description matched neither the standard nor the rare schema; skipping embed";
                    "embed_index" => index,
                    "description" => description,
                );
            }
            DecodeError::EmptyRewardName { index } => {
                slog::warn!(
                    logger,
                    "no reward name could be extracted from embed; skipping embed";
                    "embed_index" => index,
                );
            }
        }
    }
}

/// Result of decoding one frame: the embeds that decoded cleanly,
/// alongside per-embed errors for the ones that did not
#[derive(Debug)]
pub struct DecodedFrame {
    pub events: Vec<RewardEvent>,
    pub errors: Vec<DecodeError>,
}

#[derive(Debug, Deserialize)]
struct RawPayload {
    data: RawData,
}

#[derive(Debug, Deserialize)]
struct RawData {
    #[serde(default)]
    embeds: Vec<RawEmbed>,
}

#[derive(Debug, Deserialize)]
struct RawEmbed {
    author: Option<RawAuthor>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    fields: Vec<RawField>,
    #[serde(default)]
    timestamp: String,
    #[serde(default)]
    color: u32,
}

#[derive(Debug, Deserialize)]
struct RawAuthor {
    name: String,
    #[serde(default)]
    icon_url: String,
    #[serde(default)]
    url: String,
}

#[derive(Debug, Deserialize)]
struct RawField {
    #[serde(default)]
    name: String,
    #[serde(default)]
    value: String,
}

/// Attempts to decode one raw text frame into reward events.
/// Frame-level failures (bad JSON, missing structure) produce an `Err`;
/// per-embed failures are collected so the surviving embeds still flow.
pub fn decode_frame(raw: &str, ingress_ms: u64) -> Result<DecodedFrame, DecodeError> {
    let payload = match serde_json::from_str::<RawPayload>(raw) {
        Ok(payload) => payload,
        Err(inner) => {
            // Distinguish structurally-valid JSON that lacks our shape
            // from outright invalid JSON
            return if serde_json::from_str::<serde_json::Value>(raw).is_ok() {
                Err(DecodeError::MissingPayloadStructure {
                    raw_frame: truncate(raw, 500),
                })
            } else {
                Err(DecodeError::InvalidJson { inner })
            };
        }
    };

    let mut events = Vec::with_capacity(payload.data.embeds.len());
    let mut errors = Vec::new();
    for (index, embed) in payload.data.embeds.into_iter().enumerate() {
        match decode_embed(index, embed, ingress_ms) {
            Ok(event) => events.push(event),
            Err(err) => errors.push(err),
        }
    }

    Ok(DecodedFrame { events, errors })
}

fn decode_embed(index: usize, embed: RawEmbed, ingress_ms: u64) -> Result<RewardEvent, DecodeError> {
    let RawEmbed {
        author,
        description,
        fields,
        timestamp,
        color,
    } = embed;
    let author = author.ok_or(DecodeError::EmbedMissingAuthor { index })?;
    let username = extract_username(&author.name);

    // Case-insensitive field lookup, mirroring the loose upstream field naming
    let field = |wanted: &str| -> Option<String> {
        fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(wanted))
            .map(|f| f.value.clone())
    };

    // Rare auras carry a separate Rarity field; standard ones carry
    // the chance inline in the description
    let rarity_field = field("rarity");
    let is_rare_format = rarity_field.is_some() || !description.to_uppercase().contains("CHANCE");

    let (reward, rarity) = if is_rare_format {
        let reward = extract_reward_rare(&description);
        let chance = parse_chance(rarity_field.as_deref(), &description);
        (
            reward,
            Rarity::Rare {
                qualifier: rarity_field,
                chance,
            },
        )
    } else {
        let (reward, chance_text) = extract_reward_standard(&description).ok_or_else(|| {
            DecodeError::UnparsableDescription {
                index,
                description: truncate(&description, 200),
            }
        })?;
        let chance = parse_chance_text(&chance_text).ok_or_else(|| {
            DecodeError::UnparsableDescription {
                index,
                description: truncate(&description, 200),
            }
        })?;
        (reward, Rarity::Standard { chance })
    };

    if reward.is_empty() {
        return Err(DecodeError::EmptyRewardName { index });
    }

    Ok(RewardEvent {
        username,
        author_name: author.name,
        reward,
        rarity,
        rolls: field("rolls"),
        luck: field("luck"),
        discovered: field("time discovered").or_else(|| field("time")),
        icon_url: author.icon_url,
        source_url: author.url,
        description,
        color,
        timestamp,
        ingress_ms,
    })
}

/// Extracts the lowercase account username from the upstream author display
/// form `Display Name(@username)`. Falls back to the whole name when the
/// parenthesized form is absent.
pub fn extract_username(author_name: &str) -> String {
    let inner = match (author_name.find('('), author_name.rfind(')')) {
        (Some(open), Some(close)) if close > open => &author_name[open + 1..close],
        _ => author_name,
    };
    inner.replace('@', "").to_lowercase()
}

/// Standard format: `... HAS FOUND **Aura**, CHANCE OF **1 in N** ...`.
/// The aura sits in the second bold section and the chance in the third.
fn extract_reward_standard(description: &str) -> Option<(String, String)> {
    let parts: Vec<&str> = description.split("**").collect();
    if parts.len() < 6 {
        return None;
    }
    let reward = parts[3].trim().to_owned();
    let chance = parts[5].trim().to_owned();
    Some((reward, chance))
}

/// Rare format descriptions are inconsistent, so extraction is best-effort:
/// bracketed names first, then a scan of the bold sections,
/// then a generic placeholder (the description itself carries the details).
fn extract_reward_rare(description: &str) -> String {
    if let (Some(open), Some(close)) = (description.find('['), description.find(']')) {
        if close > open + 1 {
            return description[open + 1..close].to_owned();
        }
    }

    let parts: Vec<&str> = description.split("**").collect();
    for part in parts.iter().skip(1) {
        let part = part.trim();
        if part.is_empty()
            || part.contains('@')
            || part.starts_with("1 in")
            || part.starts_with('>')
            || (part.contains('(') && part.contains(')'))
        {
            continue;
        }
        return part.to_owned();
    }

    String::from("Rare Aura")
}

/// Normalizes a chance to its `N` in `1 in N`, preferring the explicit
/// qualifier text and falling back to a `1 IN N` scan of the description
fn parse_chance(qualifier: Option<&str>, description: &str) -> Option<u64> {
    if let Some(chance) = qualifier.and_then(parse_chance_text) {
        return Some(chance);
    }

    let upper = description.to_uppercase();
    let after = upper.split("1 IN ").nth(1)?;
    let candidate = after.split("**").next()?.trim();
    parse_digits(candidate)
}

fn parse_chance_text(text: &str) -> Option<u64> {
    let cleaned = text.replace(',', "").replace(' ', "");
    let cleaned = if cleaned.to_lowercase().starts_with("1in") {
        &cleaned[3..]
    } else {
        cleaned.as_str()
    };
    parse_digits(cleaned)
}

fn parse_digits(text: &str) -> Option<u64> {
    let digits: String = text
        .replace(',', "")
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    if digits.is_empty() {
        return None;
    }
    digits.parse::<u64>().ok()
}

fn truncate(text: &str, max: usize) -> String {
    if text.len() <= max {
        return String::from(text);
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    String::from(&text[..end])
}

#[cfg(test)]
mod tests {
    use super::{decode_frame, extract_username, DecodeError};
    use crate::event::Rarity;

    pub fn standard_frame(display: &str, username: &str, aura: &str, chance: &str) -> String {
        let description = format!(
            "**{display}(@{username})** HAS FOUND **{aura}**, CHANCE OF **1 in {chance}**",
            display = display,
            username = username,
            aura = aura,
            chance = chance,
        );
        serde_json::json!({
            "data": {
                "embeds": [{
                    "author": {
                        "name": format!("{}(@{})", display, username),
                        "icon_url": "https://cdn.example.com/stars/Global.png",
                        "url": "https://example.com/profile"
                    },
                    "description": description,
                    "fields": [
                        { "name": "Rolls", "value": "12,345" },
                        { "name": "Luck", "value": "x2" },
                        { "name": "Time Discovered", "value": "12:34:56" }
                    ],
                    "timestamp": "2024-05-01T12:34:56.789Z",
                    "color": 16711680
                }]
            }
        })
        .to_string()
    }

    pub fn rare_frame(display: &str, username: &str, aura: &str, qualifier: &str) -> String {
        let description = format!(
            "**{display}(@{username})** has become the **[{aura}]**",
            display = display,
            username = username,
            aura = aura,
        );
        serde_json::json!({
            "data": {
                "embeds": [{
                    "author": {
                        "name": format!("{}(@{})", display, username),
                        "icon_url": "https://cdn.example.com/stars/Exotic.png",
                        "url": "https://example.com/profile"
                    },
                    "description": description,
                    "fields": [
                        { "name": "Rarity", "value": qualifier },
                        { "name": "Rolls", "value": "777" }
                    ],
                    "timestamp": "2024-05-01T12:35:10.100Z",
                    "color": 255
                }]
            }
        })
        .to_string()
    }

    #[test]
    fn test_decodes_standard_frame() {
        let raw = standard_frame("Alice", "alice", "Starfall", "1,000");
        let decoded = decode_frame(&raw, 1).unwrap();
        assert!(decoded.errors.is_empty());
        assert_eq!(decoded.events.len(), 1);

        let event = &decoded.events[0];
        assert_eq!(event.username, "alice");
        assert_eq!(event.reward, "Starfall");
        assert_eq!(event.rarity, Rarity::Standard { chance: 1_000 });
        assert_eq!(event.rolls.as_deref(), Some("12,345"));
        assert_eq!(event.luck.as_deref(), Some("x2"));
        assert_eq!(event.discovered.as_deref(), Some("12:34:56"));
        assert_eq!(event.timestamp, "2024-05-01T12:34:56.789Z");
        assert_eq!(event.ingress_ms, 1);
    }

    #[test]
    fn test_decodes_rare_frame_with_qualifier() {
        let raw = rare_frame("Bob", "bob", "Frozen Sovereign", "Exotic");
        let decoded = decode_frame(&raw, 2).unwrap();
        assert!(decoded.errors.is_empty());
        assert_eq!(decoded.events.len(), 1);

        let event = &decoded.events[0];
        assert_eq!(event.username, "bob");
        assert_eq!(event.reward, "Frozen Sovereign");
        assert!(event.is_rare_format());
        match &event.rarity {
            Rarity::Rare { qualifier, chance } => {
                assert_eq!(qualifier.as_deref(), Some("Exotic"));
                assert_eq!(*chance, None);
            }
            other => panic!("unexpected rarity: {:?}", other),
        }
    }

    #[test]
    fn test_rare_chance_recovered_from_description() {
        let raw = rare_frame("Bob", "bob", "Frozen Sovereign", "1 in 750,000,000");
        let decoded = decode_frame(&raw, 0).unwrap();
        assert_eq!(decoded.events[0].chance(), 750_000_000);
    }

    #[test]
    fn test_invalid_json_is_a_frame_error() {
        match decode_frame("{not json", 0) {
            Err(DecodeError::InvalidJson { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_unrelated_json_is_missing_structure() {
        match decode_frame(r#"{"status": "ok"}"#, 0) {
            Err(DecodeError::MissingPayloadStructure { .. }) => {}
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_bad_embed_does_not_poison_frame() {
        let raw = serde_json::json!({
            "data": {
                "embeds": [
                    { "description": "no author here" },
                    {
                        "author": { "name": "Alice(@alice)" },
                        "description": "**Alice(@alice)** HAS FOUND **Starfall**, CHANCE OF **1 in 99**"
                    }
                ]
            }
        })
        .to_string();
        let decoded = decode_frame(&raw, 0).unwrap();
        assert_eq!(decoded.events.len(), 1);
        assert_eq!(decoded.errors.len(), 1);
        assert_eq!(decoded.events[0].reward, "Starfall");
    }

    #[test]
    fn test_username_extraction_forms() {
        assert_eq!(extract_username("Alice(@alice)"), "alice");
        assert_eq!(extract_username("Alice (alice)"), "alice");
        assert_eq!(extract_username("PlainName"), "plainname");
        assert_eq!(extract_username("MiXeD(@MiXeD)"), "mixed");
    }
}
