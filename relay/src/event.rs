//! Shared data model for decoded reward events and their dedup fingerprints

/// Rarity of a found aura, in one of the two upstream encodings.
/// The standard encoding carries the chance inline in the description
/// (`CHANCE OF **1 in N**`), while the rare/extended encoding carries
/// a separate free-form qualifier field and may or may not include a
/// parseable chance in its description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rarity {
    Standard { chance: u64 },
    Rare { qualifier: Option<String>, chance: Option<u64> },
}

/// A single decoded reward event from the upstream gateway.
/// Constructed once per decoded embed and never mutated afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct RewardEvent {
    /// Tracked identity that found the aura, lowercase
    pub username: String,
    /// Full upstream display form, e.g. `Display Name(@username)`
    pub author_name: String,
    /// Name of the found aura
    pub reward: String,
    pub rarity: Rarity,
    pub rolls: Option<String>,
    pub luck: Option<String>,
    pub discovered: Option<String>,
    pub icon_url: String,
    pub source_url: String,
    pub description: String,
    pub color: u32,
    /// Upstream-reported timestamp (not guaranteed monotonic per identity)
    pub timestamp: String,
    /// Local receipt time in milliseconds since the Unix epoch
    pub ingress_ms: u64,
}

impl RewardEvent {
    /// Normalized `1 in N` chance, independent of which upstream encoding
    /// produced the event. Zero when the payload carried no parseable chance.
    pub fn chance(&self) -> u64 {
        match &self.rarity {
            Rarity::Standard { chance } => *chance,
            Rarity::Rare { chance, .. } => chance.unwrap_or(0),
        }
    }

    pub const fn is_rare_format(&self) -> bool {
        matches!(self.rarity, Rarity::Rare { .. })
    }

    /// Derives the duplicate-suppression fingerprint for this event.
    /// Two arrivals of the same find produce equal keys even when one came
    /// through the standard encoding and the other through the rare encoding,
    /// because only encoding-independent components participate.
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey {
            username: self.username.clone(),
            reward: self.reward.clone(),
            chance: self.chance(),
            time_bucket: coarse_time_bucket(&self.timestamp),
        }
    }
}

/// Fingerprint of a reward event used for duplicate suppression
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub username: String,
    pub reward: String,
    pub chance: u64,
    pub time_bucket: String,
}

/// Truncates an RFC 3339-style upstream timestamp to minute precision,
/// so that sub-minute re-sends of the same find collapse to one bucket.
/// Timestamps in an unexpected shape are used whole.
fn coarse_time_bucket(timestamp: &str) -> String {
    if timestamp.len() >= 16 && timestamp.is_char_boundary(16) {
        String::from(&timestamp[..16])
    } else {
        String::from(timestamp)
    }
}
