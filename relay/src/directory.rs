//! Read interface for the destination directory: which identities are
//! tracked, which owners claim them, where each owner's notifications go,
//! and guild membership/role facts for permission checks.
//! The dispatcher only ever talks to the `UpstreamDirectory` trait;
//! the file-backed implementation exists so the relay can run against a
//! local snapshot and so tests can use in-memory mocks at the same seam.

use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;

/// Identifier of a user that owns one or more tracked identities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerId(pub u64);

/// A single place a reward notification can be delivered to
#[derive(Debug, Clone, PartialEq)]
pub struct Destination {
    pub guild_id: u64,
    pub webhook_url: String,
    pub enabled: bool,
    /// Role the owner must hold in the guild for delivery to proceed;
    /// `None` means delivery is unconditional
    pub required_role: Option<u64>,
}

#[derive(Debug, Error)]
pub enum DirectoryError {
    #[error("identity '{0}' is not present in the directory")]
    UnknownIdentity(String),
    #[error("directory lookup failed")]
    Lookup(#[source] anyhow::Error),
}

/// Source of truth for tracked identities and delivery destinations.
/// All lookups can fail; callers decide whether a failure is fatal
/// (startup) or survivable (a periodic refresh keeping its old snapshot).
#[async_trait]
pub trait UpstreamDirectory: Send + Sync {
    /// Lists every identity (lowercase username) that at least one
    /// destination is interested in
    async fn tracked_identities(&self) -> Result<Vec<String>, DirectoryError>;

    /// Lists the owners that claim the given identity
    async fn owners_of(&self, username: &str) -> Result<Vec<OwnerId>, DirectoryError>;

    /// Lists the destinations subscribed to finds by the given owner
    async fn destinations_for(&self, owner: OwnerId) -> Result<Vec<Destination>, DirectoryError>;

    /// Reports whether the owner holds the given role in the given guild
    async fn member_has_role(
        &self,
        guild_id: u64,
        owner: OwnerId,
        role_id: u64,
    ) -> Result<bool, DirectoryError>;
}

#[derive(Debug, Deserialize)]
struct DirectoryFile {
    #[serde(default)]
    identities: Vec<IdentityRecord>,
    #[serde(default)]
    guilds: Vec<GuildRecord>,
}

#[derive(Debug, Deserialize)]
struct IdentityRecord {
    username: String,
    #[serde(default)]
    owners: Vec<u64>,
}

#[derive(Debug, Deserialize)]
struct GuildRecord {
    guild_id: u64,
    webhook_url: String,
    #[serde(default = "default_enabled")]
    enabled: bool,
    required_role: Option<u64>,
    /// Owners whose finds this guild wants delivered
    #[serde(default)]
    subscribers: Vec<u64>,
    #[serde(default)]
    members: Vec<MemberRecord>,
}

#[derive(Debug, Deserialize)]
struct MemberRecord {
    owner: u64,
    #[serde(default)]
    roles: Vec<u64>,
}

const fn default_enabled() -> bool {
    true
}

/// Directory backed by a JSON snapshot file, loaded once at startup
pub struct FileDirectory {
    owners_by_identity: HashMap<String, Vec<OwnerId>>,
    guilds: Vec<GuildRecord>,
}

impl FileDirectory {
    pub async fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let raw = tokio::fs::read_to_string(path.as_ref()).await?;
        Self::from_json(&raw)
    }

    pub fn from_json(raw: &str) -> anyhow::Result<Self> {
        let file = serde_json::from_str::<DirectoryFile>(raw)?;
        let owners_by_identity = file
            .identities
            .into_iter()
            .map(|record| {
                (
                    record.username.to_lowercase(),
                    record.owners.into_iter().map(OwnerId).collect(),
                )
            })
            .collect();
        Ok(Self {
            owners_by_identity,
            guilds: file.guilds,
        })
    }
}

#[async_trait]
impl UpstreamDirectory for FileDirectory {
    async fn tracked_identities(&self) -> Result<Vec<String>, DirectoryError> {
        Ok(self.owners_by_identity.keys().cloned().collect())
    }

    async fn owners_of(&self, username: &str) -> Result<Vec<OwnerId>, DirectoryError> {
        self.owners_by_identity
            .get(&username.to_lowercase())
            .cloned()
            .ok_or_else(|| DirectoryError::UnknownIdentity(String::from(username)))
    }

    async fn destinations_for(&self, owner: OwnerId) -> Result<Vec<Destination>, DirectoryError> {
        Ok(self
            .guilds
            .iter()
            .filter(|guild| guild.subscribers.contains(&owner.0))
            .map(|guild| Destination {
                guild_id: guild.guild_id,
                webhook_url: guild.webhook_url.clone(),
                enabled: guild.enabled,
                required_role: guild.required_role,
            })
            .collect())
    }

    async fn member_has_role(
        &self,
        guild_id: u64,
        owner: OwnerId,
        role_id: u64,
    ) -> Result<bool, DirectoryError> {
        let guild = self
            .guilds
            .iter()
            .find(|guild| guild.guild_id == guild_id)
            .ok_or_else(|| {
                DirectoryError::Lookup(anyhow::anyhow!("guild {} not in directory", guild_id))
            })?;
        Ok(guild
            .members
            .iter()
            .any(|member| member.owner == owner.0 && member.roles.contains(&role_id)))
    }
}
