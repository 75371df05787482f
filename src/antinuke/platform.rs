//! Seams to the chat platform. The engine never talks to serenity directly;
//! `crate::discord` implements these traits and tests use mocks.

use serenity::async_trait;
use thiserror::Error;

use super::executor::PunishmentRecord;

/// Typed rejection from a platform action.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PlatformError {
    #[error("missing permissions")]
    Forbidden,
    #[error("target not found")]
    NotFound,
    #[error("rate limited")]
    RateLimited,
    #[error("{0}")]
    Other(String),
}

impl PlatformError {
    /// Short machine-readable reason stored in punishment records.
    pub fn reason(&self) -> String {
        match self {
            PlatformError::Forbidden => "forbidden".into(),
            PlatformError::NotFound => "not_found".into(),
            PlatformError::RateLimited => "rate_limited".into(),
            PlatformError::Other(msg) => format!("platform: {msg}"),
        }
    }
}

pub type PlatformResult<T> = Result<T, PlatformError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleView {
    pub id: u64,
    pub position: i64,
    /// Integration-owned roles cannot be removed by hand.
    pub managed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemberView {
    pub user_id: u64,
    pub is_bot: bool,
    pub roles: Vec<RoleView>,
}

impl MemberView {
    /// Position of the highest role, 0 for a member with only @everyone.
    pub fn top_position(&self) -> i64 {
        self.roles.iter().map(|r| r.position).max().unwrap_or(0)
    }
}

/// Fresh snapshot of what the executor needs to re-check before acting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HierarchyView {
    pub owner_id: u64,
    /// Top role position of our own account.
    pub service_top: i64,
    /// `None` if the actor is no longer a member.
    pub member: Option<MemberView>,
}

impl HierarchyView {
    /// Roles a strip must leave in place.
    pub fn kept_roles(&self) -> Vec<u64> {
        self.member
            .iter()
            .flat_map(|m| m.roles.iter())
            .filter(|r| r.managed || r.position >= self.service_top)
            .map(|r| r.id)
            .collect()
    }
}

#[async_trait]
pub trait Platform: Send + Sync {
    async fn hierarchy(&self, guild_id: u64, user_id: u64) -> PlatformResult<HierarchyView>;
    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()>;
    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()>;
    /// Replace the member's roles with `keep`.
    async fn strip_roles(&self, guild_id: u64, user_id: u64, keep: &[u64], reason: &str) -> PlatformResult<()>;
    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()>;
    async fn delete_webhook(&self, webhook_id: u64, reason: &str) -> PlatformResult<()>;
}

/// Where moderators and the punished actor hear about it.
#[async_trait]
pub trait ModerationSurface: Send + Sync {
    async fn log_action(&self, guild_id: u64, channel_id: u64, record: &PunishmentRecord) -> PlatformResult<()>;
    async fn direct_notify(&self, user_id: u64, message: &str) -> PlatformResult<()>;
}
