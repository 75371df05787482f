//! Normalizacja wpisów audit logu do zdarzeń antinuke.
//!
//! Wejście jest niezależne od klienta Discorda: adapter w `crate::discord`
//! przepisuje `AuditLogEntry` na [`RawAuditEntry`], a tutaj decydujemy, czy
//! wpis w ogóle nas interesuje i do jakiej kategorii trafia.

use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, TimeZone, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

/// Discord epoch (2015-01-01) in milliseconds.
const DISCORD_EPOCH_MS: i64 = 1_420_070_400_000;

/// Raw audit log action types we care about, as sent by the gateway.
pub mod action {
    pub const GUILD_UPDATE: u8 = 1;
    pub const CHANNEL_CREATE: u8 = 10;
    pub const CHANNEL_UPDATE: u8 = 11;
    pub const CHANNEL_DELETE: u8 = 12;
    pub const MEMBER_KICK: u8 = 20;
    pub const MEMBER_PRUNE: u8 = 21;
    pub const MEMBER_BAN_ADD: u8 = 22;
    pub const BOT_ADD: u8 = 28;
    pub const ROLE_CREATE: u8 = 30;
    pub const ROLE_UPDATE: u8 = 31;
    pub const ROLE_DELETE: u8 = 32;
    pub const WEBHOOK_CREATE: u8 = 50;
    pub const EMOJI_CREATE: u8 = 60;
    pub const EMOJI_UPDATE: u8 = 61;
    pub const EMOJI_DELETE: u8 = 62;
}

/// Class of monitored destructive action. Policy is configured per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Ban,
    Kick,
    Role,
    Channel,
    Webhook,
    Emoji,
    BotAdd,
    GuildUpdate,
    MemberPrune,
}

impl Category {
    pub const ALL: [Category; 9] = [
        Category::Ban,
        Category::Kick,
        Category::Role,
        Category::Channel,
        Category::Webhook,
        Category::Emoji,
        Category::BotAdd,
        Category::GuildUpdate,
        Category::MemberPrune,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Ban => "ban",
            Category::Kick => "kick",
            Category::Role => "role",
            Category::Channel => "channel",
            Category::Webhook => "webhook",
            Category::Emoji => "emoji",
            Category::BotAdd => "bot_add",
            Category::GuildUpdate => "guild_update",
            Category::MemberPrune => "member_prune",
        }
    }

    /// Human wording used in audit reasons and notices.
    pub fn describe(self) -> &'static str {
        match self {
            Category::Ban => "Mass ban attempt detected",
            Category::Kick => "Mass kick attempt detected",
            Category::Role => "Role modification attempt detected",
            Category::Channel => "Channel modification attempt detected",
            Category::Webhook => "Webhook creation attempt detected",
            Category::Emoji => "Emoji modification attempt detected",
            Category::BotAdd => "Bot addition attempt detected",
            Category::GuildUpdate => "Server settings modification detected",
            Category::MemberPrune => "Member prune attempt detected",
        }
    }
}

/// Verb of a create/update/delete style action. Categories collapse these,
/// but notices still name what actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Create,
    Update,
    Delete,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Update => "update",
            Verb::Delete => "delete",
        }
    }

    fn noun(self) -> &'static str {
        match self {
            Verb::Create => "creation",
            Verb::Update => "modification",
            Verb::Delete => "deletion",
        }
    }
}

impl FromStr for Verb {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "create" => Verb::Create,
            "update" => Verb::Update,
            "delete" => Verb::Delete,
            other => anyhow::bail!("unknown audit verb: {other}"),
        })
    }
}

/// Notice wording for a category, naming the verb when one is known.
pub fn describe_action(category: Category, verb: Option<Verb>) -> Cow<'static, str> {
    let subject = match category {
        Category::Role => "Role",
        Category::Channel => "Channel",
        Category::Emoji => "Emoji",
        Category::Webhook => "Webhook",
        _ => return Cow::Borrowed(category.describe()),
    };
    match verb {
        Some(v) => Cow::Owned(format!("{subject} {} attempt detected", v.noun())),
        None => Cow::Borrowed(category.describe()),
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown antinuke category: {s}"))
    }
}

/// What kind of object the audited action touched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Role,
    Channel,
    Member,
    Webhook,
    Emoji,
}

impl TargetKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TargetKind::Role => "role",
            TargetKind::Channel => "channel",
            TargetKind::Member => "member",
            TargetKind::Webhook => "webhook",
            TargetKind::Emoji => "emoji",
        }
    }
}

impl FromStr for TargetKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "role" => TargetKind::Role,
            "channel" => TargetKind::Channel,
            "member" => TargetKind::Member,
            "webhook" => TargetKind::Webhook,
            "emoji" => TargetKind::Emoji,
            other => anyhow::bail!("unknown target kind: {other}"),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TargetRef {
    pub kind: TargetKind,
    pub id: u64,
}

/// Platform-neutral audit log entry, as handed over by the gateway adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawAuditEntry {
    pub entry_id: u64,
    pub guild_id: u64,
    pub action_type: u8,
    pub user_id: Option<u64>,
    pub target_id: Option<u64>,
    pub reason: Option<String>,
}

impl RawAuditEntry {
    /// Creation time encoded in the entry snowflake.
    pub fn created_at(&self) -> DateTime<Utc> {
        snowflake_time(self.entry_id)
    }
}

/// Canonical event consumed by the decision engine. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuditEvent {
    pub entry_id: u64,
    pub guild_id: u64,
    pub category: Category,
    /// Identity recorded in the audit log.
    pub actor_id: u64,
    /// Set when the service account performed the action for a human operator.
    pub on_behalf_of: Option<u64>,
    pub verb: Option<Verb>,
    pub target: Option<TargetRef>,
    pub at: DateTime<Utc>,
}

impl AuditEvent {
    /// The identity the action is attributed to.
    pub fn effective_actor(&self) -> u64 {
        self.on_behalf_of.unwrap_or(self.actor_id)
    }
}

/// Map a raw action type to a category and the kind of its target.
pub fn classify(action_type: u8) -> Option<(Category, Option<TargetKind>)> {
    use action::*;
    let out = match action_type {
        MEMBER_BAN_ADD => (Category::Ban, Some(TargetKind::Member)),
        MEMBER_KICK => (Category::Kick, Some(TargetKind::Member)),
        MEMBER_PRUNE => (Category::MemberPrune, None),
        BOT_ADD => (Category::BotAdd, Some(TargetKind::Member)),
        ROLE_CREATE | ROLE_UPDATE | ROLE_DELETE => (Category::Role, Some(TargetKind::Role)),
        CHANNEL_CREATE | CHANNEL_UPDATE | CHANNEL_DELETE => {
            (Category::Channel, Some(TargetKind::Channel))
        }
        WEBHOOK_CREATE => (Category::Webhook, Some(TargetKind::Webhook)),
        EMOJI_CREATE | EMOJI_UPDATE | EMOJI_DELETE => (Category::Emoji, Some(TargetKind::Emoji)),
        GUILD_UPDATE => (Category::GuildUpdate, None),
        _ => return None,
    };
    Some(out)
}

fn verb_of(action_type: u8) -> Option<Verb> {
    use action::*;
    match action_type {
        ROLE_CREATE | CHANNEL_CREATE | WEBHOOK_CREATE | EMOJI_CREATE => Some(Verb::Create),
        ROLE_UPDATE | CHANNEL_UPDATE | EMOJI_UPDATE => Some(Verb::Update),
        ROLE_DELETE | CHANNEL_DELETE | EMOJI_DELETE => Some(Verb::Delete),
        _ => None,
    }
}

/// Turn a raw entry into an [`AuditEvent`]. `service_id` is our own bot user.
pub fn normalize(raw: &RawAuditEntry, service_id: u64) -> Option<AuditEvent> {
    let (category, target_kind) = classify(raw.action_type)?;
    // Discord nulls the user when the actor account was deleted; nothing to punish then.
    let actor_id = raw.user_id?;

    let on_behalf_of = if actor_id == service_id {
        raw.reason.as_deref().and_then(operator_from_reason)
    } else {
        None
    };

    let target = match (target_kind, raw.target_id) {
        (Some(kind), Some(id)) => Some(TargetRef { kind, id }),
        _ => None,
    };

    Some(AuditEvent {
        entry_id: raw.entry_id,
        guild_id: raw.guild_id,
        category,
        actor_id,
        on_behalf_of,
        verb: verb_of(raw.action_type),
        target,
        at: raw.created_at(),
    })
}

/// Moderation commands relayed through the bot end their reason with `| <user id>`.
fn operator_from_reason(reason: &str) -> Option<u64> {
    static OPERATOR_RE: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"\|\s*(\d{15,21})\s*$").expect("operator regex"));
    OPERATOR_RE
        .captures(reason)
        .and_then(|c| c.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// Audit reason for actions taken by the engine itself.
pub fn make_reason(tag: &str, text: &str) -> String {
    format!("[ {tag} antinuke ] {text}")
}

pub fn snowflake_time(id: u64) -> DateTime<Utc> {
    let ms = (id >> 22) as i64 + DISCORD_EPOCH_MS;
    Utc.timestamp_millis_opt(ms).single().unwrap_or_else(Utc::now)
}
