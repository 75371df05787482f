//! Per-guild antinuke policy: model, storage backends and the read-through cache.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serenity::async_trait;

use super::error::{StoreError, bounded};
use super::event::Category;
use crate::db::{self, Db};

/// Remedial action taken against an offender.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PunishmentKind {
    #[default]
    Ban,
    Kick,
    /// Remove every removable role, leave the member in the guild.
    Strip,
}

impl PunishmentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            PunishmentKind::Ban => "ban",
            PunishmentKind::Kick => "kick",
            PunishmentKind::Strip => "strip",
        }
    }
}

impl fmt::Display for PunishmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PunishmentKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ban" => Ok(PunishmentKind::Ban),
            "kick" => Ok(PunishmentKind::Kick),
            "strip" => Ok(PunishmentKind::Strip),
            other => anyhow::bail!("Punishment must be ban, kick, or strip (got {other})"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct ModuleRule {
    /// 0 means the module is off.
    pub threshold: u32,
    pub window_secs: u64,
    /// `None` falls back to the guild's default punishment.
    pub punishment: Option<PunishmentKind>,
}

impl ModuleRule {
    pub fn new(threshold: u32, window: Duration, punishment: PunishmentKind) -> Self {
        Self {
            threshold,
            window_secs: window.as_secs(),
            punishment: Some(punishment),
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs.max(1))
    }

    pub fn is_active(&self) -> bool {
        self.threshold > 0
    }
}

impl Default for ModuleRule {
    fn default() -> Self {
        Self {
            threshold: 5,
            window_secs: 60,
            punishment: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct PolicyConfig {
    pub guild_id: u64,
    pub enabled: bool,
    pub owner_id: Option<u64>,
    pub modules: BTreeMap<Category, ModuleRule>,
    pub whitelist: HashSet<u64>,
    pub trusted_admins: HashSet<u64>,
    pub punishment_default: PunishmentKind,
    /// Moderation log channel; `None` skips the log entry.
    pub log_channel: Option<u64>,
}

impl PolicyConfig {
    /// Policy of a guild that was never configured: everything off.
    pub fn disabled(guild_id: u64) -> Self {
        Self {
            guild_id,
            enabled: false,
            owner_id: None,
            modules: BTreeMap::new(),
            whitelist: HashSet::new(),
            trusted_admins: HashSet::new(),
            punishment_default: PunishmentKind::Ban,
            log_channel: None,
        }
    }

    /// Rule for `category` if the guild is enabled and the module is on.
    pub fn active_rule(&self, category: Category) -> Option<&ModuleRule> {
        if !self.enabled {
            return None;
        }
        self.modules.get(&category).filter(|r| r.is_active())
    }

    pub fn punishment_for(&self, category: Category) -> PunishmentKind {
        self.modules
            .get(&category)
            .and_then(|r| r.punishment)
            .unwrap_or(self.punishment_default)
    }
}

/// Persistent policy storage. Every mutation is a point update.
#[async_trait]
pub trait PolicyStore: Send + Sync {
    async fn load(&self, guild_id: u64) -> Result<Option<PolicyConfig>>;
    async fn set_enabled(&self, guild_id: u64, enabled: bool) -> Result<()>;
    /// Refresh the owner of an already configured guild. Never creates a policy;
    /// returns `false` when the guild has none.
    async fn set_owner(&self, guild_id: u64, owner_id: u64) -> Result<bool>;
    async fn set_default_punishment(&self, guild_id: u64, kind: PunishmentKind) -> Result<()>;
    async fn set_log_channel(&self, guild_id: u64, channel_id: Option<u64>) -> Result<()>;
    async fn upsert_module(&self, guild_id: u64, category: Category, rule: ModuleRule) -> Result<()>;
    async fn remove_module(&self, guild_id: u64, category: Category) -> Result<bool>;
    async fn whitelist_add(&self, guild_id: u64, user_id: u64) -> Result<bool>;
    async fn whitelist_remove(&self, guild_id: u64, user_id: u64) -> Result<bool>;
    async fn trust_add(&self, guild_id: u64, user_id: u64) -> Result<bool>;
    async fn trust_remove(&self, guild_id: u64, user_id: u64) -> Result<bool>;
    /// Drop the whole policy of a guild.
    async fn reset(&self, guild_id: u64) -> Result<()>;
}

/* ==============================
   Backend: pamięć procesu
   ============================== */

#[derive(Debug, Default)]
pub struct MemoryPolicyStore {
    guilds: DashMap<u64, PolicyConfig>,
}

impl MemoryPolicyStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with<R>(&self, guild_id: u64, f: impl FnOnce(&mut PolicyConfig) -> R) -> R {
        let mut entry = self
            .guilds
            .entry(guild_id)
            .or_insert_with(|| PolicyConfig::disabled(guild_id));
        f(entry.value_mut())
    }
}

#[async_trait]
impl PolicyStore for MemoryPolicyStore {
    async fn load(&self, guild_id: u64) -> Result<Option<PolicyConfig>> {
        Ok(self.guilds.get(&guild_id).map(|e| e.value().clone()))
    }

    async fn set_enabled(&self, guild_id: u64, enabled: bool) -> Result<()> {
        self.with(guild_id, |p| p.enabled = enabled);
        Ok(())
    }

    async fn set_owner(&self, guild_id: u64, owner_id: u64) -> Result<bool> {
        Ok(match self.guilds.get_mut(&guild_id) {
            Some(mut p) => {
                p.owner_id = Some(owner_id);
                true
            }
            None => false,
        })
    }

    async fn set_default_punishment(&self, guild_id: u64, kind: PunishmentKind) -> Result<()> {
        self.with(guild_id, |p| p.punishment_default = kind);
        Ok(())
    }

    async fn set_log_channel(&self, guild_id: u64, channel_id: Option<u64>) -> Result<()> {
        self.with(guild_id, |p| p.log_channel = channel_id);
        Ok(())
    }

    async fn upsert_module(&self, guild_id: u64, category: Category, rule: ModuleRule) -> Result<()> {
        self.with(guild_id, |p| p.modules.insert(category, rule));
        Ok(())
    }

    async fn remove_module(&self, guild_id: u64, category: Category) -> Result<bool> {
        Ok(self.with(guild_id, |p| p.modules.remove(&category).is_some()))
    }

    async fn whitelist_add(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        Ok(self.with(guild_id, |p| p.whitelist.insert(user_id)))
    }

    async fn whitelist_remove(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        Ok(self.with(guild_id, |p| p.whitelist.remove(&user_id)))
    }

    async fn trust_add(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        Ok(self.with(guild_id, |p| p.trusted_admins.insert(user_id)))
    }

    async fn trust_remove(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        Ok(self.with(guild_id, |p| p.trusted_admins.remove(&user_id)))
    }

    async fn reset(&self, guild_id: u64) -> Result<()> {
        self.guilds.remove(&guild_id);
        Ok(())
    }
}

/* ==============================
   Backend: Postgres
   ============================== */

#[derive(Debug, Clone)]
pub struct PgPolicyStore {
    db: Db,
}

impl PgPolicyStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PolicyStore for PgPolicyStore {
    async fn load(&self, guild_id: u64) -> Result<Option<PolicyConfig>> {
        db::load_policy(&self.db, guild_id).await
    }

    async fn set_enabled(&self, guild_id: u64, enabled: bool) -> Result<()> {
        db::set_policy_enabled(&self.db, guild_id, enabled).await
    }

    async fn set_owner(&self, guild_id: u64, owner_id: u64) -> Result<bool> {
        db::set_policy_owner(&self.db, guild_id, owner_id).await
    }

    async fn set_default_punishment(&self, guild_id: u64, kind: PunishmentKind) -> Result<()> {
        db::set_policy_punishment(&self.db, guild_id, kind).await
    }

    async fn set_log_channel(&self, guild_id: u64, channel_id: Option<u64>) -> Result<()> {
        db::set_policy_log_channel(&self.db, guild_id, channel_id).await
    }

    async fn upsert_module(&self, guild_id: u64, category: Category, rule: ModuleRule) -> Result<()> {
        db::upsert_module(&self.db, guild_id, category, &rule).await
    }

    async fn remove_module(&self, guild_id: u64, category: Category) -> Result<bool> {
        db::delete_module(&self.db, guild_id, category).await
    }

    async fn whitelist_add(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        db::member_list_add(&self.db, db::MemberList::Whitelist, guild_id, user_id).await
    }

    async fn whitelist_remove(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        db::member_list_remove(&self.db, db::MemberList::Whitelist, guild_id, user_id).await
    }

    async fn trust_add(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        db::member_list_add(&self.db, db::MemberList::Trusted, guild_id, user_id).await
    }

    async fn trust_remove(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        db::member_list_remove(&self.db, db::MemberList::Trusted, guild_id, user_id).await
    }

    async fn reset(&self, guild_id: u64) -> Result<()> {
        db::reset_policy(&self.db, guild_id).await
    }
}

/* ==============================
   Read-through cache
   ============================== */

/// Read-through policy cache. All writes go through here so the cached entry
/// is invalidated right after the store accepts the change.
pub struct PolicyCache {
    store: Arc<dyn PolicyStore>,
    cache: Cache<u64, Arc<PolicyConfig>>,
    timeout: Duration,
}

impl PolicyCache {
    pub fn new(store: Arc<dyn PolicyStore>, ttl: Duration, capacity: u64, timeout: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(capacity)
            .time_to_live(ttl)
            .build();
        Self {
            store,
            cache,
            timeout,
        }
    }

    /// Cached policy; a guild without a stored policy is returned as disabled.
    pub async fn get(&self, guild_id: u64) -> Result<Arc<PolicyConfig>, StoreError> {
        let store = self.store.clone();
        let timeout = self.timeout;
        self.cache
            .try_get_with(guild_id, async move {
                let loaded = bounded(timeout, store.load(guild_id)).await?;
                Ok::<_, StoreError>(Arc::new(
                    loaded.unwrap_or_else(|| PolicyConfig::disabled(guild_id)),
                ))
            })
            .await
            .map_err(|e| (*e).clone())
    }

    /// Invalidation hook; also usable by an external configuration surface.
    pub async fn invalidate(&self, guild_id: u64) {
        self.cache.invalidate(&guild_id).await;
    }

    pub async fn set_enabled(&self, guild_id: u64, enabled: bool) -> Result<()> {
        self.store.set_enabled(guild_id, enabled).await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    pub async fn set_owner(&self, guild_id: u64, owner_id: u64) -> Result<bool> {
        let updated = self.store.set_owner(guild_id, owner_id).await?;
        if updated {
            self.invalidate(guild_id).await;
        }
        Ok(updated)
    }

    pub async fn set_default_punishment(&self, guild_id: u64, kind: PunishmentKind) -> Result<()> {
        self.store.set_default_punishment(guild_id, kind).await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    pub async fn set_log_channel(&self, guild_id: u64, channel_id: Option<u64>) -> Result<()> {
        self.store.set_log_channel(guild_id, channel_id).await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    pub async fn upsert_module(&self, guild_id: u64, category: Category, rule: ModuleRule) -> Result<()> {
        self.store.upsert_module(guild_id, category, rule).await?;
        self.invalidate(guild_id).await;
        Ok(())
    }

    pub async fn remove_module(&self, guild_id: u64, category: Category) -> Result<bool> {
        let removed = self.store.remove_module(guild_id, category).await?;
        self.invalidate(guild_id).await;
        Ok(removed)
    }

    pub async fn whitelist_add(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        let added = self.store.whitelist_add(guild_id, user_id).await?;
        self.invalidate(guild_id).await;
        Ok(added)
    }

    pub async fn whitelist_remove(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        let removed = self.store.whitelist_remove(guild_id, user_id).await?;
        self.invalidate(guild_id).await;
        Ok(removed)
    }

    pub async fn trust_add(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        let added = self.store.trust_add(guild_id, user_id).await?;
        self.invalidate(guild_id).await;
        Ok(added)
    }

    pub async fn trust_remove(&self, guild_id: u64, user_id: u64) -> Result<bool> {
        let removed = self.store.trust_remove(guild_id, user_id).await?;
        self.invalidate(guild_id).await;
        Ok(removed)
    }

    pub async fn reset(&self, guild_id: u64) -> Result<()> {
        self.store.reset(guild_id).await?;
        self.invalidate(guild_id).await;
        Ok(())
    }
}
