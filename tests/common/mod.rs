#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use serenity::async_trait;
use tigris_antinuke::antinuke::event::{RawAuditEntry, action};
use tigris_antinuke::antinuke::platform::{HierarchyView, MemberView, PlatformResult, RoleView};
use tigris_antinuke::antinuke::{
    Antinuke, AntinukeParts, Category, MemoryCounterStore, MemoryPolicyStore, MemoryPunishmentLog,
    ModerationSurface, ModuleRule, Platform, PlatformError, PolicyStore, PunishmentKind, PunishmentRecord,
};
use tigris_antinuke::antinuke::policy::PolicyConfig;
use tigris_antinuke::config::{AntinukeConfig, CounterBackend};

pub const GUILD: u64 = 1;
pub const OWNER: u64 = 100;
pub const SERVICE: u64 = 900_000_000_000_000_001;
pub const SERVICE_TOP: i64 = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Ban(u64),
    Kick(u64),
    Strip(u64, Vec<u64>),
    Unban(u64),
    DeleteWebhook(u64),
}

/// Records every platform call; behavior is tweaked per test.
#[derive(Default)]
pub struct MockPlatform {
    pub calls: Mutex<Vec<Call>>,
    pub logged: Mutex<Vec<(u64, PunishmentRecord)>>,
    pub dms: Mutex<Vec<u64>>,
    pub fail_with: Mutex<Option<PlatformError>>,
    pub bots: Mutex<HashSet<u64>>,
    pub high_ranked: Mutex<HashSet<u64>>,
    pub delay: Mutex<Option<Duration>>,
}

impl MockPlatform {
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn punishments_of(&self, user: u64) -> usize {
        self.calls()
            .iter()
            .filter(|c| matches!(c, Call::Ban(u) | Call::Kick(u) | Call::Strip(u, _) if *u == user))
            .count()
    }

    async fn act(&self, call: Call) -> PlatformResult<()> {
        let delay = *self.delay.lock().unwrap();
        if let Some(d) = delay {
            tokio::time::sleep(d).await;
        }
        self.calls.lock().unwrap().push(call);
        match self.fail_with.lock().unwrap().clone() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Platform for MockPlatform {
    async fn hierarchy(&self, _guild_id: u64, user_id: u64) -> PlatformResult<HierarchyView> {
        let top = if self.high_ranked.lock().unwrap().contains(&user_id) {
            SERVICE_TOP + 1
        } else {
            5
        };
        Ok(HierarchyView {
            owner_id: OWNER,
            service_top: SERVICE_TOP,
            member: Some(MemberView {
                user_id,
                is_bot: self.bots.lock().unwrap().contains(&user_id),
                roles: vec![
                    RoleView { id: 10, position: top, managed: false },
                    RoleView { id: 11, position: 2, managed: true },
                ],
            }),
        })
    }

    async fn ban(&self, _guild_id: u64, user_id: u64, _reason: &str) -> PlatformResult<()> {
        self.act(Call::Ban(user_id)).await
    }

    async fn kick(&self, _guild_id: u64, user_id: u64, _reason: &str) -> PlatformResult<()> {
        self.act(Call::Kick(user_id)).await
    }

    async fn strip_roles(&self, _guild_id: u64, user_id: u64, keep: &[u64], _reason: &str) -> PlatformResult<()> {
        self.act(Call::Strip(user_id, keep.to_vec())).await
    }

    async fn unban(&self, _guild_id: u64, user_id: u64, _reason: &str) -> PlatformResult<()> {
        self.act(Call::Unban(user_id)).await
    }

    async fn delete_webhook(&self, webhook_id: u64, _reason: &str) -> PlatformResult<()> {
        self.act(Call::DeleteWebhook(webhook_id)).await
    }
}

#[async_trait]
impl ModerationSurface for MockPlatform {
    async fn log_action(&self, _guild_id: u64, channel_id: u64, record: &PunishmentRecord) -> PlatformResult<()> {
        self.logged.lock().unwrap().push((channel_id, record.clone()));
        Ok(())
    }

    async fn direct_notify(&self, user_id: u64, _message: &str) -> PlatformResult<()> {
        self.dms.lock().unwrap().push(user_id);
        Ok(())
    }
}

/// Memory policy store whose reads can be switched off.
#[derive(Default)]
pub struct SwitchablePolicyStore {
    pub inner: MemoryPolicyStore,
    pub down: AtomicBool,
}

#[async_trait]
impl PolicyStore for SwitchablePolicyStore {
    async fn load(&self, guild_id: u64) -> Result<Option<PolicyConfig>> {
        if self.down.load(Ordering::SeqCst) {
            anyhow::bail!("pool timed out while waiting for an open connection");
        }
        self.inner.load(guild_id).await
    }
    async fn set_enabled(&self, g: u64, e: bool) -> Result<()> { self.inner.set_enabled(g, e).await }
    async fn set_owner(&self, g: u64, o: u64) -> Result<bool> { self.inner.set_owner(g, o).await }
    async fn set_default_punishment(&self, g: u64, k: PunishmentKind) -> Result<()> { self.inner.set_default_punishment(g, k).await }
    async fn set_log_channel(&self, g: u64, c: Option<u64>) -> Result<()> { self.inner.set_log_channel(g, c).await }
    async fn upsert_module(&self, g: u64, c: Category, r: ModuleRule) -> Result<()> { self.inner.upsert_module(g, c, r).await }
    async fn remove_module(&self, g: u64, c: Category) -> Result<bool> { self.inner.remove_module(g, c).await }
    async fn whitelist_add(&self, g: u64, u: u64) -> Result<bool> { self.inner.whitelist_add(g, u).await }
    async fn whitelist_remove(&self, g: u64, u: u64) -> Result<bool> { self.inner.whitelist_remove(g, u).await }
    async fn trust_add(&self, g: u64, u: u64) -> Result<bool> { self.inner.trust_add(g, u).await }
    async fn trust_remove(&self, g: u64, u: u64) -> Result<bool> { self.inner.trust_remove(g, u).await }
    async fn reset(&self, g: u64) -> Result<()> { self.inner.reset(g).await }
}

pub struct Harness {
    pub engine: Arc<Antinuke>,
    pub platform: Arc<MockPlatform>,
    pub counters: Arc<MemoryCounterStore>,
    pub log: Arc<MemoryPunishmentLog>,
    next_entry: AtomicU64,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(AntinukeConfig {
            counter_backend: CounterBackend::Memory,
            ..Default::default()
        })
    }

    pub fn with_config(cfg: AntinukeConfig) -> Self {
        Self::with_policy_store(cfg, Arc::new(MemoryPolicyStore::new()))
    }

    pub fn with_policy_store(cfg: AntinukeConfig, policy_store: Arc<dyn PolicyStore>) -> Self {
        let platform = Arc::new(MockPlatform::default());
        let counters = Arc::new(MemoryCounterStore::new());
        let log = Arc::new(MemoryPunishmentLog::new());
        let parts = AntinukeParts {
            policy_store,
            counters: counters.clone(),
            log: log.clone(),
            platform: platform.clone(),
            surface: platform.clone(),
        };
        Self {
            engine: Antinuke::new(&cfg, SERVICE, parts),
            platform,
            counters,
            log,
            next_entry: AtomicU64::new(1),
        }
    }

    /// Enable the guild and one module; owner is registered as well.
    pub async fn configure(&self, category: Category, threshold: u32, window_secs: u64, punishment: PunishmentKind) {
        let p = self.engine.policies();
        p.set_enabled(GUILD, true).await.unwrap();
        assert!(p.set_owner(GUILD, OWNER).await.unwrap());
        p.upsert_module(
            GUILD,
            category,
            ModuleRule::new(threshold, Duration::from_secs(window_secs), punishment),
        )
        .await
        .unwrap();
    }

    pub fn entry(&self, action_type: u8, actor: u64, target: Option<u64>) -> RawAuditEntry {
        // id niesie czas w górnych bitach; tu wystarczy unikalność
        let seq = self.next_entry.fetch_add(1, Ordering::SeqCst);
        RawAuditEntry {
            entry_id: (1 << 40) + seq,
            guild_id: GUILD,
            action_type,
            user_id: Some(actor),
            target_id: target,
            reason: None,
        }
    }

    pub fn ban(&self, actor: u64, victim: u64) -> RawAuditEntry {
        self.entry(action::MEMBER_BAN_ADD, actor, Some(victim))
    }
}
