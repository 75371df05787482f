//! Audit trail of punishments and best-effort notices.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::Result;
use dashmap::DashMap;
use serenity::async_trait;

use super::event::describe_action;
use super::executor::PunishmentRecord;
use super::platform::ModerationSurface;
use super::policy::PolicyCache;
use crate::db::{self, Db};

/// Kept per guild by the in-memory log.
const MEMORY_LOG_DEPTH: usize = 500;

#[async_trait]
pub trait PunishmentLog: Send + Sync {
    async fn append(&self, record: &PunishmentRecord) -> Result<()>;
    /// Newest first.
    async fn recent(&self, guild_id: u64, limit: usize) -> Result<Vec<PunishmentRecord>>;
}

#[derive(Debug, Default)]
pub struct MemoryPunishmentLog {
    guilds: DashMap<u64, VecDeque<PunishmentRecord>>,
}

impl MemoryPunishmentLog {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PunishmentLog for MemoryPunishmentLog {
    async fn append(&self, record: &PunishmentRecord) -> Result<()> {
        let mut log = self.guilds.entry(record.guild_id).or_default();
        log.push_front(record.clone());
        log.truncate(MEMORY_LOG_DEPTH);
        Ok(())
    }

    async fn recent(&self, guild_id: u64, limit: usize) -> Result<Vec<PunishmentRecord>> {
        Ok(self
            .guilds
            .get(&guild_id)
            .map(|log| log.iter().take(limit).cloned().collect())
            .unwrap_or_default())
    }
}

#[derive(Debug, Clone)]
pub struct PgPunishmentLog {
    db: Db,
}

impl PgPunishmentLog {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl PunishmentLog for PgPunishmentLog {
    async fn append(&self, record: &PunishmentRecord) -> Result<()> {
        db::insert_punishment(&self.db, record).await
    }

    async fn recent(&self, guild_id: u64, limit: usize) -> Result<Vec<PunishmentRecord>> {
        db::list_punishments(&self.db, guild_id, limit as i64).await
    }
}

pub struct NotificationSink {
    log: Arc<dyn PunishmentLog>,
    surface: Arc<dyn ModerationSurface>,
    policies: Arc<PolicyCache>,
}

impl NotificationSink {
    pub fn new(log: Arc<dyn PunishmentLog>, surface: Arc<dyn ModerationSurface>, policies: Arc<PolicyCache>) -> Self {
        Self {
            log,
            surface,
            policies,
        }
    }

    pub fn log(&self) -> &Arc<dyn PunishmentLog> {
        &self.log
    }

    /// Persist the record, post it to the moderation log and tell the actor.
    /// Nothing here fails the caller.
    pub async fn notify(&self, record: &PunishmentRecord) {
        if let Err(e) = self.log.append(record).await {
            tracing::error!(guild_id = record.guild_id, error = ?e, "failed to persist punishment record");
        }

        let channel = match self.policies.get(record.guild_id).await {
            Ok(policy) => policy.log_channel,
            Err(e) => {
                tracing::warn!(guild_id = record.guild_id, error = %e, "policy unavailable, skipping moderation log");
                None
            }
        };
        if let Some(channel_id) = channel {
            if let Err(e) = self.surface.log_action(record.guild_id, channel_id, record).await {
                tracing::warn!(guild_id = record.guild_id, channel_id, error = %e, "moderation log entry failed");
            }
        }

        if record.success {
            let message = actor_notice(record);
            if let Err(e) = self.surface.direct_notify(record.actor_id, &message).await {
                tracing::debug!(actor = record.actor_id, error = %e, "actor notice not delivered");
            }
        }
    }
}

fn actor_notice(record: &PunishmentRecord) -> String {
    format!(
        "You were punished ({}) by the antinuke system: {}.",
        record.punishment,
        describe_action(record.category, record.verb)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antinuke::event::{Category, Verb};
    use crate::antinuke::platform::{PlatformError, PlatformResult};
    use crate::antinuke::policy::{MemoryPolicyStore, PunishmentKind};
    use chrono::Utc;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Default)]
    struct Surface {
        logged: Mutex<Vec<(u64, u64)>>,
        dms: Mutex<Vec<u64>>,
    }

    #[async_trait]
    impl ModerationSurface for Surface {
        async fn log_action(&self, guild_id: u64, channel_id: u64, _r: &PunishmentRecord) -> PlatformResult<()> {
            self.logged.lock().unwrap().push((guild_id, channel_id));
            Ok(())
        }
        async fn direct_notify(&self, _user_id: u64, _message: &str) -> PlatformResult<()> {
            // DMs closed
            Err(PlatformError::Forbidden)
        }
    }

    fn record(guild_id: u64, success: bool) -> PunishmentRecord {
        PunishmentRecord {
            guild_id,
            actor_id: 5,
            category: Category::Ban,
            verb: None,
            punishment: PunishmentKind::Kick,
            success,
            failure_reason: (!success).then(|| "forbidden".to_string()),
            target: None,
            elapsed_ms: 12,
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn records_and_logs_even_when_dm_fails() {
        let policies = Arc::new(PolicyCache::new(
            Arc::new(MemoryPolicyStore::new()),
            Duration::from_secs(60),
            16,
            Duration::from_secs(1),
        ));
        policies.set_log_channel(1, Some(300)).await.unwrap();
        let surface = Arc::new(Surface::default());
        let log = Arc::new(MemoryPunishmentLog::new());
        let sink = NotificationSink::new(log.clone(), surface.clone(), policies);

        sink.notify(&record(1, true)).await;
        sink.notify(&record(2, false)).await;

        assert_eq!(*surface.logged.lock().unwrap(), vec![(1, 300)]);
        assert_eq!(log.recent(1, 10).await.unwrap().len(), 1);
        assert!(!log.recent(2, 10).await.unwrap()[0].success);
    }

    #[test]
    fn actor_notice_names_what_happened() {
        let mut r = record(1, true);
        r.category = Category::Channel;
        r.verb = Some(Verb::Delete);
        assert_eq!(
            actor_notice(&r),
            "You were punished (kick) by the antinuke system: Channel deletion attempt detected."
        );
    }

    #[tokio::test]
    async fn memory_log_is_newest_first_and_bounded() {
        let log = MemoryPunishmentLog::new();
        for i in 0..(MEMORY_LOG_DEPTH as i64 + 5) {
            let mut r = record(1, true);
            r.elapsed_ms = i;
            log.append(&r).await.unwrap();
        }
        let recent = log.recent(1, MEMORY_LOG_DEPTH + 10).await.unwrap();
        assert_eq!(recent.len(), MEMORY_LOG_DEPTH);
        assert_eq!(recent[0].elapsed_ms, MEMORY_LOG_DEPTH as i64 + 4);
    }
}
