//! Punishment executor: turns a punish verdict into platform calls.

use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use super::decision::{Verdict, VerdictAction};
use super::event::{Category, TargetKind, TargetRef, Verb, describe_action, make_reason};
use super::platform::{HierarchyView, Platform, PlatformError};
use super::policy::PunishmentKind;

/// Failure reason of a punishment refused by the client-side hierarchy check.
pub const HIERARCHY: &str = "hierarchy";

const MAX_TRACKED_VICTIMS: usize = 256;

type Victims = Arc<StdMutex<Vec<(u64, DateTime<Utc>)>>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PunishmentRecord {
    pub guild_id: u64,
    pub actor_id: u64,
    pub category: Category,
    #[serde(default)]
    pub verb: Option<Verb>,
    /// What was actually applied (bots are escalated to ban).
    pub punishment: PunishmentKind,
    pub success: bool,
    pub failure_reason: Option<String>,
    pub target: Option<TargetRef>,
    /// Audit entry time to action completion.
    pub elapsed_ms: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionOutcome {
    Executed(PunishmentRecord),
    /// Not a punish verdict, or the actor was punished moments ago.
    Suppressed,
}

pub struct PunishmentExecutor {
    platform: Arc<dyn Platform>,
    locks: DashMap<u64, Arc<Mutex<()>>>,
    recently_punished: Cache<(u64, u64), ()>,
    /// Members banned by an actor that has not been punished yet.
    ban_victims: Cache<(u64, u64), Victims>,
    reason_tag: String,
    cleanup: bool,
}

impl PunishmentExecutor {
    pub fn new(platform: Arc<dyn Platform>, cooldown: Duration, reason_tag: impl Into<String>, cleanup: bool) -> Self {
        let recently_punished = Cache::builder()
            .max_capacity(100_000)
            .time_to_live(cooldown.max(Duration::from_secs(1)))
            .build();
        let ban_victims = Cache::builder()
            .max_capacity(100_000)
            .time_to_idle(Duration::from_secs(3600))
            .build();
        Self {
            platform,
            locks: DashMap::new(),
            recently_punished,
            ban_victims,
            reason_tag: reason_tag.into(),
            cleanup,
        }
    }

    fn guild_lock(&self, guild_id: u64) -> Arc<Mutex<()>> {
        self.locks.entry(guild_id).or_default().value().clone()
    }

    pub async fn execute(&self, verdict: &Verdict) -> ExecutionOutcome {
        let VerdictAction::Punish { punishment, count, threshold, window_secs } = verdict.action else {
            if matches!(verdict.action, VerdictAction::Allow { .. }) {
                self.remember_ban_victim(verdict).await;
            }
            return ExecutionOutcome::Suppressed;
        };
        let key = (verdict.guild_id, verdict.actor_id);

        let lock = self.guild_lock(verdict.guild_id);
        let record = {
            let _guard = lock.lock().await;
            if self.recently_punished.contains_key(&key) {
                tracing::debug!(
                    guild_id = verdict.guild_id,
                    actor = verdict.actor_id,
                    category = %verdict.category,
                    "actor already punished, suppressing"
                );
                return ExecutionOutcome::Suppressed;
            }

            tracing::warn!(
                guild_id = verdict.guild_id,
                actor = verdict.actor_id,
                category = %verdict.category,
                count,
                threshold,
                %punishment,
                "antinuke threshold exceeded, punishing"
            );
            let record = self.punish(verdict, punishment).await;
            // Platform errors stay retryable by the next event; hierarchy refusals do not.
            if record.success || record.failure_reason.as_deref() == Some(HIERARCHY) {
                self.recently_punished.insert(key, ()).await;
            }
            record
        };

        if record.success {
            tracing::info!(
                guild_id = record.guild_id,
                actor = record.actor_id,
                punishment = %record.punishment,
                elapsed_ms = record.elapsed_ms,
                "punishment applied"
            );
            if self.cleanup {
                self.clean_up(verdict, window_secs).await;
            }
        } else {
            tracing::warn!(
                guild_id = record.guild_id,
                actor = record.actor_id,
                reason = record.failure_reason.as_deref().unwrap_or_default(),
                "punishment failed"
            );
        }
        ExecutionOutcome::Executed(record)
    }

    async fn punish(&self, verdict: &Verdict, requested: PunishmentKind) -> PunishmentRecord {
        let (guild_id, actor_id) = (verdict.guild_id, verdict.actor_id);
        let finish = |punishment: PunishmentKind, result: Result<(), String>| PunishmentRecord {
            guild_id,
            actor_id,
            category: verdict.category,
            verb: verdict.verb,
            punishment,
            success: result.is_ok(),
            failure_reason: result.err(),
            target: verdict.target,
            elapsed_ms: (Utc::now() - verdict.event_at).num_milliseconds().max(0),
            created_at: Utc::now(),
        };

        let view = match self.platform.hierarchy(guild_id, actor_id).await {
            Ok(v) => v,
            Err(e) => return finish(requested, Err(e.reason())),
        };
        if outranks_service(&view, actor_id) {
            return finish(requested, Err(HIERARCHY.into()));
        }

        let kind = match &view.member {
            Some(m) if m.is_bot => PunishmentKind::Ban,
            _ => requested,
        };
        let reason = make_reason(&self.reason_tag, &describe_action(verdict.category, verdict.verb));
        let result = match kind {
            PunishmentKind::Ban => self.platform.ban(guild_id, actor_id, &reason).await,
            PunishmentKind::Kick => self.platform.kick(guild_id, actor_id, &reason).await,
            PunishmentKind::Strip => match view.member {
                Some(_) => {
                    self.platform
                        .strip_roles(guild_id, actor_id, &view.kept_roles(), &reason)
                        .await
                }
                None => Err(PlatformError::NotFound),
            },
        };
        finish(kind, result.map_err(|e| e.reason()))
    }

    async fn remember_ban_victim(&self, verdict: &Verdict) {
        if !self.cleanup || verdict.category != Category::Ban {
            return;
        }
        let Some(TargetRef { kind: TargetKind::Member, id }) = verdict.target else {
            return;
        };
        let victims = self
            .ban_victims
            .get_with((verdict.guild_id, verdict.actor_id), async { Victims::default() })
            .await;
        let mut v = victims.lock().unwrap_or_else(PoisonError::into_inner);
        v.push((id, verdict.event_at));
        if v.len() > MAX_TRACKED_VICTIMS {
            let excess = v.len() - MAX_TRACKED_VICTIMS;
            v.drain(..excess);
        }
    }

    /// Victims of the actor banned within `window_secs` of the triggering event,
    /// oldest first, ending with the triggering one.
    async fn ban_victims_of(&self, verdict: &Verdict, window_secs: u64, current: u64) -> Vec<u64> {
        let key = (verdict.guild_id, verdict.actor_id);
        let since = i64::try_from(window_secs)
            .ok()
            .and_then(chrono::Duration::try_seconds)
            .and_then(|w| verdict.event_at.checked_sub_signed(w))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut out: Vec<u64> = match self.ban_victims.remove(&key).await {
            Some(victims) => victims
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|(_, at)| *at >= since)
                .map(|(id, _)| *id)
                .collect(),
            None => Vec::new(),
        };
        out.push(current);
        let mut seen = std::collections::HashSet::new();
        out.retain(|id| seen.insert(*id));
        out
    }

    /// Undo what can be undone without snapshots.
    async fn clean_up(&self, verdict: &Verdict, window_secs: u64) {
        let Some(target) = verdict.target else {
            return;
        };
        let reason = make_reason(&self.reason_tag, "Cleanup");
        let results = match target.kind {
            TargetKind::Member => match verdict.category {
                Category::Ban => {
                    let mut results = Vec::new();
                    for victim in self.ban_victims_of(verdict, window_secs, target.id).await {
                        let r = self.platform.unban(verdict.guild_id, victim, &reason).await;
                        results.push((victim, r));
                    }
                    results
                }
                Category::BotAdd => vec![(target.id, self.platform.ban(verdict.guild_id, target.id, &reason).await)],
                _ => return,
            },
            TargetKind::Webhook => vec![(target.id, self.platform.delete_webhook(target.id, &reason).await)],
            TargetKind::Role | TargetKind::Channel | TargetKind::Emoji => return,
        };
        for (id, result) in results {
            if let Err(e) = result {
                tracing::warn!(guild_id = verdict.guild_id, target = id, error = %e, "cleanup failed");
            }
        }
    }
}

/// Owner and anyone ranked at or above us cannot be touched.
fn outranks_service(view: &HierarchyView, actor_id: u64) -> bool {
    if view.owner_id == actor_id {
        return true;
    }
    view.member
        .as_ref()
        .is_some_and(|m| m.top_position() >= view.service_top)
}
