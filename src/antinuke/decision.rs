//! Decision engine: one audit event in, one verdict out.
//!
//! The guards run as an ordered pipeline. The cheap, side-effect free stages
//! come first so an exempt or disabled event never spends a counter slot.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::counter::{ThresholdStatus, ThresholdTracker};
use super::event::{AuditEvent, Category, TargetRef, Verb};
use super::exempt::{ExemptReason, ExemptionEvaluator};
use super::policy::{PolicyCache, PolicyConfig, PunishmentKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    /// Guild disabled, module absent or threshold 0.
    Disabled,
    Exempt(ExemptReason),
    /// Policy could not be read in time.
    PolicyUnavailable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictAction {
    Ignore(IgnoreReason),
    /// Counted, still below the threshold (or the store was down).
    Allow { count: Option<u64> },
    Punish {
        count: u64,
        threshold: u32,
        /// Window of the module that fired; bounds which earlier victims are restored.
        window_secs: u64,
        punishment: PunishmentKind,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Verdict {
    pub guild_id: u64,
    pub category: Category,
    pub verb: Option<Verb>,
    pub actor_id: u64,
    pub target: Option<TargetRef>,
    pub action: VerdictAction,
    pub event_at: DateTime<Utc>,
}

impl Verdict {
    pub fn is_punish(&self) -> bool {
        matches!(self.action, VerdictAction::Punish { .. })
    }
}

/// Guard stages, in the order they must run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Disabled,
    Exempt,
    Threshold,
}

pub const PIPELINE: [Stage; 3] = [Stage::Disabled, Stage::Exempt, Stage::Threshold];

enum Flow {
    Continue,
    Stop(VerdictAction),
}

pub struct DecisionEngine {
    policies: Arc<PolicyCache>,
    exemptions: ExemptionEvaluator,
    tracker: ThresholdTracker,
}

impl DecisionEngine {
    pub fn new(policies: Arc<PolicyCache>, exemptions: ExemptionEvaluator, tracker: ThresholdTracker) -> Self {
        Self {
            policies,
            exemptions,
            tracker,
        }
    }

    pub async fn decide(&self, event: &AuditEvent) -> Verdict {
        let actor_id = event.effective_actor();
        let verdict = |action| Verdict {
            guild_id: event.guild_id,
            category: event.category,
            verb: event.verb,
            actor_id,
            target: event.target,
            action,
            event_at: event.at,
        };

        let policy = match self.policies.get(event.guild_id).await {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(guild_id = event.guild_id, error = %e, "policy unavailable, ignoring event");
                return verdict(VerdictAction::Ignore(IgnoreReason::PolicyUnavailable));
            }
        };

        for stage in PIPELINE {
            match self.run_stage(stage, &policy, event.category, actor_id).await {
                Flow::Continue => continue,
                Flow::Stop(action) => {
                    tracing::debug!(
                        guild_id = event.guild_id,
                        actor_id,
                        category = %event.category,
                        ?stage,
                        ?action,
                        "antinuke verdict"
                    );
                    return verdict(action);
                }
            }
        }

        // Threshold is the last stage and always stops; nothing falls through.
        verdict(VerdictAction::Ignore(IgnoreReason::Disabled))
    }

    async fn run_stage(&self, stage: Stage, policy: &PolicyConfig, category: Category, actor_id: u64) -> Flow {
        match stage {
            Stage::Disabled => match policy.active_rule(category) {
                Some(_) => Flow::Continue,
                None => Flow::Stop(VerdictAction::Ignore(IgnoreReason::Disabled)),
            },
            Stage::Exempt => match self.exemptions.exemption(policy, actor_id) {
                Some(reason) => Flow::Stop(VerdictAction::Ignore(IgnoreReason::Exempt(reason))),
                None => Flow::Continue,
            },
            Stage::Threshold => match self.tracker.check(policy, actor_id, category).await {
                ThresholdStatus::Exceeded { count, threshold } => Flow::Stop(VerdictAction::Punish {
                    count,
                    threshold,
                    window_secs: policy.active_rule(category).map_or(0, |r| r.window_secs),
                    punishment: policy.punishment_for(category),
                }),
                ThresholdStatus::NotExceeded { count } => Flow::Stop(VerdictAction::Allow { count }),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antinuke::counter::{CounterKey, MemoryCounterStore};
    use crate::antinuke::event::TargetKind;
    use crate::antinuke::policy::{MemoryPolicyStore, ModuleRule, PolicyStore};
    use anyhow::Result;
    use serenity::async_trait;
    use std::time::Duration;

    const BOT: u64 = 999;

    struct Fixture {
        engine: DecisionEngine,
        policies: Arc<PolicyCache>,
        counters: Arc<MemoryCounterStore>,
    }

    /// Accepts writes, but every read fails or hangs.
    struct UnreadableStore {
        inner: MemoryPolicyStore,
        hang: bool,
    }

    #[async_trait]
    impl PolicyStore for UnreadableStore {
        async fn load(&self, _g: u64) -> Result<Option<PolicyConfig>> {
            if self.hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            anyhow::bail!("connection reset by peer")
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

    fn fixture() -> Fixture {
        fixture_over(Arc::new(MemoryPolicyStore::new()))
    }

    fn fixture_over(store: Arc<dyn PolicyStore>) -> Fixture {
        let policies = Arc::new(PolicyCache::new(store, Duration::from_secs(60), 16, Duration::from_secs(1)));
        let counters = Arc::new(MemoryCounterStore::new());
        let engine = DecisionEngine::new(
            policies.clone(),
            ExemptionEvaluator::new(policies.clone(), BOT),
            ThresholdTracker::new(counters.clone(), Duration::from_secs(1)),
        );
        Fixture {
            engine,
            policies,
            counters,
        }
    }

    fn ban_by(actor: u64) -> AuditEvent {
        AuditEvent {
            entry_id: 1,
            guild_id: 1,
            category: Category::Ban,
            actor_id: actor,
            on_behalf_of: None,
            verb: None,
            target: Some(TargetRef { kind: TargetKind::Member, id: 500 }),
            at: Utc::now(),
        }
    }

    fn key(actor: u64) -> CounterKey {
        CounterKey { guild_id: 1, actor_id: actor, category: Category::Ban }
    }

    async fn enable_ban(f: &Fixture, threshold: u32) {
        f.policies.set_enabled(1, true).await.unwrap();
        f.policies
            .upsert_module(1, Category::Ban, ModuleRule::new(threshold, Duration::from_secs(60), PunishmentKind::Kick))
            .await
            .unwrap();
    }

    #[test]
    fn pipeline_order_is_fixed() {
        assert_eq!(PIPELINE, [Stage::Disabled, Stage::Exempt, Stage::Threshold]);
    }

    #[tokio::test]
    async fn unconfigured_guild_is_ignored() {
        let f = fixture();
        let v = f.engine.decide(&ban_by(5)).await;
        assert_eq!(v.action, VerdictAction::Ignore(IgnoreReason::Disabled));
        assert!(f.counters.is_empty());
    }

    #[tokio::test]
    async fn exempt_actor_does_not_consume_counter() {
        let f = fixture();
        enable_ban(&f, 2).await;
        f.policies.whitelist_add(1, 5).await.unwrap();
        for _ in 0..5 {
            let v = f.engine.decide(&ban_by(5)).await;
            assert_eq!(v.action, VerdictAction::Ignore(IgnoreReason::Exempt(ExemptReason::Whitelisted)));
        }
        assert!(f.counters.current(&key(5)).is_none());
    }

    #[tokio::test]
    async fn nth_event_punishes_with_configured_kind() {
        let f = fixture();
        enable_ban(&f, 3).await;
        assert_eq!(f.engine.decide(&ban_by(5)).await.action, VerdictAction::Allow { count: Some(1) });
        assert_eq!(f.engine.decide(&ban_by(5)).await.action, VerdictAction::Allow { count: Some(2) });
        let v = f.engine.decide(&ban_by(5)).await;
        assert_eq!(
            v.action,
            VerdictAction::Punish { count: 3, threshold: 3, window_secs: 60, punishment: PunishmentKind::Kick }
        );
        assert_eq!(v.actor_id, 5);
        assert!(v.is_punish());
    }

    #[tokio::test]
    async fn relayed_action_counts_against_operator() {
        let f = fixture();
        enable_ban(&f, 1).await;
        let mut ev = ban_by(BOT);
        ev.on_behalf_of = Some(42);
        let v = f.engine.decide(&ev).await;
        assert_eq!(v.actor_id, 42);
        assert!(v.is_punish());
        assert!(f.counters.current(&key(BOT)).is_none());
    }

    #[tokio::test]
    async fn own_actions_are_exempt() {
        let f = fixture();
        enable_ban(&f, 1).await;
        let v = f.engine.decide(&ban_by(BOT)).await;
        assert_eq!(v.action, VerdictAction::Ignore(IgnoreReason::Exempt(ExemptReason::ServiceAccount)));
    }

    #[tokio::test]
    async fn failing_policy_store_ignores_without_counting() {
        let f = fixture_over(Arc::new(UnreadableStore { inner: MemoryPolicyStore::new(), hang: false }));
        enable_ban(&f, 1).await;

        for _ in 0..3 {
            let v = f.engine.decide(&ban_by(5)).await;
            assert_eq!(v.action, VerdictAction::Ignore(IgnoreReason::PolicyUnavailable));
            assert!(!v.is_punish());
        }
        assert!(f.counters.is_empty());
        assert!(f.engine.exemptions.is_exempt(1, 5).await);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_policy_store_is_cut_off_by_the_timeout() {
        let f = fixture_over(Arc::new(UnreadableStore { inner: MemoryPolicyStore::new(), hang: true }));
        enable_ban(&f, 1).await;

        let started = tokio::time::Instant::now();
        let v = f.engine.decide(&ban_by(5)).await;
        assert_eq!(v.action, VerdictAction::Ignore(IgnoreReason::PolicyUnavailable));
        assert!(started.elapsed() < Duration::from_secs(2));
        assert!(f.counters.is_empty());
        assert!(f.engine.exemptions.is_exempt(1, 5).await);
    }
}
