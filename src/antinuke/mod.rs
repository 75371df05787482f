//! Antinuke: wykrywanie masowych akcji destrukcyjnych i karanie sprawców.
//!
//! Przepływ: surowy wpis audit logu → [`event::normalize`] →
//! [`decision::DecisionEngine`] → [`executor::PunishmentExecutor`] →
//! [`notify::NotificationSink`]. Każdy wpis obsługiwany jest we własnym tasku.

use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::Result;
use futures_util::FutureExt;
use moka::future::Cache;
use tokio::sync::RwLock;

use crate::config::{AntinukeConfig, CounterBackend};
use crate::db::Db;

pub mod api;
pub mod counter;
pub mod decision;
pub mod error;
pub mod event;
pub mod executor;
pub mod exempt;
pub mod notify;
pub mod platform;
pub mod policy;

pub use counter::{CounterStore, MemoryCounterStore, PgCounterStore};
pub use decision::{Verdict, VerdictAction};
pub use event::{Category, RawAuditEntry};
pub use executor::{ExecutionOutcome, PunishmentRecord};
pub use notify::{MemoryPunishmentLog, PgPunishmentLog, PunishmentLog};
pub use platform::{ModerationSurface, Platform, PlatformError};
pub use policy::{MemoryPolicyStore, ModuleRule, PgPolicyStore, PolicyCache, PolicyStore, PunishmentKind};

use decision::DecisionEngine;
use exempt::ExemptionEvaluator;
use executor::PunishmentExecutor;
use notify::NotificationSink;

const PRUNE_EVERY: Duration = Duration::from_secs(60);

/// Pluggable collaborators of the engine.
pub struct AntinukeParts {
    pub policy_store: Arc<dyn PolicyStore>,
    pub counters: Arc<dyn CounterStore>,
    pub log: Arc<dyn PunishmentLog>,
    pub platform: Arc<dyn Platform>,
    pub surface: Arc<dyn ModerationSurface>,
}

impl AntinukeParts {
    /// Everything in process memory. Single-process deployments and tests.
    pub fn in_memory(platform: Arc<dyn Platform>, surface: Arc<dyn ModerationSurface>) -> Self {
        Self {
            policy_store: Arc::new(MemoryPolicyStore::new()),
            counters: Arc::new(MemoryCounterStore::new()),
            log: Arc::new(MemoryPunishmentLog::new()),
            platform,
            surface,
        }
    }

    /// Postgres-backed policy and records; counters per `backend`.
    pub fn postgres(
        db: Db,
        backend: CounterBackend,
        platform: Arc<dyn Platform>,
        surface: Arc<dyn ModerationSurface>,
    ) -> Self {
        let counters: Arc<dyn CounterStore> = match backend {
            CounterBackend::Postgres => Arc::new(PgCounterStore::new(db.clone())),
            CounterBackend::Memory => Arc::new(MemoryCounterStore::new()),
        };
        Self {
            policy_store: Arc::new(PgPolicyStore::new(db.clone())),
            counters,
            log: Arc::new(PgPunishmentLog::new(db)),
            platform,
            surface,
        }
    }
}

/// Result of processing one audit entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub verdict: Verdict,
    /// Set only when a punishment was attempted.
    pub record: Option<PunishmentRecord>,
}

pub struct Antinuke {
    service_id: u64,
    policies: Arc<PolicyCache>,
    counters: Arc<dyn CounterStore>,
    engine: DecisionEngine,
    executor: PunishmentExecutor,
    sink: NotificationSink,
    seen_entries: Cache<u64, ()>,
    store_timeout: Duration,
    // read = one event in flight, write = shutdown barrier
    inflight: RwLock<()>,
    shutting_down: AtomicBool,
}

impl Antinuke {
    /// Build the engine and start the background counter pruning.
    pub fn new(cfg: &AntinukeConfig, service_id: u64, parts: AntinukeParts) -> Arc<Self> {
        let timeout = cfg.store_timeout();
        let policies = Arc::new(PolicyCache::new(
            parts.policy_store,
            Duration::from_secs(cfg.policy_cache_ttl_secs.unwrap_or(300)),
            cfg.policy_cache_capacity.unwrap_or(10_000),
            timeout,
        ));
        let engine = DecisionEngine::new(
            policies.clone(),
            ExemptionEvaluator::new(policies.clone(), service_id),
            counter::ThresholdTracker::new(parts.counters.clone(), timeout),
        );
        let executor = PunishmentExecutor::new(
            parts.platform,
            Duration::from_secs(cfg.punish_cooldown_secs.unwrap_or(30)),
            cfg.reason_tag(),
            cfg.cleanup.unwrap_or(true),
        );
        let sink = NotificationSink::new(parts.log, parts.surface, policies.clone());
        let seen_entries = Cache::builder()
            .max_capacity(200_000)
            .time_to_live(Duration::from_secs(cfg.dedup_ttl_secs.unwrap_or(600).max(1)))
            .build();

        let this = Arc::new(Self {
            service_id,
            policies,
            counters: parts.counters,
            engine,
            executor,
            sink,
            seen_entries,
            store_timeout: timeout,
            inflight: RwLock::new(()),
            shutting_down: AtomicBool::new(false),
        });
        spawn_pruner(Arc::downgrade(&this));
        tracing::info!(service_id, "antinuke engine ready");
        this
    }

    pub fn service_id(&self) -> u64 {
        self.service_id
    }

    /// Policy configuration surface. Writes invalidate the cache.
    pub fn policies(&self) -> &Arc<PolicyCache> {
        &self.policies
    }

    pub fn punishment_log(&self) -> Arc<dyn PunishmentLog> {
        self.sink.log().clone()
    }

    /// Fire-and-forget: handle the entry on its own task.
    pub fn dispatch(self: &Arc<Self>, raw: RawAuditEntry) {
        let this = self.clone();
        tokio::spawn(async move {
            let entry_id = raw.entry_id;
            // panika w jednym wpisie nie może zatrzymać pozostałych
            if AssertUnwindSafe(this.process(raw)).catch_unwind().await.is_err() {
                tracing::error!(entry_id, "antinuke task panicked");
            }
        });
    }

    /// Handle one entry end to end. `None` when the entry is not monitored,
    /// was already seen, or the engine is shutting down.
    pub async fn process(&self, raw: RawAuditEntry) -> Option<Outcome> {
        let _permit = self.inflight.read().await;
        if self.shutting_down.load(Ordering::Acquire) {
            tracing::debug!(entry_id = raw.entry_id, "shutting down, dropping audit entry");
            return None;
        }

        let event = event::normalize(&raw, self.service_id)?;
        let first_delivery = self
            .seen_entries
            .entry(event.entry_id)
            .or_insert(())
            .await
            .is_fresh();
        if !first_delivery {
            tracing::debug!(entry_id = event.entry_id, guild_id = event.guild_id, "duplicate audit entry");
            return None;
        }

        let verdict = self.engine.decide(&event).await;
        let record = match self.executor.execute(&verdict).await {
            ExecutionOutcome::Executed(record) => {
                self.sink.notify(&record).await;
                Some(record)
            }
            ExecutionOutcome::Suppressed => None,
        };
        Some(Outcome { verdict, record })
    }

    /// Remove the guild's policy and every counter it owns.
    pub async fn reset(&self, guild_id: u64) -> Result<()> {
        self.policies.reset(guild_id).await?;
        let removed = error::bounded(self.store_timeout, self.counters.reset_guild(guild_id)).await?;
        tracing::info!(guild_id, removed, "antinuke policy reset");
        Ok(())
    }

    /// Stop accepting entries and wait for in-flight ones to finish.
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
        let _barrier = self.inflight.write().await;
        tracing::info!("antinuke drained");
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }
}

fn spawn_pruner(weak: Weak<Antinuke>) {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(PRUNE_EVERY);
        tick.tick().await;
        loop {
            tick.tick().await;
            let Some(engine) = weak.upgrade() else { break };
            if engine.is_shutting_down() {
                break;
            }
            match error::bounded(engine.store_timeout, engine.counters.prune_expired()).await {
                Ok(0) => {}
                Ok(n) => tracing::debug!(pruned = n, "expired antinuke counters removed"),
                Err(e) => tracing::warn!(error = %e, "counter prune failed"),
            }
        }
    });
}
