//! Liczniki akcji per (gildia, aktor, kategoria) i tracker progów.
//!
//! Okno jest stałe (fixed window): pierwszy event epoki ustawia wygaśnięcie
//! klucza na `window`, kolejne tylko inkrementują. To nie jest sliding log.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use dashmap::DashMap;
use serenity::async_trait;
use tokio::time::Instant;

use super::error::bounded;
use super::event::Category;
use super::policy::PolicyConfig;
use crate::db::{self, Db};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CounterKey {
    pub guild_id: u64,
    pub actor_id: u64,
    pub category: Category,
}

impl fmt::Display for CounterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "antinuke_{}:{}-{}", self.category, self.guild_id, self.actor_id)
    }
}

/// Shared increment-with-expiry counters.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Atomically increment `key` and return the new value. The increment that
    /// creates the key (or starts a new epoch after expiry) sets its TTL to `window`.
    async fn incr_with_expiry(&self, key: &CounterKey, window: Duration) -> Result<u64>;
    /// Delete every counter of a guild. Only used by a full policy reset.
    async fn reset_guild(&self, guild_id: u64) -> Result<u64>;
    /// Drop expired keys; returns how many were removed.
    async fn prune_expired(&self) -> Result<u64>;
}

/* ==============================
   Backend: pamięć procesu
   ============================== */

#[derive(Debug, Clone, Copy)]
struct Slot {
    value: u64,
    expires_at: Instant,
}

/// Process-local counters. The per-key entry lock makes increment+expire atomic.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    slots: DashMap<CounterKey, Slot>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current value of a live key.
    pub fn current(&self, key: &CounterKey) -> Option<u64> {
        let now = Instant::now();
        self.slots
            .get(key)
            .filter(|s| s.expires_at > now)
            .map(|s| s.value)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn incr_with_expiry(&self, key: &CounterKey, window: Duration) -> Result<u64> {
        let now = Instant::now();
        let mut slot = self.slots.entry(*key).or_insert(Slot {
            value: 0,
            expires_at: now + window,
        });
        if slot.expires_at <= now {
            slot.value = 0;
            slot.expires_at = now + window;
        }
        slot.value += 1;
        Ok(slot.value)
    }

    async fn reset_guild(&self, guild_id: u64) -> Result<u64> {
        let mut removed = 0u64;
        self.slots.retain(|k, _| {
            let keep = k.guild_id != guild_id;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }

    // Liczone w retain: len() przed/po ściga się z równoległymi inkrementami.
    async fn prune_expired(&self) -> Result<u64> {
        let now = Instant::now();
        let mut removed = 0u64;
        self.slots.retain(|_, s| {
            let keep = s.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });
        Ok(removed)
    }
}

/* ==============================
   Backend: Postgres
   ============================== */

/// Counters shared between bot processes. One upsert statement per increment.
#[derive(Debug, Clone)]
pub struct PgCounterStore {
    db: Db,
}

impl PgCounterStore {
    pub fn new(db: Db) -> Self {
        Self { db }
    }
}

#[async_trait]
impl CounterStore for PgCounterStore {
    async fn incr_with_expiry(&self, key: &CounterKey, window: Duration) -> Result<u64> {
        let v = db::counter_incr(&self.db, key.guild_id, key.actor_id, key.category, window).await?;
        Ok(v.max(0) as u64)
    }

    async fn reset_guild(&self, guild_id: u64) -> Result<u64> {
        db::counters_reset_guild(&self.db, guild_id).await
    }

    async fn prune_expired(&self) -> Result<u64> {
        db::counters_prune(&self.db).await
    }
}

/* ==============================
   Threshold tracker
   ============================== */

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThresholdStatus {
    Exceeded { count: u64, threshold: u32 },
    /// `count` is `None` when no counter was touched (module off or store down).
    NotExceeded { count: Option<u64> },
}

pub struct ThresholdTracker {
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl ThresholdTracker {
    pub fn new(store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Count one event of `actor_id` and compare against the guild's rule.
    /// Fails closed: an unreachable store never reports `Exceeded`.
    pub async fn check(&self, policy: &PolicyConfig, actor_id: u64, category: Category) -> ThresholdStatus {
        let Some(rule) = policy.active_rule(category) else {
            return ThresholdStatus::NotExceeded { count: None };
        };

        let key = CounterKey {
            guild_id: policy.guild_id,
            actor_id,
            category,
        };
        match bounded(self.timeout, self.store.incr_with_expiry(&key, rule.window())).await {
            Ok(count) if count >= rule.threshold as u64 => {
                tracing::debug!(%key, count, threshold = rule.threshold, "antinuke threshold reached");
                ThresholdStatus::Exceeded {
                    count,
                    threshold: rule.threshold,
                }
            }
            Ok(count) => ThresholdStatus::NotExceeded { count: Some(count) },
            Err(e) => {
                tracing::warn!(%key, error = %e, "counter store unavailable, failing closed");
                ThresholdStatus::NotExceeded { count: None }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::antinuke::policy::{ModuleRule, PunishmentKind};

    fn key(actor: u64) -> CounterKey {
        CounterKey {
            guild_id: 1,
            actor_id: actor,
            category: Category::Ban,
        }
    }

    fn policy(threshold: u32, window: u64) -> PolicyConfig {
        let mut p = PolicyConfig::disabled(1);
        p.enabled = true;
        p.modules.insert(
            Category::Ban,
            ModuleRule::new(threshold, Duration::from_secs(window), PunishmentKind::Ban),
        );
        p
    }

    struct SlowStore;

    #[async_trait]
    impl CounterStore for SlowStore {
        async fn incr_with_expiry(&self, _key: &CounterKey, _window: Duration) -> Result<u64> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(1_000)
        }
        async fn reset_guild(&self, _guild_id: u64) -> Result<u64> {
            Ok(0)
        }
        async fn prune_expired(&self) -> Result<u64> {
            Ok(0)
        }
    }

    #[test]
    fn key_format() {
        assert_eq!(key(9).to_string(), "antinuke_ban:1-9");
    }

    #[tokio::test(start_paused = true)]
    async fn window_starts_at_first_event() {
        let store = MemoryCounterStore::new();
        let w = Duration::from_secs(60);
        assert_eq!(store.incr_with_expiry(&key(1), w).await.unwrap(), 1);
        tokio::time::advance(Duration::from_secs(40)).await;
        assert_eq!(store.incr_with_expiry(&key(1), w).await.unwrap(), 2);
        // the second event does not extend the epoch
        tokio::time::advance(Duration::from_secs(21)).await;
        assert_eq!(store.incr_with_expiry(&key(1), w).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn prune_drops_only_expired() {
        let store = MemoryCounterStore::new();
        store.incr_with_expiry(&key(1), Duration::from_secs(10)).await.unwrap();
        store.incr_with_expiry(&key(2), Duration::from_secs(100)).await.unwrap();
        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.prune_expired().await.unwrap(), 1);
        assert!(store.current(&key(1)).is_none());
        assert_eq!(store.current(&key(2)), Some(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn prune_survives_concurrent_increments() {
        let store = Arc::new(MemoryCounterStore::new());
        let mut writers = Vec::new();
        for w in 0..3u64 {
            let store = store.clone();
            writers.push(tokio::spawn(async move {
                for i in 0..2_000u64 {
                    store
                        .incr_with_expiry(&key(w * 10_000 + i), Duration::from_nanos(1))
                        .await
                        .unwrap();
                }
            }));
        }
        let pruner = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut total = 0u64;
                for _ in 0..500 {
                    total += store.prune_expired().await.unwrap();
                    total += store.reset_guild(2).await.unwrap();
                    tokio::task::yield_now().await;
                }
                total
            })
        };
        for w in writers {
            w.await.unwrap();
        }
        let pruned = pruner.await.unwrap();
        assert!(pruned <= 6_000);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let rest = store.prune_expired().await.unwrap();
        assert_eq!(pruned + rest, 6_000);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn reset_guild_is_scoped() {
        let store = MemoryCounterStore::new();
        let w = Duration::from_secs(60);
        store.incr_with_expiry(&key(1), w).await.unwrap();
        let other = CounterKey { guild_id: 2, ..key(1) };
        store.incr_with_expiry(&other, w).await.unwrap();
        assert_eq!(store.reset_guild(1).await.unwrap(), 1);
        assert_eq!(store.current(&other), Some(1));
    }

    #[tokio::test]
    async fn tracker_reports_exceeded_at_threshold() {
        let store = Arc::new(MemoryCounterStore::new());
        let tracker = ThresholdTracker::new(store, Duration::from_secs(1));
        let p = policy(3, 60);
        assert_eq!(tracker.check(&p, 5, Category::Ban).await, ThresholdStatus::NotExceeded { count: Some(1) });
        assert_eq!(tracker.check(&p, 5, Category::Ban).await, ThresholdStatus::NotExceeded { count: Some(2) });
        assert_eq!(
            tracker.check(&p, 5, Category::Ban).await,
            ThresholdStatus::Exceeded { count: 3, threshold: 3 }
        );
    }

    #[tokio::test]
    async fn zero_threshold_never_touches_store() {
        let store = Arc::new(MemoryCounterStore::new());
        let tracker = ThresholdTracker::new(store.clone(), Duration::from_secs(1));
        let p = policy(0, 60);
        for _ in 0..10 {
            assert_eq!(tracker.check(&p, 5, Category::Ban).await, ThresholdStatus::NotExceeded { count: None });
        }
        assert!(store.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_fails_closed() {
        let tracker = ThresholdTracker::new(Arc::new(SlowStore), Duration::from_millis(200));
        let status = tracker.check(&policy(1, 60), 5, Category::Ban).await;
        assert_eq!(status, ThresholdStatus::NotExceeded { count: None });
    }
}
