use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Executor, Pool, Postgres, Row, postgres::PgPoolOptions};

use crate::antinuke::event::{Category, TargetKind, TargetRef, Verb};
use crate::antinuke::executor::PunishmentRecord;
use crate::antinuke::policy::{ModuleRule, PolicyConfig, PunishmentKind};

pub type Db = Pool<Postgres>;

pub async fn connect(url: &str, max: Option<u32>, statement_timeout_ms: Option<u64>) -> Result<Db> {
    let pool = PgPoolOptions::new()
        .max_connections(max.unwrap_or(10))
        .after_connect(move |conn, _meta| {
            Box::pin(async move {
                if let Some(ms) = statement_timeout_ms {
                    let sql = format!("SET statement_timeout = {ms}");
                    conn.execute(sql.as_str()).await?;
                }
                Ok(())
            })
        })
        .connect(url)
        .await?;

    Ok(pool)
}

pub async fn migrate(pool: &Db) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/* ==============================
   Polityka antinuke
   ============================== */

/// Per-guild id lists stored in their own tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberList {
    Whitelist,
    Trusted,
}

impl MemberList {
    fn table(self) -> &'static str {
        match self {
            MemberList::Whitelist => "tss.antinuke_whitelist",
            MemberList::Trusted => "tss.antinuke_trusted",
        }
    }
}

/// Whole policy of a guild; `None` if it was never configured.
pub async fn load_policy(db: &Db, guild_id: u64) -> Result<Option<PolicyConfig>> {
    let gid = guild_id as i64;
    let Some(row) = sqlx::query(
        "SELECT enabled, owner_id, punishment, log_channel_id FROM tss.antinuke_settings WHERE guild_id = $1",
    )
    .bind(gid)
    .fetch_optional(db)
    .await?
    else {
        return Ok(None);
    };

    let punishment: String = row.try_get("punishment")?;
    let mut policy = PolicyConfig {
        guild_id,
        enabled: row.try_get("enabled")?,
        owner_id: row.try_get::<Option<i64>, _>("owner_id")?.map(|v| v as u64),
        modules: BTreeMap::new(),
        whitelist: HashSet::new(),
        trusted_admins: HashSet::new(),
        punishment_default: punishment.parse()?,
        log_channel: row.try_get::<Option<i64>, _>("log_channel_id")?.map(|v| v as u64),
    };

    let rows = sqlx::query(
        "SELECT category, threshold, window_secs, punishment FROM tss.antinuke_modules WHERE guild_id = $1",
    )
    .bind(gid)
    .fetch_all(db)
    .await?;
    for r in rows {
        let name: String = r.try_get("category")?;
        let Ok(category) = name.parse::<Category>() else {
            tracing::warn!(%guild_id, category = %name, "unknown antinuke module in db, skipping");
            continue;
        };
        let punishment = r
            .try_get::<Option<String>, _>("punishment")?
            .map(|p| p.parse::<PunishmentKind>())
            .transpose()?;
        let rule = ModuleRule {
            threshold: r.try_get::<i32, _>("threshold")?.max(0) as u32,
            window_secs: r.try_get::<i64, _>("window_secs")?.max(1) as u64,
            punishment,
        };
        policy.modules.insert(category, rule);
    }

    policy.whitelist = list_members(db, MemberList::Whitelist, gid).await?;
    policy.trusted_admins = list_members(db, MemberList::Trusted, gid).await?;
    Ok(Some(policy))
}

async fn list_members(db: &Db, list: MemberList, gid: i64) -> Result<HashSet<u64>> {
    let sql = format!("SELECT user_id FROM {} WHERE guild_id = $1", list.table());
    let rows: Vec<(i64,)> = sqlx::query_as(&sql).bind(gid).fetch_all(db).await?;
    Ok(rows.into_iter().map(|(id,)| id as u64).collect())
}

async fn ensure_settings<'e, E>(exec: E, gid: i64) -> Result<()>
where
    E: Executor<'e, Database = Postgres>,
{
    sqlx::query("INSERT INTO tss.antinuke_settings (guild_id) VALUES ($1) ON CONFLICT DO NOTHING")
        .bind(gid)
        .execute(exec)
        .await?;
    Ok(())
}

pub async fn set_policy_enabled(db: &Db, guild_id: u64, enabled: bool) -> Result<()> {
    sqlx::query(
        "INSERT INTO tss.antinuke_settings (guild_id, enabled) VALUES ($1, $2)
         ON CONFLICT (guild_id) DO UPDATE SET enabled = EXCLUDED.enabled, updated_at = now()",
    )
    .bind(guild_id as i64)
    .bind(enabled)
    .execute(db)
    .await?;
    Ok(())
}

/// Tylko UPDATE: odświeżenie właściciela nie zakłada wiersza dla gildii bez konfiguracji.
pub async fn set_policy_owner(db: &Db, guild_id: u64, owner_id: u64) -> Result<bool> {
    let res = sqlx::query(
        "UPDATE tss.antinuke_settings SET owner_id = $2, updated_at = now() WHERE guild_id = $1",
    )
    .bind(guild_id as i64)
    .bind(owner_id as i64)
    .execute(db)
    .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn set_policy_punishment(db: &Db, guild_id: u64, kind: PunishmentKind) -> Result<()> {
    sqlx::query(
        "INSERT INTO tss.antinuke_settings (guild_id, punishment) VALUES ($1, $2)
         ON CONFLICT (guild_id) DO UPDATE SET punishment = EXCLUDED.punishment, updated_at = now()",
    )
    .bind(guild_id as i64)
    .bind(kind.as_str())
    .execute(db)
    .await?;
    Ok(())
}

pub async fn set_policy_log_channel(db: &Db, guild_id: u64, channel_id: Option<u64>) -> Result<()> {
    sqlx::query(
        "INSERT INTO tss.antinuke_settings (guild_id, log_channel_id) VALUES ($1, $2)
         ON CONFLICT (guild_id) DO UPDATE SET log_channel_id = EXCLUDED.log_channel_id, updated_at = now()",
    )
    .bind(guild_id as i64)
    .bind(channel_id.map(|v| v as i64))
    .execute(db)
    .await?;
    Ok(())
}

pub async fn upsert_module(db: &Db, guild_id: u64, category: Category, rule: &ModuleRule) -> Result<()> {
    let gid = guild_id as i64;
    let mut tx = db.begin().await?;
    ensure_settings(&mut *tx, gid).await?;
    sqlx::query(
        "INSERT INTO tss.antinuke_modules (guild_id, category, threshold, window_secs, punishment)
         VALUES ($1, $2, $3, $4, $5)
         ON CONFLICT (guild_id, category) DO UPDATE
         SET threshold = EXCLUDED.threshold,
             window_secs = EXCLUDED.window_secs,
             punishment = EXCLUDED.punishment",
    )
    .bind(gid)
    .bind(category.as_str())
    .bind(rule.threshold.min(i32::MAX as u32) as i32)
    .bind(rule.window_secs.min(i64::MAX as u64) as i64)
    .bind(rule.punishment.map(PunishmentKind::as_str))
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;
    Ok(())
}

pub async fn delete_module(db: &Db, guild_id: u64, category: Category) -> Result<bool> {
    let res = sqlx::query("DELETE FROM tss.antinuke_modules WHERE guild_id = $1 AND category = $2")
        .bind(guild_id as i64)
        .bind(category.as_str())
        .execute(db)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn member_list_add(db: &Db, list: MemberList, guild_id: u64, user_id: u64) -> Result<bool> {
    let gid = guild_id as i64;
    let sql = format!(
        "INSERT INTO {} (guild_id, user_id) VALUES ($1, $2) ON CONFLICT DO NOTHING",
        list.table()
    );
    let mut tx = db.begin().await?;
    ensure_settings(&mut *tx, gid).await?;
    let res = sqlx::query(&sql)
        .bind(gid)
        .bind(user_id as i64)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(res.rows_affected() > 0)
}

pub async fn member_list_remove(db: &Db, list: MemberList, guild_id: u64, user_id: u64) -> Result<bool> {
    let sql = format!("DELETE FROM {} WHERE guild_id = $1 AND user_id = $2", list.table());
    let res = sqlx::query(&sql)
        .bind(guild_id as i64)
        .bind(user_id as i64)
        .execute(db)
        .await?;
    Ok(res.rows_affected() > 0)
}

/// Modules and both id lists go with it (ON DELETE CASCADE).
pub async fn reset_policy(db: &Db, guild_id: u64) -> Result<()> {
    sqlx::query("DELETE FROM tss.antinuke_settings WHERE guild_id = $1")
        .bind(guild_id as i64)
        .execute(db)
        .await?;
    Ok(())
}

/* ==============================
   Liczniki
   ============================== */

/// Increment and return the counter. A missing or expired row starts a new
/// epoch with value 1 and `expires_at = now() + window`; otherwise the expiry
/// is left alone. One statement, so concurrent callers never lose an update.
pub async fn counter_incr(
    db: &Db,
    guild_id: u64,
    actor_id: u64,
    category: Category,
    window: Duration,
) -> Result<i64> {
    let (value,): (i64,) = sqlx::query_as(
        "INSERT INTO tss.antinuke_counters AS c (guild_id, actor_id, category, value, expires_at)
         VALUES ($1, $2, $3, 1, now() + make_interval(secs => $4))
         ON CONFLICT (guild_id, actor_id, category) DO UPDATE
         SET value = CASE WHEN c.expires_at <= now() THEN 1 ELSE c.value + 1 END,
             expires_at = CASE WHEN c.expires_at <= now() THEN EXCLUDED.expires_at ELSE c.expires_at END
         RETURNING value",
    )
    .bind(guild_id as i64)
    .bind(actor_id as i64)
    .bind(category.as_str())
    .bind(window.as_secs_f64())
    .fetch_one(db)
    .await?;
    Ok(value)
}

pub async fn counters_reset_guild(db: &Db, guild_id: u64) -> Result<u64> {
    let res = sqlx::query("DELETE FROM tss.antinuke_counters WHERE guild_id = $1")
        .bind(guild_id as i64)
        .execute(db)
        .await?;
    Ok(res.rows_affected())
}

pub async fn counters_prune(db: &Db) -> Result<u64> {
    let res = sqlx::query("DELETE FROM tss.antinuke_counters WHERE expires_at <= now()")
        .execute(db)
        .await?;
    Ok(res.rows_affected())
}

/* ==============================
   Rejestr kar
   ============================== */

pub async fn insert_punishment(db: &Db, rec: &PunishmentRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO tss.antinuke_punishments
           (guild_id, actor_id, category, verb, punishment, success, failure_reason,
            target_kind, target_id, elapsed_ms, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)",
    )
    .bind(rec.guild_id as i64)
    .bind(rec.actor_id as i64)
    .bind(rec.category.as_str())
    .bind(rec.verb.map(Verb::as_str))
    .bind(rec.punishment.as_str())
    .bind(rec.success)
    .bind(rec.failure_reason.as_deref())
    .bind(rec.target.map(|t| t.kind.as_str()))
    .bind(rec.target.map(|t| t.id as i64))
    .bind(rec.elapsed_ms)
    .bind(rec.created_at)
    .execute(db)
    .await?;
    Ok(())
}

/// Newest first.
pub async fn list_punishments(db: &Db, guild_id: u64, limit: i64) -> Result<Vec<PunishmentRecord>> {
    let rows = sqlx::query(
        "SELECT actor_id, category, verb, punishment, success, failure_reason,
                target_kind, target_id, elapsed_ms, created_at
         FROM tss.antinuke_punishments
         WHERE guild_id = $1
         ORDER BY created_at DESC, id DESC
         LIMIT $2",
    )
    .bind(guild_id as i64)
    .bind(limit.max(0))
    .fetch_all(db)
    .await?;

    let mut out = Vec::with_capacity(rows.len());
    for r in rows {
        let category: String = r.try_get("category")?;
        let punishment: String = r.try_get("punishment")?;
        let verb = r
            .try_get::<Option<String>, _>("verb")?
            .map(|v| v.parse::<Verb>())
            .transpose()?;
        let target_kind: Option<String> = r.try_get("target_kind")?;
        let target_id: Option<i64> = r.try_get("target_id")?;
        let target = match (target_kind, target_id) {
            (Some(kind), Some(id)) => Some(TargetRef {
                kind: kind.parse::<TargetKind>()?,
                id: id as u64,
            }),
            _ => None,
        };
        let created_at: DateTime<Utc> = r.try_get("created_at")?;
        out.push(PunishmentRecord {
            guild_id,
            actor_id: r.try_get::<i64, _>("actor_id")? as u64,
            category: category.parse()?,
            verb,
            punishment: punishment.parse()?,
            success: r.try_get("success")?,
            failure_reason: r.try_get("failure_reason")?,
            target,
            elapsed_ms: r.try_get("elapsed_ms")?,
            created_at,
        });
    }
    Ok(out)
}
