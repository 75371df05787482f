// src/discord/mod.rs
use std::sync::Arc;

use anyhow::Result;
use serenity::all::*;
use serenity::async_trait;

use crate::AppContext;
use crate::antinuke::event::{Category, RawAuditEntry, describe_action};
use crate::antinuke::executor::PunishmentRecord;
use crate::antinuke::platform::{
    HierarchyView, MemberView, ModerationSurface, Platform, PlatformError, PlatformResult, RoleView,
};
use crate::antinuke::{Antinuke, AntinukeParts};

pub struct Handler {
    pub app: Arc<AppContext>,
}

#[async_trait]
impl EventHandler for Handler {
    async fn ready(&self, ctx: Context, ready: Ready) {
        tracing::info!("Logged in as {}", ready.user.name);

        // Przy reconnect dostajemy ready ponownie; silnik budujemy raz.
        if self.app.antinuke().is_some() {
            return;
        }
        let platform = Arc::new(SerenityPlatform::new(ctx.http.clone(), ready.user.id.get()));
        let parts = AntinukeParts::postgres(
            self.app.db.clone(),
            self.app.settings.antinuke.counter_backend,
            platform.clone(),
            platform,
        );
        let engine = Antinuke::new(&self.app.settings.antinuke, ready.user.id.get(), parts);
        self.app.set_antinuke(engine);
    }

    async fn guild_create(&self, _ctx: Context, guild: Guild, _is_new: Option<bool>) {
        self.track_owner(guild.id, guild.owner_id).await;
    }

    async fn guild_update(&self, _ctx: Context, _old: Option<Guild>, new_data: PartialGuild) {
        self.track_owner(new_data.id, new_data.owner_id).await;
    }

    async fn guild_audit_log_entry_create(&self, _ctx: Context, entry: AuditLogEntry, guild_id: GuildId) {
        let Some(engine) = self.app.antinuke() else {
            tracing::debug!(gid = %guild_id.get(), "audit entry before ready, dropped");
            return;
        };
        engine.dispatch(RawAuditEntry {
            entry_id: entry.id.get(),
            guild_id: guild_id.get(),
            action_type: entry.action.num(),
            user_id: Some(entry.user_id.get()),
            target_id: entry.target_id.map(|t| t.get()),
            reason: entry.reason,
        });
    }
}

impl Handler {
    async fn track_owner(&self, guild_id: GuildId, owner_id: UserId) {
        let Some(engine) = self.app.antinuke() else { return };
        let policies = engine.policies();
        // Zapis tylko przy zmianie; guild_create leci dla każdej gildii przy starcie.
        if let Ok(p) = policies.get(guild_id.get()).await {
            if p.owner_id == Some(owner_id.get()) {
                return;
            }
        }
        match policies.set_owner(guild_id.get(), owner_id.get()).await {
            Ok(true) => tracing::debug!(gid = %guild_id.get(), owner = %owner_id.get(), "owner refreshed"),
            Ok(false) => {}
            Err(e) => tracing::warn!(error = ?e, gid = %guild_id.get(), "owner refresh failed"),
        }
    }
}

/* ============================================================
   Platform / moderation surface na serenity
   ============================================================ */

pub struct SerenityPlatform {
    http: Arc<Http>,
    service_id: u64,
}

impl SerenityPlatform {
    pub fn new(http: Arc<Http>, service_id: u64) -> Self {
        Self { http, service_id }
    }
}

fn platform_error(e: serenity::Error) -> PlatformError {
    if let serenity::Error::Http(http) = &e {
        match http.status_code().map(|s| s.as_u16()) {
            Some(403) => return PlatformError::Forbidden,
            Some(404) => return PlatformError::NotFound,
            Some(429) => return PlatformError::RateLimited,
            _ => {}
        }
    }
    PlatformError::Other(e.to_string())
}

fn role_views(member: &Member, roles: &std::collections::HashMap<RoleId, Role>) -> Vec<RoleView> {
    member
        .roles
        .iter()
        .filter_map(|id| roles.get(id))
        .map(|r| RoleView {
            id: r.id.get(),
            position: i64::from(r.position),
            managed: r.managed,
        })
        .collect()
}

#[async_trait]
impl Platform for SerenityPlatform {
    async fn hierarchy(&self, guild_id: u64, user_id: u64) -> PlatformResult<HierarchyView> {
        let gid = GuildId::new(guild_id);
        let guild = gid.to_partial_guild(&self.http).await.map_err(platform_error)?;

        let me = gid
            .member(&self.http, UserId::new(self.service_id))
            .await
            .map_err(platform_error)?;
        let service_top = role_views(&me, &guild.roles)
            .iter()
            .map(|r| r.position)
            .max()
            .unwrap_or(0);

        let member = match gid.member(&self.http, UserId::new(user_id)).await {
            Ok(m) => Some(MemberView {
                user_id,
                is_bot: m.user.bot,
                roles: role_views(&m, &guild.roles),
            }),
            Err(e) => match platform_error(e) {
                PlatformError::NotFound => None,
                other => return Err(other),
            },
        };

        Ok(HierarchyView {
            owner_id: guild.owner_id.get(),
            service_top,
            member,
        })
    }

    async fn ban(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()> {
        GuildId::new(guild_id)
            .ban_with_reason(&self.http, UserId::new(user_id), 0, reason)
            .await
            .map_err(platform_error)
    }

    async fn kick(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()> {
        GuildId::new(guild_id)
            .kick_with_reason(&self.http, UserId::new(user_id), reason)
            .await
            .map_err(platform_error)
    }

    async fn strip_roles(&self, guild_id: u64, user_id: u64, keep: &[u64], reason: &str) -> PlatformResult<()> {
        let builder = EditMember::new()
            .roles(keep.iter().copied().map(RoleId::new))
            .audit_log_reason(reason);
        GuildId::new(guild_id)
            .edit_member(&self.http, UserId::new(user_id), builder)
            .await
            .map(|_| ())
            .map_err(platform_error)
    }

    async fn unban(&self, guild_id: u64, user_id: u64, reason: &str) -> PlatformResult<()> {
        self.http
            .remove_ban(GuildId::new(guild_id), UserId::new(user_id), Some(reason))
            .await
            .map_err(platform_error)
    }

    async fn delete_webhook(&self, webhook_id: u64, reason: &str) -> PlatformResult<()> {
        self.http
            .delete_webhook(WebhookId::new(webhook_id), Some(reason))
            .await
            .map_err(platform_error)
    }
}

fn record_embed(record: &PunishmentRecord) -> CreateEmbed {
    let colour = if record.success {
        Colour::new(0xE74C3C)
    } else {
        Colour::new(0x95A5A6)
    };
    let status = match &record.failure_reason {
        None => "applied".to_string(),
        Some(r) => format!("failed: `{r}`"),
    };
    let mut e = CreateEmbed::new()
        .title(format!("🛡️ Antinuke: {}", describe_action(record.category, record.verb)))
        .colour(colour)
        .field("Offender", format!("<@{}> (`{}`)", record.actor_id, record.actor_id), true)
        .field("Punishment", format!("`{}`", record.punishment), true)
        .field("Status", status, true)
        .field("Latency", format!("{} ms", record.elapsed_ms), true)
        .timestamp(Timestamp::from_unix_timestamp(record.created_at.timestamp()).unwrap_or_else(|_| Timestamp::now()));
    if let Some(t) = record.target {
        e = e.field("Target", format!("{} `{}`", t.kind.as_str(), t.id), true);
    }
    if record.category == Category::BotAdd {
        e = e.footer(CreateEmbedFooter::new("Added bots are removed automatically"));
    }
    e
}

#[async_trait]
impl ModerationSurface for SerenityPlatform {
    async fn log_action(&self, _guild_id: u64, channel_id: u64, record: &PunishmentRecord) -> PlatformResult<()> {
        ChannelId::new(channel_id)
            .send_message(&self.http, CreateMessage::new().embed(record_embed(record)))
            .await
            .map(|_| ())
            .map_err(platform_error)
    }

    async fn direct_notify(&self, user_id: u64, message: &str) -> PlatformResult<()> {
        let dm = UserId::new(user_id)
            .create_dm_channel(&self.http)
            .await
            .map_err(platform_error)?;
        dm.send_message(&self.http, CreateMessage::new().content(message))
            .await
            .map(|_| ())
            .map_err(platform_error)
    }
}

/* ============================================================
   Klient
   ============================================================ */

fn intents_from_settings(names: &[String]) -> GatewayIntents {
    let mut i = GatewayIntents::empty();
    for n in names {
        match n.as_str() {
            "GUILDS" => i |= GatewayIntents::GUILDS,
            "GUILD_MEMBERS" => i |= GatewayIntents::GUILD_MEMBERS,
            "GUILD_MODERATION" => i |= GatewayIntents::GUILD_MODERATION,
            "GUILD_WEBHOOKS" => i |= GatewayIntents::GUILD_WEBHOOKS,
            "GUILD_EMOJIS_AND_STICKERS" => i |= GatewayIntents::GUILD_EMOJIS_AND_STICKERS,
            other => tracing::warn!(intent = other, "unknown gateway intent in config, ignored"),
        }
    }
    // Bez tego nie ma GUILD_AUDIT_LOG_ENTRY_CREATE.
    i | GatewayIntents::GUILD_MODERATION
}

pub async fn run_bot(ctx: Arc<AppContext>) -> Result<()> {
    let token = &ctx.settings.discord.token;
    if token.is_empty() {
        anyhow::bail!("Brak tokenu Discord (TSS_DISCORD__TOKEN). Uzupełnij w .env.");
    }

    let intents = intents_from_settings(&ctx.settings.discord.intents);
    let handler = Handler { app: ctx.clone() };

    let mut client = serenity::Client::builder(token, intents)
        .event_handler(handler)
        .await?;

    let shard_manager = client.shard_manager.clone();
    let app = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            return;
        }
        tracing::info!("ctrl-c received, draining antinuke");
        if let Some(engine) = app.antinuke() {
            engine.shutdown().await;
        }
        shard_manager.shutdown_all().await;
    });

    tracing::info!("Discord client starting…");
    client.start().await?;
    Ok(())
}
