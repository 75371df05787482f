// src/lib.rs

pub mod antinuke;
pub mod config;
pub mod db;
pub mod discord;
pub mod logging;

use anyhow::Result;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::sync::Arc;

use antinuke::{Antinuke, PgPunishmentLog};
use config::Settings;
use db::Db;

/// Globalny kontekst aplikacji.
/// Uchwyt do DB, konfiguracja i silnik antinuke (powstaje dopiero w `ready`,
/// bo potrzebuje id konta bota).
pub struct AppContext {
    pub settings: Settings,
    pub db: Db,
    antinuke: OnceCell<Arc<Antinuke>>,
}

impl AppContext {
    /// Bootstrap: logi, połączenie z DB + migracje.
    pub async fn bootstrap(settings: Settings) -> Result<Arc<Self>> {
        logging::init(&settings);

        let db = db::connect(
            &settings.database.url,
            settings.database.max_connections,
            settings.database.statement_timeout_ms,
        )
        .await?;
        db::migrate(&db).await?;

        Ok(Arc::new(Self {
            settings,
            db,
            antinuke: OnceCell::new(),
        }))
    }

    /// `None` until the gateway session is ready.
    pub fn antinuke(&self) -> Option<Arc<Antinuke>> {
        self.antinuke.get().cloned()
    }

    /// set() działa tylko raz; kolejne wywołania są ignorowane.
    pub fn set_antinuke(&self, engine: Arc<Antinuke>) {
        if self.antinuke.set(engine).is_err() {
            tracing::debug!("antinuke already initialized");
        }
    }
}

/// Start: opcjonalne API HTTP + klient Discorda.
pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    if let Some(bind) = ctx.settings.api.bind.as_deref() {
        let addr: SocketAddr = bind.parse()?;
        let log = Arc::new(PgPunishmentLog::new(ctx.db.clone()));
        tokio::spawn(async move {
            if let Err(e) = antinuke::api::serve(addr, log).await {
                tracing::error!(error = ?e, "antinuke api stopped");
            }
        });
    }

    discord::run_bot(ctx).await
}
