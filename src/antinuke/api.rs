use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::get,
};
use serde::Deserialize;

use super::executor::PunishmentRecord;
use super::notify::PunishmentLog;

const MAX_LIMIT: usize = 200;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub limit: Option<usize>,
}

/// Healthcheck and read-only punishment history.
pub fn router(log: Arc<dyn PunishmentLog>) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/guilds/{guild_id}/punishments", get(list_punishments))
        .with_state(log)
}

async fn list_punishments(
    State(log): State<Arc<dyn PunishmentLog>>,
    Path(guild_id): Path<u64>,
    Query(params): Query<ListParams>,
) -> Result<Json<Vec<PunishmentRecord>>, (StatusCode, String)> {
    let limit = params.limit.unwrap_or(50).min(MAX_LIMIT);
    log.recent(guild_id, limit).await.map(Json).map_err(|e| {
        tracing::error!(%guild_id, error = ?e, "listing punishments failed");
        (StatusCode::INTERNAL_SERVER_ERROR, "storage error".to_string())
    })
}

/// Start HTTP server exposing the router.
pub async fn serve(addr: SocketAddr, log: Arc<dyn PunishmentLog>) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "antinuke api listening");
    axum::serve(listener, router(log)).await?;
    Ok(())
}
