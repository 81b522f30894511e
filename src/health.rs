//! Thin operational HTTP surface: `/health` (liveness) and `/status`
//! (the same counters the periodic status report logs, readable on
//! demand). This service has no client-submitted-transaction surface,
//! so there is no `/submit`, `/batch/:id`, or ECIES/auth/rate-limit
//! middleware (see DESIGN.md).

use std::sync::Arc;

use axum::extract::State;
use axum::response::IntoResponse;
use axum::Json;
use serde_json::json;

use crate::error::AppError;
use crate::relayer::Relayer;
use crate::store::DurableStore;

pub struct HealthState<S: DurableStore> {
    pub relayer: Arc<Relayer<S>>,
}

pub async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "bridge-relay",
    }))
}

pub async fn status<S: DurableStore>(
    State(state): State<Arc<HealthState<S>>>,
) -> Result<impl IntoResponse, AppError> {
    let bridge_state = state
        .relayer
        .get_bridge_state()
        .await
        .map_err(|e| AppError::Unavailable(e.to_string()))?;

    let most_recent_mirror_tx_hash = bridge_state
        .processed_deposits
        .iter()
        .max_by_key(|p| p.processed_at)
        .map(|p| p.mirror_tx_hash.clone());

    Ok(Json(json!({
        "processed_deposits": bridge_state.processed_deposits.len(),
        "pending_mirrors": bridge_state.pending_mirrors.len(),
        "most_recent_mirror_tx_hash": most_recent_mirror_tx_hash,
        "watermark": {
            "last_processed_slot": bridge_state.watermark.last_processed_slot,
            "last_processed_block_hash": bridge_state.watermark.last_processed_block_hash,
        },
    })))
}
