//! Operator endpoints over the room monitor.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn translation_status(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(state.monitor.system_status())
}

pub async fn room_status(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let room_id = path.into_inner();
    let status = state
        .monitor
        .room_status(&room_id)
        .ok_or_else(|| AppError::NotFound(format!("room {} not found", room_id)))?;
    Ok(HttpResponse::Ok().json(status))
}

/// Force-close a room's translation: clients are disconnected and the
/// backend session ends. The room accepts new joins afterwards.
pub async fn close_translation(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let room_id = path.into_inner();
    if !state.registry.force_close(&room_id) {
        return Err(AppError::NotFound(format!("room {} not found", room_id)));
    }
    info!(room_id = %room_id, "translation force-closed by operator");

    Ok(HttpResponse::Ok().json(json!({
        "success": true,
        "room_id": room_id,
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "message": "Translation connection closed"
    })))
}
