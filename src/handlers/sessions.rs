//! Session management API: list live sessions, inspect one, or force-close it.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;

pub async fn list_sessions(state: web::Data<AppState>) -> HttpResponse {
    let sessions = state.sessions.list();

    HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "count": sessions.len(),
        "sessions": sessions
    }))
}

pub async fn get_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    let session = state
        .sessions
        .get(&id)
        .ok_or_else(|| AppError::NotFound(format!("Session '{}' not found", id)))?;

    Ok(HttpResponse::Ok().json(session.info()))
}

/// Shut a session's pipeline down. The WebSocket closes once its outbound queue ends.
pub async fn close_session(
    state: web::Data<AppState>,
    path: web::Path<String>,
) -> Result<HttpResponse, AppError> {
    let id = path.into_inner();
    if !state.sessions.remove(&id) {
        return Err(AppError::NotFound(format!("Session '{}' not found", id)));
    }
    state.record_session_closed();

    Ok(HttpResponse::Ok().json(json!({
        "status": "closed",
        "session_id": id
    })))
}
