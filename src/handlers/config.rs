//! Runtime configuration API.
//!
//! Secrets are never returned. Updates are partial and validated as a whole; pipeline and
//! provider changes apply to sessions created afterwards.

use crate::{error::AppError, state::AppState};
use actix_web::{web, HttpResponse};
use serde_json::json;
use tracing::info;

pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    let config = state.get_config();

    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": config.redacted_json()
    })))
}

pub async fn update_config(
    state: web::Data<AppState>,
    body: web::Json<serde_json::Value>,
) -> Result<HttpResponse, AppError> {
    let json_str = serde_json::to_string(&body.into_inner())?;
    let updated = state.update_config(&json_str)?;
    info!("Configuration updated");

    Ok(HttpResponse::Ok().json(json!({
        "status": "success",
        "message": "Configuration updated successfully",
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "updated_config": updated.redacted_json()
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{http::StatusCode, test, App};

    fn app_state() -> web::Data<AppState> {
        let mut config = AppConfig::default();
        config.providers.openai.api_key = Some("sk-secret".into());
        web::Data::new(AppState::new(config))
    }

    #[actix_web::test]
    async fn test_get_config_redacts_key() {
        let app = test::init_service(
            App::new()
                .app_data(app_state())
                .route("/config", web::get().to(get_config)),
        )
        .await;

        let req = test::TestRequest::get().uri("/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(body["config"]["providers"]["openai"]["api_key"], "***");
    }

    #[actix_web::test]
    async fn test_invalid_update_rejected() {
        let state = app_state();
        let app = test::init_service(
            App::new()
                .app_data(state.clone())
                .route("/config", web::put().to(update_config)),
        )
        .await;

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"pipeline": {"energy_threshold": 3.0}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert_eq!(state.get_config().pipeline.energy_threshold, 0.05);

        let req = test::TestRequest::put()
            .uri("/config")
            .set_json(json!({"pipeline": {"voice_end_debounce_ms": 500}}))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert!(resp.status().is_success());
        assert_eq!(state.get_config().pipeline.voice_end_debounce_ms, 500);
    }
}
