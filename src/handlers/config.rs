use actix_web::{web, HttpResponse};
use serde_json::json;

use crate::error::AppError;
use crate::state::AppState;

/// Effective configuration, secrets masked.
pub async fn get_config(state: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(HttpResponse::Ok().json(json!({
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "config": state.config.redacted(),
        "derived": {
            "chunk_bytes": state.config.chunk_bytes(),
            "block_bytes": state.config.block_bytes()
        }
    })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use actix_web::{test, App};

    #[actix_web::test]
    async fn test_config_view_masks_secrets() {
        let mut config = AppConfig::default();
        config.pool.workers = 1;
        config.telephony.auth_token = "twilio-secret".to_string();
        config.translation.client_secret = "palabra-secret".to_string();
        let state = web::Data::new(AppState::new(config).unwrap());

        let app = test::init_service(
            App::new()
                .app_data(state)
                .route("/api/v1/config", web::get().to(get_config)),
        )
        .await;
        let req = test::TestRequest::get().uri("/api/v1/config").to_request();
        let body: serde_json::Value = test::call_and_read_body_json(&app, req).await;

        let text = body.to_string();
        assert!(!text.contains("twilio-secret"));
        assert!(!text.contains("palabra-secret"));
        assert_eq!(body["derived"]["chunk_bytes"], 2560);
        assert_eq!(body["derived"]["block_bytes"], 960);
        assert_eq!(body["config"]["server"]["port"], 8080);
    }
}
