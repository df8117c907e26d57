use actix_web::http::header::{self, HeaderValue};
use actix_web::{web, HttpRequest, HttpResponse, Responder};
use std::time::Duration;
use tracing::{error, warn};

use crate::relay::{CallRequest, RelayError};
use crate::util::{error_response, AppState};

pub fn config_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("")
            .app_data(json_config())
            .route("/status", web::get().to(status))
            .route("/callmodel", web::post().to(call_model))
            .route("/listmodels", web::get().to(list_models))
            .route("/analytics", web::get().to(analytics)),
    );
}

/// Malformed or incomplete bodies become `400 {"detail": ...}`.
fn json_config() -> web::JsonConfig {
    web::JsonConfig::default().error_handler(|err, _req: &HttpRequest| {
        let msg = format!("Invalid request body: {}", err);
        let resp = error_response(http::StatusCode::BAD_REQUEST, &msg);
        actix_web::error::InternalError::from_response(err, resp).into()
    })
}

/// Whole seconds, rounded up, never below one.
fn retry_after_secs(retry_after: Duration) -> u64 {
    let millis = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
    millis.div_ceil(1000).max(1)
}

/// Relay a prompt to the configured upstream model.
async fn call_model(state: web::Data<AppState>, payload: web::Json<CallRequest>) -> HttpResponse {
    let req = payload.into_inner();
    match state.relay.relay(&req).await {
        Ok(body) => HttpResponse::Ok().json(body),
        Err(e) => {
            let mut resp = error_response(e.status(), &e.to_string());
            match &e {
                RelayError::RateLimited { model, retry_after } => {
                    let secs = retry_after_secs(*retry_after);
                    warn!(model = %model, retry_after_secs = secs, "Rate limit exceeded");
                    resp.headers_mut()
                        .insert(header::RETRY_AFTER, HeaderValue::from(secs));
                }
                RelayError::NotFound { project, model } => {
                    warn!(project = %project, model = %model, "Model not found");
                }
                RelayError::Upstream(_) => {}
            }
            resp
        }
    }
}

/// The registry document exactly as loaded.
async fn list_models(state: web::Data<AppState>) -> impl Responder {
    HttpResponse::Ok().json(state.relay.registry().raw())
}

/// Usage counts and mean latency per model, recomputed from the success log.
async fn analytics(state: web::Data<AppState>) -> HttpResponse {
    let aggregator = state.analytics.clone();
    match web::block(move || aggregator.report()).await {
        Ok(Ok(report)) => HttpResponse::Ok().json(report),
        Ok(Err(e)) => {
            error!("Failed to read success log: {}", e);
            error_response(
                http::StatusCode::INTERNAL_SERVER_ERROR,
                &format!("Failed to compute analytics: {}", e),
            )
        }
        Err(e) => error_response(
            http::StatusCode::INTERNAL_SERVER_ERROR,
            &format!("Failed to compute analytics: {}", e),
        ),
    }
}

/// Service status: routes, registry shape and limiter counters.
async fn status(state: web::Data<AppState>) -> impl Responder {
    let routes = vec!["/status", "/callmodel", "/listmodels", "/analytics"];
    let log = state.relay.telemetry().log();
    let uptime = (chrono::Utc::now() - state.started_at).num_seconds().max(0);

    web::Json(serde_json::json!({
        "name": "modelrelay",
        "version": env!("CARGO_PKG_VERSION"),
        "routes": routes,
        "uptime_seconds": uptime,
        "registry": state.relay.registry().stats(),
        "rate_limiter": state.relay.limiter().stats(),
        "telemetry": {
            "collector": state.relay.telemetry().collector_name(),
            "success_log": log.success_stream().path().display().to_string(),
            "error_log": log.error_stream().path().display().to_string(),
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(900)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1000)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1001)), 2);
        assert_eq!(retry_after_secs(Duration::ZERO), 1);
        assert_eq!(retry_after_secs(Duration::MAX), u64::MAX / 1000 + 1);
    }
}
