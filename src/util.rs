use actix_web::HttpResponse;
use http::StatusCode;
use tracing_subscriber::{fmt, EnvFilter};

use crate::analytics::AnalyticsAggregator;
use crate::relay::Relay;

/// Load the environment file and install the tracing subscriber.
///
/// The env file is taken from ENV_FILE, ENVFILE or DOTENV_PATH when set,
/// then `.envfile`, then the usual `.env` discovery. Existing variables are
/// never overwritten. Filtering follows RUST_LOG (default `info`).
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }

    if env_source == "none"
        && std::path::Path::new(".envfile").is_file()
        && dotenvy::from_filename(".envfile").is_ok()
    {
        env_source = ".envfile".into();
    }

    if env_source == "none" && dotenvy::dotenv().is_ok() {
        env_source = ".env".into();
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| v.trim().to_ascii_lowercase())
        .map(|v| v == "1" || v == "true" || v == "yes" || v == "on")
        .unwrap_or(false)
}

/// Build the upstream HTTP client honoring proxy environment variables.
///
/// Environment:
/// - RELAY_NO_PROXY = 1|true|yes|on -> disable all proxies
/// - RELAY_PROXY_URL = <url>        -> proxy for all schemes
/// - HTTP_PROXY / HTTPS_PROXY       -> scheme proxies (reqwest defaults)
///
/// No client-wide timeout is set; each upstream call carries its own.
pub fn build_http_client_from_env() -> reqwest::Client {
    let mut builder = reqwest::Client::builder();

    if env_flag("RELAY_NO_PROXY") {
        builder = builder.no_proxy();
    } else if let Ok(url) = std::env::var("RELAY_PROXY_URL") {
        let u = url.trim();
        if !u.is_empty() {
            match reqwest::Proxy::all(u) {
                Ok(p) => builder = builder.proxy(p),
                Err(e) => tracing::warn!("Ignoring invalid RELAY_PROXY_URL: {}", e),
            }
        }
    }

    builder = builder.user_agent(format!("modelrelay/{}", env!("CARGO_PKG_VERSION")));

    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

/// Shared application state used by the HTTP server and handlers.
#[derive(Debug, Clone)]
pub struct AppState {
    pub relay: Relay,
    pub analytics: AnalyticsAggregator,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

impl AppState {
    /// Analytics read the same success stream the relay writes.
    pub fn new(relay: Relay) -> Self {
        let analytics =
            AnalyticsAggregator::new(relay.telemetry().log().success_stream().clone());
        Self {
            relay,
            analytics,
            started_at: chrono::Utc::now(),
        }
    }
}

/// Build a JSON error response `{"detail": msg}` with the given status.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "detail": msg });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    let s = raw.trim();
    if s == "*" {
        return None;
    }
    Some(
        s.split(',')
            .map(|p| p.trim().to_string())
            .filter(|p| !p.is_empty())
            .collect(),
    )
}

/// Build a CORS configuration from environment variables for Actix-web.
///
/// Environment variables:
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins
/// - CORS_ALLOWED_METHODS: "*" or comma-separated methods
/// - CORS_ALLOWED_HEADERS: "*" or comma-separated request header names
/// - CORS_ALLOW_CREDENTIALS: enable with 1,true,yes,on
/// - CORS_MAX_AGE: max age in seconds
///
/// Anything unset is permissive.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    match env_list("CORS_ALLOWED_ORIGINS") {
        Some(origins) => {
            for origin in &origins {
                cors = cors.allowed_origin(origin);
            }
        }
        None => cors = cors.allow_any_origin(),
    }

    match env_list("CORS_ALLOWED_METHODS") {
        Some(methods) if !methods.is_empty() => {
            cors = cors.allowed_methods(methods.iter().map(String::as_str));
        }
        _ => cors = cors.allow_any_method(),
    }

    match env_list("CORS_ALLOWED_HEADERS") {
        Some(headers) if !headers.is_empty() => {
            for h in &headers {
                cors = cors.allowed_header(h.as_str());
            }
        }
        _ => cors = cors.allow_any_header(),
    }

    if env_flag("CORS_ALLOW_CREDENTIALS") {
        cors = cors.supports_credentials();
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::body::MessageBody;

    #[test]
    fn error_response_uses_detail_body() {
        let resp = error_response(StatusCode::NOT_FOUND, "Model not found");
        assert_eq!(resp.status().as_u16(), 404);
        let bytes = resp.into_body().try_into_bytes().unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body, serde_json::json!({"detail": "Model not found"}));
    }
}
