//! Relay Dispatcher
//!
//! `lookup -> admit -> render -> POST -> record`. Lookup misses and rate
//! denials return before anything is written anywhere; every failure after
//! admission is written to the error log and surfaced as
//! [`RelayError::Upstream`].

use crate::model_registry::{ModelConfig, ModelRegistry};
use crate::rate_limiter::{Admission, RateLimiter};
use crate::telemetry::{GenerationRecord, ModelParameters, TelemetrySink, Usage};
use crate::template::{self, RenderedRequest};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{error, info, warn};

pub const DEFAULT_TEMPERATURE: f64 = 0.9;
pub const DEFAULT_MAX_TOKENS: &str = "1000";
pub const DEFAULT_UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful assistant.";

/// An incoming "run this model" request.
#[derive(Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRequest {
    #[serde(alias = "project_name")]
    pub project_name: String,
    #[serde(alias = "model_name")]
    pub model_name: String,
    pub prompt: String,
    #[serde(alias = "api_token")]
    pub api_token: String,
}

impl std::fmt::Debug for CallRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallRequest")
            .field("project_name", &self.project_name)
            .field("model_name", &self.model_name)
            .field("prompt_chars", &self.prompt.chars().count())
            .field("api_token", &"<redacted>")
            .finish()
    }
}

/// Relay error types
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Model not found")]
    NotFound { project: String, model: String },

    #[error("Rate limit exceeded")]
    RateLimited { model: String, retry_after: Duration },

    #[error("{0}")]
    Upstream(String),
}

impl RelayError {
    pub fn status(&self) -> http::StatusCode {
        match self {
            RelayError::NotFound { .. } => http::StatusCode::NOT_FOUND,
            RelayError::RateLimited { .. } => http::StatusCode::TOO_MANY_REQUESTS,
            RelayError::Upstream(_) => http::StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// What came back from one upstream POST.
#[derive(Debug, Clone)]
pub struct UpstreamExchange {
    pub rendered: RenderedRequest,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub status: u16,
    pub text: String,
    pub body: Value,
}

/// Forwards calls to configured upstream models.
#[derive(Debug, Clone)]
pub struct Relay {
    registry: Arc<ModelRegistry>,
    limiter: Arc<RateLimiter>,
    telemetry: TelemetrySink,
    http: reqwest::Client,
    default_timeout: Duration,
}

impl Relay {
    pub fn new(registry: Arc<ModelRegistry>, telemetry: TelemetrySink, http: reqwest::Client) -> Self {
        Self {
            registry,
            limiter: Arc::new(RateLimiter::new()),
            telemetry,
            http,
            default_timeout: DEFAULT_UPSTREAM_TIMEOUT,
        }
    }

    /// Timeout applied when a model sets no `timeoutSeconds`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn telemetry(&self) -> &TelemetrySink {
        &self.telemetry
    }

    /// Relay one call and return the upstream's decoded JSON body.
    pub async fn relay(&self, req: &CallRequest) -> Result<Value, RelayError> {
        let config = self
            .registry
            .lookup(&req.project_name, &req.model_name)
            .ok_or_else(|| RelayError::NotFound {
                project: req.project_name.clone(),
                model: req.model_name.clone(),
            })?;

        if let Admission::Denied { retry_after } =
            self.limiter
                .admit(&req.model_name, config.min_interval(), Instant::now())
        {
            return Err(RelayError::RateLimited {
                model: req.model_name.clone(),
                retry_after,
            });
        }

        match self.dispatch(config, req).await {
            Ok(exchange) => {
                let record = generation_record(req, config, &exchange);
                info!(
                    project = %req.project_name,
                    model = %req.model_name,
                    status = exchange.status,
                    duration_ms = u64::try_from(record.duration().as_millis()).unwrap_or(u64::MAX),
                    "Relayed call"
                );
                self.telemetry.record_success(record);
                Ok(exchange.body)
            }
            Err(message) => {
                error!(
                    project = %req.project_name,
                    model = %req.model_name,
                    "Relay failed: {}",
                    message
                );
                self.telemetry.record_failure(&req.model_name, &message);
                Err(RelayError::Upstream(message))
            }
        }
    }

    /// Render the templates and POST them upstream, timing exactly the HTTP exchange.
    async fn dispatch(
        &self,
        config: &ModelConfig,
        req: &CallRequest,
    ) -> Result<UpstreamExchange, String> {
        let template = config.template().map_err(|e| e.to_string())?;
        let rendered = template::render(template, &req.api_token, &req.prompt);
        let timeout = config.timeout().unwrap_or(self.default_timeout);

        let mut builder = self
            .http
            .post(&config.endpoint)
            .timeout(timeout)
            .json(&rendered.params);
        for (name, value) in &rendered.headers {
            let name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| format!("invalid header name {:?}: {}", name, e))?;
            let value = reqwest::header::HeaderValue::from_str(value)
                .map_err(|e| format!("invalid value for header {}: {}", name, e))?;
            builder = builder.header(name, value);
        }

        let started_at = Utc::now();
        let response = builder
            .send()
            .await
            .map_err(|e| transport_error(&e, timeout))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| transport_error(&e, timeout))?;
        let finished_at = Utc::now();

        let body: Value = serde_json::from_str(&text).map_err(|e| {
            format!(
                "upstream returned a non-JSON body (status {}): {}",
                status.as_u16(),
                e
            )
        })?;
        if !status.is_success() {
            warn!(
                model = %req.model_name,
                status = status.as_u16(),
                "Upstream returned an error status with a JSON body; relaying as-is"
            );
        }

        Ok(UpstreamExchange {
            rendered,
            started_at,
            finished_at,
            status: status.as_u16(),
            text,
            body,
        })
    }
}

fn transport_error(e: &reqwest::Error, timeout: Duration) -> String {
    if e.is_timeout() {
        format!("upstream request timed out after {}s", timeout.as_secs_f64())
    } else {
        e.to_string()
    }
}

/// Build the telemetry record for a successful exchange.
pub fn generation_record(
    req: &CallRequest,
    config: &ModelConfig,
    exchange: &UpstreamExchange,
) -> GenerationRecord {
    let params = &exchange.rendered.params;

    let mut metadata = Map::new();
    metadata.insert("interface".to_string(), Value::from("api"));
    metadata.insert("project".to_string(), Value::from(req.project_name.clone()));
    metadata.insert("upstreamStatus".to_string(), Value::from(exchange.status));

    GenerationRecord {
        name: format!("{}-generation", req.model_name),
        model_name: req.model_name.clone(),
        project_name: req.project_name.clone(),
        start_time: exchange.started_at,
        end_time: exchange.finished_at,
        model_parameters: ModelParameters {
            max_tokens: max_tokens_param(params),
            temperature: config.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        },
        prompt_structure: prompt_structure(params, &req.prompt),
        completion_text: exchange.text.clone(),
        usage: Usage::from_texts(&req.prompt, &exchange.text),
        metadata,
    }
}

/// `max_tokens`, else `max_tokens_to_sample`, else the default, as a string.
fn max_tokens_param(params: &Map<String, Value>) -> String {
    params
        .get("max_tokens")
        .or_else(|| params.get("max_tokens_to_sample"))
        .map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
        .unwrap_or_else(|| DEFAULT_MAX_TOKENS.to_string())
}

/// The rendered `messages` param, or a synthesized system + user exchange.
fn prompt_structure(params: &Map<String, Value>, prompt: &str) -> Value {
    params.get("messages").cloned().unwrap_or_else(|| {
        serde_json::json!([
            { "role": "system", "content": DEFAULT_SYSTEM_PROMPT },
            template::user_message(prompt),
        ])
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(prompt: &str) -> CallRequest {
        CallRequest {
            project_name: "projA".to_string(),
            model_name: "modelX".to_string(),
            prompt: prompt.to_string(),
            api_token: "secret-token".to_string(),
        }
    }

    fn exchange(params: Value, text: &str) -> UpstreamExchange {
        let started_at = Utc::now();
        UpstreamExchange {
            rendered: RenderedRequest {
                headers: vec![],
                params: params.as_object().unwrap().clone(),
            },
            started_at,
            finished_at: started_at + chrono::Duration::milliseconds(250),
            status: 200,
            text: text.to_string(),
            body: serde_json::from_str(text).unwrap(),
        }
    }

    #[test]
    fn call_request_accepts_both_casings() {
        let camel: CallRequest = serde_json::from_value(json!({
            "projectName": "p", "modelName": "m", "prompt": "hi", "apiToken": "t"
        }))
        .unwrap();
        let snake: CallRequest = serde_json::from_value(json!({
            "project_name": "p", "model_name": "m", "prompt": "hi", "api_token": "t"
        }))
        .unwrap();
        assert_eq!(camel.project_name, snake.project_name);
        assert_eq!(camel.api_token, snake.api_token);
    }

    #[test]
    fn debug_output_hides_the_token() {
        let rendered = format!("{:?}", request("hello"));
        assert!(!rendered.contains("secret-token"));
        assert!(rendered.contains("modelX"));
    }

    #[test]
    fn record_uses_messages_and_max_tokens() {
        let mut config = ModelConfig::new("https://x.example.com");
        config.temperature = Some(0.3);
        let ex = exchange(
            json!({"max_tokens": 256, "messages": [{"role": "user", "content": "two words"}]}),
            r#"{"answer": "three word reply"}"#,
        );

        let record = generation_record(&request("two words"), &config, &ex);

        assert_eq!(record.name, "modelX-generation");
        assert_eq!(record.model_parameters.max_tokens, "256");
        assert_eq!(record.model_parameters.temperature, 0.3);
        assert_eq!(
            record.prompt_structure,
            json!([{"role": "user", "content": "two words"}])
        );
        assert_eq!(record.usage.prompt_tokens, 2);
        assert_eq!(record.usage.completion_tokens, 4);
        assert_eq!(record.duration(), Duration::from_millis(250));
        assert_eq!(record.metadata["interface"], "api");
        assert_eq!(record.metadata["project"], "projA");
        assert_eq!(record.metadata["upstreamStatus"], 200);
    }

    #[test]
    fn record_falls_back_through_max_tokens_names() {
        let config = ModelConfig::new("https://x.example.com");

        let anthropic = exchange(json!({"max_tokens_to_sample": "300"}), "{}");
        let record = generation_record(&request("hi"), &config, &anthropic);
        assert_eq!(record.model_parameters.max_tokens, "300");

        let bare = exchange(json!({"prompt": "hi"}), "{}");
        let record = generation_record(&request("hi"), &config, &bare);
        assert_eq!(record.model_parameters.max_tokens, DEFAULT_MAX_TOKENS);
        assert_eq!(record.model_parameters.temperature, DEFAULT_TEMPERATURE);
    }

    #[test]
    fn record_synthesizes_prompt_structure_without_messages() {
        let config = ModelConfig::new("https://x.example.com");
        let ex = exchange(json!({"prompt": "Human: hi"}), "{}");

        let record = generation_record(&request("hi"), &config, &ex);

        assert_eq!(
            record.prompt_structure,
            json!([
                {"role": "system", "content": "You are a helpful assistant."},
                {"role": "user", "content": "hi"}
            ])
        );
    }

    #[test]
    fn error_statuses() {
        assert_eq!(
            RelayError::NotFound {
                project: "p".into(),
                model: "m".into()
            }
            .status(),
            http::StatusCode::NOT_FOUND
        );
        let limited = RelayError::RateLimited {
            model: "m".into(),
            retry_after: Duration::from_millis(10),
        };
        assert_eq!(limited.status(), http::StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(limited.to_string(), "Rate limit exceeded");
        let upstream = RelayError::Upstream("connection refused".into());
        assert_eq!(upstream.status(), http::StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(upstream.to_string(), "connection refused");
    }
}
