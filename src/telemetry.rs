//! Telemetry Sink
//!
//! Successful calls produce a [`GenerationRecord`] that is written to the
//! success log and handed to an external [`GenerationCollector`] on a spawned
//! task. Failed calls only reach the error log. Neither path can fail the
//! relay: collector and log errors are reported through `tracing` and dropped.

use crate::event_log::{LogEvent, RequestLog};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("collector unavailable: {0}")]
    Unavailable(String),
    #[error("collector rejected record ({status}): {body}")]
    Rejected { status: u16, body: String },
    #[error("invalid collector credentials: {0}")]
    Credentials(String),
}

/// Parameters reported alongside a generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelParameters {
    pub max_tokens: String,
    pub temperature: f64,
}

/// Whitespace-delimited word counts, not tokenizer counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
}

impl Usage {
    pub fn from_texts(prompt: &str, completion: &str) -> Self {
        Self {
            prompt_tokens: prompt.split_whitespace().count(),
            completion_tokens: completion.split_whitespace().count(),
        }
    }

    pub fn total(&self) -> usize {
        self.prompt_tokens + self.completion_tokens
    }
}

/// One completed upstream call, as reported to the collector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationRecord {
    pub name: String,
    pub model_name: String,
    pub project_name: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub model_parameters: ModelParameters,
    pub prompt_structure: Value,
    pub completion_text: String,
    pub usage: Usage,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl GenerationRecord {
    /// Wall-clock time between start and end; zero if the clock went backwards.
    pub fn duration(&self) -> Duration {
        (self.end_time - self.start_time)
            .to_std()
            .unwrap_or_default()
    }
}

/// External observability backend.
#[async_trait]
pub trait GenerationCollector: Send + Sync {
    async fn submit(&self, record: &GenerationRecord) -> Result<(), TelemetryError>;

    fn name(&self) -> &'static str;
}

/// Collector used when no backend is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCollector;

#[async_trait]
impl GenerationCollector for NoopCollector {
    async fn submit(&self, _record: &GenerationRecord) -> Result<(), TelemetryError> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "noop"
    }
}

/// Langfuse project keys, read from the secrets file.
#[derive(Clone, Deserialize)]
pub struct LangfuseCredentials {
    #[serde(rename = "ENV_PUBLIC_KEY")]
    pub public_key: String,
    #[serde(rename = "ENV_SECRET_KEY")]
    pub secret_key: String,
    #[serde(rename = "ENV_HOST")]
    pub host: String,
}

impl LangfuseCredentials {
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, TelemetryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| TelemetryError::Credentials(format!("{}: {}", path.display(), e)))?;
        let credentials: LangfuseCredentials = serde_json::from_str(&content)
            .map_err(|e| TelemetryError::Credentials(format!("{}: {}", path.display(), e)))?;
        if credentials.host.trim().is_empty() {
            return Err(TelemetryError::Credentials("ENV_HOST is empty".to_string()));
        }
        Ok(credentials)
    }
}

impl std::fmt::Debug for LangfuseCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LangfuseCredentials")
            .field("public_key", &self.public_key)
            .field("secret_key", &"<redacted>")
            .field("host", &self.host)
            .finish()
    }
}

/// Posts generations to the Langfuse ingestion API.
pub struct LangfuseCollector {
    credentials: LangfuseCredentials,
    client: reqwest::Client,
}

impl LangfuseCollector {
    pub fn new(credentials: LangfuseCredentials, client: reqwest::Client) -> Self {
        Self {
            credentials,
            client,
        }
    }

    pub fn ingestion_url(&self) -> String {
        format!(
            "{}/api/public/ingestion",
            self.credentials.host.trim_end_matches('/')
        )
    }

    /// Ingestion batch holding a trace and its generation.
    pub fn ingestion_batch(record: &GenerationRecord) -> Value {
        let trace_id = uuid::Uuid::new_v4().to_string();
        let generation_id = uuid::Uuid::new_v4().to_string();
        let timestamp = record.end_time.to_rfc3339();

        serde_json::json!({
            "batch": [
                {
                    "id": uuid::Uuid::new_v4().to_string(),
                    "type": "trace-create",
                    "timestamp": timestamp,
                    "body": {
                        "id": trace_id,
                        "name": record.name,
                        "timestamp": record.start_time.to_rfc3339(),
                        "metadata": record.metadata,
                    }
                },
                {
                    "id": uuid::Uuid::new_v4().to_string(),
                    "type": "generation-create",
                    "timestamp": timestamp,
                    "body": {
                        "id": generation_id,
                        "traceId": trace_id,
                        "name": record.name,
                        "startTime": record.start_time.to_rfc3339(),
                        "endTime": record.end_time.to_rfc3339(),
                        "model": record.model_name,
                        "modelParameters": record.model_parameters,
                        "input": record.prompt_structure,
                        "output": record.completion_text,
                        "usage": {
                            "promptTokens": record.usage.prompt_tokens,
                            "completionTokens": record.usage.completion_tokens,
                            "totalTokens": record.usage.total(),
                        },
                        "metadata": record.metadata,
                    }
                }
            ]
        })
    }
}

#[async_trait]
impl GenerationCollector for LangfuseCollector {
    async fn submit(&self, record: &GenerationRecord) -> Result<(), TelemetryError> {
        let response = self
            .client
            .post(self.ingestion_url())
            .basic_auth(
                &self.credentials.public_key,
                Some(&self.credentials.secret_key),
            )
            .json(&Self::ingestion_batch(record))
            .send()
            .await
            .map_err(|e| TelemetryError::Unavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown error".to_string());
            return Err(TelemetryError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        Ok(())
    }

    fn name(&self) -> &'static str {
        "langfuse"
    }
}

/// Records relay outcomes to the request logs and the external collector.
#[derive(Clone)]
pub struct TelemetrySink {
    collector: Arc<dyn GenerationCollector>,
    log: RequestLog,
}

impl TelemetrySink {
    pub fn new(collector: Arc<dyn GenerationCollector>, log: RequestLog) -> Self {
        Self { collector, log }
    }

    pub fn log(&self) -> &RequestLog {
        &self.log
    }

    pub fn collector_name(&self) -> &'static str {
        self.collector.name()
    }

    /// Log the success line and submit the record in the background.
    pub fn record_success(&self, record: GenerationRecord) {
        let event = LogEvent::success(&record.model_name, record.duration());
        if let Err(e) = self.log.record(&event) {
            warn!(model = %record.model_name, "Failed to append success log: {}", e);
        }

        match Handle::try_current() {
            Ok(rt) => {
                let collector = Arc::clone(&self.collector);
                rt.spawn(async move {
                    match collector.submit(&record).await {
                        Ok(()) => debug!(
                            collector = collector.name(),
                            model = %record.model_name,
                            "Generation submitted"
                        ),
                        Err(e) => warn!(
                            collector = collector.name(),
                            model = %record.model_name,
                            "Generation submission failed: {}",
                            e
                        ),
                    }
                });
            }
            Err(_) => warn!(
                model = %record.model_name,
                "No async runtime; generation record not submitted"
            ),
        }
    }

    /// Log the error line. The collector is not called for failures.
    pub fn record_failure(&self, model: &str, error: &str) {
        if let Err(e) = self.log.record(&LogEvent::failure(model, error)) {
            warn!(model = %model, "Failed to append error log: {}", e);
        }
    }
}

impl std::fmt::Debug for TelemetrySink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelemetrySink")
            .field("collector", &self.collector.name())
            .field("log", &self.log)
            .finish()
    }
}
