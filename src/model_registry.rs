//! Model Registry
//!
//! Immutable `project -> model -> ModelConfig` mapping loaded once at startup.
//!
//! Source format (JSON, or YAML for `.yaml`/`.yml` files):
//!
//! ```json
//! {
//!   "projectA": {
//!     "gpt-4": {
//!       "endpoint": "https://api.openai.com/v1/chat/completions",
//!       "headers": {"Authorization": "Bearer $API_TOKEN"},
//!       "params": {"model": "gpt-4", "messages": ["$PROMPT"]},
//!       "rateLimit": 2,
//!       "temperature": 0.7
//!     }
//!   }
//! }
//! ```
//!
//! Every entry is validated and its templates compiled during load; any
//! failure is returned as a [`RegistryError`] and is fatal for startup.

use crate::template::{RequestTemplate, TemplateError};
use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to read model config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse model config: {0}")]
    Parse(String),
    #[error("model config must map project -> model -> settings: {0}")]
    Shape(String),
    #[error("invalid config for {project}/{model}: {reason}")]
    InvalidModel {
        project: String,
        model: String,
        reason: String,
    },
}

fn default_rate_limit() -> f64 {
    1.0
}

/// Settings for one upstream model.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelConfig {
    /// Upstream URL the rendered request is POSTed to
    pub endpoint: String,

    /// Header templates; `$API_TOKEN` is substituted per call
    #[serde(default)]
    pub headers: Map<String, Value>,

    /// Body templates; `$PROMPT` is substituted per call
    #[serde(default)]
    pub params: Map<String, Value>,

    /// Requests per second ceiling (default: 1)
    #[serde(default = "default_rate_limit", alias = "rate_limit")]
    pub rate_limit: f64,

    /// Temperature reported in telemetry (default: 0.9)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,

    /// Upstream timeout override in seconds
    #[serde(
        default,
        alias = "timeout_seconds",
        skip_serializing_if = "Option::is_none"
    )]
    pub timeout_seconds: Option<u64>,

    /// Compiled templates (not serialized)
    #[serde(skip)]
    template: OnceCell<RequestTemplate>,
}

impl ModelConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            headers: Map::new(),
            params: Map::new(),
            rate_limit: default_rate_limit(),
            temperature: None,
            timeout_seconds: None,
            template: OnceCell::new(),
        }
    }

    /// Minimum spacing between two admitted calls, `1 / rate_limit`.
    ///
    /// Saturates at `Duration::MAX` for rates too small to represent.
    pub fn min_interval(&self) -> Duration {
        Duration::try_from_secs_f64(1.0 / self.rate_limit).unwrap_or(Duration::MAX)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_seconds.map(Duration::from_secs)
    }

    /// Compiled templates, built on first use.
    pub fn template(&self) -> Result<&RequestTemplate, TemplateError> {
        self.template
            .get_or_try_init(|| RequestTemplate::compile(&self.headers, &self.params))
    }

    fn validate(&self, model: &str) -> Result<(), String> {
        match reqwest::Url::parse(&self.endpoint) {
            Ok(url) if url.scheme() == "http" || url.scheme() == "https" => {}
            Ok(url) => return Err(format!("unsupported endpoint scheme {:?}", url.scheme())),
            Err(e) => return Err(format!("invalid endpoint {:?}: {}", self.endpoint, e)),
        }

        if !self.rate_limit.is_finite() || self.rate_limit <= 0.0 {
            return Err(format!(
                "rateLimit must be a positive number, got {}",
                self.rate_limit
            ));
        }
        Duration::try_from_secs_f64(1.0 / self.rate_limit).map_err(|_| {
            format!(
                "rateLimit {} is too small; the interval 1/rateLimit does not fit",
                self.rate_limit
            )
        })?;

        if model_name_breaks_log_lines(model) {
            return Err("model name must not contain line breaks".to_string());
        }

        if matches!(self.timeout_seconds, Some(0)) {
            return Err("timeoutSeconds must be greater than zero".to_string());
        }

        self.template().map_err(|e| e.to_string())?;
        Ok(())
    }
}

/// Request log lines are one event per line, so names must stay on one line.
fn model_name_breaks_log_lines(model: &str) -> bool {
    model.contains(['\r', '\n'])
}

/// Registry statistics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryStats {
    pub total_projects: usize,
    pub total_models: usize,
    pub models_per_project: BTreeMap<String, usize>,
}

/// Loaded model configuration, read-only for the lifetime of the process.
#[derive(Debug, Clone)]
pub struct ModelRegistry {
    projects: HashMap<String, HashMap<String, ModelConfig>>,
    raw: Value,
}

impl ModelRegistry {
    /// Load from a JSON file, or YAML when the extension is `.yaml`/`.yml`.
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, RegistryError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| RegistryError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        let is_yaml = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("yaml") | Some("yml")
        );
        let raw: Value = if is_yaml {
            serde_yaml::from_str(&content).map_err(|e| RegistryError::Parse(e.to_string()))?
        } else {
            serde_json::from_str(&content).map_err(|e| RegistryError::Parse(e.to_string()))?
        };

        let registry = Self::from_value(raw)?;
        tracing::info!(
            path = %path.display(),
            projects = registry.projects.len(),
            models = registry.stats().total_models,
            "Loaded model registry"
        );
        Ok(registry)
    }

    pub fn from_json_str(content: &str) -> Result<Self, RegistryError> {
        let raw: Value =
            serde_json::from_str(content).map_err(|e| RegistryError::Parse(e.to_string()))?;
        Self::from_value(raw)
    }

    /// Validate and compile a parsed config document.
    pub fn from_value(raw: Value) -> Result<Self, RegistryError> {
        let Some(project_map) = raw.as_object() else {
            return Err(RegistryError::Shape("top level is not an object".into()));
        };

        let mut projects = HashMap::with_capacity(project_map.len());
        for (project, models) in project_map {
            let Some(model_map) = models.as_object() else {
                return Err(RegistryError::Shape(format!(
                    "project {:?} is not an object",
                    project
                )));
            };

            let mut entries = HashMap::with_capacity(model_map.len());
            for (model, settings) in model_map {
                let invalid = |reason: String| RegistryError::InvalidModel {
                    project: project.clone(),
                    model: model.clone(),
                    reason,
                };
                let config: ModelConfig =
                    serde_json::from_value(settings.clone()).map_err(|e| invalid(e.to_string()))?;
                config.validate(model).map_err(invalid)?;
                entries.insert(model.clone(), config);
            }
            projects.insert(project.clone(), entries);
        }

        Ok(Self { projects, raw })
    }

    /// Create an empty registry
    pub fn empty() -> Self {
        Self {
            projects: HashMap::new(),
            raw: Value::Object(Map::new()),
        }
    }

    /// Find the config for `(project, model)`. A miss is `None`, never an error.
    pub fn lookup(&self, project: &str, model: &str) -> Option<&ModelConfig> {
        self.projects.get(project)?.get(model)
    }

    /// The source document exactly as loaded.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn stats(&self) -> RegistryStats {
        let models_per_project: BTreeMap<String, usize> = self
            .projects
            .iter()
            .map(|(name, models)| (name.clone(), models.len()))
            .collect();

        RegistryStats {
            total_projects: self.projects.len(),
            total_models: models_per_project.values().sum(),
            models_per_project,
        }
    }
}
