//! Process settings and application bootstrap.

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::event_log::RequestLog;
use crate::model_registry::ModelRegistry;
use crate::relay::Relay;
use crate::telemetry::{
    GenerationCollector, LangfuseCollector, LangfuseCredentials, NoopCollector, TelemetrySink,
};
use crate::util::{build_http_client_from_env, AppState};

/// Command-line flags, each with an environment fallback.
#[derive(Debug, Clone, Parser)]
#[command(name = "modelrelay", version, about = "Config-driven model relay")]
pub struct Settings {
    /// Model registry file (JSON, or YAML by extension)
    #[arg(long = "config", env = "RELAY_CONFIG_PATH", default_value = "config.json")]
    pub config_path: PathBuf,

    /// Collector credentials; a missing file disables the external collector
    #[arg(long = "secrets", env = "RELAY_SECRETS_PATH", default_value = "secrets.json")]
    pub secrets_path: PathBuf,

    #[arg(long = "success-log", env = "RELAY_SUCCESS_LOG", default_value = "successful_requests.log")]
    pub success_log: PathBuf,

    #[arg(long = "error-log", env = "RELAY_ERROR_LOG", default_value = "error_requests.log")]
    pub error_log: PathBuf,

    #[arg(long = "bind", env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: String,

    /// Upstream timeout for models without `timeoutSeconds`
    #[arg(
        long = "upstream-timeout-seconds",
        env = "RELAY_UPSTREAM_TIMEOUT_SECONDS",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(1..)
    )]
    pub upstream_timeout_seconds: u64,
}

impl Settings {
    pub fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_seconds)
    }

    /// Load the registry and secrets and assemble the shared state.
    ///
    /// A registry that cannot be loaded is fatal. Unusable secrets only
    /// disable the external collector.
    pub fn build_state(&self) -> anyhow::Result<AppState> {
        let registry = ModelRegistry::load_from_file(&self.config_path).with_context(|| {
            format!(
                "failed to load model registry from {}",
                self.config_path.display()
            )
        })?;

        let http = build_http_client_from_env();
        let collector = self.collector(http.clone());
        let log = RequestLog::new(&self.success_log, &self.error_log);
        let telemetry = TelemetrySink::new(collector, log);

        let relay = Relay::new(Arc::new(registry), telemetry, http)
            .with_default_timeout(self.upstream_timeout());
        Ok(AppState::new(relay))
    }

    fn collector(&self, http: reqwest::Client) -> Arc<dyn GenerationCollector> {
        if !self.secrets_path.is_file() {
            warn!(
                "Secrets file {} not found; external telemetry disabled",
                self.secrets_path.display()
            );
            return Arc::new(NoopCollector);
        }
        match LangfuseCredentials::load_from_file(&self.secrets_path) {
            Ok(credentials) => {
                info!(host = %credentials.host, "Langfuse telemetry enabled");
                Arc::new(LangfuseCollector::new(credentials, http))
            }
            Err(e) => {
                warn!("{}; external telemetry disabled", e);
                Arc::new(NoopCollector)
            }
        }
    }
}
