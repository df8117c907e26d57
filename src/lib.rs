#![forbid(unsafe_code)]
#![doc = r#"
Modelrelay

Relay prompts to upstream inference endpoints described in a model registry,
with a per-model rate gate, request templating, request logs and usage
analytics.

Crate highlights
- Library: `Relay::relay(&CallRequest)` runs lookup, admission, templating and
  the upstream POST; `template::render` is usable on its own.
- HTTP server (in `server`): `/callmodel`, `/listmodels`, `/analytics`, `/status`.

Modules
- `model_registry`: project -> model -> config, loaded once at startup.
- `template`: `$API_TOKEN` / `$PROMPT` substitution over compiled templates.
- `rate_limiter`: one admission per model per `1 / rateLimit` seconds.
- `relay`: the dispatcher tying the above together.
- `event_log`: the two append-only request logs and their line format.
- `telemetry`: generation records, collectors (Langfuse, noop) and the sink.
- `analytics`: per-model counts and mean latency folded from the success log.
- `server`, `settings`, `util`: actix handlers, CLI settings, shared helpers.
"#]

pub mod analytics;
pub mod event_log;
pub mod model_registry;
pub mod rate_limiter;
pub mod relay;
pub mod server;
pub mod settings;
pub mod telemetry;
pub mod template;
pub mod util;

pub use crate::analytics::{AnalyticsAggregator, AnalyticsReport};
pub use crate::event_log::{LogEvent, LogRecord, LogStream, RequestLog};
pub use crate::model_registry::{ModelConfig, ModelRegistry, RegistryError, RegistryStats};
pub use crate::rate_limiter::{Admission, RateLimiter, RateLimiterStats};
pub use crate::relay::{CallRequest, Relay, RelayError};
pub use crate::settings::Settings;
pub use crate::telemetry::{
    GenerationCollector, GenerationRecord, LangfuseCollector, LangfuseCredentials,
    ModelParameters, NoopCollector, TelemetryError, TelemetrySink, Usage,
};
pub use crate::template::{Bindings, RenderedRequest, RequestTemplate};
