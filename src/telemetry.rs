//! Tracing subscriber setup and the HTTP trace layer.
//!
//! `RUST_LOG` controls filtering (default `info` for this crate, `warn` elsewhere).
//! `LOG_FORMAT=json` switches to structured JSON output.

use tower_http::classify::{ServerErrorsAsFailures, SharedClassifier};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Clone, Default)]
pub struct Telemetry {
    name: Option<&'static str>,
    version: Option<&'static str>,
}

impl Telemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_name(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    pub fn with_version(mut self, version: &'static str) -> Self {
        self.version = Some(version);
        self
    }

    /// Install the global subscriber. A second registration is ignored.
    pub fn register(self) -> Self {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new("warn,admission_gate=info,tower_http=info"));
        let json = std::env::var("LOG_FORMAT")
            .map(|format| format.eq_ignore_ascii_case("json"))
            .unwrap_or(false);

        let registry = tracing_subscriber::registry().with(filter);
        let result = if json {
            registry
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
        } else {
            registry
                .with(tracing_subscriber::fmt::layer().with_target(true))
                .try_init()
        };

        match result {
            Ok(()) => tracing::info!(
                service = self.name.unwrap_or("unknown"),
                version = self.version.unwrap_or("unknown"),
                json,
                "Telemetry registered"
            ),
            Err(e) => eprintln!("Tracing subscriber already installed: {e}"),
        }

        self
    }

    pub fn http_tracing(&self) -> TraceLayer<SharedClassifier<ServerErrorsAsFailures>> {
        TraceLayer::new_for_http()
    }
}
