//! Admission gate HTTP entrypoint.
//!
//! Launches an Axum server with every route behind the admission pipeline, plus the
//! background sweepers that expire bans and forget idle clients.
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `CONFIG_FILE` path of the TOML config (default `config.toml`)
//! - `APP_ENV` selects the profile (`production` unless set to `development`)
//! - `HOST`, `PORT` override the bind address
//! - `ADMIN_API_KEY` enables the `/api/security` endpoints
//! - `RUST_LOG`, `LOG_FORMAT` control logging

use admission_gate::app;
use admission_gate::config::AppConfig;
use admission_gate::error::GateError;
use admission_gate::security::{AdminAuth, AdmissionPipeline, Sweepers};
use admission_gate::sig_down::SigDown;
use admission_gate::telemetry::Telemetry;
use dotenvy::dotenv;
use std::net::{IpAddr, SocketAddr};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register();

    let app_config = match AppConfig::from_env() {
        Ok(config) => {
            tracing::info!(profile = ?config.profile, "Configuration loaded successfully");
            config
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            tracing::info!("Using default (production) configuration");
            AppConfig::default()
        }
    };

    let pipeline = AdmissionPipeline::new(&app_config);
    let sweepers = Sweepers::start(&pipeline, &app_config.sweepers);
    let admin_auth = AdminAuth::from_env();

    let http_endpoints = app::build_app(pipeline, &app_config, admin_auth)
        .layer(telemetry.http_tracing());

    let host = std::env::var("HOST").unwrap_or_else(|_| app_config.server.host.clone());
    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(app_config.server.port);
    let ip: IpAddr = host
        .parse()
        .map_err(|_| GateError::InvalidAddress(host.clone()))?;

    let addr = SocketAddr::new(ip, port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind to {}: {}", addr, e);
        e
    })?;

    let sig_down = SigDown::try_new()?;
    let axum_cancellation_token = sig_down.cancellation_token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(
        listener,
        http_endpoints.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(axum_graceful_shutdown)
    .await?;

    sweepers.shutdown().await;
    tracing::info!("Server stopped");
    Ok(())
}
