//! HTTP endpoints served behind the admission gate.
//!
//! Public:
//! - `GET /` greeting
//! - `GET /health` liveness probe
//!
//! Admin (require `X-Admin-Key`):
//! - `GET /api/security/status` live config and component counters
//! - `GET /api/security/blocked-ips` active bans
//! - `POST /api/security/block/:ip` manual ban (`?duration=<secs>&reason=<text>`)
//! - `POST /api/security/unblock/:ip` lift a ban
//! - `GET /api/security/connections` in-flight requests per address
//! - `PUT /api/security/config` replace the live security config

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::any::Any;
use std::net::IpAddr;
use std::time::{Duration, SystemTime};
use tracing::instrument;

use crate::config::{SecurityConfig, MAX_BAN_DURATION};
use crate::security::rejection::ErrorBody;
use crate::security::{AdminAuth, AdmissionPipeline};

const DEFAULT_MANUAL_BAN_SECS: u64 = 3600;

pub fn routes() -> Router {
    Router::new()
        .route("/", get(get_root))
        .route("/health", get(get_health))
}

pub fn admin_routes(pipeline: AdmissionPipeline, admin_auth: AdminAuth) -> Router {
    Router::new()
        .route("/api/security/status", get(get_security_status))
        .route("/api/security/blocked-ips", get(get_blocked_ips))
        .route("/api/security/block/:ip", post(post_block_ip))
        .route("/api/security/unblock/:ip", post(post_unblock_ip))
        .route("/api/security/connections", get(get_connections))
        .route("/api/security/config", put(put_security_config))
        .with_state(pipeline)
        .layer(axum::middleware::from_fn(move |req, next| {
            let auth = admin_auth.clone();
            async move { auth.middleware(req, next).await }
        }))
}

fn bad_request(error: impl ToString, code: &'static str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorBody {
            error: error.to_string(),
            code: Some(code),
            retry_after: None,
        }),
    )
        .into_response()
}

fn parse_ip(raw: &str) -> Result<IpAddr, Response> {
    raw.parse()
        .map_err(|_| bad_request(format!("Invalid IP address: {raw}"), "INVALID_IP"))
}

/// `GET /`: Returns a simple greeting message.
#[instrument(skip_all)]
pub async fn get_root() -> impl IntoResponse {
    let pkg_name = env!("CARGO_PKG_NAME");
    (StatusCode::OK, format!("Hello from {pkg_name}!"))
}

#[instrument(skip_all)]
pub async fn get_health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now(),
    }))
}

/// Fallback for unmatched routes.
pub async fn not_found() -> impl IntoResponse {
    StatusCode::NOT_FOUND
}

#[instrument(skip_all)]
pub async fn get_security_status(State(pipeline): State<AdmissionPipeline>) -> impl IntoResponse {
    Json(json!({
        "rate_limiter_active": true,
        "config": pipeline.security_config().as_ref(),
        "stats": pipeline.stats(),
        "timestamp": Utc::now(),
    }))
}

#[derive(Debug, Serialize)]
struct BlockedIp {
    ip: IpAddr,
    reason: String,
    blocked_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    remaining_seconds: u64,
}

#[instrument(skip_all)]
pub async fn get_blocked_ips(State(pipeline): State<AdmissionPipeline>) -> impl IntoResponse {
    let now = SystemTime::now();
    let mut blocked: Vec<BlockedIp> = pipeline
        .reputation()
        .active_bans()
        .into_iter()
        .map(|(ip, entry)| BlockedIp {
            ip,
            reason: entry.reason,
            blocked_at: entry.banned_at.into(),
            expires_at: entry.expires_at.into(),
            remaining_seconds: entry
                .expires_at
                .duration_since(now)
                .map(|left| left.as_secs())
                .unwrap_or(0),
        })
        .collect();
    blocked.sort_by(|a, b| b.expires_at.cmp(&a.expires_at));

    Json(json!({
        "count": blocked.len(),
        "blocked_ips": blocked,
    }))
}

#[derive(Debug, Deserialize)]
pub struct BlockParams {
    /// Ban length in seconds.
    duration: Option<u64>,
    reason: Option<String>,
}

#[instrument(skip_all)]
pub async fn post_block_ip(
    State(pipeline): State<AdmissionPipeline>,
    Path(raw_ip): Path<String>,
    Query(params): Query<BlockParams>,
) -> Response {
    let ip = match parse_ip(&raw_ip) {
        Ok(ip) => ip,
        Err(response) => return response,
    };
    let duration = Duration::from_secs(params.duration.unwrap_or(DEFAULT_MANUAL_BAN_SECS));
    if duration > MAX_BAN_DURATION {
        return bad_request(
            format!(
                "Ban duration must not exceed {} seconds",
                MAX_BAN_DURATION.as_secs()
            ),
            "INVALID_DURATION",
        );
    }
    let reason = params.reason.unwrap_or_else(|| "manual".to_string());

    if pipeline.is_whitelisted(&ip) {
        tracing::warn!(ip = %ip, "Banning a whitelisted IP has no effect on admission");
    }
    pipeline.add_to_blacklist(ip, duration, &reason);

    (
        StatusCode::OK,
        Json(json!({
            "blocked": ip,
            "duration_seconds": duration.as_secs(),
            "reason": reason,
        })),
    )
        .into_response()
}

#[instrument(skip_all)]
pub async fn post_unblock_ip(
    State(pipeline): State<AdmissionPipeline>,
    Path(raw_ip): Path<String>,
) -> Response {
    let ip = match parse_ip(&raw_ip) {
        Ok(ip) => ip,
        Err(response) => return response,
    };

    if pipeline.remove_from_blacklist(&ip) {
        tracing::info!(ip = %ip, "IP unblocked by admin");
        (StatusCode::OK, Json(json!({ "unblocked": ip }))).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(ErrorBody {
                error: format!("IP {ip} is not blocked"),
                code: Some("NOT_BLOCKED"),
                retry_after: None,
            }),
        )
            .into_response()
    }
}

#[instrument(skip_all)]
pub async fn get_connections(State(pipeline): State<AdmissionPipeline>) -> impl IntoResponse {
    let mut connections: Vec<_> = pipeline.connections().snapshot().into_iter().collect();
    connections.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));

    Json(json!({
        "total": pipeline.connections().total_in_flight(),
        "max_per_ip": pipeline.security_config().max_concurrent_connections,
        "connections": connections
            .into_iter()
            .map(|(ip, active)| json!({ "ip": ip, "active": active }))
            .collect::<Vec<_>>(),
    }))
}

#[instrument(skip_all)]
pub async fn put_security_config(
    State(pipeline): State<AdmissionPipeline>,
    Json(config): Json<SecurityConfig>,
) -> Response {
    match pipeline.update_security_config(config) {
        Ok(()) => {
            tracing::info!("Security configuration updated by admin");
            (StatusCode::OK, Json(pipeline.security_config().as_ref().clone())).into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "Rejected security configuration update");
            bad_request(e, "INVALID_CONFIG")
        }
    }
}

/// Renders a caught handler panic as a JSON 500.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic payload"
    };
    tracing::error!(detail, "Handler panicked");

    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": "Internal server error" })),
    )
        .into_response()
}
