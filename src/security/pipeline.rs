//! Admission pipeline.
//!
//! Every request walks [`ADMISSION_ORDER`] until a stage forwards or rejects it:
//!
//! ```text
//! whitelist -> banned -> sensitive path -> connection admit -> rate limit -> threat scan
//! ```
//!
//! A whitelisted address is forwarded without running any later stage. Once the connection
//! stage reserves a slot, the [`ConnectionPermit`] travels with the request and is released
//! when the downstream handler finishes, fails, panics or is cancelled.

use axum::{
    extract::{FromRequestParts, RawPathParams, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use super::abuse::{Escalator, SuspicionReason};
use super::client_ip::{extract_ip_from_request, UNKNOWN_CLIENT};
use super::connections::{ConnectionCounter, ConnectionPermit};
use super::quick_ban::{QuickBan, VolumeDecision};
use super::rate_limit::{RateDecision, RateLimiter};
use super::rejection::Rejection;
use super::reputation::{BanSink, IpReputation, WhitelistEntry};
use super::sensitive_path::{PathVerdict, SensitivePathGuard};
use super::threat::{RequestSurface, ThreatDetector};
use crate::config::{AppConfig, SecurityConfig, SensitivePathConfig, SharedSecurityConfig};
use crate::error::GateResult;

const STATIC_PREFIXES: &[&str] = &["/website/"];

const STATIC_EXTENSIONS: &[&str] = &[
    ".css", ".js", ".map", ".png", ".jpg", ".jpeg", ".gif", ".webp", ".svg", ".ico", ".woff",
    ".woff2", ".ttf", ".eot", ".mp4", ".webm", ".mp3", ".wav", ".pdf", ".zip",
];

/// Admission checks in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Whitelist,
    Banned,
    SensitivePath,
    ConnectionAdmit,
    RateLimit,
    ThreatScan,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Whitelist => "whitelist",
            Stage::Banned => "banned",
            Stage::SensitivePath => "sensitive_path",
            Stage::ConnectionAdmit => "connection_admit",
            Stage::RateLimit => "rate_limit",
            Stage::ThreatScan => "threat_scan",
        };
        f.write_str(name)
    }
}

pub const ADMISSION_ORDER: [Stage; 6] = [
    Stage::Whitelist,
    Stage::Banned,
    Stage::SensitivePath,
    Stage::ConnectionAdmit,
    Stage::RateLimit,
    Stage::ThreatScan,
];

/// What the pipeline knows about one inbound request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub ip: IpAddr,
    pub surface: RequestSurface,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn new(ip: IpAddr, surface: RequestSurface) -> Self {
        Self {
            ip,
            surface,
            request_id: None,
        }
    }

    fn request_id(&self) -> &str {
        self.request_id.as_deref().unwrap_or("unknown")
    }
}

pub enum Admission {
    /// Request may proceed. `permit` is `None` only for whitelisted addresses.
    Forwarded { permit: Option<ConnectionPermit> },
    Rejected { stage: Stage, rejection: Rejection },
}

impl Admission {
    pub fn is_forwarded(&self) -> bool {
        matches!(self, Admission::Forwarded { .. })
    }

    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            Admission::Rejected { rejection, .. } => Some(rejection),
            Admission::Forwarded { .. } => None,
        }
    }
}

enum StageOutcome {
    Continue,
    Forward,
    Reject(Rejection),
}

/// Writes every ban to both the denylist and the rate limiter.
#[derive(Clone)]
struct DenylistSink {
    reputation: IpReputation,
    limiter: RateLimiter,
}

impl BanSink for DenylistSink {
    fn ban(&self, ip: IpAddr, duration: Duration, reason: &str) {
        self.reputation.ban(ip, duration, reason);
        self.limiter.block_ip(ip, duration);
    }
}

/// Counters exposed to the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct AdmissionStats {
    pub active_bans: usize,
    pub tracked_visitors: usize,
    pub suspicious_ips: usize,
    pub in_flight_requests: u64,
}

/// Shared admission state. Cheap to clone.
#[derive(Clone)]
pub struct AdmissionPipeline {
    config: SharedSecurityConfig,
    reputation: IpReputation,
    limiter: RateLimiter,
    connections: ConnectionCounter,
    volume: QuickBan,
    escalator: Escalator,
    paths: SensitivePathGuard,
    detector: ThreatDetector,
    denylist: DenylistSink,
    trusted_proxies: Arc<Vec<IpNetwork>>,
}

impl AdmissionPipeline {
    pub fn new(app_config: &AppConfig) -> Self {
        Self::from_parts(
            SharedSecurityConfig::new(app_config.security.clone()),
            app_config.whitelist.clone(),
            &app_config.paths,
            app_config.server.effective_trusted_proxies(),
        )
    }

    pub fn from_parts(
        config: SharedSecurityConfig,
        whitelist: Vec<WhitelistEntry>,
        paths: &SensitivePathConfig,
        trusted_proxies: Vec<IpNetwork>,
    ) -> Self {
        let reputation = IpReputation::new(whitelist);
        let limiter = RateLimiter::new(config.clone());
        let denylist = DenylistSink {
            reputation: reputation.clone(),
            limiter: limiter.clone(),
        };
        let sink: Arc<dyn BanSink> = Arc::new(denylist.clone());

        Self {
            connections: ConnectionCounter::new(config.clone()),
            volume: QuickBan::new(config.clone(), Arc::clone(&sink)),
            escalator: Escalator::new(config.clone(), sink),
            paths: SensitivePathGuard::new(paths),
            detector: ThreatDetector,
            config,
            reputation,
            limiter,
            denylist,
            trusted_proxies: Arc::new(trusted_proxies),
        }
    }

    /// Run every stage for `ctx`.
    pub fn admit(&self, ctx: &RequestContext) -> Admission {
        let config = self.config.snapshot();
        let mut permit = None;

        for stage in ADMISSION_ORDER {
            match self.run_stage(stage, ctx, &config, &mut permit) {
                StageOutcome::Continue => {}
                StageOutcome::Forward => break,
                StageOutcome::Reject(rejection) => {
                    tracing::warn!(
                        ip = %ctx.ip,
                        path = %ctx.surface.path,
                        request_id = ctx.request_id(),
                        stage = %stage,
                        "Request rejected"
                    );
                    // Any slot reserved by an earlier stage is released here
                    return Admission::Rejected { stage, rejection };
                }
            }
        }

        Admission::Forwarded { permit }
    }

    fn run_stage(
        &self,
        stage: Stage,
        ctx: &RequestContext,
        config: &SecurityConfig,
        permit: &mut Option<ConnectionPermit>,
    ) -> StageOutcome {
        match stage {
            Stage::Whitelist => {
                if self.reputation.is_whitelisted(&ctx.ip) {
                    tracing::trace!(ip = %ctx.ip, "Request bypassing admission: IP is whitelisted");
                    StageOutcome::Forward
                } else {
                    StageOutcome::Continue
                }
            }
            Stage::Banned => {
                let now = SystemTime::now();
                match self.reputation.ban_expiry_at(&ctx.ip, now) {
                    Some(expires_at) => StageOutcome::Reject(Rejection::Banned {
                        retry_after: expires_at.duration_since(now).unwrap_or_default(),
                    }),
                    None => StageOutcome::Continue,
                }
            }
            Stage::SensitivePath => match self.paths.check(&ctx.surface.path) {
                PathVerdict::Allow => StageOutcome::Continue,
                PathVerdict::Deny { prefix } => {
                    tracing::warn!(
                        ip = %ctx.ip,
                        path = %ctx.surface.path,
                        prefix = %prefix,
                        request_id = ctx.request_id(),
                        "Attempt to access sensitive path"
                    );
                    self.escalator
                        .report(ctx.ip, SuspicionReason::SensitivePathAccess);
                    StageOutcome::Reject(Rejection::NotFound)
                }
            },
            Stage::ConnectionAdmit => match self.connections.try_admit(ctx.ip) {
                Some(slot) => {
                    *permit = Some(slot);
                    StageOutcome::Continue
                }
                None => StageOutcome::Reject(Rejection::TooManyConnections),
            },
            Stage::RateLimit => self.check_rate(ctx, config),
            Stage::ThreatScan => self.scan_threats(ctx),
        }
    }

    fn check_rate(&self, ctx: &RequestContext, config: &SecurityConfig) -> StageOutcome {
        if is_static_resource(&ctx.surface.path) {
            return StageOutcome::Continue;
        }

        match self.volume.record(ctx.ip) {
            VolumeDecision::Under => {}
            VolumeDecision::ConnectionRateExceeded { retry_after } => {
                return StageOutcome::Reject(Rejection::ConnectionRate { retry_after });
            }
            VolumeDecision::QuickBanned { duration } => {
                return StageOutcome::Reject(Rejection::Banned {
                    retry_after: duration,
                });
            }
        }

        match self.limiter.allow(ctx.ip) {
            RateDecision::Allowed => StageOutcome::Continue,
            RateDecision::Limited { retry_after } => {
                tracing::warn!(ip = %ctx.ip, request_id = ctx.request_id(), "Rate limit exceeded");
                StageOutcome::Reject(Rejection::RateLimited {
                    limit: config.rate_limit_per_second,
                    retry_after,
                })
            }
        }
    }

    fn scan_threats(&self, ctx: &RequestContext) -> StageOutcome {
        let hits = self.detector.classify(&ctx.surface);
        let mut block = false;

        for hit in &hits {
            tracing::warn!(
                ip = %ctx.ip,
                category = %hit.category,
                location = %hit.location,
                pattern = hit.pattern,
                value = %hit.value,
                request_id = ctx.request_id(),
                "Suspicious request content"
            );
            self.escalator.report(ctx.ip, hit.category.into());
            block |= hit.category.blocks_immediately();
        }

        if block {
            tracing::error!(
                ip = %ctx.ip,
                path = %ctx.surface.path,
                request_id = ctx.request_id(),
                "Path traversal attempt blocked"
            );
            return StageOutcome::Reject(Rejection::NotFound);
        }
        StageOutcome::Continue
    }

    /// Middleware function wrapping every route.
    pub async fn middleware(&self, req: Request, next: Next) -> Response {
        let ip = extract_ip_from_request(&req, &self.trusted_proxies).unwrap_or_else(|| {
            tracing::debug!("Could not extract IP from request, using shared unknown-client key");
            UNKNOWN_CLIENT
        });

        let (mut parts, body) = req.into_parts();
        let route_params = match RawPathParams::from_request_parts(&mut parts, &()).await {
            Ok(params) => params
                .iter()
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .collect(),
            Err(_) => Vec::new(),
        };
        let request_id = parts
            .headers
            .get("x-request-id")
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let surface = RequestSurface::from_parts(parts.uri.path(), parts.uri.query())
            .with_route_params(route_params);
        let req = Request::from_parts(parts, body);

        let ctx = RequestContext {
            ip,
            surface,
            request_id,
        };

        match self.admit(&ctx) {
            Admission::Forwarded { permit } => {
                let response = next.run(req).await;
                drop(permit);
                response
            }
            Admission::Rejected { rejection, .. } => rejection.into_response(),
        }
    }

    /// Ban `ip` in the denylist and the rate limiter.
    pub fn add_to_blacklist(&self, ip: IpAddr, duration: Duration, reason: &str) {
        self.denylist.ban(ip, duration, reason);
    }

    /// Lift a ban from both stores. Returns whether the denylist held an active ban.
    pub fn remove_from_blacklist(&self, ip: &IpAddr) -> bool {
        let was_banned = self.reputation.is_banned(ip);
        self.reputation.unban(ip);
        self.limiter.unblock_ip(ip);
        was_banned
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.reputation.is_whitelisted(ip)
    }

    pub fn security_config(&self) -> Arc<SecurityConfig> {
        self.config.snapshot()
    }

    pub fn update_security_config(&self, config: SecurityConfig) -> GateResult<()> {
        self.config.replace(config)
    }

    pub fn shared_config(&self) -> &SharedSecurityConfig {
        &self.config
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            active_bans: self.reputation.active_bans().len(),
            tracked_visitors: self.limiter.visitor_count(),
            suspicious_ips: self.escalator.tracked_ips(),
            in_flight_requests: self.connections.total_in_flight(),
        }
    }

    pub fn reputation(&self) -> &IpReputation {
        &self.reputation
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn connections(&self) -> &ConnectionCounter {
        &self.connections
    }

    pub fn escalator(&self) -> &Escalator {
        &self.escalator
    }

    pub fn volume(&self) -> &QuickBan {
        &self.volume
    }
}

/// Paths exempt from the rate-limit stage.
pub fn is_static_resource(path: &str) -> bool {
    STATIC_PREFIXES.iter().any(|prefix| path.starts_with(prefix))
        || STATIC_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
