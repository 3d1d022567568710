//! Request admission and threat mitigation.
//!
//! This module provides:
//! - IP reputation (whitelist and time-bounded denylist)
//! - Token-bucket rate limiting with temporary blocks
//! - Per-IP concurrency ceilings and request-volume quick bans
//! - Sensitive path guarding and signature-based threat detection
//! - Escalation of repeated suspicious activity into bans
//! - The admission pipeline composing all of the above, plus its background sweepers

pub mod abuse;
pub mod admin_auth;
pub mod client_ip;
pub mod connections;
pub mod headers;
pub mod pipeline;
pub mod quick_ban;
pub mod rate_limit;
pub mod rejection;
pub mod reputation;
pub mod sensitive_path;
pub mod sweeper;
pub mod threat;

pub use abuse::Escalator;
pub use admin_auth::AdminAuth;
pub use connections::{ConnectionCounter, ConnectionPermit};
pub use pipeline::{AdmissionPipeline, Stage};
pub use quick_ban::QuickBan;
pub use rate_limit::RateLimiter;
pub use rejection::Rejection;
pub use reputation::IpReputation;
pub use sensitive_path::SensitivePathGuard;
pub use sweeper::Sweepers;
pub use threat::ThreatDetector;
