//! Per-address token bucket with temporary blocks.
//!
//! Each visitor holds up to `rate_limit_burst` tokens and regains one token per refill
//! interval. The refill timestamp only advances when at least one whole token was added,
//! so partial intervals carry over to the next call.
//!
//! Concurrent calls for the same address may observe a slightly stale count; the bucket
//! is eventually consistent rather than serialized per address.

use dashmap::DashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::{clamp_ban_duration, SharedSecurityConfig};

/// Outcome of a single [`RateLimiter::allow`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    Limited { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed)
    }
}

#[derive(Debug, Clone)]
struct Visitor {
    last_refill: Instant,
    last_seen: Instant,
    tokens: u32,
    blocked_until: Option<Instant>,
}

/// Token-bucket limiter keyed by client address.
#[derive(Clone)]
pub struct RateLimiter {
    config: SharedSecurityConfig,
    visitors: Arc<DashMap<IpAddr, Visitor>>,
}

impl RateLimiter {
    pub fn new(config: SharedSecurityConfig) -> Self {
        Self {
            config,
            visitors: Arc::new(DashMap::new()),
        }
    }

    pub fn allow(&self, ip: IpAddr) -> RateDecision {
        self.allow_at(ip, Instant::now())
    }

    pub fn allow_at(&self, ip: IpAddr, now: Instant) -> RateDecision {
        let config = self.config.snapshot();
        let burst = config.rate_limit_burst;
        let interval = config.refill_interval();

        let mut visitor = self.visitors.entry(ip).or_insert_with(|| Visitor {
            last_refill: now,
            last_seen: now,
            tokens: burst,
            blocked_until: None,
        });
        visitor.last_seen = now;

        if let Some(until) = visitor.blocked_until {
            if now < until {
                return RateDecision::Limited {
                    retry_after: until - now,
                };
            }
            visitor.blocked_until = None;
            visitor.tokens = burst;
            visitor.last_refill = now;
        }

        let elapsed = now.saturating_duration_since(visitor.last_refill);
        let interval_nanos = interval.as_nanos().max(1);
        let whole_intervals = elapsed.as_nanos() / interval_nanos;

        if whole_intervals > 0 {
            let refill = u32::try_from(whole_intervals).unwrap_or(u32::MAX);
            visitor.tokens = visitor.tokens.saturating_add(refill).min(burst);
            visitor.last_refill = now;
        }

        if visitor.tokens > 0 {
            visitor.tokens -= 1;
            return RateDecision::Allowed;
        }

        let carried = elapsed.as_nanos() % interval_nanos;
        let retry_after = interval.saturating_sub(Duration::from_nanos(carried as u64));
        RateDecision::Limited { retry_after }
    }

    /// Deny every call from `ip` for `duration`. Tokens are restored once the block lapses.
    pub fn block_ip(&self, ip: IpAddr, duration: Duration) {
        let now = Instant::now();
        let Some(until) = now.checked_add(clamp_ban_duration(duration)) else {
            tracing::error!(ip = %ip, "Block expiry out of clock range, block not applied");
            return;
        };
        self.visitors
            .entry(ip)
            .and_modify(|visitor| visitor.blocked_until = Some(until))
            .or_insert_with(|| Visitor {
                last_refill: now,
                last_seen: now,
                tokens: 0,
                blocked_until: Some(until),
            });
        tracing::debug!(ip = %ip, block_secs = duration.as_secs(), "Rate limiter block applied");
    }

    /// Lift a block early and refill the bucket. Returns whether the visitor was blocked.
    pub fn unblock_ip(&self, ip: &IpAddr) -> bool {
        let burst = self.config.snapshot().rate_limit_burst;
        match self.visitors.get_mut(ip) {
            Some(mut visitor) if visitor.blocked_until.is_some() => {
                visitor.blocked_until = None;
                visitor.tokens = burst;
                visitor.last_refill = Instant::now();
                true
            }
            _ => false,
        }
    }

    /// Drop visitors that are unblocked and idle for longer than `idle`, and visitors whose
    /// block has lapsed. Returns the number removed.
    pub fn sweep_idle(&self, idle: Duration) -> usize {
        self.sweep_idle_at(idle, Instant::now())
    }

    pub fn sweep_idle_at(&self, idle: Duration, now: Instant) -> usize {
        let before = self.visitors.len();
        self.visitors.retain(|_, visitor| match visitor.blocked_until {
            Some(until) => now <= until,
            None => now.saturating_duration_since(visitor.last_seen) <= idle,
        });
        before - self.visitors.len()
    }

    pub fn visitor_count(&self) -> usize {
        self.visitors.len()
    }
}
