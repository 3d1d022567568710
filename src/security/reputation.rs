//! IP reputation: timed denylist plus a static allowlist.
//!
//! The allowlist is fixed for the lifetime of the process and is consulted before any
//! other admission logic. Denylist entries carry an expiry; an expired entry reads as
//! "not banned" immediately, but is only physically removed by [`IpReputation::purge_expired`].

use dashmap::DashMap;
use ipnetwork::IpNetwork;
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::config::clamp_ban_duration;
use crate::error::GateError;

/// A single allowlist rule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WhitelistEntry {
    /// Address or CIDR range.
    Network(IpNetwork),
    /// Substring of the textual address (e.g. `"192.168."`).
    Substring(String),
}

impl WhitelistEntry {
    pub fn matches(&self, ip: &IpAddr) -> bool {
        match self {
            WhitelistEntry::Network(network) => network.contains(*ip),
            WhitelistEntry::Substring(fragment) => ip.to_string().contains(fragment.as_str()),
        }
    }
}

impl FromStr for WhitelistEntry {
    type Err = GateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(GateError::InvalidWhitelistEntry(s.to_string()));
        }
        match IpNetwork::from_str(trimmed) {
            Ok(network) => Ok(WhitelistEntry::Network(network)),
            Err(_) => Ok(WhitelistEntry::Substring(trimmed.to_string())),
        }
    }
}

impl fmt::Display for WhitelistEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WhitelistEntry::Network(network) => write!(f, "{network}"),
            WhitelistEntry::Substring(fragment) => f.write_str(fragment),
        }
    }
}

/// Receiver of ban commands. Lets the escalator and the volume tracker ban without
/// knowing which stores hold ban state.
pub trait BanSink: Send + Sync {
    fn ban(&self, ip: IpAddr, duration: Duration, reason: &str);
}

#[derive(Debug, Clone)]
pub struct BlacklistEntry {
    pub banned_at: SystemTime,
    pub expires_at: SystemTime,
    pub reason: String,
}

/// Denylist/allowlist store.
#[derive(Clone)]
pub struct IpReputation {
    whitelist: Arc<Vec<WhitelistEntry>>,
    /// Banned IPs with expiration time
    blacklist: Arc<DashMap<IpAddr, BlacklistEntry>>,
}

impl IpReputation {
    pub fn new(whitelist: Vec<WhitelistEntry>) -> Self {
        if !whitelist.is_empty() {
            tracing::info!(count = whitelist.len(), "IP whitelist enabled");
        }
        Self {
            whitelist: Arc::new(whitelist),
            blacklist: Arc::new(DashMap::new()),
        }
    }

    pub fn is_whitelisted(&self, ip: &IpAddr) -> bool {
        self.whitelist.iter().any(|entry| entry.matches(ip))
    }

    pub fn is_banned(&self, ip: &IpAddr) -> bool {
        self.ban_expiry_at(ip, SystemTime::now()).is_some()
    }

    /// Expiry of an active ban, or `None` when the address is not banned at `now`.
    pub fn ban_expiry_at(&self, ip: &IpAddr, now: SystemTime) -> Option<SystemTime> {
        self.blacklist
            .get(ip)
            .map(|entry| entry.expires_at)
            .filter(|expires_at| now < *expires_at)
    }

    /// Ban `ip` until `now + duration`, replacing any earlier entry.
    pub fn ban(&self, ip: IpAddr, duration: Duration, reason: &str) {
        let now = SystemTime::now();
        let duration = clamp_ban_duration(duration);
        let Some(expires_at) = now.checked_add(duration) else {
            tracing::error!(ip = %ip, reason, "Ban expiry out of clock range, ban not recorded");
            return;
        };
        self.blacklist.insert(
            ip,
            BlacklistEntry {
                banned_at: now,
                expires_at,
                reason: reason.to_string(),
            },
        );
        tracing::warn!(
            ip = %ip,
            ban_duration_secs = duration.as_secs(),
            reason,
            "IP added to blacklist"
        );
    }

    /// Returns whether an entry (expired or not) was removed.
    pub fn unban(&self, ip: &IpAddr) -> bool {
        let removed = self.blacklist.remove(ip).is_some();
        if removed {
            tracing::info!(ip = %ip, "IP removed from blacklist");
        }
        removed
    }

    /// Entries that are still in force.
    pub fn active_bans(&self) -> Vec<(IpAddr, BlacklistEntry)> {
        let now = SystemTime::now();
        self.blacklist
            .iter()
            .filter(|entry| now < entry.value().expires_at)
            .map(|entry| (*entry.key(), entry.value().clone()))
            .collect()
    }

    /// Delete expired entries. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(SystemTime::now())
    }

    pub fn purge_expired_at(&self, now: SystemTime) -> usize {
        let before = self.blacklist.len();
        self.blacklist.retain(|_, entry| now <= entry.expires_at);
        before - self.blacklist.len()
    }

    /// Number of entries physically stored, expired ones included.
    pub fn stored_entries(&self) -> usize {
        self.blacklist.len()
    }
}

impl BanSink for IpReputation {
    fn ban(&self, ip: IpAddr, duration: Duration, reason: &str) {
        IpReputation::ban(self, ip, duration, reason);
    }
}
