//! Configuration file parsing for the admission gate.
//!
//! Settings are read from an optional `config.toml` (path overridable through `CONFIG_FILE`)
//! and then overlaid with `GATE__<SECTION>__<KEY>` environment variables, e.g.
//! `GATE__SECURITY__RATE_LIMIT_BURST=500`.
//!
//! The production profile is the default. The development profile raises throttling
//! thresholds and must be selected explicitly (`profile = "development"` or `APP_ENV=development`).

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use crate::error::{GateError, GateResult};
use crate::security::reputation::WhitelistEntry;

/// Deployment profile.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Profile {
    #[default]
    Production,
    Development,
}

impl Profile {
    /// Reads `APP_ENV`. Unknown values are ignored.
    pub fn from_env() -> Option<Self> {
        let value = std::env::var("APP_ENV").ok()?;
        match value.trim().to_ascii_lowercase().as_str() {
            "development" | "dev" => Some(Profile::Development),
            "production" | "prod" => Some(Profile::Production),
            other => {
                tracing::warn!(app_env = other, "Ignoring unknown APP_ENV value");
                None
            }
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Profile::Production)
    }
}

/// Complete gate configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AppConfig {
    pub profile: Profile,
    pub server: ServerConfig,
    pub security: SecurityConfig,
    /// Addresses exempt from every admission check.
    #[serde(with = "whitelist_serde")]
    pub whitelist: Vec<WhitelistEntry>,
    pub paths: SensitivePathConfig,
    pub sweepers: SweeperConfig,
    pub request: RequestConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            server: ServerConfig::default(),
            security: SecurityConfig::default(),
            whitelist: default_whitelist(),
            paths: SensitivePathConfig::default(),
            sweepers: SweeperConfig::default(),
            request: RequestConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file plus `GATE__*` environment overrides.
    ///
    /// A missing file is not an error; a malformed one is.
    pub fn from_file<P: AsRef<Path>>(path: P) -> GateResult<Self> {
        let path = path.as_ref();

        if !path.exists() {
            tracing::info!("Config file not found at {:?}, using defaults", path);
        }

        let environment = config::Environment::with_prefix("GATE")
            .separator("__")
            .try_parsing(true)
            .list_separator(",")
            .with_list_parse_key("security.allowed_origins")
            .with_list_parse_key("whitelist")
            .with_list_parse_key("server.trusted_proxies")
            .with_list_parse_key("paths.allow_prefixes")
            .with_list_parse_key("paths.deny_prefixes");

        let mut loaded: AppConfig = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(environment)
            .build()?
            .try_deserialize()?;

        if let Some(profile) = Profile::from_env() {
            loaded.profile = profile;
        }
        loaded.apply_profile();
        loaded.security.validate()?;
        Ok(loaded)
    }

    /// Load configuration from environment variable CONFIG_FILE or default path.
    pub fn from_env() -> GateResult<Self> {
        let config_path =
            std::env::var("CONFIG_FILE").unwrap_or_else(|_| "config.toml".to_string());
        Self::from_file(config_path)
    }

    /// Applies the development overrides when that profile is selected.
    pub fn apply_profile(&mut self) {
        if self.profile == Profile::Development {
            tracing::warn!("Development profile active: throttling thresholds raised");
            self.security = self.security.clone().development();
        }
    }
}

/// Listener settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Resolve the client address from `X-Real-IP` / `X-Forwarded-For` when the request
    /// arrives from one of `trusted_proxies`.
    pub trust_proxy_headers: bool,
    /// Peers allowed to set the forwarding headers. Any other peer is keyed by its own address.
    #[serde(with = "network_list_serde")]
    pub trusted_proxies: Vec<IpNetwork>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            trust_proxy_headers: true,
            trusted_proxies: default_trusted_proxies(),
        }
    }
}

impl ServerConfig {
    /// Proxies whose forwarding headers are honoured. Empty when proxy headers are off.
    pub fn effective_trusted_proxies(&self) -> Vec<IpNetwork> {
        if self.trust_proxy_headers {
            self.trusted_proxies.clone()
        } else {
            Vec::new()
        }
    }
}

/// Longest ban any component will record (ten years).
pub const MAX_BAN_DURATION: Duration = Duration::from_secs(10 * 365 * 24 * 60 * 60);

/// Caps a requested ban length at [`MAX_BAN_DURATION`].
pub fn clamp_ban_duration(duration: Duration) -> Duration {
    duration.min(MAX_BAN_DURATION)
}

/// Admission thresholds. Swappable at runtime through [`SharedSecurityConfig`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Token refill rate per address (tokens per second).
    pub rate_limit_per_second: u32,
    /// Token bucket capacity per address.
    pub rate_limit_burst: u32,
    /// Ceiling of in-flight requests per address.
    pub max_concurrent_connections: u32,
    /// Requests per address per minute before connection-rate rejection.
    pub connection_rate_per_minute: u32,
    /// Requests per address per minute that trigger an immediate ban.
    pub quick_ban_threshold: u32,
    pub quick_ban_duration_seconds: u64,
    /// Suspicious events per address before an automatic ban.
    pub auto_block_threshold: u32,
    pub auto_block_duration_seconds: u64,
    /// CORS origins. `*` allows any origin.
    pub allowed_origins: Vec<String>,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            rate_limit_per_second: 1,
            rate_limit_burst: 10_000,
            max_concurrent_connections: 100,
            connection_rate_per_minute: 600,
            quick_ban_threshold: 1000,
            quick_ban_duration_seconds: 600,   // 10 minutes
            auto_block_threshold: 50,
            auto_block_duration_seconds: 86_400, // 24 hours
            allowed_origins: vec!["*".to_string()],
        }
    }
}

impl SecurityConfig {
    /// Interval after which one token is added back to a bucket.
    pub fn refill_interval(&self) -> Duration {
        Duration::from_secs(1) / self.rate_limit_per_second.max(1)
    }

    pub fn quick_ban_duration(&self) -> Duration {
        Duration::from_secs(self.quick_ban_duration_seconds)
    }

    pub fn auto_block_duration(&self) -> Duration {
        Duration::from_secs(self.auto_block_duration_seconds)
    }

    /// Development thresholds. Only ever raises limits.
    pub fn development(mut self) -> Self {
        self.rate_limit_per_second = self.rate_limit_per_second.max(1000);
        self.rate_limit_burst = self.rate_limit_burst.max(2000);
        self.quick_ban_threshold = self.quick_ban_threshold.max(10_000);
        self
    }

    pub fn validate(&self) -> GateResult<()> {
        let checks = [
            (self.rate_limit_per_second == 0, "rate_limit_per_second must be greater than 0"),
            (self.rate_limit_burst == 0, "rate_limit_burst must be greater than 0"),
            (
                self.max_concurrent_connections == 0,
                "max_concurrent_connections must be greater than 0",
            ),
            (
                self.connection_rate_per_minute == 0,
                "connection_rate_per_minute must be greater than 0",
            ),
            (self.quick_ban_threshold == 0, "quick_ban_threshold must be greater than 0"),
            (
                self.quick_ban_duration_seconds == 0,
                "quick_ban_duration_seconds must be greater than 0",
            ),
            (self.auto_block_threshold == 0, "auto_block_threshold must be greater than 0"),
            (
                self.auto_block_duration_seconds == 0,
                "auto_block_duration_seconds must be greater than 0",
            ),
        ];

        let max_secs = MAX_BAN_DURATION.as_secs();
        let mut checks = checks.into_iter().chain([
            (
                self.quick_ban_duration_seconds > max_secs,
                "quick_ban_duration_seconds exceeds the ten-year maximum",
            ),
            (
                self.auto_block_duration_seconds > max_secs,
                "auto_block_duration_seconds exceeds the ten-year maximum",
            ),
        ]);

        match checks.find(|(failed, _)| *failed) {
            Some((_, message)) => Err(GateError::InvalidSecurityConfig(message.to_string())),
            None => Ok(()),
        }
    }
}

/// Process-wide handle to the active [`SecurityConfig`].
///
/// Readers take a cheap `Arc` snapshot; writers replace the whole struct. A poisoned lock
/// keeps serving the last value that was written.
#[derive(Debug, Clone, Default)]
pub struct SharedSecurityConfig {
    inner: Arc<RwLock<Arc<SecurityConfig>>>,
}

impl SharedSecurityConfig {
    pub fn new(config: SecurityConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(Arc::new(config))),
        }
    }

    pub fn snapshot(&self) -> Arc<SecurityConfig> {
        let guard = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(&guard)
    }

    /// Replace the active config. Invalid configs are rejected and the prior one stays.
    pub fn replace(&self, config: SecurityConfig) -> GateResult<()> {
        config.validate()?;
        let mut guard = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Arc::new(config);
        tracing::info!("Security configuration replaced");
        Ok(())
    }
}

/// Path prefix tables for the sensitive-path guard.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SensitivePathConfig {
    /// Checked first; a match always allows.
    pub allow_prefixes: Vec<String>,
    /// Checked second; a match answers 404 and counts as suspicious activity.
    pub deny_prefixes: Vec<String>,
}

impl Default for SensitivePathConfig {
    fn default() -> Self {
        let to_strings = |items: &[&str]| items.iter().map(|s| s.to_string()).collect();
        Self {
            allow_prefixes: to_strings(&["/textures/", "/models/"]),
            deny_prefixes: to_strings(&[
                "/.env",
                "/.git",
                "/data/",
                "/config/",
                "/bootstrap/",
                "/build/",
                "/core/",
                "/database/",
                "/dev/",
                "/docs/",
                "/frontend/",
                "/logger/",
                "/middleware/",
                "/scripts/",
                "/server/",
                "/services/",
                "/temp/",
                "/tmp/",
                "/utils/",
                "/@fs/",
                "/@fs",
            ]),
        }
    }
}

/// Background sweep periods (in seconds).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SweeperConfig {
    pub denylist_interval_seconds: u64,
    pub activity_interval_seconds: u64,
    pub visitor_interval_seconds: u64,
    /// Visitors idle for longer than this are dropped by the visitor sweep.
    pub visitor_idle_seconds: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            denylist_interval_seconds: 30 * 60,
            activity_interval_seconds: 60 * 60,
            visitor_interval_seconds: 10 * 60,
            visitor_idle_seconds: 10 * 60,
        }
    }
}

impl SweeperConfig {
    pub fn denylist_interval(&self) -> Duration {
        Duration::from_secs(self.denylist_interval_seconds.max(1))
    }

    pub fn activity_interval(&self) -> Duration {
        Duration::from_secs(self.activity_interval_seconds.max(1))
    }

    pub fn visitor_interval(&self) -> Duration {
        Duration::from_secs(self.visitor_interval_seconds.max(1))
    }

    pub fn visitor_idle(&self) -> Duration {
        Duration::from_secs(self.visitor_idle_seconds)
    }
}

/// Request validation configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RequestConfig {
    /// Maximum request body size in bytes (default 100MB).
    pub max_body_size_bytes: usize,
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            max_body_size_bytes: 100 * 1024 * 1024,
        }
    }
}

fn default_trusted_proxies() -> Vec<IpNetwork> {
    ["127.0.0.0/8", "::1/128"]
        .iter()
        .filter_map(|network| network.parse().ok())
        .collect()
}

pub(crate) fn default_whitelist() -> Vec<WhitelistEntry> {
    ["127.0.0.0/8", "::1/128"]
        .iter()
        .filter_map(|entry| entry.parse().ok())
        .collect()
}

/// Address ranges as strings (`"10.0.0.0/8"`, `"192.0.2.7"`).
mod network_list_serde {
    use ipnetwork::IpNetwork;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(networks: &[IpNetwork], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(networks.iter().map(|network| network.to_string()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<IpNetwork>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let strings: Vec<String> = Vec::deserialize(deserializer)?;
        strings
            .into_iter()
            .map(|s| s.trim().parse::<IpNetwork>().map_err(serde::de::Error::custom))
            .collect()
    }
}

/// Custom serde module for whitelist entries.
mod whitelist_serde {
    use crate::security::reputation::WhitelistEntry;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::str::FromStr;

    pub fn serialize<S>(entries: &[WhitelistEntry], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_seq(entries.iter().map(|entry| entry.to_string()))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<WhitelistEntry>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let strings: Vec<String> = Vec::deserialize(deserializer)?;
        strings
            .into_iter()
            .map(|s| WhitelistEntry::from_str(&s).map_err(serde::de::Error::custom))
            .collect()
    }
}
