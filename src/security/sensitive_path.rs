//! Static path-prefix guard for operational directories.
//!
//! Allow prefixes are checked before deny prefixes, so a public asset directory nested
//! under a protected one stays reachable.

use std::sync::Arc;

use crate::config::SensitivePathConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathVerdict {
    Allow,
    Deny { prefix: String },
}

#[derive(Debug, Clone)]
pub struct SensitivePathGuard {
    allow_prefixes: Arc<Vec<String>>,
    deny_prefixes: Arc<Vec<String>>,
}

impl SensitivePathGuard {
    pub fn new(config: &SensitivePathConfig) -> Self {
        tracing::info!(
            allow = config.allow_prefixes.len(),
            deny = config.deny_prefixes.len(),
            "Sensitive path guard configured"
        );
        Self {
            allow_prefixes: Arc::new(config.allow_prefixes.clone()),
            deny_prefixes: Arc::new(config.deny_prefixes.clone()),
        }
    }

    pub fn check(&self, path: &str) -> PathVerdict {
        if self
            .allow_prefixes
            .iter()
            .any(|prefix| path.starts_with(prefix.as_str()))
        {
            return PathVerdict::Allow;
        }

        match self
            .deny_prefixes
            .iter()
            .find(|prefix| path.starts_with(prefix.as_str()))
        {
            Some(prefix) => PathVerdict::Deny {
                prefix: prefix.clone(),
            },
            None => PathVerdict::Allow,
        }
    }
}
