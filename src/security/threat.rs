//! Signature-based request classification.
//!
//! Matching is case-insensitive substring containment against fixed pattern lists. It is
//! deliberately coarse: legitimate values containing e.g. `select` or an apostrophe are
//! flagged as SQL injection. Those false positives are part of the documented behavior.
//!
//! Scope per category:
//! - SQL injection: decoded query values
//! - XSS: decoded query values
//! - Path traversal: URL path, decoded query values and route parameters

use serde::Serialize;
use std::fmt;

const SQL_PATTERNS: &[&str] = &[
    "'", "\"", "--", ";", "/*", "*/", "xp_", "sp_", "union", "select", "insert", "update",
    "delete", "drop", "exec", "execute", "script", "javascript", "eval",
];

const TRAVERSAL_PATTERNS: &[&str] = &[
    "../", "..\\", "..", "./..", ".\\..", "%2e%2e", "%252e", "..%2f", "..%5c", "%2e%2e%2f",
    "%2e%2e%5c", "/etc/", "/proc/", "/sys/", "c:\\", "c:/", "/@fs/", "/@fs", "/fs/",
    "/etc/passwd", "/etc/shadow", "/etc/hosts", "/etc/group", "/etc/sudoers",
];

const XSS_PATTERNS: &[&str] = &[
    "<script",
    "javascript:",
    "onerror=",
    "onload=",
    "<iframe",
    "<object",
    "<embed",
    "eval(",
    "alert(",
];

/// Detector categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreatCategory {
    SqlInjection,
    Xss,
    PathTraversal,
}

impl ThreatCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThreatCategory::SqlInjection => "sql_injection",
            ThreatCategory::Xss => "xss_attempt",
            ThreatCategory::PathTraversal => "path_traversal",
        }
    }

    /// Categories that end the request on first sight instead of only adding score.
    pub fn blocks_immediately(&self) -> bool {
        matches!(self, ThreatCategory::PathTraversal)
    }
}

impl fmt::Display for ThreatCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where in the request a pattern matched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MatchLocation {
    Path,
    Query(String),
    RouteParam(String),
}

impl fmt::Display for MatchLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchLocation::Path => f.write_str("path"),
            MatchLocation::Query(key) => write!(f, "query:{key}"),
            MatchLocation::RouteParam(key) => write!(f, "param:{key}"),
        }
    }
}

/// First match found for one category.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ThreatHit {
    pub category: ThreatCategory,
    pub location: MatchLocation,
    pub pattern: &'static str,
    /// The offending value, kept for the audit log.
    pub value: String,
}

/// The parts of a request the detector inspects.
#[derive(Debug, Clone, Default)]
pub struct RequestSurface {
    pub path: String,
    /// Decoded query pairs in request order.
    pub query: Vec<(String, String)>,
    pub route_params: Vec<(String, String)>,
}

impl RequestSurface {
    /// Build from a path and a raw (still encoded) query string.
    pub fn from_parts(path: &str, raw_query: Option<&str>) -> Self {
        let query = raw_query
            .map(|raw| {
                url::form_urlencoded::parse(raw.as_bytes())
                    .map(|(key, value)| (key.into_owned(), value.into_owned()))
                    .collect()
            })
            .unwrap_or_default();
        Self {
            path: path.to_string(),
            query,
            route_params: Vec::new(),
        }
    }

    pub fn with_route_params(mut self, params: Vec<(String, String)>) -> Self {
        self.route_params = params;
        self
    }
}

/// Stateless classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreatDetector;

impl ThreatDetector {
    /// Evaluate every category independently. At most one hit per category, in the order
    /// SQL injection, path traversal, XSS.
    pub fn classify(&self, surface: &RequestSurface) -> Vec<ThreatHit> {
        [
            self.detect_sql_injection(surface),
            self.detect_path_traversal(surface),
            self.detect_xss(surface),
        ]
        .into_iter()
        .flatten()
        .collect()
    }

    pub fn detect_sql_injection(&self, surface: &RequestSurface) -> Option<ThreatHit> {
        scan_query(ThreatCategory::SqlInjection, SQL_PATTERNS, &surface.query)
    }

    pub fn detect_xss(&self, surface: &RequestSurface) -> Option<ThreatHit> {
        scan_query(ThreatCategory::Xss, XSS_PATTERNS, &surface.query)
    }

    pub fn detect_path_traversal(&self, surface: &RequestSurface) -> Option<ThreatHit> {
        let category = ThreatCategory::PathTraversal;

        if let Some(pattern) = first_match(&surface.path, TRAVERSAL_PATTERNS) {
            return Some(ThreatHit {
                category,
                location: MatchLocation::Path,
                pattern,
                value: surface.path.clone(),
            });
        }

        if let Some(hit) = scan_query(category, TRAVERSAL_PATTERNS, &surface.query) {
            return Some(hit);
        }

        surface.route_params.iter().find_map(|(key, value)| {
            first_match(value, TRAVERSAL_PATTERNS).map(|pattern| ThreatHit {
                category,
                location: MatchLocation::RouteParam(key.clone()),
                pattern,
                value: value.clone(),
            })
        })
    }
}

fn scan_query(
    category: ThreatCategory,
    patterns: &'static [&'static str],
    query: &[(String, String)],
) -> Option<ThreatHit> {
    query.iter().find_map(|(key, value)| {
        first_match(value, patterns).map(|pattern| ThreatHit {
            category,
            location: MatchLocation::Query(key.clone()),
            pattern,
            value: value.clone(),
        })
    })
}

fn first_match(value: &str, patterns: &'static [&'static str]) -> Option<&'static str> {
    let lowered = value.to_lowercase();
    patterns
        .iter()
        .copied()
        .find(|pattern| lowered.contains(pattern))
}
