//! HTTP rendering of admission denials.
//!
//! Rejections are expected outcomes, not errors. Every variant maps to a fixed status code
//! and a JSON body of the form `{"error": .., "code": .., "retry_after": ..}`; probing
//! rejections answer a bare 404 so the protected resource looks absent.

use axum::{
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    /// Address is on the denylist.
    Banned { retry_after: Duration },
    /// Too many in-flight requests from this address.
    TooManyConnections,
    /// Too many requests this minute.
    ConnectionRate { retry_after: Duration },
    /// Token bucket empty or visitor blocked.
    RateLimited { limit: u32, retry_after: Duration },
    /// Sensitive path or path traversal. Empty 404.
    NotFound,
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::NotFound => StatusCode::NOT_FOUND,
            _ => StatusCode::TOO_MANY_REQUESTS,
        }
    }

    pub fn code(&self) -> Option<&'static str> {
        match self {
            Rejection::Banned { .. } => Some("IP_BANNED"),
            Rejection::TooManyConnections => Some("TOO_MANY_CONNECTIONS"),
            Rejection::ConnectionRate { .. } => Some("CONNECTION_RATE_EXCEEDED"),
            Rejection::RateLimited { .. } => Some("RATE_LIMITED"),
            Rejection::NotFound => None,
        }
    }
}

/// Error response
#[derive(Debug, Serialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
}

/// Whole seconds, rounded up so a client never retries early.
pub fn retry_after_secs(retry_after: Duration) -> u64 {
    let secs = retry_after.as_secs();
    if retry_after.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs
    }
}

impl IntoResponse for Rejection {
    fn into_response(self) -> Response {
        let status = self.status();
        let code = self.code();

        let (message, retry_after) = match &self {
            Rejection::NotFound => return status.into_response(),
            Rejection::Banned { retry_after } => {
                ("Your IP address has been blocked", Some(*retry_after))
            }
            Rejection::TooManyConnections => ("Too many concurrent connections", None),
            Rejection::ConnectionRate { retry_after } => {
                ("Too many connections per minute, please retry later", Some(*retry_after))
            }
            Rejection::RateLimited { retry_after, .. } => {
                ("Too many requests, please retry later", Some(*retry_after))
            }
        };

        let retry_after = retry_after.map(retry_after_secs);
        let mut response = (
            status,
            Json(ErrorBody {
                error: message.to_string(),
                code,
                retry_after,
            }),
        )
            .into_response();

        if let Rejection::RateLimited { limit, .. } = self {
            let headers = response.headers_mut();
            headers.insert("x-ratelimit-limit", HeaderValue::from(limit));
            headers.insert("x-ratelimit-remaining", HeaderValue::from_static("0"));
            headers.insert("x-ratelimit-reset", HeaderValue::from(retry_after.unwrap_or(0)));
        }

        response
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_rounds_up() {
        assert_eq!(retry_after_secs(Duration::from_secs(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(1)), 1);
        assert_eq!(retry_after_secs(Duration::from_millis(2500)), 3);
        assert_eq!(retry_after_secs(Duration::ZERO), 0);
    }

    #[test]
    fn test_rate_limited_headers() {
        let response = Rejection::RateLimited {
            limit: 10,
            retry_after: Duration::from_millis(400),
        }
        .into_response();

        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        let headers = response.headers();
        assert_eq!(headers["x-ratelimit-limit"], "10");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["x-ratelimit-reset"], "1");
    }

    #[test]
    fn test_not_found_has_no_rate_headers() {
        let response = Rejection::NotFound.into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response.headers().get("x-ratelimit-limit").is_none());
    }

    #[test]
    fn test_connection_rejection_status() {
        let rejection = Rejection::TooManyConnections;
        assert_eq!(rejection.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(rejection.code(), Some("TOO_MANY_CONNECTIONS"));
    }
}
