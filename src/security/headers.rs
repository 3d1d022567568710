//! Response hardening headers and the CORS policy.

use axum::{
    extract::{Request, State},
    http::{header, request::Parts, HeaderName, HeaderValue, Method},
    middleware::Next,
    response::Response,
};
use std::time::Duration;
use tower_http::cors::{AllowOrigin, CorsLayer};

use crate::config::{Profile, SharedSecurityConfig};

const CSP_STRICT: &str = "default-src 'self'; script-src 'self'; style-src 'self' 'unsafe-inline'; \
     img-src 'self' data: blob:; font-src 'self' data:; connect-src 'self'; frame-ancestors 'self'";

const CSP_HTML: &str = "default-src 'self'; script-src 'self' 'unsafe-inline' 'unsafe-eval'; \
     style-src 'self' 'unsafe-inline'; img-src 'self' data: blob: https:; font-src 'self' data:; \
     connect-src 'self' ws: wss:; media-src 'self' blob:; frame-src 'self'";

const HSTS: &str = "max-age=31536000; includeSubDomains";

fn is_html(path: &str) -> bool {
    path.ends_with(".html") || path.ends_with(".htm")
}

/// Adds hardening headers to every response. HSTS is only sent in production.
pub async fn security_headers(State(profile): State<Profile>, req: Request, next: Next) -> Response {
    let html = is_html(req.uri().path());
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    if !html {
        headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("SAMEORIGIN"));
    }
    headers.insert(
        header::X_XSS_PROTECTION,
        HeaderValue::from_static("1; mode=block"),
    );
    headers.insert(
        header::REFERRER_POLICY,
        HeaderValue::from_static("strict-origin-when-cross-origin"),
    );
    headers.insert(
        HeaderName::from_static("permissions-policy"),
        HeaderValue::from_static("geolocation=(), microphone=(), camera=()"),
    );
    headers.insert(
        header::CONTENT_SECURITY_POLICY,
        HeaderValue::from_static(if html { CSP_HTML } else { CSP_STRICT }),
    );
    if profile.is_production() {
        headers.insert(
            header::STRICT_TRANSPORT_SECURITY,
            HeaderValue::from_static(HSTS),
        );
    }

    response
}

/// Local development origins are always accepted, as is any origin when the list holds `*`.
pub fn is_origin_allowed(origin: &str, allowed_origins: &[String]) -> bool {
    origin.contains("localhost")
        || origin.contains("127.0.0.1")
        || allowed_origins
            .iter()
            .any(|allowed| allowed == "*" || allowed == origin)
}

/// CORS layer reading `allowed_origins` from the live security config on every request.
pub fn cors_layer(config: SharedSecurityConfig) -> CorsLayer {
    let allow_origin = AllowOrigin::predicate(move |origin: &HeaderValue, _parts: &Parts| {
        origin
            .to_str()
            .map(|origin| is_origin_allowed(origin, &config.snapshot().allowed_origins))
            .unwrap_or(false)
    });

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_credentials(true)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::PATCH,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::ORIGIN,
            header::CONTENT_TYPE,
            header::CONTENT_LENGTH,
            header::ACCEPT_ENCODING,
            header::AUTHORIZATION,
            HeaderName::from_static("x-csrf-token"),
            HeaderName::from_static("x-admin-key"),
        ])
        .expose_headers([header::CONTENT_LENGTH])
        .max_age(Duration::from_secs(86400))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, middleware, routing::get, Router};
    use tower::ServiceExt;

    #[test]
    fn test_origin_rules() {
        let exact = vec!["https://app.example.com".to_string()];
        assert!(is_origin_allowed("https://app.example.com", &exact));
        assert!(is_origin_allowed("http://localhost:3000", &exact));
        assert!(is_origin_allowed("http://127.0.0.1:8080", &exact));
        assert!(!is_origin_allowed("https://evil.example.net", &exact));
        assert!(is_origin_allowed("https://evil.example.net", &["*".to_string()]));
    }

    fn app(profile: Profile) -> Router {
        Router::new()
            .route("/api/data", get(|| async { "data" }))
            .route("/index.html", get(|| async { "<html></html>" }))
            .layer(middleware::from_fn_with_state(profile, security_headers))
    }

    async fn get_path(app: Router, path: &str) -> Response {
        app.oneshot(
            axum::http::Request::builder()
                .uri(path)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
    }

    #[tokio::test]
    async fn test_production_headers() {
        let response = get_path(app(Profile::Production), "/api/data").await;
        let headers = response.headers();

        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
        assert_eq!(headers["content-security-policy"], CSP_STRICT);
        assert_eq!(headers["strict-transport-security"], HSTS);
    }

    #[tokio::test]
    async fn test_html_pages_use_relaxed_policy() {
        let response = get_path(app(Profile::Development), "/index.html").await;
        let headers = response.headers();

        assert!(headers.get("x-frame-options").is_none());
        assert_eq!(headers["content-security-policy"], CSP_HTML);
        assert!(headers.get("strict-transport-security").is_none());
    }
}
