//! Router assembly.
//!
//! Layer order, outermost first:
//!
//! ```text
//! CORS -> request id -> security headers -> body limit -> panic catcher -> admission -> routes
//! ```
//!
//! CORS preflights are answered before admission runs. A panicking handler unwinds through
//! the admission middleware (releasing its connection slot) before it is turned into a 500.

use axum::{middleware, Router};
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use crate::config::AppConfig;
use crate::handlers;
use crate::security::headers::{cors_layer, security_headers};
use crate::security::{AdminAuth, AdmissionPipeline};

/// Wrap `routes` with the full admission stack.
pub fn protect(routes: Router, pipeline: AdmissionPipeline, app_config: &AppConfig) -> Router {
    let cors = cors_layer(pipeline.shared_config().clone());

    routes
        .layer(middleware::from_fn(move |req, next| {
            let pipeline = pipeline.clone();
            async move { pipeline.middleware(req, next).await }
        }))
        .layer(CatchPanicLayer::custom(handlers::panic_response))
        .layer(RequestBodyLimitLayer::new(
            app_config.request.max_body_size_bytes,
        ))
        .layer(middleware::from_fn_with_state(
            app_config.profile,
            security_headers,
        ))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(cors)
}

/// Public routes, admin routes and the 404 fallback behind the admission stack.
pub fn build_app(pipeline: AdmissionPipeline, app_config: &AppConfig, admin_auth: AdminAuth) -> Router {
    let routes = Router::new()
        .merge(handlers::routes())
        .merge(handlers::admin_routes(pipeline.clone(), admin_auth))
        .fallback(handlers::not_found);

    protect(routes, pipeline, app_config)
}
