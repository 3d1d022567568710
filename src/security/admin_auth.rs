//! Admin API key check for the `/api/security` endpoints.

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};

use super::rejection::ErrorBody;

const ADMIN_KEY_HEADER: &str = "x-admin-key";

/// Validates `X-Admin-Key` against `ADMIN_API_KEY`. Without a configured key every
/// admin request is refused.
#[derive(Clone, Debug, Default)]
pub struct AdminAuth {
    admin_key: Option<String>,
}

impl AdminAuth {
    pub fn from_env() -> Self {
        let admin_key = std::env::var("ADMIN_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty());
        Self::with_key(admin_key)
    }

    pub fn with_key(admin_key: Option<String>) -> Self {
        if admin_key.is_some() {
            tracing::info!("Admin API key authentication enabled");
        } else {
            tracing::info!("Admin API key not configured - security admin endpoints disabled");
        }
        Self { admin_key }
    }

    pub fn is_enabled(&self) -> bool {
        self.admin_key.is_some()
    }

    fn authorize(&self, provided: Option<&str>) -> Result<(), &'static str> {
        let Some(expected) = self.admin_key.as_deref() else {
            return Err("Admin access disabled");
        };
        match provided {
            Some(key) if constant_time_eq(key.as_bytes(), expected.as_bytes()) => Ok(()),
            Some(_) => Err("Invalid admin key"),
            None => Err("X-Admin-Key header required"),
        }
    }

    pub async fn middleware(&self, req: Request, next: Next) -> Response {
        let provided = req
            .headers()
            .get(ADMIN_KEY_HEADER)
            .and_then(|value| value.to_str().ok());

        match self.authorize(provided) {
            Ok(()) => next.run(req).await,
            Err(reason) => {
                tracing::warn!(path = %req.uri().path(), reason, "Admin request refused");
                (
                    StatusCode::UNAUTHORIZED,
                    Json(ErrorBody {
                        error: reason.to_string(),
                        code: Some("UNAUTHORIZED"),
                        retry_after: None,
                    }),
                )
                    .into_response()
            }
        }
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}
