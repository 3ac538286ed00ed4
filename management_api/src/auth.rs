//! Bearer token check for the management API.

use axum::{
    extract::{Request, State},
    http::header::AUTHORIZATION,
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use subtle::{Choice, ConstantTimeEq};
use tracing::debug;

use crate::error::ApiError;

/// Allow-list of bearer tokens.
#[derive(Clone)]
pub struct AuthTokens(Arc<Vec<String>>);

impl AuthTokens {
    /// Empty tokens are dropped; they would match an empty `Bearer ` header.
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        AuthTokens(Arc::new(
            tokens.into_iter().filter(|t| !t.is_empty()).collect(),
        ))
    }

    /// Compares against every configured token in constant time.
    pub fn accepts(&self, presented: &str) -> bool {
        let presented = presented.as_bytes();
        let matched = self
            .0
            .iter()
            .fold(Choice::from(0u8), |acc, token| {
                acc | token.as_bytes().ct_eq(presented)
            });
        bool::from(matched)
    }
}

fn bearer(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Rejects requests without an allow-listed bearer token.
pub async fn require_bearer(
    State(tokens): State<AuthTokens>,
    request: Request,
    next: Next,
) -> Response {
    match bearer(&request) {
        Some(token) if tokens.accepts(token) => next.run(request).await,
        _ => {
            debug!(path = %request.uri().path(), "Rejected unauthenticated API request");
            ApiError::Unauthorized.into_response()
        }
    }
}
